use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use vidgen_core::clock::SystemClock;
use vidgen_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use vidgen_core::coordinator::Coordinator;
use vidgen_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use vidgen_core::remote::MiniMaxClient;
use vidgen_core::server::{app_router_with_static, AppState};

#[derive(Parser, Debug)]
#[command(
    name = "vidgen",
    about = "Multi-user web front end for remote video generation"
)]
struct Cli {
    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    run_server(cli.port, cli.host, resolved_data_dir).await
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let options = LoggingInitOptions {
        data_dir: Some(data_dir.to_path_buf()),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filter = logging::compose_logging_filters(&options).effective_filter;

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filter, "console"));

    match logging::build_file_sink_plan(&options) {
        FileSinkPlan::Ready { appender, .. } => {
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(logging::redacting_make_writer(appender))
                .with_filter(parse_env_filter_with_fallback(&filter, "file"));
            let subscriber = tracing_subscriber::registry().with(console).with(file);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
                return;
            }
            warn!(
                attempted_log_dir = ?attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let mut config = match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.apply_env_overrides();
    config
}

fn resolve_port(cli_port: Option<u16>, env_port: Option<&str>, config_port: u16) -> u16 {
    cli_port
        .or_else(|| env_port.and_then(|value| value.trim().parse().ok()))
        .unwrap_or(config_port)
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    let config = load_config(&data_dir);
    let port = resolve_port(
        port_override,
        std::env::var("PORT").ok().as_deref(),
        config.server.port,
    );
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    if config.remote.api_key.trim().is_empty() {
        warn!("No remote API key configured; set remote.api_key or VIDGEN_API_KEY");
    }
    let api = MiniMaxClient::new(
        &config.remote.api_url,
        &config.remote.api_key,
        config.remote.request_timeout(),
    )?;
    let coordinator = Arc::new(Coordinator::new(
        &config,
        &data_dir,
        Arc::new(api),
        Arc::new(SystemClock),
    ));

    let cancel = CancellationToken::new();
    let background = coordinator.spawn_background(&cancel);

    let static_dir = config.server.static_dir.as_path();
    if !static_dir.is_dir() {
        info!(static_dir = %static_dir.display(), "Static directory not found; serving API only");
    }
    let app = app_router_with_static(AppState::new(coordinator), Some(static_dir));

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting vidgen server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let shutdown = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for shutdown signal");
        }
        info!("Shutdown requested");
        shutdown.cancel();
    })
    .await?;

    cancel.cancel();
    for handle in background {
        let _ = handle.await;
    }
    info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_prefers_cli_then_env_then_config() {
        assert_eq!(resolve_port(Some(9000), Some("8000"), 5211), 9000);
        assert_eq!(resolve_port(None, Some("8000"), 5211), 8000);
        assert_eq!(resolve_port(None, Some("not-a-port"), 5211), 5211);
        assert_eq!(resolve_port(None, None, 5211), 5211);
    }

    #[test]
    fn cli_counts_verbosity_and_reads_overrides() {
        let cli = Cli::try_parse_from([
            "vidgen",
            "-vv",
            "--port",
            "8080",
            "--data-dir",
            "/tmp/vidgen",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.port, Some(8080));
        assert_eq!(cli.data_dir.as_deref(), Some(Path::new("/tmp/vidgen")));
        assert!(cli.log_filter.is_none());
    }

    #[test]
    fn load_config_writes_defaults_on_first_run() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("data");
        let config = load_config(&dir);

        assert_eq!(config.server.port, 5211);
        assert!(config_path(&dir).exists());
    }
}
