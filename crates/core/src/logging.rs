//! Filter selection, the rolling file sink and secret redaction for log
//! output. The subscriber itself is assembled by the binary.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "hyper=warn,reqwest=warn,tower_http=info";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "vidgen";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";
pub const REDACTION_PLACEHOLDER: &str = "***REDACTED***";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    /// The filter the user asked for, before noise suppression.
    pub user_filter: String,
    pub effective_filter: String,
    pub noise_suppressed: bool,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready { .. } => None,
            Self::Fallback { reason, .. } => Some(reason),
        }
    }
}

/// Pick the active filter: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`,
/// then the default. Library noise is muted only when nothing was chosen
/// explicitly on the command line.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = match (options.cli_log_filter.as_deref(), options.verbose) {
        (Some(filter), _) => filter.to_string(),
        (None, 2..) => "trace".to_string(),
        (None, 1) => "debug".to_string(),
        (None, 0) => options
            .rust_log_env
            .clone()
            .filter(|filter| !filter.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
    };

    let noise_suppressed = options.cli_log_filter.is_none() && options.verbose == 0;
    let effective_filter = if noise_suppressed {
        format!("{DEFAULT_NOISE_FILTER},{user_filter}")
    } else {
        user_filter.clone()
    };

    LoggingFilterPlan {
        user_filter,
        effective_filter,
        noise_suppressed,
    }
}

/// Daily rolling file under `<data_dir>/logs`. Any failure degrades to
/// console-only logging with the reason attached.
pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let retention = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };
    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready { log_dir, appender },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Wraps a [`MakeWriter`] so every line passes through
/// [`redact_sensitive_text`] before reaching the sink.
#[derive(Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

pub fn redacting_make_writer<M>(inner: M) -> RedactingMakeWriter<M> {
    RedactingMakeWriter { inner }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, metadata: &Metadata<'_>) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer_for(metadata))
    }
}

/// Buffers partial writes and redacts whole lines.
#[derive(Debug)]
pub struct RedactingWriter<W: Write> {
    inner: W,
    buffer: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
        }
    }

    fn emit(&mut self, chunk: &[u8]) -> io::Result<()> {
        let redacted = redact_sensitive_text(&String::from_utf8_lossy(chunk));
        self.inner.write_all(redacted.as_bytes())
    }

    fn drain_lines(&mut self) -> io::Result<()> {
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            self.emit(&line)?;
        }
        Ok(())
    }

    fn drain_rest(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rest = std::mem::take(&mut self.buffer);
        self.emit(&rest)
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.drain_lines()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain_rest()?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.drain_rest();
        let _ = self.inner.flush();
    }
}

/// Mask URL userinfo and the values of secret-looking keys such as
/// `api_key=...`, `"authorization": "Bearer ..."` or `token: ...`.
pub fn redact_sensitive_text(input: &str) -> String {
    redact_key_values(&redact_userinfo(input))
}

fn redact_userinfo(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(scheme_end) = rest.find("://") {
        let (head, tail) = rest.split_at(scheme_end + 3);
        output.push_str(head);
        let authority_len = tail
            .find(|ch: char| matches!(ch, '/' | '?' | '#' | '"' | '\'' | '<' | '>') || ch.is_whitespace())
            .unwrap_or(tail.len());
        let authority = &tail[..authority_len];
        match authority.rfind('@') {
            Some(at) if at > 0 => {
                output.push_str(REDACTION_PLACEHOLDER);
                output.push_str(&authority[at..]);
            }
            _ => output.push_str(authority),
        }
        rest = &tail[authority_len..];
    }

    output.push_str(rest);
    output
}

fn redact_key_values(input: &str) -> String {
    let lower = input.to_ascii_lowercase();
    let bytes = input.as_bytes();
    let mut output = String::with_capacity(input.len());
    let mut copied = 0;
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] != b'=' && bytes[index] != b':' {
            index += 1;
            continue;
        }

        let mut key_end = index;
        if key_end > 0 && bytes[key_end - 1] == b'"' {
            key_end -= 1;
        }
        let mut key_start = key_end;
        while key_start > 0 && is_key_byte(bytes[key_start - 1]) {
            key_start -= 1;
        }
        if key_start == key_end || !is_sensitive_key(&lower[key_start..key_end]) {
            index += 1;
            continue;
        }

        let mut value_start = index + 1;
        while value_start < bytes.len() && matches!(bytes[value_start], b' ' | b'"' | b'\'') {
            value_start += 1;
        }
        if lower[value_start..].starts_with("bearer ") {
            value_start += "bearer ".len();
        }
        let value_end = bytes[value_start..]
            .iter()
            .position(|b| is_value_terminator(*b))
            .map_or(bytes.len(), |offset| value_start + offset);

        if value_end > value_start {
            output.push_str(&input[copied..value_start]);
            output.push_str(REDACTION_PLACEHOLDER);
            copied = value_end;
        }
        index = value_end.max(index + 1);
    }

    output.push_str(&input[copied..]);
    output
}

fn is_key_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-'
}

fn is_value_terminator(byte: u8) -> bool {
    byte.is_ascii_whitespace()
        || matches!(byte, b'"' | b'\'' | b',' | b';' | b'&' | b')' | b']' | b'}')
}

fn is_sensitive_key(key: &str) -> bool {
    matches!(key, "key" | "authorization" | "pwd" | "passwd")
        || key.contains("token")
        || key.contains("secret")
        || key.contains("password")
        || key.ends_with("_key")
        || key.ends_with("-key")
        || key.ends_with("apikey")
}
