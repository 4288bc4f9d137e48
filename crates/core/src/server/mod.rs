use std::net::SocketAddr;
use std::path::Path as StdPath;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Extension, Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{debug, error, info, warn};

use crate::coordinator::{AdminStats, Coordinator, GenerationAccepted, GenerationRequest};
use crate::error::{RegistryError, SubmissionError, UploadError};
use crate::sessions::{ServerMessage, SessionManager};
use crate::task::TaskSnapshot;
use crate::uploads::ImageFormat;

/// Files accepted in one multipart upload request.
const MAX_FILES_PER_UPLOAD: u64 = 10;
const MULTIPART_OVERHEAD_BYTES: u64 = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    coordinator: Arc<Coordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { coordinator }),
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.inner.coordinator
    }

    fn sessions(&self) -> &Arc<SessionManager> {
        self.inner.coordinator.sessions()
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
}

#[derive(Serialize)]
pub struct UploadedFile {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<ImageFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub session_id: String,
    pub files: Vec<UploadedFile>,
}

/// Messages a client may send on its push channel.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
}

pub fn app_router(state: AppState) -> Router {
    app_router_with_static(state, None)
}

pub fn app_router_with_static(state: AppState, static_dir: Option<&StdPath>) -> Router {
    let upload_limit = state.coordinator().uploads().max_bytes() * MAX_FILES_PER_UPLOAD
        + MULTIPART_OVERHEAD_BYTES;
    let upload_limit = usize::try_from(upload_limit).unwrap_or(usize::MAX);

    let api = Router::new()
        .route("/api/health", get(health))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}/tasks", get(list_session_tasks))
        .route(
            "/api/upload",
            post(upload_files).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/generate", post(generate))
        .route("/api/tasks/{id}", get(get_task).delete(cancel_task))
        .route("/api/admin/stats", get(admin_stats))
        .route("/api/{*path}", any(api_route_not_found))
        .route("/ws/{session_id}", any(session_ws))
        .layer(CorsLayer::permissive())
        .with_state(state);

    match static_dir {
        Some(dir) if dir.is_dir() => {
            let index = dir.join("index.html");
            api.fallback_service(ServeDir::new(dir).fallback(ServeFile::new(index)))
        }
        _ => api,
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn create_session(State(state): State<AppState>) -> (StatusCode, Json<SessionResponse>) {
    let session_id = state.sessions().create_session();
    (StatusCode::CREATED, Json(SessionResponse { session_id }))
}

async fn list_session_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TaskSnapshot>>, AppError> {
    Ok(Json(state.coordinator().session_snapshots(&id)?))
}

async fn upload_files(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut session_id = None;
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("session_id") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("invalid session_id field: {e}")))?;
                session_id = Some(text.trim().to_string());
            }
            Some("files") | Some("file") => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("failed to read {filename}: {e}")))?;
                files.push((filename, bytes));
            }
            other => debug!(field = ?other, "Ignoring unknown multipart field"),
        }
    }

    let session_id = session_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("missing session_id field".to_string()))?;
    if files.is_empty() {
        return Err(AppError::BadRequest("no files in upload".to_string()));
    }

    let mut results = Vec::with_capacity(files.len());
    for (filename, bytes) in files {
        match state
            .coordinator()
            .upload(&session_id, &bytes, &filename)
            .await
        {
            Ok(upload) => results.push(UploadedFile {
                filename,
                upload_ref: Some(upload.upload_ref),
                size: Some(upload.size),
                format: Some(upload.format),
                error: None,
            }),
            Err(SubmissionError::Upload(
                err @ (UploadError::TooLarge { .. } | UploadError::UnsupportedFormat(_)),
            )) => {
                warn!(session_id = %session_id, filename = %filename, error = %err, "Upload rejected");
                results.push(UploadedFile {
                    filename,
                    upload_ref: None,
                    size: None,
                    format: None,
                    error: Some(err.to_string()),
                });
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(Json(UploadResponse {
        session_id,
        files: results,
    }))
}

async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer: Option<Extension<ConnectInfo<SocketAddr>>>,
    Json(request): Json<GenerationRequest>,
) -> Result<(StatusCode, Json<GenerationAccepted>), AppError> {
    let peer = peer.map(|Extension(ConnectInfo(addr))| addr);
    if let Some(ip) = client_ip(&headers, peer) {
        state.sessions().record_client_ip(&request.session_id, &ip);
    }
    let accepted = state.coordinator().submit_generation(&request)?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// First `X-Forwarded-For` hop when behind a proxy, else the socket peer.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskSnapshot>, AppError> {
    Ok(Json(state.coordinator().task_snapshot(&id)?))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskSnapshot>, AppError> {
    Ok(Json(state.coordinator().cancel_task(&id)?))
}

async fn admin_stats(State(state): State<AppState>) -> Json<AdminStats> {
    Json(state.coordinator().admin_stats())
}

async fn session_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    let sessions = Arc::clone(state.sessions());
    ws.on_upgrade(move |socket| handle_ws(socket, sessions, session_id))
}

async fn handle_ws(socket: WebSocket, sessions: Arc<SessionManager>, session_id: String) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let connection_id = sessions.attach(&session_id, tx.clone());
    let (mut sink, mut stream) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    error!(error = %err, "Failed to encode push message");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                sessions.touch(&session_id);
                if is_ping(text.as_str()) {
                    let _ = tx.send(ServerMessage::Pong);
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(session_id = %session_id, error = %err, "WebSocket receive error");
                break;
            }
        }
    }

    sessions.detach(&session_id, connection_id);
    send_task.abort();
    info!(session_id = %session_id, connection_id, "WebSocket disconnected");
}

fn is_ping(text: &str) -> bool {
    let text = text.trim();
    text.eq_ignore_ascii_case("ping")
        || matches!(serde_json::from_str::<ClientMessage>(text), Ok(ClientMessage::Ping))
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    TooManyRequests(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            AppError::Internal(msg) => {
                error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        let message = err.to_string();
        match err {
            RegistryError::InvalidSession(_) | RegistryError::NotFound(_) => {
                AppError::NotFound(message)
            }
            RegistryError::CapacityExceeded(_) => AppError::TooManyRequests(message),
            RegistryError::InvalidTransition { .. } | RegistryError::RemoteIdAlreadyAssigned(_) => {
                AppError::Conflict(message)
            }
        }
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let message = err.to_string();
        match err {
            UploadError::UnsupportedFormat(_) | UploadError::TooLarge { .. } => {
                AppError::BadRequest(message)
            }
            UploadError::NotFound(_) => AppError::NotFound(message),
            UploadError::Io(_) => AppError::Internal(message),
        }
    }
}

impl From<SubmissionError> for AppError {
    fn from(err: SubmissionError) -> Self {
        match err {
            SubmissionError::Invalid(message) => AppError::BadRequest(message),
            SubmissionError::Registry(err) => err.into(),
            // A dangling image reference is a malformed request, not a missing route.
            SubmissionError::Upload(err @ UploadError::NotFound(_)) => {
                AppError::BadRequest(err.to_string())
            }
            SubmissionError::Upload(err) => err.into(),
        }
    }
}
