//! Client for the remote video-generation service.
//!
//! [`VideoApi`] is the seam the poller and submission path talk to;
//! [`MiniMaxClient`] is the HTTP implementation. Clients never retry: every
//! call maps to exactly one request chain and retry policy lives in the poller.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::error::RemoteError;
use crate::task::TaskParams;

pub const SUBJECT_REFERENCE_MODEL: &str = "S2V-01";
const FALLBACK_RESOLUTION: &str = "768P";
const FULL_RESOLUTION_DURATION_SECS: u32 = 6;
const WATERMARK_TAG: &str = "hailuo";
const TRACE_ID_HEADERS: [&str; 2] = ["x-minimax-trace-id", "trace-id"];
const KEY_HINT_CHARS: usize = 10;

/// Endpoint and key a task talks to the remote service with. Empty fields
/// fall back to the client's configured defaults.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RemoteCredentials {
    pub api_url: String,
    pub api_key: String,
}

impl RemoteCredentials {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Masked key suffix used to group usage statistics.
    pub fn key_hint(&self) -> Option<String> {
        let key = self.api_key.trim();
        (!key.is_empty()).then(|| mask_api_key(key))
    }
}

impl fmt::Debug for RemoteCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCredentials")
            .field("api_url", &self.api_url)
            .field("api_key", &mask_api_key(&self.api_key))
            .finish()
    }
}

/// `...` followed by the last ten characters of the key.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(KEY_HINT_CHARS)..]
        .iter()
        .collect();
    format!("...{tail}")
}

/// Everything needed to submit one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub params: TaskParams,
    /// `data:<mime>;base64,...` URL of the reference image, if any.
    pub image_data_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub remote_job_id: String,
    pub trace_id: Option<String>,
}

/// Remote view of a job, already translated out of the wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Queued,
    Processing,
    Succeeded { artifact_url: String },
    Failed { reason: String },
}

#[async_trait]
pub trait VideoApi: Send + Sync {
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitReceipt, RemoteError>;

    async fn poll(
        &self,
        remote_job_id: &str,
        credentials: &RemoteCredentials,
    ) -> Result<RemoteStatus, RemoteError>;
}

#[derive(Debug, Default, Deserialize)]
struct BaseResp {
    #[serde(default)]
    status_code: i64,
    #[serde(default)]
    status_msg: String,
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    base_resp: Option<BaseResp>,
}

#[derive(Debug, Deserialize)]
struct QueryBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    file_id: Option<String>,
    #[serde(default)]
    base_resp: Option<BaseResp>,
}

#[derive(Debug, Deserialize)]
struct RetrieveBody {
    #[serde(default)]
    file: Option<FileObject>,
    #[serde(default)]
    base_resp: Option<BaseResp>,
}

#[derive(Debug, Deserialize)]
struct FileObject {
    #[serde(default)]
    download_url: Option<String>,
}

/// HTTP client for the MiniMax video generation API.
#[derive(Debug, Clone)]
pub struct MiniMaxClient {
    api_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl MiniMaxClient {
    pub fn new(api_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(api_url).context("invalid remote API base URL")?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            api_url: parsed.as_str().trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Base URL and key for one call: per-task credentials win over the
    /// configured defaults.
    fn target<'a>(
        &'a self,
        credentials: &'a RemoteCredentials,
    ) -> Result<(String, &'a str), RemoteError> {
        let base = match credentials.api_url.trim() {
            "" => self.api_url.clone(),
            custom => Url::parse(custom)
                .map(|url| url.as_str().trim_end_matches('/').to_string())
                .map_err(|err| {
                    RemoteError::RemoteRejected(format!("invalid api_url {custom:?}: {err}"))
                })?,
        };
        let key = match credentials.api_key.trim() {
            "" => self.api_key.as_str(),
            custom => custom,
        };
        Ok((base, key))
    }

    async fn resolve_download_url(
        &self,
        base: &str,
        api_key: &str,
        file_id: &str,
    ) -> Result<String, RemoteError> {
        let response = self
            .client
            .get(format!("{base}/files/retrieve"))
            .bearer_auth(api_key)
            .query(&[("file_id", file_id)])
            .send()
            .await
            .map_err(transport_error)?;

        let body: RetrieveBody = read_json(response).await?;
        check_base_resp(body.base_resp.as_ref())?;
        body.file
            .and_then(|file| file.download_url)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                RemoteError::RemoteRejected(format!("no download url for file {file_id}"))
            })
    }
}

#[async_trait]
impl VideoApi for MiniMaxClient {
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitReceipt, RemoteError> {
        let (base, api_key) = self.target(&request.params.credentials)?;
        let payload = build_submit_payload(request);
        let response = self
            .client
            .post(format!("{base}/video_generation"))
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        let trace_id = trace_id_from_headers(response.headers());
        let body: SubmitBody = read_json(response).await?;
        check_base_resp(body.base_resp.as_ref())?;

        let remote_job_id = body
            .task_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                RemoteError::RemoteRejected("remote response did not include a task id".to_string())
            })?;

        debug!(remote_job_id = %remote_job_id, trace_id = ?trace_id, "Remote submission accepted");
        Ok(SubmitReceipt {
            remote_job_id,
            trace_id,
        })
    }

    async fn poll(
        &self,
        remote_job_id: &str,
        credentials: &RemoteCredentials,
    ) -> Result<RemoteStatus, RemoteError> {
        let (base, api_key) = self.target(credentials)?;
        let response = self
            .client
            .get(format!("{base}/query/video_generation"))
            .bearer_auth(api_key)
            .query(&[("task_id", remote_job_id)])
            .send()
            .await
            .map_err(transport_error)?;

        let body: QueryBody = read_json(response).await?;
        check_base_resp(body.base_resp.as_ref())?;

        match body.status.as_deref().unwrap_or_default() {
            "Preparing" | "Queueing" => Ok(RemoteStatus::Queued),
            "Processing" => Ok(RemoteStatus::Processing),
            "Success" => match body.file_id.filter(|id| !id.is_empty()) {
                Some(file_id) => Ok(RemoteStatus::Succeeded {
                    artifact_url: self.resolve_download_url(&base, api_key, &file_id).await?,
                }),
                None => Ok(RemoteStatus::Failed {
                    reason: "remote reported success without a file id".to_string(),
                }),
            },
            "Fail" => Ok(RemoteStatus::Failed {
                reason: body
                    .base_resp
                    .map(|resp| resp.status_msg)
                    .filter(|msg| !msg.is_empty() && msg != "success")
                    .unwrap_or_else(|| "remote generation failed".to_string()),
            }),
            other => Err(RemoteError::RemoteUnavailable(format!(
                "unrecognized remote status: {other:?}"
            ))),
        }
    }
}

/// Build the JSON body for `POST /video_generation`.
pub fn build_submit_payload(request: &SubmitRequest) -> serde_json::Value {
    let params = &request.params;

    if params.model == SUBJECT_REFERENCE_MODEL {
        let images: Vec<&str> = request.image_data_url.iter().map(String::as_str).collect();
        return json!({
            "model": params.model,
            "prompt": params.prompt,
            "prompt_optimizer": params.prompt_optimizer,
            "subject_reference": [{
                "type": "character",
                "image": images,
            }],
        });
    }

    let resolution = if params.duration_secs == FULL_RESOLUTION_DURATION_SECS {
        params.resolution.as_str()
    } else {
        FALLBACK_RESOLUTION
    };

    let mut payload = json!({
        "model": params.model,
        "prompt": params.prompt,
        "duration": params.duration_secs,
        "prompt_optimizer": params.prompt_optimizer,
        "resolution": resolution,
    });
    if let Some(image) = &request.image_data_url {
        payload["first_frame_image"] = json!(image);
    }
    if params.watermark {
        payload["watermark"] = json!(WATERMARK_TAG);
    }
    payload
}

fn trace_id_from_headers(headers: &HeaderMap) -> Option<String> {
    TRACE_ID_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    })
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    RemoteError::RemoteUnavailable(err.to_string())
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Classify the HTTP status and decode the body. Transient statuses map to
/// `RemoteUnavailable`; other failures carry the remote's own message.
async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RemoteError> {
    let status = response.status();
    if is_transient_status(status) {
        return Err(RemoteError::RemoteUnavailable(format!(
            "HTTP {}",
            status.as_u16()
        )));
    }

    let bytes = response.bytes().await.map_err(transport_error)?;
    if !status.is_success() {
        let detail = serde_json::from_slice::<serde_json::Value>(&bytes)
            .ok()
            .and_then(|value| {
                value["base_resp"]["status_msg"]
                    .as_str()
                    .filter(|msg| !msg.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        return Err(RemoteError::RemoteRejected(detail));
    }

    serde_json::from_slice(&bytes).map_err(|err| {
        RemoteError::RemoteUnavailable(format!("malformed remote response: {err}"))
    })
}

fn check_base_resp(base_resp: Option<&BaseResp>) -> Result<(), RemoteError> {
    match base_resp {
        Some(resp) if resp.status_code != 0 => {
            let detail = if resp.status_msg.is_empty() {
                format!("remote error code {}", resp.status_code)
            } else {
                resp.status_msg.clone()
            };
            Err(RemoteError::RemoteRejected(detail))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::Query;
    use axum::http::{HeaderMap as AxumHeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;

    use super::*;

    const TEST_KEY: &str = "test-key";

    fn authorized(headers: &AxumHeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {TEST_KEY}"))
    }

    async fn stub_submit(
        headers: AxumHeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> axum::response::Response {
        if !authorized(&headers) {
            return (
                AxumStatus::UNAUTHORIZED,
                Json(json!({"base_resp": {"status_code": 1004, "status_msg": "invalid api key"}})),
            )
                .into_response();
        }
        match body["prompt"].as_str().unwrap_or_default() {
            "overloaded" => AxumStatus::SERVICE_UNAVAILABLE.into_response(),
            "sensitive" => Json(json!({
                "task_id": "",
                "base_resp": {"status_code": 1026, "status_msg": "input contains sensitive content"}
            }))
            .into_response(),
            _ => (
                [("X-Minimax-Trace-Id", "trace-abc")],
                Json(json!({"task_id": "remote-1", "base_resp": {"status_code": 0, "status_msg": "success"}})),
            )
                .into_response(),
        }
    }

    async fn stub_query(Query(query): Query<HashMap<String, String>>) -> axum::response::Response {
        let body = match query.get("task_id").map(String::as_str) {
            Some("queued") => json!({"status": "Queueing"}),
            Some("running") => json!({"status": "Processing"}),
            Some("done") => json!({"status": "Success", "file_id": "file-9"}),
            Some("broken") => json!({"status": "Fail", "base_resp": {"status_code": 0, "status_msg": "content moderation"}}),
            Some("boom") => return AxumStatus::BAD_GATEWAY.into_response(),
            _ => json!({"status": "Mystery"}),
        };
        Json(body).into_response()
    }

    async fn stub_retrieve(Query(query): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
        let file_id = query.get("file_id").cloned().unwrap_or_default();
        Json(json!({"file": {"download_url": format!("https://cdn.example/{file_id}.mp4")}}))
    }

    async fn spawn_stub() -> String {
        let app = Router::new()
            .route("/v1/video_generation", post(stub_submit))
            .route("/v1/query/video_generation", get(stub_query))
            .route("/v1/files/retrieve", get(stub_retrieve));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    fn client(base: &str, key: &str) -> MiniMaxClient {
        MiniMaxClient::new(base, key, Duration::from_secs(5)).unwrap()
    }

    fn request(model: &str, prompt: &str, image: Option<&str>) -> SubmitRequest {
        SubmitRequest {
            params: TaskParams {
                prompt: prompt.to_string(),
                model: model.to_string(),
                ..Default::default()
            },
            image_data_url: image.map(str::to_string),
        }
    }

    #[test]
    fn subject_reference_payload_omits_duration_and_resolution() {
        let payload = build_submit_payload(&request("S2V-01", "hero", Some("data:image/png;base64,AA")));
        assert_eq!(payload["subject_reference"][0]["type"], "character");
        assert_eq!(payload["subject_reference"][0]["image"][0], "data:image/png;base64,AA");
        assert!(payload.get("duration").is_none());
        assert!(payload.get("resolution").is_none());
    }

    #[test]
    fn long_clips_fall_back_to_default_resolution() {
        let mut req = request("MiniMax-Hailuo-02", "sea", None);
        req.params.resolution = "1080P".to_string();
        assert_eq!(build_submit_payload(&req)["resolution"], "1080P");

        req.params.duration_secs = 10;
        let payload = build_submit_payload(&req);
        assert_eq!(payload["resolution"], "768P");
        assert_eq!(payload["watermark"], "hailuo");
        assert!(payload.get("first_frame_image").is_none());
    }

    #[test]
    fn first_frame_image_and_watermark_toggle() {
        let mut req = request("I2V-01", "sea", Some("data:image/jpeg;base64,/9j"));
        req.params.watermark = false;
        let payload = build_submit_payload(&req);
        assert_eq!(payload["first_frame_image"], "data:image/jpeg;base64,/9j");
        assert!(payload.get("watermark").is_none());
    }

    #[tokio::test]
    async fn submit_returns_remote_id_and_trace_id() {
        let base = spawn_stub().await;
        let receipt = client(&base, TEST_KEY)
            .submit(&request("I2V-01", "a cat", None))
            .await
            .unwrap();
        assert_eq!(receipt.remote_job_id, "remote-1");
        assert_eq!(receipt.trace_id.as_deref(), Some("trace-abc"));
    }

    #[tokio::test]
    async fn submit_propagates_remote_rejection_detail() {
        let base = spawn_stub().await;

        let err = client(&base, "wrong-key")
            .submit(&request("I2V-01", "a cat", None))
            .await
            .unwrap_err();
        assert_eq!(err, RemoteError::RemoteRejected("invalid api key".to_string()));

        let err = client(&base, TEST_KEY)
            .submit(&request("I2V-01", "sensitive", None))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RemoteError::RemoteRejected("input contains sensitive content".to_string())
        );
    }

    #[tokio::test]
    async fn submit_maps_server_errors_to_unavailable() {
        let base = spawn_stub().await;
        let err = client(&base, TEST_KEY)
            .submit(&request("I2V-01", "overloaded", None))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::RemoteUnavailable(_)));
    }

    #[tokio::test]
    async fn poll_translates_remote_statuses() {
        let base = spawn_stub().await;
        let api = client(&base, TEST_KEY);
        let none = RemoteCredentials::default();

        assert_eq!(api.poll("queued", &none).await.unwrap(), RemoteStatus::Queued);
        assert_eq!(
            api.poll("running", &none).await.unwrap(),
            RemoteStatus::Processing
        );
        assert_eq!(
            api.poll("done", &none).await.unwrap(),
            RemoteStatus::Succeeded {
                artifact_url: "https://cdn.example/file-9.mp4".to_string()
            }
        );
        assert_eq!(
            api.poll("broken", &none).await.unwrap(),
            RemoteStatus::Failed {
                reason: "content moderation".to_string()
            }
        );
    }

    #[tokio::test]
    async fn poll_failures_are_transient() {
        let base = spawn_stub().await;
        let api = client(&base, TEST_KEY);
        let none = RemoteCredentials::default();

        assert!(matches!(
            api.poll("boom", &none).await,
            Err(RemoteError::RemoteUnavailable(_))
        ));
        assert!(matches!(
            api.poll("unknown", &none).await,
            Err(RemoteError::RemoteUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_service_is_unavailable() {
        let api = MiniMaxClient::new("http://127.0.0.1:1/v1", TEST_KEY, Duration::from_secs(2)).unwrap();
        let none = RemoteCredentials::default();
        assert!(matches!(
            api.poll("anything", &none).await,
            Err(RemoteError::RemoteUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn per_task_credentials_override_configured_defaults() {
        let base = spawn_stub().await;
        let api = client("http://127.0.0.1:1/v1", "server-key");

        let mut req = request("I2V-01", "a cat", None);
        req.params.credentials = RemoteCredentials::new(base.clone(), TEST_KEY);
        let receipt = api.submit(&req).await.unwrap();
        assert_eq!(receipt.remote_job_id, "remote-1");

        let own = RemoteCredentials::new(base, "");
        req.params.credentials = own.clone();
        let err = api.submit(&req).await.unwrap_err();
        assert_eq!(err, RemoteError::RemoteRejected("invalid api key".to_string()));
        assert_eq!(api.poll("running", &own).await.unwrap(), RemoteStatus::Processing);
    }

    #[tokio::test]
    async fn malformed_per_task_url_is_rejected() {
        let api = client("http://127.0.0.1:1/v1", TEST_KEY);
        let err = api
            .poll("queued", &RemoteCredentials::new("not a url", TEST_KEY))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::RemoteRejected(_)));
    }

    #[test]
    fn credentials_never_print_the_full_key() {
        let credentials = RemoteCredentials::new("https://api.example/v1", "sk-abcdefghijklmnop");
        assert_eq!(credentials.key_hint().as_deref(), Some("...ghijklmnop"));
        assert_eq!(mask_api_key("short"), "...short");
        assert!(!format!("{credentials:?}").contains("sk-abcdef"));
        assert_eq!(RemoteCredentials::default().key_hint(), None);
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(MiniMaxClient::new("not a url", TEST_KEY, Duration::from_secs(1)).is_err());
    }
}
