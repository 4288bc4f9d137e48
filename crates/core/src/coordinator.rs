//! Wiring between the registry, sessions, uploads and the remote service.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::clock::Clock;
use crate::config::{resolve_relative_to, AppConfig};
use crate::error::{RegistryError, SubmissionError, UploadError};
use crate::poller::Poller;
use crate::registry::{CapacityLimits, SessionLookup, TaskRegistry};
use crate::remote::{RemoteCredentials, SubmitRequest, VideoApi, SUBJECT_REFERENCE_MODEL};
use crate::sessions::{ApiKeyUsage, SessionManager, SessionSummary};
use crate::task::{
    TaskOutcome, TaskParams, TaskSnapshot, TaskStatus, DEFAULT_DURATION_SECS, DEFAULT_MODEL,
    DEFAULT_RESOLUTION,
};
use crate::uploads::{Upload, UploadStore};

const SUPPORTED_DURATIONS: [u32; 2] = [6, 10];

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_duration() -> u32 {
    DEFAULT_DURATION_SECS
}

fn default_resolution() -> String {
    DEFAULT_RESOLUTION.to_string()
}

fn default_true() -> bool {
    true
}

fn default_videos_per_image() -> u32 {
    1
}

/// Body of `POST /api/generate`. `api_key` and `api_url` let each user run
/// against their own account; the configured ones are used otherwise.
#[derive(Clone, Deserialize)]
pub struct GenerationRequest {
    pub session_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub image_refs: Vec<String>,
    #[serde(default = "default_duration")]
    pub duration: u32,
    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default = "default_true")]
    pub prompt_optimizer: bool,
    #[serde(default = "default_true")]
    pub watermark: bool,
    #[serde(default = "default_videos_per_image")]
    pub videos_per_image: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationAccepted {
    pub session_id: String,
    pub task_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub total_sessions: usize,
    pub connected_sessions: usize,
    pub total_tasks: usize,
    pub active_tasks: usize,
    pub uploads: usize,
    pub total_api_keys: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminStats {
    pub sessions: Vec<SessionSummary>,
    pub api_keys: Vec<ApiKeyUsage>,
    pub system: SystemStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: usize,
    pub tasks: usize,
    pub uploads: usize,
    pub api_keys: usize,
}

pub struct Coordinator {
    registry: Arc<TaskRegistry>,
    sessions: Arc<SessionManager>,
    uploads: Arc<UploadStore>,
    api: Arc<dyn VideoApi>,
    poller: Arc<Poller>,
    clock: Arc<dyn Clock>,
    default_credentials: RemoteCredentials,
    max_videos_per_image: u32,
    retention: chrono::Duration,
    poll_interval: Duration,
    sweep_interval: Duration,
}

impl Coordinator {
    pub fn new(
        config: &AppConfig,
        data_dir: &Path,
        api: Arc<dyn VideoApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(TaskRegistry::new(
            CapacityLimits {
                global: config.tasks.global_cap,
                per_session: config.tasks.per_session_cap,
            },
            clock.clone(),
        ));
        let uploads = Arc::new(UploadStore::new(
            resolve_relative_to(data_dir, &config.uploads.dir),
            config.uploads.max_file_bytes,
            config.uploads.expiry(),
            clock.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            registry.clone(),
            uploads.clone(),
            clock.clone(),
            config.sessions.grace_period(),
        ));
        let poller = Arc::new(Poller::new(
            registry.clone(),
            api.clone(),
            clock.clone(),
            config.tasks.failure_threshold,
            config.tasks.max_task_duration(),
        ));

        Self {
            registry,
            sessions,
            uploads,
            api,
            poller,
            clock,
            default_credentials: RemoteCredentials::new(
                config.remote.api_url.clone(),
                config.remote.api_key.clone(),
            ),
            max_videos_per_image: config.tasks.max_videos_per_image.max(1),
            retention: config.tasks.retention(),
            poll_interval: config.tasks.poll_interval(),
            sweep_interval: config.sessions.sweep_interval(),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn uploads(&self) -> &Arc<UploadStore> {
        &self.uploads
    }

    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    pub async fn upload(
        &self,
        session_id: &str,
        bytes: &[u8],
        filename: &str,
    ) -> Result<Upload, SubmissionError> {
        self.require_session(session_id)?;
        self.sessions.touch(session_id);
        Ok(self.uploads.store(session_id, bytes, filename).await?)
    }

    /// Turn a request into per-task parameters: one task per image and
    /// `videos_per_image`, or `videos_per_image` text-only tasks.
    pub fn plan_generation(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<TaskParams>, SubmissionError> {
        self.require_session(&request.session_id)?;

        if request.videos_per_image == 0 || request.videos_per_image > self.max_videos_per_image {
            return Err(SubmissionError::Invalid(format!(
                "videos_per_image must be between 1 and {}",
                self.max_videos_per_image
            )));
        }
        if !SUPPORTED_DURATIONS.contains(&request.duration) {
            return Err(SubmissionError::Invalid(format!(
                "unsupported duration {}s, expected 6 or 10",
                request.duration
            )));
        }
        if request.model == SUBJECT_REFERENCE_MODEL && request.image_refs.is_empty() {
            return Err(SubmissionError::Invalid(format!(
                "model {SUBJECT_REFERENCE_MODEL} requires a reference image"
            )));
        }
        if request.prompt.trim().is_empty() && request.image_refs.is_empty() {
            return Err(SubmissionError::Invalid(
                "prompt must not be empty without a reference image".to_string(),
            ));
        }
        let credentials = self.resolve_credentials(request)?;
        for upload_ref in &request.image_refs {
            let upload = self.uploads.get(upload_ref)?;
            if upload.session_id != request.session_id {
                return Err(UploadError::NotFound(upload_ref.clone()).into());
            }
        }

        let base = TaskParams {
            prompt: request.prompt.trim().to_string(),
            model: request.model.clone(),
            image_refs: Vec::new(),
            duration_secs: request.duration,
            resolution: request.resolution.clone(),
            prompt_optimizer: request.prompt_optimizer,
            watermark: request.watermark,
            credentials,
        };
        let copies = request.videos_per_image as usize;
        if request.image_refs.is_empty() {
            return Ok(vec![base; copies]);
        }
        Ok(request
            .image_refs
            .iter()
            .flat_map(|upload_ref| {
                let params = TaskParams {
                    image_refs: vec![upload_ref.clone()],
                    ..base.clone()
                };
                std::iter::repeat(params).take(copies)
            })
            .collect())
    }

    /// Validate and admit a request without starting remote submission.
    pub fn create_generation(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<String>, SubmissionError> {
        let batch = self.plan_generation(request)?;
        let api_key_hint = batch
            .first()
            .and_then(|params| params.credentials.key_hint());
        let task_ids = self
            .registry
            .create_tasks(self.sessions.as_ref(), &request.session_id, batch)?;
        self.track_or_release(&request.session_id, &task_ids, api_key_hint.as_deref())?;
        info!(
            session_id = %request.session_id,
            model = %request.model,
            tasks = task_ids.len(),
            "Generation accepted"
        );
        Ok(task_ids)
    }

    /// Admit a request and submit each task in the background. Returns as soon
    /// as the tasks exist.
    pub fn submit_generation(
        self: &Arc<Self>,
        request: &GenerationRequest,
    ) -> Result<GenerationAccepted, SubmissionError> {
        let task_ids = self.create_generation(request)?;
        for task_id in &task_ids {
            let this = Arc::clone(self);
            let task_id = task_id.clone();
            tokio::spawn(async move { this.submit_task(&task_id).await });
        }
        Ok(GenerationAccepted {
            session_id: request.session_id.clone(),
            task_ids,
        })
    }

    /// Submit one pending task to the remote service. Submission is not
    /// retried; any failure is terminal for the task.
    pub async fn submit_task(&self, task_id: &str) {
        let task = match self.registry.get_task(task_id) {
            Ok(task) if task.status == TaskStatus::Pending => task,
            Ok(task) => {
                debug!(task_id, status = %task.status, "Skipping submission of non-pending task");
                return;
            }
            Err(_) => return,
        };

        let image_data_url = match task.params.image_refs.first() {
            Some(upload_ref) => match self.uploads.read_data_url(upload_ref).await {
                Ok(data_url) => Some(data_url),
                Err(err) => {
                    self.fail_submission(task_id, format!("reference image unavailable: {err}"));
                    return;
                }
            },
            None => None,
        };

        let request = SubmitRequest {
            params: task.params,
            image_data_url,
        };
        match self.api.submit(&request).await {
            Ok(receipt) => {
                if let Err(err) = self.registry.assign_remote_id(
                    task_id,
                    &receipt.remote_job_id,
                    receipt.trace_id.clone(),
                ) {
                    warn!(task_id, error = %err, "Could not record remote job id");
                    return;
                }
                info!(
                    task_id,
                    remote_job_id = %receipt.remote_job_id,
                    trace_id = receipt.trace_id.as_deref().unwrap_or("-"),
                    "Task submitted"
                );
                if let Err(err) =
                    self.registry
                        .update_status(task_id, TaskStatus::Submitted, TaskOutcome::None)
                {
                    debug!(task_id, error = %err, "Submission result arrived after task changed");
                }
            }
            Err(err) => {
                warn!(task_id, error = %err, "Task submission failed");
                self.fail_submission(task_id, err.to_string());
            }
        }
    }

    pub fn task_snapshot(&self, task_id: &str) -> Result<TaskSnapshot, RegistryError> {
        self.registry.get_task(task_id).map(|task| task.snapshot())
    }

    pub fn session_snapshots(&self, session_id: &str) -> Result<Vec<TaskSnapshot>, RegistryError> {
        self.require_session(session_id)?;
        Ok(self
            .registry
            .tasks_for_session(session_id)
            .iter()
            .map(|task| task.snapshot())
            .collect())
    }

    pub fn cancel_task(&self, task_id: &str) -> Result<TaskSnapshot, RegistryError> {
        let snapshot = self.registry.cancel_task(task_id)?;
        info!(task_id, session_id = %snapshot.session_id, "Task cancelled");
        Ok(snapshot)
    }

    pub fn admin_stats(&self) -> AdminStats {
        let sessions = self.sessions.summaries();
        let api_keys = self.sessions.api_key_usage();
        AdminStats {
            system: SystemStats {
                total_sessions: sessions.len(),
                connected_sessions: self.sessions.connected_count(),
                total_tasks: self.registry.len(),
                active_tasks: self.registry.active_count(),
                uploads: self.uploads.len(),
                total_api_keys: api_keys.len(),
            },
            sessions,
            api_keys,
        }
    }

    /// Expire abandoned sessions, old terminal tasks and stale uploads.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let sessions = self.sessions.expire_detached(now).await.len();

        let mut purged: HashMap<String, Vec<String>> = HashMap::new();
        for (task_id, session_id) in self.registry.purge_terminal_before(now - self.retention) {
            purged.entry(session_id).or_default().push(task_id);
        }
        for (session_id, task_ids) in &purged {
            self.sessions.forget_tasks(session_id, task_ids);
        }

        let uploads = self.uploads.purge_expired(now).await;
        let api_keys = self.sessions.prune_api_keys(now - self.retention);
        SweepReport {
            sessions,
            tasks: purged.values().map(Vec::len).sum(),
            uploads,
            api_keys,
        }
    }

    async fn run_janitor(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.sweep().await;
                    if report != SweepReport::default() {
                        info!(
                            sessions = report.sessions,
                            tasks = report.tasks,
                            uploads = report.uploads,
                            api_keys = report.api_keys,
                            "Janitor sweep"
                        );
                    }
                }
            }
        }
        debug!("Janitor stopped");
    }

    /// Start the poller, the event router and the janitor. All stop when
    /// `cancel` fires.
    pub fn spawn_background(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(
                self.poller
                    .clone()
                    .run(self.poll_interval, cancel.clone()),
            ),
            tokio::spawn(
                self.sessions
                    .clone()
                    .run_event_router(self.registry.subscribe(), cancel.clone()),
            ),
            tokio::spawn(
                Arc::clone(self).run_janitor(self.sweep_interval, cancel.clone()),
            ),
        ]
    }

    /// Per-request credentials, falling back to the configured ones.
    fn resolve_credentials(
        &self,
        request: &GenerationRequest,
    ) -> Result<RemoteCredentials, SubmissionError> {
        let api_url = match request.api_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => {
                let parsed = Url::parse(url).map_err(|err| {
                    SubmissionError::Invalid(format!("invalid api_url: {err}"))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(SubmissionError::Invalid(
                        "api_url must use http or https".to_string(),
                    ));
                }
                url.trim_end_matches('/').to_string()
            }
            _ => self.default_credentials.api_url.clone(),
        };
        let api_key = match request.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => self.default_credentials.api_key.clone(),
        };
        Ok(RemoteCredentials::new(api_url, api_key))
    }

    /// Hand freshly created tasks to their session. If the session vanished
    /// in between, the tasks are dropped again so they free their slots.
    fn track_or_release(
        &self,
        session_id: &str,
        task_ids: &[String],
        api_key_hint: Option<&str>,
    ) -> Result<(), SubmissionError> {
        if self.sessions.track_tasks(session_id, task_ids, api_key_hint) {
            return Ok(());
        }
        for task_id in task_ids {
            self.registry.remove_task(task_id);
        }
        warn!(session_id, tasks = task_ids.len(), "Session vanished while admitting tasks");
        Err(RegistryError::InvalidSession(session_id.to_string()).into())
    }

    fn require_session(&self, session_id: &str) -> Result<(), RegistryError> {
        if self.sessions.session_exists(session_id) {
            Ok(())
        } else {
            Err(RegistryError::InvalidSession(session_id.to_string()))
        }
    }

    fn fail_submission(&self, task_id: &str, detail: String) {
        if let Err(err) =
            self.registry
                .update_status(task_id, TaskStatus::Failed, TaskOutcome::Error(detail))
        {
            debug!(task_id, error = %err, "Could not fail task after submission error");
        }
    }
}
