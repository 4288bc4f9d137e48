use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::remote::RemoteCredentials;

pub const DEFAULT_MODEL: &str = "MiniMax-Hailuo-02";
pub const DEFAULT_RESOLUTION: &str = "768P";
pub const DEFAULT_DURATION_SECS: u32 = 6;

/// Lifecycle of a generation task.
///
/// Transitions only move forward:
/// `Pending -> Submitted -> Processing -> {Succeeded, Failed}`, with
/// `Submitted` allowed to jump straight to a terminal state, `Pending` allowed
/// to fail on a rejected submission, and `Cancelled` reachable from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Submitted,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Statuses the poller refreshes against the remote service.
    pub fn is_pollable(self) -> bool {
        matches!(self, Self::Submitted | Self::Processing)
    }

    /// Position in the state machine; terminal states share the last rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Submitted => 1,
            Self::Processing => 2,
            Self::Succeeded | Self::Failed | Self::Cancelled => 3,
        }
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        match (self, next) {
            (Pending, Submitted | Failed | Cancelled) => true,
            (Submitted, Processing | Succeeded | Failed | Cancelled) => true,
            (Processing, Succeeded | Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller asked the remote service to generate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParams {
    pub prompt: String,
    pub model: String,
    /// Upload references; at most one is used per task.
    pub image_refs: Vec<String>,
    pub duration_secs: u32,
    pub resolution: String,
    pub prompt_optimizer: bool,
    pub watermark: bool,
    /// Not serialized; snapshots carry no credentials.
    #[serde(skip)]
    pub credentials: RemoteCredentials,
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            model: DEFAULT_MODEL.to_string(),
            image_refs: Vec::new(),
            duration_secs: DEFAULT_DURATION_SECS,
            resolution: DEFAULT_RESOLUTION.to_string(),
            prompt_optimizer: true,
            watermark: true,
            credentials: RemoteCredentials::default(),
        }
    }
}

/// Result or error that accompanies a status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    None,
    Result(String),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub session_id: String,
    pub remote_job_id: Option<String>,
    pub trace_id: Option<String>,
    pub status: TaskStatus,
    pub params: TaskParams,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_url: Option<String>,
    pub error: Option<String>,
    pub message: String,
    pub consecutive_poll_failures: u32,
    /// Bumped on every mutation; lets consumers discard stale copies.
    pub version: u64,
}

impl Task {
    pub fn new(id: String, session_id: String, params: TaskParams, now: DateTime<Utc>) -> Self {
        Self {
            id,
            session_id,
            remote_job_id: None,
            trace_id: None,
            status: TaskStatus::Pending,
            params,
            created_at: now,
            updated_at: now,
            last_polled_at: None,
            completed_at: None,
            result_url: None,
            error: None,
            message: "Preparing submission".to_string(),
            consecutive_poll_failures: 0,
            version: 1,
        }
    }

    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds().max(0)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id.clone(),
            session_id: self.session_id.clone(),
            status: self.status,
            result: self.result_url.clone(),
            error: self.error.clone(),
            message: self.message.clone(),
            remote_job_id: self.remote_job_id.clone(),
            trace_id: self.trace_id.clone(),
            model: self.params.model.clone(),
            prompt: self.params.prompt.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            version: self.version,
        }
    }

    pub fn event(&self) -> TaskEvent {
        TaskEvent {
            session_id: self.session_id.clone(),
            api_key_hint: self.params.credentials.key_hint(),
            snapshot: self.snapshot(),
        }
    }
}

/// Human readable progress line shown next to the status.
pub fn status_message(status: TaskStatus, elapsed_secs: i64, error: Option<&str>) -> String {
    match status {
        TaskStatus::Pending => "Preparing submission".to_string(),
        TaskStatus::Submitted => format!("Queued ({elapsed_secs}s elapsed)"),
        TaskStatus::Processing => format!("Generating ({elapsed_secs}s elapsed)"),
        TaskStatus::Succeeded => format!("Generated in {elapsed_secs}s"),
        TaskStatus::Failed => match error {
            Some(detail) => format!("Generation failed: {detail}"),
            None => "Generation failed".to_string(),
        },
        TaskStatus::Cancelled => "Cancelled".to_string(),
    }
}

/// Point-in-time view of a task, returned by the status endpoint and pushed
/// to sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub session_id: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub message: String,
    pub remote_job_id: Option<String>,
    pub trace_id: Option<String>,
    pub model: String,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

/// Published by the registry after every accepted mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub session_id: String,
    /// Masked key the task runs under, for usage statistics.
    pub api_key_hint: Option<String>,
    pub snapshot: TaskSnapshot,
}
