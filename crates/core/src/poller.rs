use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{RegistryError, RemoteError};
use crate::registry::TaskRegistry;
use crate::remote::{RemoteStatus, VideoApi};
use crate::task::{Task, TaskOutcome, TaskStatus};

const DEFAULT_CONCURRENCY: usize = 16;

/// What a single refresh did to a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Not pollable right now (pending, terminal, or lost a race).
    Skipped,
    /// Remote state unchanged; progress message refreshed.
    Unchanged,
    Transitioned(TaskStatus),
    /// Transient failure below the threshold; retried next cycle.
    Retrying { failures: u32 },
    Exhausted,
    TimedOut,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub refreshed: usize,
    pub transitioned: usize,
    pub retrying: usize,
    pub failed: usize,
}

pub struct Poller {
    registry: Arc<TaskRegistry>,
    api: Arc<dyn VideoApi>,
    clock: Arc<dyn Clock>,
    failure_threshold: u32,
    max_duration: chrono::Duration,
    concurrency: usize,
}

impl Poller {
    pub fn new(
        registry: Arc<TaskRegistry>,
        api: Arc<dyn VideoApi>,
        clock: Arc<dyn Clock>,
        failure_threshold: u32,
        max_duration: chrono::Duration,
    ) -> Self {
        Self {
            registry,
            api,
            clock,
            failure_threshold: failure_threshold.max(1),
            max_duration,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Bring one task up to date with the remote service.
    pub async fn refresh_task(&self, task: &Task) -> PollOutcome {
        if task.status.is_terminal() {
            return PollOutcome::Skipped;
        }

        let now = self.clock.now();
        if now - task.created_at >= self.max_duration {
            let detail = format!(
                "timed out after {}s without a final result",
                task.elapsed_secs(now)
            );
            warn!(task_id = %task.id, status = %task.status, "Task exceeded maximum duration");
            return match self.apply(&task.id, TaskStatus::Failed, TaskOutcome::Error(detail)) {
                PollOutcome::Transitioned(_) => PollOutcome::TimedOut,
                other => other,
            };
        }

        if !task.status.is_pollable() {
            return PollOutcome::Skipped;
        }
        let Some(remote_job_id) = task.remote_job_id.as_deref() else {
            warn!(task_id = %task.id, "Pollable task has no remote job id");
            return PollOutcome::Skipped;
        };

        match self.api.poll(remote_job_id, &task.params.credentials).await {
            Ok(remote) => {
                self.note_poll(&task.id, true);
                self.apply_remote(task, remote)
            }
            Err(RemoteError::RemoteRejected(detail)) => {
                self.note_poll(&task.id, true);
                warn!(task_id = %task.id, remote_job_id, error = %detail, "Remote rejected status query");
                self.apply(&task.id, TaskStatus::Failed, TaskOutcome::Error(detail))
            }
            Err(RemoteError::RemoteUnavailable(detail)) => {
                let failures = self.note_poll(&task.id, false);
                if failures < self.failure_threshold {
                    debug!(task_id = %task.id, failures, error = %detail, "Transient poll failure");
                    return PollOutcome::Retrying { failures };
                }
                warn!(task_id = %task.id, failures, error = %detail, "Polling exhausted");
                let detail =
                    format!("polling exhausted after {failures} consecutive failures: {detail}");
                match self.apply(&task.id, TaskStatus::Failed, TaskOutcome::Error(detail)) {
                    PollOutcome::Transitioned(_) => PollOutcome::Exhausted,
                    other => other,
                }
            }
        }
    }

    /// Refresh every active task once. Tasks are polled concurrently, but a
    /// task never has two refreshes in flight because cycles do not overlap.
    pub async fn run_cycle(&self) -> CycleReport {
        let tasks = self.registry.list_active_tasks();
        let outcomes: Vec<PollOutcome> = stream::iter(tasks)
            .map(|task| async move { self.refresh_task(&task).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = CycleReport::default();
        for outcome in outcomes {
            match outcome {
                PollOutcome::Skipped => continue,
                PollOutcome::Unchanged => {}
                PollOutcome::Transitioned(TaskStatus::Failed)
                | PollOutcome::Exhausted
                | PollOutcome::TimedOut => {
                    report.transitioned += 1;
                    report.failed += 1;
                }
                PollOutcome::Transitioned(_) => report.transitioned += 1,
                PollOutcome::Retrying { .. } => report.retrying += 1,
            }
            report.refreshed += 1;
        }
        report
    }

    /// Poll on a fixed interval until cancelled. A slow cycle delays the next
    /// tick instead of overlapping it.
    pub async fn run(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = period.as_secs(), "Poller started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.run_cycle().await;
                    if report.refreshed > 0 {
                        debug!(
                            refreshed = report.refreshed,
                            transitioned = report.transitioned,
                            retrying = report.retrying,
                            failed = report.failed,
                            "Poll cycle finished"
                        );
                    }
                }
            }
        }
        info!("Poller stopped");
    }

    fn apply_remote(&self, task: &Task, remote: RemoteStatus) -> PollOutcome {
        match remote {
            RemoteStatus::Queued => self.touch(&task.id),
            RemoteStatus::Processing if task.status == TaskStatus::Submitted => {
                self.apply(&task.id, TaskStatus::Processing, TaskOutcome::None)
            }
            RemoteStatus::Processing => self.touch(&task.id),
            RemoteStatus::Succeeded { artifact_url } => {
                info!(task_id = %task.id, url = %artifact_url, "Generation succeeded");
                self.apply(&task.id, TaskStatus::Succeeded, TaskOutcome::Result(artifact_url))
            }
            RemoteStatus::Failed { reason } => {
                warn!(task_id = %task.id, error = %reason, "Generation failed remotely");
                self.apply(&task.id, TaskStatus::Failed, TaskOutcome::Error(reason))
            }
        }
    }

    fn apply(&self, task_id: &str, status: TaskStatus, outcome: TaskOutcome) -> PollOutcome {
        match self.registry.update_status(task_id, status, outcome) {
            Ok(_) => PollOutcome::Transitioned(status),
            Err(RegistryError::InvalidTransition { from, .. }) => {
                debug!(task_id, from = %from, to = %status, "Dropped stale poll result");
                PollOutcome::Skipped
            }
            Err(err) => {
                debug!(task_id, error = %err, "Task vanished during poll");
                PollOutcome::Skipped
            }
        }
    }

    fn touch(&self, task_id: &str) -> PollOutcome {
        match self.registry.touch_progress(task_id) {
            Ok(_) => PollOutcome::Unchanged,
            Err(_) => PollOutcome::Skipped,
        }
    }

    fn note_poll(&self, task_id: &str, succeeded: bool) -> u32 {
        self.registry.record_poll(task_id, succeeded).unwrap_or(0)
    }
}
