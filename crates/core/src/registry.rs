//! Process-wide task table.
//!
//! [`TaskRegistry`] is the single owner of [`Task`] entities. Every accepted
//! status change is published on a broadcast channel; the session layer
//! subscribes to it to push updates to connected clients.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::RegistryError;
use crate::task::{status_message, Task, TaskEvent, TaskOutcome, TaskParams, TaskSnapshot, TaskStatus};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Answers whether a session id refers to a live session. Implemented by the
/// session layer so the registry can validate ownership without owning
/// sessions itself.
pub trait SessionLookup: Send + Sync {
    fn session_exists(&self, session_id: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityLimits {
    pub global: usize,
    pub per_session: usize,
}

/// Slots held by non-terminal tasks, keyed by task id.
#[derive(Debug, Default)]
struct CapacityLedger {
    held: HashMap<String, String>,
    per_session: HashMap<String, usize>,
}

impl CapacityLedger {
    fn session_count(&self, session_id: &str) -> usize {
        self.per_session.get(session_id).copied().unwrap_or(0)
    }

    fn hold(&mut self, task_id: String, session_id: &str) {
        *self.per_session.entry(session_id.to_string()).or_default() += 1;
        self.held.insert(task_id, session_id.to_string());
    }

    fn release(&mut self, task_id: &str) -> bool {
        let Some(session_id) = self.held.remove(task_id) else {
            return false;
        };
        if let Some(count) = self.per_session.get_mut(&session_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_session.remove(&session_id);
            }
        }
        true
    }
}

pub struct TaskRegistry {
    tasks: DashMap<String, Task>,
    capacity: Mutex<CapacityLedger>,
    limits: CapacityLimits,
    events: broadcast::Sender<TaskEvent>,
    clock: Arc<dyn Clock>,
}

impl TaskRegistry {
    pub fn new(limits: CapacityLimits, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tasks: DashMap::new(),
            capacity: Mutex::new(CapacityLedger::default()),
            limits,
            events,
            clock,
        }
    }

    pub fn limits(&self) -> CapacityLimits {
        self.limits
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub fn create_task(
        &self,
        sessions: &dyn SessionLookup,
        session_id: &str,
        params: TaskParams,
    ) -> Result<String, RegistryError> {
        let mut ids = self.create_tasks(sessions, session_id, vec![params])?;
        Ok(ids.remove(0))
    }

    /// Admit a batch of tasks for one session. Either every task fits under
    /// both caps and all are created, or none is.
    pub fn create_tasks(
        &self,
        sessions: &dyn SessionLookup,
        session_id: &str,
        batch: Vec<TaskParams>,
    ) -> Result<Vec<String>, RegistryError> {
        if !sessions.session_exists(session_id) {
            return Err(RegistryError::InvalidSession(session_id.to_string()));
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = batch.iter().map(|_| Uuid::new_v4().to_string()).collect();
        {
            let mut ledger = self.lock_capacity();
            let requested = ids.len();
            if ledger.held.len() + requested > self.limits.global {
                return Err(RegistryError::CapacityExceeded(format!(
                    "global limit of {} concurrent tasks reached",
                    self.limits.global
                )));
            }
            if ledger.session_count(session_id) + requested > self.limits.per_session {
                return Err(RegistryError::CapacityExceeded(format!(
                    "session limit of {} concurrent tasks reached",
                    self.limits.per_session
                )));
            }
            for id in &ids {
                ledger.hold(id.clone(), session_id);
            }
        }

        let now = self.clock.now();
        for (id, params) in ids.iter().zip(batch) {
            let task = Task::new(id.clone(), session_id.to_string(), params, now);
            let event = task.event();
            self.tasks.insert(id.clone(), task);
            let _ = self.events.send(event);
            info!(task_id = %id, session_id, "Task created");
        }

        Ok(ids)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task, RegistryError> {
        self.tasks
            .get(task_id)
            .map(|task| task.clone())
            .ok_or_else(|| RegistryError::NotFound(task_id.to_string()))
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// Apply a state-machine transition. Stale or illegal transitions are
    /// rejected and leave the task untouched.
    pub fn update_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        outcome: TaskOutcome,
    ) -> Result<TaskSnapshot, RegistryError> {
        let now = self.clock.now();
        let (snapshot, session_id) = {
            let mut task = self
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| RegistryError::NotFound(task_id.to_string()))?;

            if !task.status.can_transition_to(new_status) {
                warn!(
                    task_id,
                    from = %task.status,
                    to = %new_status,
                    "Rejected invalid task transition"
                );
                return Err(RegistryError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: task.status,
                    to: new_status,
                });
            }

            task.status = new_status;
            task.updated_at = now;
            match outcome {
                TaskOutcome::None => {}
                TaskOutcome::Result(url) => task.result_url = Some(url),
                TaskOutcome::Error(detail) => task.error = Some(detail),
            }
            if new_status.is_terminal() {
                task.completed_at = Some(now);
            }
            task.message = status_message(new_status, task.elapsed_secs(now), task.error.as_deref());
            task.version += 1;

            let event = task.event();
            let snapshot = event.snapshot.clone();
            // Published under the entry lock so per-task event order matches
            // apply order.
            let _ = self.events.send(event);
            (snapshot, task.session_id.clone())
        };

        if new_status.is_terminal() {
            self.lock_capacity().release(task_id);
        }

        debug!(task_id, session_id = %session_id, status = %new_status, "Task status updated");
        Ok(snapshot)
    }

    /// Refresh the progress line of a non-terminal task without changing its
    /// status, e.g. to report elapsed time while the remote keeps processing.
    pub fn touch_progress(&self, task_id: &str) -> Result<TaskSnapshot, RegistryError> {
        let now = self.clock.now();
        let mut task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| RegistryError::NotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Ok(task.snapshot());
        }

        task.message = status_message(task.status, task.elapsed_secs(now), None);
        task.updated_at = now;
        task.version += 1;
        let event = task.event();
        let snapshot = event.snapshot.clone();
        let _ = self.events.send(event);
        Ok(snapshot)
    }

    /// Record the remote job id returned by a successful submission. The id
    /// can be set exactly once.
    pub fn assign_remote_id(
        &self,
        task_id: &str,
        remote_job_id: &str,
        trace_id: Option<String>,
    ) -> Result<(), RegistryError> {
        let mut task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| RegistryError::NotFound(task_id.to_string()))?;

        if task.remote_job_id.is_some() {
            warn!(task_id, remote_job_id, "Remote job id already assigned");
            return Err(RegistryError::RemoteIdAlreadyAssigned(task_id.to_string()));
        }

        task.remote_job_id = Some(remote_job_id.to_string());
        task.trace_id = trace_id;
        Ok(())
    }

    /// Record the outcome of one poll attempt and return the number of
    /// consecutive failures after it. A successful poll resets the count.
    pub fn record_poll(&self, task_id: &str, succeeded: bool) -> Result<u32, RegistryError> {
        let now = self.clock.now();
        let mut task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| RegistryError::NotFound(task_id.to_string()))?;

        task.last_polled_at = Some(now);
        if succeeded {
            task.consecutive_poll_failures = 0;
        } else {
            task.consecutive_poll_failures += 1;
        }
        Ok(task.consecutive_poll_failures)
    }

    pub fn cancel_task(&self, task_id: &str) -> Result<TaskSnapshot, RegistryError> {
        self.update_status(task_id, TaskStatus::Cancelled, TaskOutcome::None)
    }

    /// Tasks in `Pending`, `Submitted` or `Processing`.
    pub fn list_active_tasks(&self) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|entry| !entry.status.is_terminal())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn tasks_for_session(&self, session_id: &str) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| entry.session_id == session_id)
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Remove a task. Idempotent; frees its capacity slot if it still held one.
    pub fn remove_task(&self, task_id: &str) -> Option<Task> {
        let removed = self.tasks.remove(task_id).map(|(_, task)| task);
        self.lock_capacity().release(task_id);
        if removed.is_some() {
            debug!(task_id, "Task removed");
        }
        removed
    }

    pub fn remove_session_tasks(&self, session_id: &str) -> Vec<String> {
        let ids: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| entry.session_id == session_id)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &ids {
            self.remove_task(id);
        }
        ids
    }

    /// Drop terminal tasks that completed before `cutoff`. Returns
    /// `(task_id, session_id)` pairs so owners can forget them too.
    pub fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Vec<(String, String)> {
        let expired: Vec<(String, String)> = self
            .tasks
            .iter()
            .filter(|entry| {
                entry.status.is_terminal()
                    && entry.completed_at.unwrap_or(entry.updated_at) < cutoff
            })
            .map(|entry| (entry.key().clone(), entry.session_id.clone()))
            .collect();
        for (id, _) in &expired {
            self.remove_task(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.lock_capacity().held.len()
    }

    fn lock_capacity(&self) -> std::sync::MutexGuard<'_, CapacityLedger> {
        self.capacity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
