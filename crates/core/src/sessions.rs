//! Session bookkeeping and push delivery.
//!
//! A session outlives its WebSocket: when the socket drops the session is
//! only marked detached, and the janitor tears it down once the grace period
//! runs out. Reattaching before that resyncs every owned task.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::registry::{SessionLookup, TaskRegistry};
use crate::task::{TaskEvent, TaskSnapshot, TaskStatus};
use crate::uploads::UploadStore;

/// Messages pushed from the server to a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TaskUpdate {
        task_id: String,
        status: TaskStatus,
        result: Option<String>,
        error: Option<String>,
        message: String,
        version: u64,
    },
    Pong,
}

impl ServerMessage {
    pub fn task_update(snapshot: &TaskSnapshot) -> Self {
        Self::TaskUpdate {
            task_id: snapshot.task_id.clone(),
            status: snapshot.status,
            result: snapshot.result.clone(),
            error: snapshot.error.clone(),
            message: snapshot.message.clone(),
            version: snapshot.version,
        }
    }
}

/// Sender half of a session's push channel.
pub type PushChannel = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    pub requests: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl SessionCounters {
    fn record_outcome(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Succeeded => self.succeeded += 1,
            TaskStatus::Failed => self.failed += 1,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub connected: bool,
    pub task_count: usize,
    #[serde(flatten)]
    pub counters: SessionCounters,
    /// Masked key of the session's latest request.
    pub api_key_hint: Option<String>,
    pub client_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// Requests and outcomes grouped by masked API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiKeyUsage {
    pub api_key_hint: String,
    #[serde(flatten)]
    pub counters: SessionCounters,
    pub sessions: BTreeSet<String>,
    pub last_used: DateTime<Utc>,
}

impl ApiKeyUsage {
    fn new(api_key_hint: &str, now: DateTime<Utc>) -> Self {
        Self {
            api_key_hint: api_key_hint.to_string(),
            counters: SessionCounters::default(),
            sessions: BTreeSet::new(),
            last_used: now,
        }
    }
}

struct Attachment {
    connection_id: u64,
    sender: PushChannel,
}

struct Session {
    tasks: HashSet<String>,
    channel: Option<Attachment>,
    detached_at: Option<DateTime<Utc>>,
    /// Highest task version pushed on the current channel.
    delivered: HashMap<String, u64>,
    counters: SessionCounters,
    api_key_hint: Option<String>,
    client_ip: Option<String>,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
}

impl Session {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            tasks: HashSet::new(),
            channel: None,
            detached_at: Some(now),
            delivered: HashMap::new(),
            counters: SessionCounters::default(),
            api_key_hint: None,
            client_ip: None,
            created_at: now,
            last_active: now,
        }
    }

    /// Push one snapshot unless the channel already saw this version or a
    /// newer one. A failed send drops the channel.
    fn push(&mut self, snapshot: &TaskSnapshot, now: DateTime<Utc>) -> bool {
        let Some(attachment) = &self.channel else {
            return false;
        };
        let seen = self.delivered.get(&snapshot.task_id).copied().unwrap_or(0);
        if snapshot.version <= seen {
            return false;
        }
        if attachment.sender.send(ServerMessage::task_update(snapshot)).is_err() {
            self.channel = None;
            self.detached_at = Some(now);
            return false;
        }
        self.delivered.insert(snapshot.task_id.clone(), snapshot.version);
        true
    }
}

pub struct SessionManager {
    sessions: DashMap<String, Session>,
    api_keys: DashMap<String, ApiKeyUsage>,
    registry: Arc<TaskRegistry>,
    uploads: Arc<UploadStore>,
    clock: Arc<dyn Clock>,
    grace_period: chrono::Duration,
    next_connection: AtomicU64,
}

impl SessionManager {
    pub fn new(
        registry: Arc<TaskRegistry>,
        uploads: Arc<UploadStore>,
        clock: Arc<dyn Clock>,
        grace_period: chrono::Duration,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            api_keys: DashMap::new(),
            registry,
            uploads,
            clock,
            grace_period,
            next_connection: AtomicU64::new(1),
        }
    }

    /// Create a session with no channel. It expires after the grace period
    /// unless a client attaches.
    pub fn create_session(&self) -> String {
        let session_id = Uuid::new_v4().to_string();
        self.sessions
            .insert(session_id.clone(), Session::new(self.clock.now()));
        info!(session_id = %session_id, "Session created");
        session_id
    }

    /// Attach a push channel, replacing any previous one, and resync the
    /// current state of every owned task. Unknown ids start a fresh session.
    /// Returns the connection id to pass back to [`Self::detach`].
    pub fn attach(&self, session_id: &str, sender: PushChannel) -> u64 {
        let now = self.clock.now();
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);

        let mut session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!(session_id, "Session created on connect");
                Session::new(now)
            });
        let replaced = session.channel.is_some();
        session.channel = Some(Attachment {
            connection_id,
            sender,
        });
        session.detached_at = None;
        session.last_active = now;
        session.delivered.clear();

        let mut snapshots = Vec::with_capacity(session.tasks.len());
        session.tasks.retain(|task_id| match self.registry.get_task(task_id) {
            Ok(task) => {
                snapshots.push(task.snapshot());
                true
            }
            Err(_) => false,
        });
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let resynced = snapshots
            .iter()
            .filter(|snapshot| session.push(snapshot, now))
            .count();

        info!(session_id, connection_id, replaced, resynced, "Session attached");
        connection_id
    }

    /// Drop the channel if it still belongs to `connection_id` and start the
    /// grace period. A stale connection closing after a reconnect is ignored.
    pub fn detach(&self, session_id: &str, connection_id: u64) {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return;
        };
        let current = session
            .channel
            .as_ref()
            .is_some_and(|attachment| attachment.connection_id == connection_id);
        if !current {
            debug!(session_id, connection_id, "Ignoring detach of replaced connection");
            return;
        }
        let now = self.clock.now();
        session.channel = None;
        session.detached_at = Some(now);
        session.last_active = now;
        info!(session_id, connection_id, "Session detached");
    }

    /// Record newly created tasks as owned by `session_id`. Returns `false`
    /// when the session is gone, in which case nothing is recorded.
    pub fn track_tasks(
        &self,
        session_id: &str,
        task_ids: &[String],
        api_key_hint: Option<&str>,
    ) -> bool {
        let now = self.clock.now();
        {
            let Some(mut session) = self.sessions.get_mut(session_id) else {
                warn!(session_id, "Tracking tasks for unknown session");
                return false;
            };
            session.tasks.extend(task_ids.iter().cloned());
            session.counters.requests += task_ids.len() as u64;
            session.last_active = now;
            if let Some(hint) = api_key_hint {
                session.api_key_hint = Some(hint.to_string());
            }
        }

        if let Some(hint) = api_key_hint {
            let mut usage = self
                .api_keys
                .entry(hint.to_string())
                .or_insert_with(|| ApiKeyUsage::new(hint, now));
            usage.counters.requests += task_ids.len() as u64;
            usage.sessions.insert(session_id.to_string());
            usage.last_used = now;
        }
        true
    }

    /// Drop purged tasks from the session's index and delivery history.
    pub fn forget_tasks(&self, session_id: &str, task_ids: &[String]) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            for task_id in task_ids {
                session.tasks.remove(task_id);
                session.delivered.remove(task_id);
            }
        }
    }

    pub fn record_client_ip(&self, session_id: &str, client_ip: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.client_ip = Some(client_ip.to_string());
        }
    }

    pub fn touch(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.last_active = self.clock.now();
        }
    }

    /// Best-effort push of one registry event to its owning session.
    pub fn deliver(&self, event: &TaskEvent) -> bool {
        let Some(mut session) = self.sessions.get_mut(&event.session_id) else {
            return false;
        };
        let snapshot = &event.snapshot;
        if !session.tasks.contains(&snapshot.task_id) {
            // Creation events can race ahead of `track_tasks`.
            if snapshot.status != TaskStatus::Pending {
                return false;
            }
            session.tasks.insert(snapshot.task_id.clone());
        }

        let now = self.clock.now();
        session.counters.record_outcome(snapshot.status);
        if snapshot.status.is_terminal() {
            if let Some(mut usage) = event
                .api_key_hint
                .as_deref()
                .and_then(|hint| self.api_keys.get_mut(hint))
            {
                usage.counters.record_outcome(snapshot.status);
                usage.last_used = now;
            }
        }

        session.push(snapshot, now)
    }

    /// Forward registry events to sessions until cancelled.
    pub async fn run_event_router(
        self: Arc<Self>,
        mut events: broadcast::Receiver<TaskEvent>,
        cancel: CancellationToken,
    ) {
        info!("Event router started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        self.deliver(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event router lagged; clients recover on reconnect");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("Event router stopped");
    }

    /// Tear down every detached session whose grace period ended by `now`.
    pub async fn expire_detached(&self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| self.is_expired(entry.value(), now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for session_id in expired {
            let still_expired = self
                .sessions
                .remove_if(&session_id, |_, session| self.is_expired(session, now))
                .is_some();
            if still_expired {
                self.release_resources(&session_id).await;
                removed.push(session_id);
            }
        }
        removed
    }

    /// Remove a session together with its tasks and uploads.
    pub async fn teardown(&self, session_id: &str) -> bool {
        if self.sessions.remove(session_id).is_none() {
            return false;
        }
        self.release_resources(session_id).await;
        true
    }

    async fn release_resources(&self, session_id: &str) {
        let tasks = self.registry.remove_session_tasks(session_id);
        for mut usage in self.api_keys.iter_mut() {
            usage.sessions.remove(session_id);
        }
        let uploads = self.uploads.purge_session(session_id).await;
        info!(
            session_id,
            tasks = tasks.len(),
            uploads,
            "Session torn down"
        );
    }

    fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        session.channel.is_none()
            && session
                .detached_at
                .is_some_and(|detached_at| detached_at + self.grace_period <= now)
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|session| session.channel.is_some())
    }

    pub fn owned_tasks(&self, session_id: &str) -> Option<HashSet<String>> {
        self.sessions
            .get(session_id)
            .map(|session| session.tasks.clone())
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| SessionSummary {
                session_id: entry.key().clone(),
                connected: entry.channel.is_some(),
                task_count: entry.tasks.len(),
                counters: entry.counters,
                api_key_hint: entry.api_key_hint.clone(),
                client_ip: entry.client_ip.clone(),
                created_at: entry.created_at,
                last_active: entry.last_active,
            })
            .collect();
        summaries.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        summaries
    }

    pub fn api_key_usage(&self) -> Vec<ApiKeyUsage> {
        let mut usage: Vec<ApiKeyUsage> = self
            .api_keys
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        usage.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        usage
    }

    /// Forget keys not used since `cutoff`.
    pub fn prune_api_keys(&self, cutoff: DateTime<Utc>) -> usize {
        let mut pruned = 0;
        self.api_keys.retain(|_, usage| {
            let keep = usage.last_used >= cutoff;
            if !keep {
                pruned += 1;
            }
            keep
        });
        pruned
    }

    pub fn connected_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.channel.is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionLookup for SessionManager {
    fn session_exists(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::CapacityLimits;
    use crate::remote::RemoteCredentials;
    use crate::task::{TaskOutcome, TaskParams};

    struct Fixture {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        registry: Arc<TaskRegistry>,
        uploads: Arc<UploadStore>,
        sessions: SessionManager,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let registry = Arc::new(TaskRegistry::new(
            CapacityLimits {
                global: 16,
                per_session: 8,
            },
            clock.clone(),
        ));
        let uploads = Arc::new(UploadStore::new(
            dir.path().join("uploads"),
            1024 * 1024,
            Duration::hours(1),
            clock.clone(),
        ));
        let sessions = SessionManager::new(
            registry.clone(),
            uploads.clone(),
            clock.clone(),
            Duration::seconds(120),
        );
        Fixture {
            _dir: dir,
            clock,
            registry,
            uploads,
            sessions,
        }
    }

    fn create_tasks(fx: &Fixture, session_id: &str, count: usize) -> Vec<String> {
        let batch = (0..count)
            .map(|i| TaskParams {
                prompt: format!("clip {i}"),
                ..Default::default()
            })
            .collect();
        let ids = fx
            .registry
            .create_tasks(&fx.sessions, session_id, batch)
            .unwrap();
        assert!(fx.sessions.track_tasks(session_id, &ids, None));
        ids
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn update_ids(messages: &[ServerMessage]) -> HashSet<String> {
        messages
            .iter()
            .filter_map(|message| match message {
                ServerMessage::TaskUpdate { task_id, .. } => Some(task_id.clone()),
                ServerMessage::Pong => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn reconnect_within_grace_keeps_session_and_tasks() {
        let fx = fixture();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = fx.sessions.attach("s1", tx);
        let ids = create_tasks(&fx, "s1", 3);

        fx.sessions.detach("s1", connection);
        fx.clock.advance(Duration::seconds(60));
        assert!(fx.sessions.expire_detached(fx.clock.now()).await.is_empty());

        let (tx, mut rx) = mpsc::unbounded_channel();
        fx.sessions.attach("s1", tx);
        let resynced = update_ids(&drain(&mut rx));

        assert_eq!(resynced, ids.iter().cloned().collect::<HashSet<_>>());
        for id in &ids {
            assert_eq!(fx.registry.get_task(id).unwrap().status, TaskStatus::Pending);
        }
    }

    #[tokio::test]
    async fn grace_expiry_tears_down_session_tasks_and_uploads() {
        let fx = fixture();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = fx.sessions.attach("s1", tx);
        let ids = create_tasks(&fx, "s1", 3);
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        fx.uploads.store("s1", &png, "a.png").await.unwrap();

        fx.sessions.detach("s1", connection);
        fx.clock.advance(Duration::seconds(121));
        let removed = fx.sessions.expire_detached(fx.clock.now()).await;

        assert_eq!(removed, vec!["s1".to_string()]);
        assert!(!fx.sessions.session_exists("s1"));
        assert!(ids.iter().all(|id| !fx.registry.contains(id)));
        assert!(fx.uploads.is_empty());
        assert_eq!(fx.registry.active_count(), 0);
    }

    #[tokio::test]
    async fn unattached_sessions_expire_after_grace() {
        let fx = fixture();
        let session_id = fx.sessions.create_session();
        fx.clock.advance(Duration::seconds(121));

        assert_eq!(fx.sessions.expire_detached(fx.clock.now()).await, vec![session_id]);
        assert!(fx.sessions.is_empty());
    }

    #[tokio::test]
    async fn attached_sessions_never_expire() {
        let fx = fixture();
        let (tx, _rx) = mpsc::unbounded_channel();
        fx.sessions.attach("s1", tx);
        fx.clock.advance(Duration::hours(5));

        assert!(fx.sessions.expire_detached(fx.clock.now()).await.is_empty());
        assert!(fx.sessions.is_connected("s1"));
    }

    #[test]
    fn stale_detach_does_not_drop_newer_connection() {
        let fx = fixture();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let old = fx.sessions.attach("s1", old_tx);
        let (new_tx, _new_rx) = mpsc::unbounded_channel();
        fx.sessions.attach("s1", new_tx);

        fx.sessions.detach("s1", old);
        assert!(fx.sessions.is_connected("s1"));
    }

    #[test]
    fn deliver_routes_to_owner_and_drops_stale_versions() {
        let fx = fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        fx.sessions.attach("s1", tx);
        let (other_tx, mut other_rx) = mpsc::unbounded_channel();
        fx.sessions.attach("s2", other_tx);
        let mut events = fx.registry.subscribe();
        let id = create_tasks(&fx, "s1", 1).remove(0);

        fx.registry
            .update_status(&id, TaskStatus::Submitted, TaskOutcome::None)
            .unwrap();
        fx.registry
            .update_status(&id, TaskStatus::Processing, TaskOutcome::None)
            .unwrap();
        let collected: Vec<TaskEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();

        // Deliver newest first; the older ones must be discarded.
        for event in collected.iter().rev() {
            fx.sessions.deliver(event);
        }

        let received = drain(&mut rx);
        assert_eq!(received.len(), 1);
        assert!(matches!(
            received[0],
            ServerMessage::TaskUpdate {
                status: TaskStatus::Processing,
                ..
            }
        ));
        assert!(drain(&mut other_rx).is_empty());
    }

    #[test]
    fn deliver_without_channel_is_dropped_and_counts_outcomes() {
        let fx = fixture();
        let session_id = fx.sessions.create_session();
        let mut events = fx.registry.subscribe();
        let id = create_tasks(&fx, &session_id, 1).remove(0);
        fx.registry
            .update_status(&id, TaskStatus::Failed, TaskOutcome::Error("nope".into()))
            .unwrap();

        let delivered: Vec<bool> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|event| fx.sessions.deliver(&event))
            .collect();
        assert!(delivered.iter().all(|sent| !sent));

        let summary = fx.sessions.summaries().remove(0);
        assert_eq!(
            summary.counters,
            SessionCounters {
                requests: 1,
                succeeded: 0,
                failed: 1,
            }
        );
    }

    #[tokio::test]
    async fn api_key_usage_groups_sessions_by_masked_key() {
        let fx = fixture();
        let credentials = RemoteCredentials::new("", "sk-live-0123456789abcdef");
        let hint = credentials.key_hint().unwrap();
        let mut events = fx.registry.subscribe();
        let mut ids = Vec::new();
        for session_id in ["s1", "s2"] {
            let (tx, _rx) = mpsc::unbounded_channel();
            fx.sessions.attach(session_id, tx);
            let params = TaskParams {
                credentials: credentials.clone(),
                ..Default::default()
            };
            let created = fx
                .registry
                .create_tasks(&fx.sessions, session_id, vec![params])
                .unwrap();
            assert!(fx.sessions.track_tasks(session_id, &created, Some(&hint)));
            ids.extend(created);
        }
        fx.sessions.record_client_ip("s1", "203.0.113.7");
        fx.registry
            .update_status(&ids[0], TaskStatus::Submitted, TaskOutcome::None)
            .unwrap();
        fx.registry
            .update_status(
                &ids[0],
                TaskStatus::Succeeded,
                TaskOutcome::Result("https://x/y.mp4".into()),
            )
            .unwrap();
        fx.registry
            .update_status(&ids[1], TaskStatus::Failed, TaskOutcome::Error("quota".into()))
            .unwrap();
        while let Ok(event) = events.try_recv() {
            fx.sessions.deliver(&event);
        }

        let usage = fx.sessions.api_key_usage();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].api_key_hint, "...6789abcdef");
        assert_eq!(
            usage[0].counters,
            SessionCounters {
                requests: 2,
                succeeded: 1,
                failed: 1,
            }
        );
        assert_eq!(usage[0].sessions.len(), 2);
        let s1 = fx
            .sessions
            .summaries()
            .into_iter()
            .find(|summary| summary.session_id == "s1")
            .unwrap();
        assert_eq!(s1.api_key_hint.as_deref(), Some(hint.as_str()));
        assert_eq!(s1.client_ip.as_deref(), Some("203.0.113.7"));

        assert!(fx.sessions.teardown("s1").await);
        assert_eq!(
            fx.sessions.api_key_usage()[0].sessions,
            BTreeSet::from(["s2".to_string()])
        );

        fx.clock.advance(Duration::hours(2));
        assert_eq!(fx.sessions.prune_api_keys(fx.clock.now() - Duration::hours(1)), 1);
        assert!(fx.sessions.api_key_usage().is_empty());
    }

    #[test]
    fn tracking_for_a_vanished_session_is_refused() {
        let fx = fixture();
        assert!(!fx.sessions.track_tasks("ghost", &["t1".to_string()], Some("...key")));
        assert!(fx.sessions.api_key_usage().is_empty());
    }

    #[test]
    fn forgotten_tasks_leave_index_and_summary() {
        let fx = fixture();
        let (tx, _rx) = mpsc::unbounded_channel();
        fx.sessions.attach("s1", tx);
        let ids = create_tasks(&fx, "s1", 3);

        fx.sessions.forget_tasks("s1", &ids[..2]);

        let owned = fx.sessions.owned_tasks("s1").unwrap();
        assert_eq!(owned, HashSet::from([ids[2].clone()]));
        assert_eq!(fx.sessions.summaries()[0].task_count, 1);
    }

    #[test]
    fn closed_receiver_detaches_channel() {
        let fx = fixture();
        let (tx, rx) = mpsc::unbounded_channel();
        fx.sessions.attach("s1", tx);
        drop(rx);
        let mut events = fx.registry.subscribe();
        create_tasks(&fx, "s1", 1);

        let event = events.try_recv().unwrap();
        assert!(!fx.sessions.deliver(&event));
        assert!(!fx.sessions.is_connected("s1"));
    }

    #[test]
    fn task_update_serializes_with_type_tag() {
        let message = ServerMessage::TaskUpdate {
            task_id: "t1".into(),
            status: TaskStatus::Succeeded,
            result: Some("https://x/y.mp4".into()),
            error: None,
            message: "Generated in 3s".into(),
            version: 4,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "task_update");
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["result"], "https://x/y.mp4");
        assert_eq!(
            serde_json::to_value(ServerMessage::Pong).unwrap(),
            serde_json::json!({"type": "pong"})
        );
    }
}
