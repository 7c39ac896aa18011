//! Mutation Queue: a durable FIFO of writes made while offline, replayed
//! against per-entity handlers once the device is back online.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics;

pub const DEFAULT_NAMESPACE: &str = "pending_mutations";

/// CRUD entity kinds that may be queued. Leases never are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Apartment,
    Room,
    Business,
    Campaign,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Apartment,
        EntityType::Room,
        EntityType::Business,
        EntityType::Campaign,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Apartment => "apartment",
            EntityType::Room => "room",
            EntityType::Business => "business",
            EntityType::Campaign => "campaign",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown entity type: {0}")]
pub struct UnknownEntityType(pub String);

impl FromStr for EntityType {
    type Err = UnknownEntityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEntityType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl MutationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub action: MutationAction,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub actor_id: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    /// The remote end could not be reached. The mutation stays queued.
    #[error("transport unavailable: {0}")]
    Transport(String),
    /// The remote end refused the mutation. Retrying cannot help.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ApplyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplyError::Transport(_))
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full ({max} entries)")]
    Full { max: usize },
    #[error("queue storage error: {0}")]
    Storage(String),
    #[error("unsupported queue schema version {0}")]
    UnsupportedVersion(u32),
    #[error("queue serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Idempotent apply function for one entity type. It may see the same
/// mutation more than once.
#[async_trait]
pub trait ReplayHandler: Send + Sync {
    async fn apply(&self, mutation: &PendingMutation) -> Result<serde_json::Value, ApplyError>;
}

#[async_trait]
impl<F, Fut> ReplayHandler for F
where
    F: Fn(PendingMutation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, ApplyError>> + Send,
{
    async fn apply(&self, mutation: &PendingMutation) -> Result<serde_json::Value, ApplyError> {
        (self)(mutation.clone()).await
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<EntityType, Arc<dyn ReplayHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any handler already registered for `entity_type`.
    pub fn register_handler<H>(&self, entity_type: EntityType, handler: H)
    where
        H: ReplayHandler + 'static,
    {
        self.handlers.write().insert(entity_type, Arc::new(handler));
    }

    pub fn get(&self, entity_type: EntityType) -> Option<Arc<dyn ReplayHandler>> {
        self.handlers.read().get(&entity_type).cloned()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub applied: usize,
    /// Rejected by their handler and discarded.
    pub dropped: usize,
    /// Retryable failures, still queued.
    pub failed: usize,
    /// Not attempted because an earlier entry for the same entity is stuck or
    /// no handler is registered.
    pub deferred: usize,
    pub remaining: usize,
    /// Another drain was already running; nothing was attempted.
    pub skipped: bool,
}

/// Durable backing for the queue: the whole ordered list is loaded once and
/// rewritten on every change.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn load(&self) -> Result<Vec<PendingMutation>, QueueError>;
    async fn save(&self, entries: &[PendingMutation]) -> Result<(), QueueError>;
}

#[derive(Default)]
pub struct InMemoryQueueStore {
    entries: Mutex<Vec<PendingMutation>>,
    fail_writes: AtomicBool,
}

impl InMemoryQueueStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every save fail, as a full disk would.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn persisted(&self) -> Vec<PendingMutation> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn load(&self) -> Result<Vec<PendingMutation>, QueueError> {
        Ok(self.entries.lock().clone())
    }

    async fn save(&self, entries: &[PendingMutation]) -> Result<(), QueueError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(QueueError::Storage("no space left on device".into()));
        }
        *self.entries.lock() = entries.to_vec();
        Ok(())
    }
}

pub struct MutationQueue {
    store: Arc<dyn QueueStore>,
    entries: tokio::sync::Mutex<Vec<PendingMutation>>,
    drain_gate: tokio::sync::Mutex<()>,
    max_entries: usize,
}

impl MutationQueue {
    /// Load whatever the store holds from a previous run.
    pub async fn open(store: Arc<dyn QueueStore>, max_entries: usize) -> Result<Self, QueueError> {
        let entries = store.load().await?;
        metrics::QUEUE_DEPTH.set(entries.len() as i64);
        if !entries.is_empty() {
            info!(target = "field.queue", pending = entries.len(), "restored pending mutations");
        }
        Ok(Self {
            store,
            entries: tokio::sync::Mutex::new(entries),
            drain_gate: tokio::sync::Mutex::new(()),
            max_entries: max_entries.max(1),
        })
    }

    /// Append a mutation and persist it before returning. Fails only when the
    /// queue is at capacity or the write does not land.
    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        action: MutationAction,
        entity_id: &str,
        payload: serde_json::Value,
        actor_id: Option<&str>,
    ) -> Result<PendingMutation, QueueError> {
        let mutation = PendingMutation {
            id: Uuid::new_v4(),
            entity_type,
            action,
            entity_id: entity_id.to_string(),
            payload,
            enqueued_at: Utc::now(),
            actor_id: actor_id.map(str::to_string),
        };

        let mut entries = self.entries.lock().await;
        if entries.len() >= self.max_entries {
            warn!(target = "field.queue", max = self.max_entries, "queue full; mutation refused");
            return Err(QueueError::Full {
                max: self.max_entries,
            });
        }
        entries.push(mutation.clone());
        if let Err(err) = self.store.save(&entries).await {
            entries.pop();
            warn!(target = "field.queue", error = %err, "failed to persist queued mutation");
            return Err(err);
        }
        metrics::QUEUE_DEPTH.set(entries.len() as i64);
        metrics::QUEUE_ENQUEUED
            .with_label_values(&[entity_type.as_str()])
            .inc();
        info!(
            target = "field.queue",
            id = %mutation.id,
            entity_type = %entity_type,
            entity_id,
            action = action.as_str(),
            "mutation queued"
        );
        Ok(mutation)
    }

    /// Replay the queue in enqueue order. A retryable failure blocks the rest
    /// of that entity's entries until the next drain; other entities carry on.
    /// Only one drain runs at a time; a concurrent call returns a report with
    /// `skipped` set.
    pub async fn drain(&self, registry: &HandlerRegistry) -> SyncReport {
        let Ok(_gate) = self.drain_gate.try_lock() else {
            debug!(target = "field.queue", "drain already in flight");
            return SyncReport {
                skipped: true,
                remaining: self.len().await,
                ..SyncReport::default()
            };
        };
        self.replay(registry).await
    }

    /// Drain, waiting for an in-flight drain to finish first instead of
    /// skipping. Used where the queue must be settled before moving on.
    pub async fn drain_waiting(&self, registry: &HandlerRegistry) -> SyncReport {
        let _gate = self.drain_gate.lock().await;
        self.replay(registry).await
    }

    // Caller holds `drain_gate`.
    async fn replay(&self, registry: &HandlerRegistry) -> SyncReport {
        let snapshot = self.entries.lock().await.clone();
        let mut report = SyncReport::default();
        let mut blocked: HashSet<(EntityType, String)> = HashSet::new();

        for mutation in snapshot {
            let entity = (mutation.entity_type, mutation.entity_id.clone());
            if blocked.contains(&entity) {
                report.deferred += 1;
                continue;
            }
            let Some(handler) = registry.get(mutation.entity_type) else {
                warn!(
                    target = "field.queue",
                    entity_type = %mutation.entity_type,
                    "no replay handler registered"
                );
                blocked.insert(entity);
                report.deferred += 1;
                continue;
            };

            let outcome = AssertUnwindSafe(handler.apply(&mutation))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ApplyError::Transport("replay handler panicked".into())));
            match outcome {
                Ok(_) => {
                    self.remove(mutation.id).await;
                    report.applied += 1;
                    metrics::REPLAY_OUTCOMES.with_label_values(&["applied"]).inc();
                    debug!(target = "field.queue", id = %mutation.id, "replayed");
                }
                Err(err) if err.is_retryable() => {
                    blocked.insert(entity);
                    report.failed += 1;
                    metrics::REPLAY_OUTCOMES.with_label_values(&["retry"]).inc();
                    debug!(
                        target = "field.queue",
                        id = %mutation.id,
                        error = %err,
                        "replay deferred"
                    );
                }
                Err(err) => {
                    self.remove(mutation.id).await;
                    report.dropped += 1;
                    metrics::REPLAY_OUTCOMES.with_label_values(&["dropped"]).inc();
                    warn!(
                        target = "field.queue",
                        id = %mutation.id,
                        entity_type = %mutation.entity_type,
                        entity_id = %mutation.entity_id,
                        error = %err,
                        "replay rejected; mutation dropped"
                    );
                }
            }
        }

        report.remaining = self.len().await;
        info!(
            target = "field.queue",
            applied = report.applied,
            dropped = report.dropped,
            failed = report.failed,
            deferred = report.deferred,
            remaining = report.remaining,
            "drain finished"
        );
        report
    }

    pub async fn pending(&self) -> Vec<PendingMutation> {
        self.entries.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn has_pending_for(&self, entity_type: EntityType, entity_id: &str) -> bool {
        self.entries
            .lock()
            .await
            .iter()
            .any(|m| m.entity_type == entity_type && m.entity_id == entity_id)
    }

    /// Forget every pending mutation, e.g. on sign-out. Waits for a running
    /// drain so nothing it is replaying is applied after the clear.
    pub async fn clear(&self) -> Result<usize, QueueError> {
        let _gate = self.drain_gate.lock().await;
        let mut entries = self.entries.lock().await;
        self.store.save(&[]).await?;
        let cleared = entries.len();
        entries.clear();
        metrics::QUEUE_DEPTH.set(0);
        Ok(cleared)
    }

    async fn remove(&self, id: Uuid) {
        let mut entries = self.entries.lock().await;
        entries.retain(|m| m.id != id);
        metrics::QUEUE_DEPTH.set(entries.len() as i64);
        // The entry may come back after a restart; handlers are idempotent.
        if let Err(err) = self.store.save(&entries).await {
            warn!(
                target = "field.queue",
                %id,
                error = %err,
                "failed to persist queue after replay"
            );
        }
    }
}
