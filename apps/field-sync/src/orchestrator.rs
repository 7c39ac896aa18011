//! Sync Orchestrator: apply a write now when connected, otherwise queue it, and
//! drain the queue on every return to `connected`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelMultiplexer, ConnectionState, StateListener, TopicKey};
use crate::identity::IdentityProvider;
use crate::metrics;
use crate::queue::{
    ApplyError, EntityType, HandlerRegistry, MutationAction, MutationQueue, PendingMutation,
    QueueError, SyncReport,
};
use crate::signals::FieldSignal;

pub const QUEUED_MESSAGE: &str = "Saved, will sync when back online";
pub const APPLIED_MESSAGE: &str = "Saved";

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Applied(serde_json::Value),
    Queued(PendingMutation),
}

impl SyncOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, SyncOutcome::Queued(_))
    }
}

/// What the UI shows for a write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncAck {
    pub success: bool,
    pub queued: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl From<SyncOutcome> for SyncAck {
    fn from(outcome: SyncOutcome) -> Self {
        match outcome {
            SyncOutcome::Applied(result) => SyncAck {
                success: true,
                queued: false,
                message: APPLIED_MESSAGE.to_string(),
                result: Some(result),
            },
            SyncOutcome::Queued(_) => SyncAck {
                success: true,
                queued: true,
                message: QUEUED_MESSAGE.to_string(),
                result: None,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub struct SyncOrchestrator {
    queue: Arc<MutationQueue>,
    registry: HandlerRegistry,
    channels: Arc<ChannelMultiplexer>,
    identity: Arc<dyn IdentityProvider>,
    team_id: Option<String>,
    watcher: Mutex<Option<(StateListener, JoinHandle<()>)>>,
}

impl SyncOrchestrator {
    pub fn new(
        queue: Arc<MutationQueue>,
        registry: HandlerRegistry,
        channels: Arc<ChannelMultiplexer>,
        identity: Arc<dyn IdentityProvider>,
        team_id: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            registry,
            channels,
            identity,
            team_id,
            watcher: Mutex::new(None),
        })
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Drain once per observed entry into `connected`, starting with the
    /// current state. Calling this again has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = self.channels.on_connection_state_change(move |state| {
            let _ = tx.send(state);
        });
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut previous = None;
            while let Some(state) = rx.recv().await {
                let entered = state == ConnectionState::Connected
                    && previous != Some(ConnectionState::Connected);
                previous = Some(state);
                if !entered {
                    continue;
                }
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                let report = orchestrator.drain_now().await;
                debug!(target = "field.sync", ?report, "reconnect drain");
            }
        });
        *watcher = Some((listener, task));
    }

    pub async fn drain_now(&self) -> SyncReport {
        self.queue.drain(&self.registry).await
    }

    /// Like [`drain_now`](Self::drain_now), but waits out a drain that is
    /// already running instead of skipping.
    pub async fn drain_all(&self) -> SyncReport {
        self.queue.drain_waiting(&self.registry).await
    }

    /// Route one write. When connected and nothing for the same entity is still
    /// queued, `apply_fn` runs directly; any failure there, panics included,
    /// queues the write instead. Only a failed enqueue is an error.
    pub async fn perform<F, Fut>(
        &self,
        entity_type: EntityType,
        action: MutationAction,
        entity_id: &str,
        payload: serde_json::Value,
        apply_fn: F,
    ) -> Result<SyncOutcome, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, ApplyError>>,
    {
        let connected = self.channels.state() == ConnectionState::Connected;
        if connected && !self.queue.has_pending_for(entity_type, entity_id).await {
            match AssertUnwindSafe(apply_fn()).catch_unwind().await {
                Ok(Ok(result)) => {
                    metrics::SYNC_ROUTES.with_label_values(&["applied"]).inc();
                    self.announce(entity_type, entity_id, action);
                    return Ok(SyncOutcome::Applied(result));
                }
                Ok(Err(err)) => {
                    debug!(
                        target = "field.sync",
                        %entity_type,
                        entity_id,
                        error = %err,
                        "direct apply failed; queueing"
                    );
                }
                Err(_) => {
                    warn!(
                        target = "field.sync",
                        %entity_type,
                        entity_id,
                        "direct apply panicked; queueing"
                    );
                }
            }
        }
        self.enqueue(entity_type, action, entity_id, payload).await
    }

    async fn enqueue(
        &self,
        entity_type: EntityType,
        action: MutationAction,
        entity_id: &str,
        payload: serde_json::Value,
    ) -> Result<SyncOutcome, SyncError> {
        let actor = self.identity.current_actor().map(|actor| actor.id);
        let mutation = self
            .queue
            .enqueue(entity_type, action, entity_id, payload, actor.as_deref())
            .await?;
        metrics::SYNC_ROUTES.with_label_values(&["queued"]).inc();
        info!(target = "field.sync", %entity_type, entity_id, id = %mutation.id, "write queued");
        Ok(SyncOutcome::Queued(mutation))
    }

    pub async fn sync_create(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: serde_json::Value,
    ) -> Result<SyncAck, SyncError> {
        self.sync_with_handler(entity_type, MutationAction::Create, entity_id, payload)
            .await
    }

    pub async fn sync_update(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: serde_json::Value,
    ) -> Result<SyncAck, SyncError> {
        self.sync_with_handler(entity_type, MutationAction::Update, entity_id, payload)
            .await
    }

    pub async fn sync_delete(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<SyncAck, SyncError> {
        let payload = serde_json::json!({ "id": entity_id });
        self.sync_with_handler(entity_type, MutationAction::Delete, entity_id, payload)
            .await
    }

    async fn sync_with_handler(
        &self,
        entity_type: EntityType,
        action: MutationAction,
        entity_id: &str,
        payload: serde_json::Value,
    ) -> Result<SyncAck, SyncError> {
        // Writes for an entity nobody handles yet wait in the queue; the drain
        // leaves them there until a handler is registered.
        let Some(handler) = self.registry.get(entity_type) else {
            warn!(
                target = "field.sync",
                %entity_type,
                entity_id,
                "no handler registered; queueing"
            );
            let outcome = self.enqueue(entity_type, action, entity_id, payload).await?;
            return Ok(outcome.into());
        };
        let draft = PendingMutation {
            id: Uuid::new_v4(),
            entity_type,
            action,
            entity_id: entity_id.to_string(),
            payload: payload.clone(),
            enqueued_at: Utc::now(),
            actor_id: self.identity.current_actor().map(|actor| actor.id),
        };
        let outcome = self
            .perform(entity_type, action, entity_id, payload, || async move {
                handler.apply(&draft).await
            })
            .await?;
        Ok(outcome.into())
    }

    fn announce(&self, entity_type: EntityType, entity_id: &str, action: MutationAction) {
        let Some(team_id) = &self.team_id else {
            return;
        };
        let signal = FieldSignal::MutationApplied {
            entity_type,
            entity_id: entity_id.to_string(),
            action,
        };
        if let Err(err) = self
            .channels
            .broadcast(&TopicKey::Team(team_id.clone()), signal.to_message())
        {
            debug!(target = "field.sync", error = %err, "mutation signal not sent");
        }
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        if let Some((listener, task)) = self.watcher.get_mut().take() {
            listener.unsubscribe();
            task.abort();
        }
    }
}
