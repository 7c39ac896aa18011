//! Composition root for one device: wires identity, channels, the lease
//! manager and the sync orchestrator, and exposes the operations the UI calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use field_bus::{Bus, RowChange};
use lease_store::{FloorKey, FloorLease, LeaseStore, LeaseStoreError};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{
    BusTransport, ChannelEvent, ChannelMultiplexer, ConnectionState, EventFilter, StateListener,
    Subscription, TopicKey,
};
use crate::config::AppConfig;
use crate::identity::{Actor, HolderDirectory, IdentityProvider, LayeredDirectory, SessionIdentity};
use crate::lease::{build_lease_store, ActiveLease, FloorLeaseManager, LeaseError};
use crate::orchestrator::{SyncAck, SyncError, SyncOrchestrator};
use crate::queue::{
    EntityType, HandlerRegistry, InMemoryQueueStore, MutationQueue, QueueError, QueueStore,
    SyncReport,
};
use crate::queue_file::FileQueueStore;
use crate::signals::FieldSignal;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("lease store: {0}")]
    LeaseStore(#[from] LeaseStoreError),
    #[error("no team configured")]
    NoTeam,
}

pub struct FieldCoordinator {
    identity: Arc<SessionIdentity>,
    transport: Arc<BusTransport>,
    channels: Arc<ChannelMultiplexer>,
    leases: FloorLeaseManager,
    sync: Arc<SyncOrchestrator>,
    team_id: Option<String>,
    heartbeat_interval: Duration,
    heartbeats: Mutex<HashMap<FloorKey, JoinHandle<()>>>,
}

impl FieldCoordinator {
    /// Build from configuration: lease backend per `lease_backend`, file-backed
    /// queue when `data_dir` is set.
    pub async fn build(
        cfg: &AppConfig,
        bus: Arc<dyn Bus>,
        registry: HandlerRegistry,
        directory: Arc<dyn HolderDirectory>,
    ) -> Result<Arc<Self>, CoordinatorError> {
        let store = build_lease_store(cfg, bus.clone()).await?;
        let queue_store: Arc<dyn QueueStore> = match &cfg.data_dir {
            Some(dir) => Arc::new(FileQueueStore::new(dir, &cfg.queue_namespace)),
            None => InMemoryQueueStore::new(),
        };
        Self::with_stores(cfg, bus, store, queue_store, registry, directory).await
    }

    /// Holder names resolve from actors seen on this device first, then from
    /// `directory`.
    pub async fn with_stores(
        cfg: &AppConfig,
        bus: Arc<dyn Bus>,
        lease_store: Arc<dyn LeaseStore>,
        queue_store: Arc<dyn QueueStore>,
        registry: HandlerRegistry,
        directory: Arc<dyn HolderDirectory>,
    ) -> Result<Arc<Self>, CoordinatorError> {
        let identity = Arc::new(SessionIdentity::new());
        let transport = BusTransport::new(bus);
        let channels = ChannelMultiplexer::new(transport.clone());
        let local: Arc<dyn HolderDirectory> = identity.clone();
        let directory = LayeredDirectory::new(vec![local, directory]);
        let leases = FloorLeaseManager::new(
            lease_store,
            channels.clone(),
            Arc::new(directory),
            Duration::from_secs(cfg.lease_stale_after_secs),
        );
        let queue = Arc::new(MutationQueue::open(queue_store, cfg.queue_max_entries).await?);
        let sync = SyncOrchestrator::new(
            queue,
            registry,
            channels.clone(),
            identity.clone(),
            cfg.team_id.clone(),
        );
        Ok(Arc::new(Self {
            identity,
            transport,
            channels,
            leases,
            sync,
            team_id: cfg.team_id.clone(),
            heartbeat_interval: Duration::from_secs(cfg.heartbeat_interval_secs),
            heartbeats: Mutex::new(HashMap::new()),
        }))
    }

    /// Open the device channel (and the team channel when configured) and
    /// start draining on reconnect.
    pub async fn start(&self) {
        self.sync.start();
        let _ = self
            .channels
            .subscribe(TopicKey::System, EventFilter::All, |_| {})
            .await;
        if let Some(team_id) = &self.team_id {
            let _ = self
                .channels
                .subscribe(
                    TopicKey::Team(team_id.clone()),
                    EventFilter::Broadcast { event: None },
                    |event| {
                        if let ChannelEvent::Broadcast(msg) = event {
                            if let Some(signal) = FieldSignal::from_message(msg) {
                                debug!(target = "field.sync", ?signal, "team signal");
                            }
                        }
                    },
                )
                .await;
        }
        info!(target = "field.sync", state = %self.channels.state(), "coordinator started");
    }

    pub fn channels(&self) -> &Arc<ChannelMultiplexer> {
        &self.channels
    }

    pub fn leases(&self) -> &FloorLeaseManager {
        &self.leases
    }

    pub fn sync(&self) -> &Arc<SyncOrchestrator> {
        &self.sync
    }

    pub fn current_actor(&self) -> Option<Actor> {
        self.identity.current_actor()
    }

    fn holder(&self) -> Result<String, LeaseError> {
        self.identity
            .current_actor()
            .map(|actor| actor.id)
            .ok_or(LeaseError::Unauthenticated)
    }

    /// Claim a floor for the signed-in volunteer and keep it warm with a
    /// periodic heartbeat until it is released or completed.
    pub async fn claim_floor(
        &self,
        building_id: &str,
        floor: i32,
    ) -> Result<FloorLease, LeaseError> {
        let holder = self.holder()?;
        let lease = self.leases.claim(building_id, floor, &holder).await?;
        let key = lease.key();
        let ticker = self
            .leases
            .spawn_heartbeat_loop(key.clone(), holder, self.heartbeat_interval);
        if let Some(previous) = self.heartbeats.lock().insert(key, ticker) {
            previous.abort();
        }
        Ok(lease)
    }

    /// The heartbeat keeps running if the release does not land, so a retry
    /// finds the lease still fresh.
    pub async fn release_floor(&self, building_id: &str, floor: i32) -> Result<(), LeaseError> {
        let holder = self.holder()?;
        self.leases.release(building_id, floor, &holder).await?;
        self.stop_heartbeat(&FloorKey::new(building_id, floor));
        Ok(())
    }

    pub fn heartbeat_claim(&self, building_id: &str, floor: i32) -> Result<(), LeaseError> {
        let holder = self.holder()?;
        self.leases.heartbeat(building_id, floor, &holder);
        Ok(())
    }

    pub async fn list_claims(&self, building_id: &str) -> Result<Vec<ActiveLease>, LeaseError> {
        self.leases.list_active(building_id).await
    }

    pub async fn subscribe_to_claims<F>(&self, building_id: &str, on_change: F) -> Subscription
    where
        F: Fn(&RowChange) + Send + Sync + 'static,
    {
        self.leases.subscribe(building_id, on_change).await
    }

    pub async fn complete_floor(&self, building_id: &str, floor: i32) -> Result<(), LeaseError> {
        let holder = self.holder()?;
        self.leases.complete_floor(building_id, floor, &holder).await?;
        self.stop_heartbeat(&FloorKey::new(building_id, floor));
        Ok(())
    }

    pub async fn reclaim_stale_floor(
        &self,
        building_id: &str,
        floor: i32,
    ) -> Result<Option<FloorLease>, LeaseError> {
        let actor = self.holder()?;
        let reclaimed = self.leases.reclaim_stale(building_id, floor).await?;
        if let Some(lease) = &reclaimed {
            info!(
                target = "field.lease",
                building_id,
                floor,
                previous_holder = %lease.holder_id,
                reclaimed_by = %actor,
                "floor reclaimed"
            );
        }
        Ok(reclaimed)
    }

    pub fn request_help(
        &self,
        building_id: &str,
        floor: i32,
        note: Option<String>,
    ) -> Result<(), CoordinatorError> {
        let team_id = self.team_id.as_deref().ok_or(CoordinatorError::NoTeam)?;
        let holder = self.holder()?;
        self.leases
            .request_help(team_id, &FloorKey::new(building_id, floor), &holder, note)?;
        Ok(())
    }

    pub async fn sync_create(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: serde_json::Value,
    ) -> Result<SyncAck, SyncError> {
        self.sync.sync_create(entity_type, entity_id, payload).await
    }

    pub async fn sync_update(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: serde_json::Value,
    ) -> Result<SyncAck, SyncError> {
        self.sync.sync_update(entity_type, entity_id, payload).await
    }

    pub async fn sync_delete(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<SyncAck, SyncError> {
        self.sync.sync_delete(entity_type, entity_id).await
    }

    pub async fn drain_now(&self) -> SyncReport {
        self.sync.drain_now().await
    }

    pub fn on_connection_state_change<F>(&self, callback: F) -> StateListener
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.channels.on_connection_state_change(callback)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channels.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.channels.watch_state()
    }

    /// Network monitor hook.
    pub fn set_online(&self, online: bool) {
        self.transport.set_online(online);
    }

    pub fn sign_in(&self, actor: Actor) {
        info!(target = "field.sync", actor_id = %actor.id, "signed in");
        self.identity.sign_in(actor);
    }

    /// Stop heartbeats, try one last drain (waiting out one already running),
    /// tear down every channel, then drop whatever is still queued so the next
    /// volunteer does not replay it.
    pub async fn sign_out(&self) -> Result<Option<Actor>, CoordinatorError> {
        let tickers: Vec<JoinHandle<()>> =
            self.heartbeats.lock().drain().map(|(_, h)| h).collect();
        for ticker in tickers {
            ticker.abort();
        }
        if self.channels.state() == ConnectionState::Connected {
            let report = self.sync.drain_all().await;
            debug!(target = "field.sync", ?report, "sign-out drain");
        }
        self.channels.unsubscribe_all().await;
        let discarded = self.sync.queue().clear().await?;
        if discarded > 0 {
            warn!(target = "field.sync", discarded, "pending mutations discarded at sign-out");
        }
        let actor = self.identity.sign_out();
        info!(target = "field.sync", actor_id = ?actor.as_ref().map(|a| &a.id), "signed out");
        Ok(actor)
    }

    fn stop_heartbeat(&self, key: &FloorKey) {
        if let Some(ticker) = self.heartbeats.lock().remove(key) {
            ticker.abort();
        }
    }
}

impl Drop for FieldCoordinator {
    fn drop(&mut self) {
        for (_, ticker) in self.heartbeats.get_mut().drain() {
            ticker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticDirectory;
    use crate::queue::{ApplyError, PendingMutation};
    use field_bus::LocalBus;
    use lease_store::InMemoryLeaseStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn team_config() -> AppConfig {
        AppConfig {
            team_id: Some("north".into()),
            ..AppConfig::default()
        }
    }

    async fn coordinator_on(
        bus: Arc<LocalBus>,
        store: Arc<dyn LeaseStore>,
        registry: HandlerRegistry,
        directory: Arc<dyn HolderDirectory>,
    ) -> Arc<FieldCoordinator> {
        FieldCoordinator::with_stores(
            &team_config(),
            bus,
            store,
            InMemoryQueueStore::new(),
            registry,
            directory,
        )
        .await
        .unwrap()
    }

    async fn coordinator() -> Arc<FieldCoordinator> {
        let bus = Arc::new(LocalBus::new());
        coordinator_on(
            bus.clone(),
            InMemoryLeaseStore::with_feed(bus),
            HandlerRegistry::new(),
            Arc::new(StaticDirectory::default()),
        )
        .await
    }

    #[tokio::test]
    async fn claim_requires_identity() {
        let coord = coordinator().await;
        assert!(matches!(
            coord.claim_floor("B1", 1).await,
            Err(LeaseError::Unauthenticated)
        ));
        coord.sign_in(Actor::new("v-a", Some("Avi".into())));
        let lease = coord.claim_floor("B1", 1).await.unwrap();
        assert_eq!(lease.holder_id, "v-a");
        assert_eq!(coord.heartbeats.lock().len(), 1);

        let claims = coord.list_claims("B1").await.unwrap();
        assert_eq!(claims[0].holder_name.as_deref(), Some("Avi"));

        coord.release_floor("B1", 1).await.unwrap();
        assert!(coord.heartbeats.lock().is_empty());
    }

    #[tokio::test]
    async fn start_connects_and_sign_out_disconnects() {
        let coord = coordinator().await;
        coord.start().await;
        assert_eq!(coord.connection_state(), ConnectionState::Connected);

        coord.sign_in(Actor::new("v-a", None));
        coord.claim_floor("B1", 2).await.unwrap();
        let actor = coord.sign_out().await.unwrap();
        assert_eq!(actor.map(|a| a.id).as_deref(), Some("v-a"));
        assert_eq!(coord.connection_state(), ConnectionState::Disconnected);
        assert!(coord.heartbeats.lock().is_empty());
        assert!(coord.current_actor().is_none());
    }

    #[tokio::test]
    async fn help_requires_team_and_identity() {
        let coord = coordinator().await;
        coord.start().await;
        assert!(matches!(
            coord.request_help("B1", 3, None),
            Err(CoordinatorError::Lease(LeaseError::Unauthenticated))
        ));
        coord.sign_in(Actor::new("v-a", None));
        coord.request_help("B1", 3, Some("locked lobby".into())).unwrap();
    }

    #[tokio::test]
    async fn failed_release_keeps_heartbeat_running() {
        let bus = Arc::new(LocalBus::new());
        let store = InMemoryLeaseStore::with_feed(bus.clone());
        let coord = coordinator_on(
            bus,
            store.clone(),
            HandlerRegistry::new(),
            Arc::new(StaticDirectory::default()),
        )
        .await;
        coord.sign_in(Actor::new("v-a", None));
        coord.claim_floor("B1", 4).await.unwrap();

        store.set_offline(true);
        assert!(coord.release_floor("B1", 4).await.is_err());
        assert!(coord.complete_floor("B1", 4).await.is_err());
        assert_eq!(coord.heartbeats.lock().len(), 1);

        store.set_offline(false);
        coord.complete_floor("B1", 4).await.unwrap();
        assert!(coord.heartbeats.lock().is_empty());
    }

    #[tokio::test]
    async fn other_device_sees_holder_name_from_directory() {
        let bus = Arc::new(LocalBus::new());
        let store: Arc<dyn LeaseStore> = InMemoryLeaseStore::with_feed(bus.clone());
        let profiles = Arc::new(StaticDirectory(HashMap::from([(
            "v-a".to_string(),
            "Avi".to_string(),
        )])));
        let device_a =
            coordinator_on(bus.clone(), store.clone(), HandlerRegistry::new(), profiles.clone())
                .await;
        let device_b = coordinator_on(bus, store, HandlerRegistry::new(), profiles).await;

        device_a.sign_in(Actor::new("v-a", None));
        device_a.claim_floor("B1", 5).await.unwrap();
        device_b.sign_in(Actor::new("v-b", Some("Bina".into())));

        let claims = device_b.list_claims("B1").await.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].lease.holder_id, "v-a");
        assert_eq!(claims[0].holder_name.as_deref(), Some("Avi"));
    }

    #[tokio::test]
    async fn sign_out_replays_before_discarding() {
        let applied = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new();
        {
            let applied = applied.clone();
            registry.register_handler(EntityType::Room, move |_m: PendingMutation| {
                let applied = applied.clone();
                async move {
                    applied.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ApplyError>(json!(null))
                }
            });
        }
        let bus = Arc::new(LocalBus::new());
        let coord = coordinator_on(
            bus.clone(),
            InMemoryLeaseStore::with_feed(bus),
            registry,
            Arc::new(StaticDirectory::default()),
        )
        .await;
        coord.sign_in(Actor::new("v-a", None));
        let ack = coord
            .sync_update(EntityType::Room, "r1", json!({"status": "donated"}))
            .await
            .unwrap();
        assert!(ack.queued);

        coord.start().await;
        coord.sign_out().await.unwrap();
        assert_eq!(applied.load(Ordering::SeqCst), 1);
        assert!(coord.sync().queue().is_empty().await);
    }
}
