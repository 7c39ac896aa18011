//! Floor Lease Manager: claim, heartbeat, and release exclusive working rights
//! over a (building, floor) pair.
//!
//! Arbitration is the store's insert-if-absent and nothing else. There is no
//! read before the insert, so two devices racing for the same floor always see
//! exactly one winner.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use field_bus::{Bus, RowChange};
use lease_store::{
    FloorKey, FloorLease, InMemoryLeaseStore, LeaseStore, LeaseStoreError, LEASE_TABLE,
};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelMultiplexer, EventFilter, Subscription, TopicKey};
use crate::config::{AppConfig, LeaseBackend};
use crate::identity::HolderDirectory;
use crate::lease_postgres::{spawn_change_feed, PostgresLeaseStore};
use crate::lease_redis::RedisLeaseStore;
use crate::metrics;
use crate::signals::FieldSignal;

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("not signed in")]
    Unauthenticated,
    #[error("Floor is already claimed.")]
    Conflict { building_id: String, floor: i32 },
    #[error("lease store unavailable: {0}")]
    Unavailable(String),
    #[error("lease store error: {0}")]
    Store(String),
}

impl LeaseError {
    fn from_store(err: LeaseStoreError, key: &FloorKey) -> Self {
        match err {
            LeaseStoreError::Conflict => LeaseError::Conflict {
                building_id: key.building_id.clone(),
                floor: key.floor,
            },
            LeaseStoreError::Unavailable(msg) => LeaseError::Unavailable(msg),
            LeaseStoreError::Store(msg) => LeaseError::Store(msg),
        }
    }
}

/// A lease as shown to other volunteers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveLease {
    #[serde(flatten)]
    pub lease: FloorLease,
    pub holder_name: Option<String>,
    pub idle_secs: i64,
    /// Idle past the reclaim threshold.
    pub stale: bool,
}

#[derive(Clone)]
pub struct FloorLeaseManager {
    store: Arc<dyn LeaseStore>,
    channels: Arc<ChannelMultiplexer>,
    directory: Arc<dyn HolderDirectory>,
    stale_after: chrono::Duration,
}

impl FloorLeaseManager {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        channels: Arc<ChannelMultiplexer>,
        directory: Arc<dyn HolderDirectory>,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            channels,
            directory,
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
        }
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    pub async fn claim(
        &self,
        building_id: &str,
        floor: i32,
        holder_id: &str,
    ) -> Result<FloorLease, LeaseError> {
        let holder_id = require_holder(holder_id)?;
        let key = FloorKey::new(building_id, floor);
        let lease = FloorLease::new(key.clone(), holder_id, Utc::now());
        match self.store.insert_if_absent(lease).await {
            Ok(lease) => {
                metrics::CLAIMS.with_label_values(&["won"]).inc();
                info!(target = "field.lease", %key, holder_id, "floor claimed");
                Ok(lease)
            }
            Err(LeaseStoreError::Conflict) => {
                metrics::CLAIMS.with_label_values(&["conflict"]).inc();
                debug!(target = "field.lease", %key, holder_id, "floor already claimed");
                Err(LeaseError::from_store(LeaseStoreError::Conflict, &key))
            }
            Err(err) => {
                metrics::CLAIMS.with_label_values(&["error"]).inc();
                warn!(target = "field.lease", %key, holder_id, error = %err, "claim failed");
                Err(LeaseError::from_store(err, &key))
            }
        }
    }

    /// Delete the lease held by `holder_id`. Releasing someone else's lease, or
    /// one that no longer exists, succeeds without touching anything.
    pub async fn release(
        &self,
        building_id: &str,
        floor: i32,
        holder_id: &str,
    ) -> Result<(), LeaseError> {
        let holder_id = require_holder(holder_id)?;
        let key = FloorKey::new(building_id, floor);
        match self.store.delete(&key, holder_id).await {
            Ok(true) => {
                metrics::RELEASES.with_label_values(&["released"]).inc();
                info!(target = "field.lease", %key, holder_id, "floor released");
                Ok(())
            }
            Ok(false) => {
                metrics::RELEASES.with_label_values(&["noop"]).inc();
                debug!(target = "field.lease", %key, holder_id, "release matched no lease");
                Ok(())
            }
            Err(err) => {
                metrics::RELEASES.with_label_values(&["error"]).inc();
                Err(LeaseError::from_store(err, &key))
            }
        }
    }

    /// Fire-and-forget activity bump. Runs detached with no result channel; a
    /// failure is logged and dropped, never retried.
    pub fn heartbeat(&self, building_id: &str, floor: i32, holder_id: &str) {
        let store = self.store.clone();
        let key = FloorKey::new(building_id, floor);
        let holder_id = holder_id.to_string();
        tokio::spawn(async move {
            touch_lease(store.as_ref(), &key, &holder_id).await;
        });
    }

    /// Heartbeat every `interval` until the handle is aborted.
    pub fn spawn_heartbeat_loop(
        &self,
        key: FloorKey,
        holder_id: String,
        interval: Duration,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                touch_lease(store.as_ref(), &key, &holder_id).await;
            }
        })
    }

    /// Current leases of a building ordered by floor, with holder names.
    pub async fn list_active(&self, building_id: &str) -> Result<Vec<ActiveLease>, LeaseError> {
        let mut leases = self
            .store
            .list_for_building(building_id)
            .await
            .map_err(|err| LeaseError::from_store(err, &FloorKey::new(building_id, 0)))?;
        leases.sort_by_key(|lease| lease.floor);

        let holders: Vec<String> = leases
            .iter()
            .map(|lease| lease.holder_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let names = if holders.is_empty() {
            HashMap::new()
        } else {
            self.directory.display_names(&holders).await
        };

        let now = Utc::now();
        Ok(leases
            .into_iter()
            .map(|lease| {
                let idle = now.signed_duration_since(lease.last_activity_at);
                ActiveLease {
                    holder_name: names.get(&lease.holder_id).cloned(),
                    idle_secs: idle.num_seconds().max(0),
                    stale: idle >= self.stale_after,
                    lease,
                }
            })
            .collect())
    }

    /// Row-level lease changes for one building.
    pub async fn subscribe<F>(&self, building_id: &str, on_change: F) -> Subscription
    where
        F: Fn(&RowChange) + Send + Sync + 'static,
    {
        self.channels
            .subscribe(
                TopicKey::table_where(LEASE_TABLE, "building_id", building_id),
                EventFilter::rows_where(LEASE_TABLE, "building_id", serde_json::json!(building_id)),
                move |event| {
                    if let ChannelEvent::RowChange(change) = event {
                        on_change(change);
                    }
                },
            )
            .await
    }

    /// Release the floor and tell the building it is done.
    pub async fn complete_floor(
        &self,
        building_id: &str,
        floor: i32,
        holder_id: &str,
    ) -> Result<(), LeaseError> {
        self.release(building_id, floor, holder_id).await?;
        let signal = FieldSignal::FloorCompleted {
            building_id: building_id.to_string(),
            floor,
            holder_id: holder_id.to_string(),
        };
        if let Err(err) = self
            .channels
            .broadcast(&TopicKey::Building(building_id.to_string()), signal.to_message())
        {
            warn!(
                target = "field.lease",
                building_id,
                floor,
                error = %err,
                "floor completion not broadcast"
            );
        }
        Ok(())
    }

    /// Force-release a lease idle past the stale threshold. The idle check and
    /// the delete are one conditional operation in the store.
    pub async fn reclaim_stale(
        &self,
        building_id: &str,
        floor: i32,
    ) -> Result<Option<FloorLease>, LeaseError> {
        let key = FloorKey::new(building_id, floor);
        let cutoff = Utc::now() - self.stale_after;
        let reclaimed = self
            .store
            .delete_idle(&key, cutoff)
            .await
            .map_err(|err| LeaseError::from_store(err, &key))?;
        match &reclaimed {
            Some(lease) => {
                metrics::RELEASES.with_label_values(&["reclaimed"]).inc();
                info!(
                    target = "field.lease",
                    %key,
                    holder_id = %lease.holder_id,
                    idle_since = %lease.last_activity_at,
                    "stale lease reclaimed"
                );
            }
            None => debug!(target = "field.lease", %key, "no stale lease to reclaim"),
        }
        Ok(reclaimed)
    }

    pub fn request_help(
        &self,
        team_id: &str,
        key: &FloorKey,
        holder_id: &str,
        note: Option<String>,
    ) -> Result<(), LeaseError> {
        let holder_id = require_holder(holder_id)?;
        let signal = FieldSignal::HelpRequested {
            building_id: key.building_id.clone(),
            floor: key.floor,
            holder_id: holder_id.to_string(),
            note,
        };
        self.channels
            .broadcast(&TopicKey::Team(team_id.to_string()), signal.to_message())
            .map_err(|err| LeaseError::Unavailable(err.to_string()))
    }
}

fn require_holder(holder_id: &str) -> Result<&str, LeaseError> {
    let trimmed = holder_id.trim();
    if trimmed.is_empty() {
        Err(LeaseError::Unauthenticated)
    } else {
        Ok(trimmed)
    }
}

async fn touch_lease(store: &dyn LeaseStore, key: &FloorKey, holder_id: &str) {
    match store.touch(key, holder_id, Utc::now()).await {
        Ok(true) => debug!(target = "field.lease", %key, holder_id, "heartbeat"),
        Ok(false) => debug!(target = "field.lease", %key, holder_id, "heartbeat matched no lease"),
        Err(err) => {
            metrics::HEARTBEAT_FAILURES.inc();
            warn!(target = "field.lease", %key, holder_id, error = %err, "heartbeat dropped");
        }
    }
}

/// Lease store for the configured backend. Only `memory` arbitrates in
/// process; a shared backend that is down surfaces as `Unavailable` per call
/// instead of degrading to a device-local lock.
pub async fn build_lease_store(
    cfg: &AppConfig,
    bus: Arc<dyn Bus>,
) -> Result<Arc<dyn LeaseStore>, LeaseStoreError> {
    match cfg.lease_backend {
        LeaseBackend::Memory => {
            info!(target = "field.lease", "using in-process lease store");
            Ok(InMemoryLeaseStore::with_feed(bus))
        }
        LeaseBackend::Postgres => {
            let url = cfg.database_url.as_deref().ok_or_else(|| {
                LeaseStoreError::Store(
                    "FIELD_LEASE_BACKEND=postgres needs FIELD_DATABASE_URL".into(),
                )
            })?;
            let store = PostgresLeaseStore::connect_lazy(url)?;
            spawn_change_feed(store.pool().clone(), bus);
            Ok(Arc::new(store))
        }
        LeaseBackend::Redis => {
            let url = cfg.redis_url.as_deref().ok_or_else(|| {
                LeaseStoreError::Store("FIELD_LEASE_BACKEND=redis needs FIELD_REDIS_URL".into())
            })?;
            Ok(Arc::new(RedisLeaseStore::connect(url, Some(bus))?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::BusTransport;
    use crate::identity::StaticDirectory;
    use field_bus::{ChangeKind, LocalBus};
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<InMemoryLeaseStore>,
        channels: Arc<ChannelMultiplexer>,
        manager: FloorLeaseManager,
    }

    fn fixture(stale_after: Duration) -> Fixture {
        let bus = Arc::new(LocalBus::new());
        let store = InMemoryLeaseStore::with_feed(bus.clone());
        let channels = ChannelMultiplexer::new(BusTransport::new(bus));
        let directory = StaticDirectory(HashMap::from([("v-a".to_string(), "Avi".to_string())]));
        let manager = FloorLeaseManager::new(
            store.clone(),
            channels.clone(),
            Arc::new(directory),
            stale_after,
        );
        Fixture {
            store,
            channels,
            manager,
        }
    }

    #[tokio::test]
    async fn second_claim_conflicts_with_message() {
        let fx = fixture(Duration::from_secs(1800));
        fx.manager.claim("B1", 3, "v-a").await.unwrap();
        let err = fx.manager.claim("B1", 3, "v-b").await.unwrap_err();
        assert!(matches!(
            err,
            LeaseError::Conflict { ref building_id, floor: 3 } if building_id == "B1"
        ));
        assert_eq!(err.to_string(), "Floor is already claimed.");
    }

    #[tokio::test]
    async fn blank_holder_is_unauthenticated() {
        let fx = fixture(Duration::from_secs(1800));
        assert!(matches!(fx.manager.claim("B1", 1, " ").await, Err(LeaseError::Unauthenticated)));
        assert!(matches!(fx.manager.release("B1", 1, "").await, Err(LeaseError::Unauthenticated)));
    }

    #[tokio::test]
    async fn release_by_other_holder_is_a_noop() {
        let fx = fixture(Duration::from_secs(1800));
        fx.manager.claim("B1", 2, "v-a").await.unwrap();
        fx.manager.release("B1", 2, "v-b").await.unwrap();
        assert_eq!(fx.manager.list_active("B1").await.unwrap().len(), 1);
        fx.manager.release("B1", 2, "v-a").await.unwrap();
        fx.manager.release("B1", 2, "v-a").await.unwrap();
        assert!(fx.manager.list_active("B1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_active_orders_by_floor_with_names() {
        let fx = fixture(Duration::from_secs(1800));
        assert!(fx.manager.list_active("B1").await.unwrap().is_empty());
        fx.manager.claim("B1", 5, "v-b").await.unwrap();
        fx.manager.claim("B1", 1, "v-a").await.unwrap();
        fx.manager.claim("B2", 1, "v-a").await.unwrap();

        let active = fx.manager.list_active("B1").await.unwrap();
        let floors: Vec<i32> = active.iter().map(|a| a.lease.floor).collect();
        assert_eq!(floors, [1, 5]);
        assert_eq!(active[0].holder_name.as_deref(), Some("Avi"));
        assert!(active[1].holder_name.is_none());
        assert!(!active[0].stale);
    }

    #[tokio::test]
    async fn heartbeat_only_moves_last_activity() {
        let fx = fixture(Duration::from_secs(1800));
        let original = fx.manager.claim("B1", 3, "v-a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        fx.manager.heartbeat("B1", 3, "v-a");

        let updated = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let leases = fx.store.list_for_building("B1").await.unwrap();
                if leases[0].last_activity_at > original.last_activity_at {
                    break leases[0].clone();
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("heartbeat landed");
        assert_eq!(updated.holder_id, original.holder_id);
        assert_eq!(updated.claimed_at, original.claimed_at);
    }

    #[tokio::test]
    async fn heartbeat_failure_is_swallowed() {
        let fx = fixture(Duration::from_secs(1800));
        fx.manager.claim("B1", 3, "v-a").await.unwrap();
        let before = metrics::HEARTBEAT_FAILURES.get();
        fx.store.set_offline(true);
        fx.manager.heartbeat("B1", 3, "v-a");
        tokio::time::timeout(Duration::from_secs(2), async {
            while metrics::HEARTBEAT_FAILURES.get() == before {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("failure counted");
    }

    #[tokio::test]
    async fn reclaim_only_removes_idle_leases() {
        let fx = fixture(Duration::from_secs(60));
        fx.manager.claim("B1", 1, "v-a").await.unwrap();
        assert!(fx.manager.reclaim_stale("B1", 1).await.unwrap().is_none());

        let old = Utc::now() - chrono::Duration::minutes(10);
        fx.store
            .insert_if_absent(FloorLease::new(FloorKey::new("B1", 2), "v-b", old))
            .await
            .unwrap();
        let active = fx.manager.list_active("B1").await.unwrap();
        assert!(active.iter().any(|a| a.lease.floor == 2 && a.stale));

        let reclaimed = fx.manager.reclaim_stale("B1", 2).await.unwrap().expect("reclaimed");
        assert_eq!(reclaimed.holder_id, "v-b");
        fx.manager.claim("B1", 2, "v-a").await.unwrap();
    }

    #[tokio::test]
    async fn subscribers_see_claims_for_their_building_only() {
        let fx = fixture(Duration::from_secs(1800));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = fx
            .manager
            .subscribe("B1", move |change| {
                let _ = tx.send(change.clone());
            })
            .await;

        fx.manager.claim("B2", 1, "v-a").await.unwrap();
        fx.manager.claim("B1", 4, "v-a").await.unwrap();
        fx.manager.release("B1", 4, "v-a").await.unwrap();

        let inserted = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inserted.kind, ChangeKind::Insert);
        assert_eq!(inserted.column("floor"), Some(&serde_json::json!(4)));
        let deleted = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deleted.kind, ChangeKind::Delete);
        assert_eq!(deleted.column("building_id"), Some(&serde_json::json!("B1")));
    }

    #[tokio::test]
    async fn complete_floor_releases_and_announces() {
        let fx = fixture(Duration::from_secs(1800));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = fx
            .channels
            .subscribe(
                TopicKey::Building("B1".into()),
                EventFilter::broadcast("floor_completed"),
                move |event| {
                    if let ChannelEvent::Broadcast(msg) = event {
                        let _ = tx.send(FieldSignal::from_message(msg));
                    }
                },
            )
            .await;

        fx.manager.claim("B1", 6, "v-a").await.unwrap();
        fx.manager.complete_floor("B1", 6, "v-a").await.unwrap();
        assert!(fx.manager.list_active("B1").await.unwrap().is_empty());

        let signal = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(signal, Some(FieldSignal::FloorCompleted { floor: 6, .. })));
    }

    #[tokio::test]
    async fn shared_backend_never_degrades_to_memory() {
        let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
        let cfg = AppConfig {
            lease_backend: LeaseBackend::Postgres,
            database_url: Some("postgres://u:p@127.0.0.1:1/field".into()),
            ..AppConfig::default()
        };
        let store = build_lease_store(&cfg, bus.clone()).await.unwrap();
        let lease = FloorLease::new(FloorKey::new("B1", 3), "v-a", Utc::now());
        assert!(matches!(
            store.insert_if_absent(lease).await,
            Err(LeaseStoreError::Unavailable(_))
        ));

        let missing_url = AppConfig {
            lease_backend: LeaseBackend::Redis,
            ..AppConfig::default()
        };
        assert!(build_lease_store(&missing_url, bus.clone()).await.is_err());

        let memory = build_lease_store(&AppConfig::default(), bus).await.unwrap();
        assert!(memory.list_for_building("B1").await.unwrap().is_empty());
    }
}
