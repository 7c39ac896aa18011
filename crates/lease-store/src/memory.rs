use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use field_bus::{Bus, ChangeKind};
use tokio::sync::Mutex;

use crate::{publish_lease_change, FloorKey, FloorLease, LeaseStore, LeaseStoreError};

/// In-memory adapter for tests and single-process wiring.
///
/// The map's entry API under one lock is the insert-if-absent primitive. When a
/// bus is attached every committed change is published on `rows:floor_leases`,
/// standing in for a database change feed.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<FloorKey, FloorLease>>,
    feed: Option<Arc<dyn Bus>>,
    offline: AtomicBool,
}

impl InMemoryLeaseStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_feed(bus: Arc<dyn Bus>) -> Arc<Self> {
        Arc::new(Self {
            feed: Some(bus),
            ..Self::default()
        })
    }

    /// Simulate losing the connection to the store. Every call fails with
    /// [`LeaseStoreError::Unavailable`] until reset.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), LeaseStoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(LeaseStoreError::Unavailable("store offline".into()))
        } else {
            Ok(())
        }
    }

    fn emit(&self, kind: ChangeKind, new: Option<&FloorLease>, old: Option<&FloorLease>) {
        if let Some(bus) = &self.feed {
            publish_lease_change(bus.as_ref(), kind, new, old);
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn insert_if_absent(&self, lease: FloorLease) -> Result<FloorLease, LeaseStoreError> {
        self.ensure_online()?;
        let mut guard = self.leases.lock().await;
        match guard.entry(lease.key()) {
            Entry::Occupied(_) => Err(LeaseStoreError::Conflict),
            Entry::Vacant(slot) => {
                let stored = slot.insert(lease).clone();
                self.emit(ChangeKind::Insert, Some(&stored), None);
                Ok(stored)
            }
        }
    }

    async fn touch(
        &self,
        key: &FloorKey,
        holder_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, LeaseStoreError> {
        self.ensure_online()?;
        let mut guard = self.leases.lock().await;
        match guard.get_mut(key) {
            Some(existing) if existing.holder_id == holder_id => {
                let old = existing.clone();
                existing.last_activity_at = at;
                let new = existing.clone();
                self.emit(ChangeKind::Update, Some(&new), Some(&old));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &FloorKey, holder_id: &str) -> Result<bool, LeaseStoreError> {
        self.ensure_online()?;
        let mut guard = self.leases.lock().await;
        let owned = guard
            .get(key)
            .map(|lease| lease.holder_id == holder_id)
            .unwrap_or(false);
        if !owned {
            return Ok(false);
        }
        if let Some(old) = guard.remove(key) {
            self.emit(ChangeKind::Delete, None, Some(&old));
        }
        Ok(true)
    }

    async fn delete_idle(
        &self,
        key: &FloorKey,
        idle_before: DateTime<Utc>,
    ) -> Result<Option<FloorLease>, LeaseStoreError> {
        self.ensure_online()?;
        let mut guard = self.leases.lock().await;
        let idle = guard
            .get(key)
            .map(|lease| lease.last_activity_at < idle_before)
            .unwrap_or(false);
        if !idle {
            return Ok(None);
        }
        let removed = guard.remove(key);
        if let Some(old) = &removed {
            self.emit(ChangeKind::Delete, None, Some(old));
        }
        Ok(removed)
    }

    async fn list_for_building(
        &self,
        building_id: &str,
    ) -> Result<Vec<FloorLease>, LeaseStoreError> {
        self.ensure_online()?;
        let guard = self.leases.lock().await;
        let mut leases: Vec<FloorLease> = guard
            .values()
            .filter(|lease| lease.building_id == building_id)
            .cloned()
            .collect();
        leases.sort_by_key(|lease| lease.floor);
        Ok(leases)
    }
}
