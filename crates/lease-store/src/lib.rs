//! Lease Store Adapter: the arbitration point for floor claims.
//!
//! A backing store qualifies if it can insert a row and fail *distinctly* when
//! a row with the same (building, floor) key already exists. That failure is
//! the only mutual-exclusion mechanism; callers must never check-then-insert.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use field_bus::{publish_envelope, rows_topic, Bus, ChangeKind, Envelope, RowChange};
use serde::{Deserialize, Serialize};
use tracing::warn;

mod memory;

pub use memory::InMemoryLeaseStore;

/// Table name used by every backend and by the row-change feed.
pub const LEASE_TABLE: &str = "floor_leases";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FloorKey {
    pub building_id: String,
    pub floor: i32,
}

impl FloorKey {
    pub fn new(building_id: impl Into<String>, floor: i32) -> Self {
        Self {
            building_id: building_id.into(),
            floor,
        }
    }
}

impl fmt::Display for FloorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.building_id, self.floor)
    }
}

/// Exclusive working rights over one floor of one building.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloorLease {
    pub building_id: String,
    pub floor: i32,
    pub holder_id: String,
    pub claimed_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl FloorLease {
    pub fn new(key: FloorKey, holder_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            building_id: key.building_id,
            floor: key.floor,
            holder_id: holder_id.into(),
            claimed_at: at,
            last_activity_at: at,
        }
    }

    pub fn key(&self) -> FloorKey {
        FloorKey::new(self.building_id.clone(), self.floor)
    }

    pub fn to_row(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseStoreError {
    /// The uniqueness constraint on (building, floor) rejected the insert.
    #[error("lease already exists")]
    Conflict,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store error: {0}")]
    Store(String),
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Atomically insert `lease` unless a lease for its key exists.
    async fn insert_if_absent(&self, lease: FloorLease) -> Result<FloorLease, LeaseStoreError>;

    /// Bump `last_activity_at` on the lease for `key` held by `holder_id`.
    /// Returns whether a row matched.
    async fn touch(
        &self,
        key: &FloorKey,
        holder_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, LeaseStoreError>;

    /// Delete the lease for `key` only if it is held by `holder_id`.
    async fn delete(&self, key: &FloorKey, holder_id: &str) -> Result<bool, LeaseStoreError>;

    /// Delete the lease for `key` only if its last activity is older than
    /// `idle_before`, returning the removed lease.
    async fn delete_idle(
        &self,
        key: &FloorKey,
        idle_before: DateTime<Utc>,
    ) -> Result<Option<FloorLease>, LeaseStoreError>;

    async fn list_for_building(&self, building_id: &str)
        -> Result<Vec<FloorLease>, LeaseStoreError>;
}

/// Publish a lease row change on `rows:floor_leases`, the way a database
/// change feed would. Failures are logged and dropped.
pub fn publish_lease_change(
    bus: &dyn Bus,
    kind: ChangeKind,
    new: Option<&FloorLease>,
    old: Option<&FloorLease>,
) {
    let envelope = Envelope::RowChange(RowChange {
        table: LEASE_TABLE.to_string(),
        kind,
        new: new.map(FloorLease::to_row),
        old: old.map(FloorLease::to_row),
    });
    if let Err(err) = publish_envelope(bus, &rows_topic(LEASE_TABLE), &envelope) {
        warn!(target = "lease.store", error = %err, "failed to publish lease change");
    }
}
