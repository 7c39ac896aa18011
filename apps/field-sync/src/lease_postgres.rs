use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use field_bus::{publish_envelope, rows_topic, Bus, Envelope, RowChange};
use lease_store::{FloorKey, FloorLease, LeaseStore, LeaseStoreError, LEASE_TABLE};
use sea_query::{Expr, Iden, Order, PostgresQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use sqlx::migrate::MigrateError;
use sqlx::postgres::{PgListener, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Channel the migration's trigger notifies on.
pub const CHANGE_CHANNEL: &str = "floor_leases_changes";

const UNIQUE_VIOLATION: &str = "23505";

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Postgres lease store. The pool connects on demand and migrations run before
/// the first statement, so a device that boots without the database gets
/// `Unavailable` from each call until it is reachable.
pub struct PostgresLeaseStore {
    pool: PgPool,
    migrated: OnceCell<()>,
}

impl PostgresLeaseStore {
    /// Build the pool without touching the network. Fails only on a bad URL.
    pub fn connect_lazy(url: &str) -> Result<Self, LeaseStoreError> {
        let pool = PgPoolOptions::new()
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy(url)
            .map_err(map_sqlx_error)?;
        Ok(Self {
            pool,
            migrated: OnceCell::new(),
        })
    }

    /// Connect and migrate up front.
    pub async fn connect(url: &str) -> Result<Self, LeaseStoreError> {
        let store = Self::connect_lazy(url)?;
        store.ready().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ready(&self) -> Result<(), LeaseStoreError> {
        self.migrated
            .get_or_try_init(|| run_migrations(&self.pool))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    async fn insert_if_absent(&self, lease: FloorLease) -> Result<FloorLease, LeaseStoreError> {
        self.ready().await?;
        // Plain INSERT: the primary key rejects a second live lease.
        let (sql, values) = Query::insert()
            .into_table(FloorLeases::Table)
            .columns([
                FloorLeases::BuildingId,
                FloorLeases::Floor,
                FloorLeases::HolderId,
                FloorLeases::ClaimedAt,
                FloorLeases::LastActivityAt,
            ])
            .values_panic([
                lease.building_id.clone().into(),
                lease.floor.into(),
                lease.holder_id.clone().into(),
                lease.claimed_at.into(),
                lease.last_activity_at.into(),
            ])
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(lease)
    }

    async fn touch(
        &self,
        key: &FloorKey,
        holder_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, LeaseStoreError> {
        self.ready().await?;
        let (sql, values) = Query::update()
            .table(FloorLeases::Table)
            .value(FloorLeases::LastActivityAt, at)
            .and_where(Expr::col(FloorLeases::BuildingId).eq(key.building_id.as_str()))
            .and_where(Expr::col(FloorLeases::Floor).eq(key.floor))
            .and_where(Expr::col(FloorLeases::HolderId).eq(holder_id))
            .build_sqlx(PostgresQueryBuilder);
        let result = sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, key: &FloorKey, holder_id: &str) -> Result<bool, LeaseStoreError> {
        self.ready().await?;
        let (sql, values) = Query::delete()
            .from_table(FloorLeases::Table)
            .and_where(Expr::col(FloorLeases::BuildingId).eq(key.building_id.as_str()))
            .and_where(Expr::col(FloorLeases::Floor).eq(key.floor))
            .and_where(Expr::col(FloorLeases::HolderId).eq(holder_id))
            .build_sqlx(PostgresQueryBuilder);
        let result = sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_idle(
        &self,
        key: &FloorKey,
        idle_before: DateTime<Utc>,
    ) -> Result<Option<FloorLease>, LeaseStoreError> {
        self.ready().await?;
        let (sql, values) = Query::delete()
            .from_table(FloorLeases::Table)
            .and_where(Expr::col(FloorLeases::BuildingId).eq(key.building_id.as_str()))
            .and_where(Expr::col(FloorLeases::Floor).eq(key.floor))
            .and_where(Expr::col(FloorLeases::LastActivityAt).lt(idle_before))
            .returning_all()
            .build_sqlx(PostgresQueryBuilder);
        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(lease_from_row).transpose()
    }

    async fn list_for_building(
        &self,
        building_id: &str,
    ) -> Result<Vec<FloorLease>, LeaseStoreError> {
        self.ready().await?;
        let (sql, values) = Query::select()
            .columns([
                FloorLeases::BuildingId,
                FloorLeases::Floor,
                FloorLeases::HolderId,
                FloorLeases::ClaimedAt,
                FloorLeases::LastActivityAt,
            ])
            .from(FloorLeases::Table)
            .and_where(Expr::col(FloorLeases::BuildingId).eq(building_id))
            .order_by(FloorLeases::Floor, Order::Asc)
            .build_sqlx(PostgresQueryBuilder);
        let rows = sqlx::query_with(&sql, values)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(lease_from_row).collect()
    }
}

#[derive(Iden)]
enum FloorLeases {
    Table,
    BuildingId,
    Floor,
    HolderId,
    ClaimedAt,
    LastActivityAt,
}

fn lease_from_row(row: &PgRow) -> Result<FloorLease, LeaseStoreError> {
    let read = |e: sqlx::Error| LeaseStoreError::Store(e.to_string());
    Ok(FloorLease {
        building_id: row.try_get("building_id").map_err(read)?,
        floor: row.try_get("floor").map_err(read)?,
        holder_id: row.try_get("holder_id").map_err(read)?,
        claimed_at: row.try_get("claimed_at").map_err(read)?,
        last_activity_at: row.try_get("last_activity_at").map_err(read)?,
    })
}

fn map_sqlx_error(err: sqlx::Error) -> LeaseStoreError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            LeaseStoreError::Conflict
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => LeaseStoreError::Unavailable(err.to_string()),
        _ => LeaseStoreError::Store(err.to_string()),
    }
}

async fn run_migrations(pool: &PgPool) -> Result<(), LeaseStoreError> {
    match sqlx::migrate!().run(pool).await {
        Ok(()) => Ok(()),
        Err(MigrateError::Execute(err)) => Err(map_sqlx_error(err)),
        Err(err) => Err(LeaseStoreError::Store(err.to_string())),
    }
}

fn relay_change(bus: &dyn Bus, topic: &str, change: RowChange) {
    debug!(target = "field.lease", kind = ?change.kind, "lease row changed");
    let envelope = Envelope::RowChange(change);
    if let Err(err) = publish_envelope(bus, topic, &envelope) {
        warn!(target = "field.lease", error = %err, "lease change not relayed");
    }
}

/// Relay trigger notifications from `floor_leases` onto `rows:floor_leases`.
/// Reconnects with a fixed delay if the listener drops.
pub fn spawn_change_feed(pool: PgPool, bus: Arc<dyn Bus>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let topic = rows_topic(LEASE_TABLE);
        loop {
            let mut listener = match PgListener::connect_with(&pool).await {
                Ok(listener) => listener,
                Err(err) => {
                    warn!(target = "field.lease", error = %err, "lease change feed connect failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };
            if let Err(err) = listener.listen(CHANGE_CHANNEL).await {
                warn!(target = "field.lease", error = %err, "lease change feed listen failed");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<RowChange>(notification.payload()) {
                            Ok(change) => relay_change(bus.as_ref(), &topic, change),
                            Err(err) => {
                                warn!(
                                    target = "field.lease",
                                    error = %err,
                                    "bad lease change payload"
                                )
                            }
                        }
                    }
                    Err(err) => {
                        warn!(target = "field.lease", error = %err, "lease change feed dropped");
                        break;
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use field_bus::LocalBus;

    #[tokio::test]
    async fn unreachable_database_is_unavailable_per_call() {
        let store = PostgresLeaseStore::connect_lazy("postgres://u:p@127.0.0.1:1/field").unwrap();
        let lease = FloorLease::new(FloorKey::new("B1", 3), "v-a", Utc::now());
        let err = store.insert_if_absent(lease).await.unwrap_err();
        assert!(matches!(err, LeaseStoreError::Unavailable(_)), "{err:?}");
        assert!(matches!(
            store.list_for_building("B1").await,
            Err(LeaseStoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn malformed_url_is_rejected_up_front() {
        assert!(PostgresLeaseStore::connect_lazy("not a url").is_err());
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_claim_and_release() {
        let url = std::env::var("DATABASE_URL").expect("set DATABASE_URL");
        let store = PostgresLeaseStore::connect(&url).await.expect("connect");
        let bus = Arc::new(LocalBus::new());
        let mut feed = bus.subscribe(&rows_topic(LEASE_TABLE));
        let _relay = spawn_change_feed(store.pool().clone(), bus.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let building = format!("pg-{}", uuid::Uuid::new_v4());
        let key = FloorKey::new(&building, 3);
        store
            .insert_if_absent(FloorLease::new(key.clone(), "v-a", Utc::now()))
            .await
            .unwrap();
        let err = store
            .insert_if_absent(FloorLease::new(key.clone(), "v-b", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseStoreError::Conflict));

        assert!(store.touch(&key, "v-a", Utc::now()).await.unwrap());
        assert!(!store.delete(&key, "v-b").await.unwrap());
        assert_eq!(store.list_for_building(&building).await.unwrap().len(), 1);
        assert!(store.delete(&key, "v-a").await.unwrap());

        let msg = tokio::time::timeout(Duration::from_secs(5), feed.recv())
            .await
            .expect("feed delivered")
            .expect("message");
        assert!(matches!(Envelope::decode(&msg.payload), Ok(Envelope::RowChange(_))));
    }
}
