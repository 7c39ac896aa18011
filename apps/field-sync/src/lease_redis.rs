use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use field_bus::{Bus, ChangeKind};
use lease_store::{publish_lease_change, FloorKey, FloorLease, LeaseStore, LeaseStoreError};
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::OnceCell;

// KEYS[1] lease key, KEYS[2] building index. ARGV[1] lease json, ARGV[2] floor.
static INSERT_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  redis.call('SADD', KEYS[2], ARGV[2])
  return 1
end
return 0
"#,
    )
});

// ARGV[1] holder, ARGV[2] last_activity_at, ARGV[3] last_activity_ms.
static TOUCH_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return false end
local lease = cjson.decode(raw)
if lease['holder_id'] ~= ARGV[1] then return false end
lease['last_activity_at'] = ARGV[2]
lease['last_activity_ms'] = tonumber(ARGV[3])
local updated = cjson.encode(lease)
redis.call('SET', KEYS[1], updated)
return {raw, updated}
"#,
    )
});

// ARGV[1] holder, ARGV[2] floor.
static DELETE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return false end
if cjson.decode(raw)['holder_id'] ~= ARGV[1] then return false end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[2])
return raw
"#,
    )
});

// ARGV[1] cutoff ms, ARGV[2] floor.
static DELETE_IDLE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return false end
local last = tonumber(cjson.decode(raw)['last_activity_ms'])
if last == nil or last >= tonumber(ARGV[1]) then return false end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[2])
return raw
"#,
    )
});

/// Redis-backed lease store. Each lease is a JSON document under
/// `field:lease:{building}:{floor}`; `field:lease_floors:{building}` indexes
/// the floors of a building.
pub struct RedisLeaseStore {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    feed: Option<Arc<dyn Bus>>,
}

impl RedisLeaseStore {
    pub fn connect(url: &str, feed: Option<Arc<dyn Bus>>) -> Result<Self, LeaseStoreError> {
        let client = redis::Client::open(url).map_err(map_redis_error)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            feed,
        })
    }

    async fn conn(&self) -> Result<ConnectionManager, LeaseStoreError> {
        self.conn
            .get_or_try_init(|| self.client.get_connection_manager())
            .await
            .cloned()
            .map_err(map_redis_error)
    }

    fn emit(&self, kind: ChangeKind, new: Option<&FloorLease>, old: Option<&FloorLease>) {
        if let Some(bus) = &self.feed {
            publish_lease_change(bus.as_ref(), kind, new, old);
        }
    }
}

fn lease_key(key: &FloorKey) -> String {
    format!("field:lease:{}:{}", key.building_id, key.floor)
}

fn index_key(building_id: &str) -> String {
    format!("field:lease_floors:{building_id}")
}

fn encode(lease: &FloorLease) -> Result<String, LeaseStoreError> {
    let mut doc = serde_json::to_value(lease).map_err(|e| LeaseStoreError::Store(e.to_string()))?;
    doc["last_activity_ms"] = serde_json::json!(lease.last_activity_at.timestamp_millis());
    Ok(doc.to_string())
}

fn decode(raw: &str) -> Result<FloorLease, LeaseStoreError> {
    serde_json::from_str(raw).map_err(|e| LeaseStoreError::Store(e.to_string()))
}

fn map_redis_error(err: redis::RedisError) -> LeaseStoreError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_timeout()
        || err.is_connection_dropped()
    {
        LeaseStoreError::Unavailable(err.to_string())
    } else {
        LeaseStoreError::Store(err.to_string())
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn insert_if_absent(&self, lease: FloorLease) -> Result<FloorLease, LeaseStoreError> {
        let mut conn = self.conn().await?;
        let inserted: i32 = INSERT_SCRIPT
            .key(lease_key(&lease.key()))
            .key(index_key(&lease.building_id))
            .arg(encode(&lease)?)
            .arg(lease.floor)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        if inserted == 0 {
            return Err(LeaseStoreError::Conflict);
        }
        self.emit(ChangeKind::Insert, Some(&lease), None);
        Ok(lease)
    }

    async fn touch(
        &self,
        key: &FloorKey,
        holder_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, LeaseStoreError> {
        let mut conn = self.conn().await?;
        let at_json = serde_json::to_value(at).map_err(|e| LeaseStoreError::Store(e.to_string()))?;
        let stamp = at_json.as_str().unwrap_or_default().to_string();
        let touched: Option<(String, String)> = TOUCH_SCRIPT
            .key(lease_key(key))
            .arg(holder_id)
            .arg(stamp)
            .arg(at.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        match touched {
            Some((old, new)) => {
                self.emit(ChangeKind::Update, Some(&decode(&new)?), Some(&decode(&old)?));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &FloorKey, holder_id: &str) -> Result<bool, LeaseStoreError> {
        let mut conn = self.conn().await?;
        let removed: Option<String> = DELETE_SCRIPT
            .key(lease_key(key))
            .key(index_key(&key.building_id))
            .arg(holder_id)
            .arg(key.floor)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        match removed {
            Some(raw) => {
                self.emit(ChangeKind::Delete, None, Some(&decode(&raw)?));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_idle(
        &self,
        key: &FloorKey,
        idle_before: DateTime<Utc>,
    ) -> Result<Option<FloorLease>, LeaseStoreError> {
        let mut conn = self.conn().await?;
        let removed: Option<String> = DELETE_IDLE_SCRIPT
            .key(lease_key(key))
            .key(index_key(&key.building_id))
            .arg(idle_before.timestamp_millis())
            .arg(key.floor)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        let removed = removed.as_deref().map(decode).transpose()?;
        if let Some(old) = &removed {
            self.emit(ChangeKind::Delete, None, Some(old));
        }
        Ok(removed)
    }

    async fn list_for_building(
        &self,
        building_id: &str,
    ) -> Result<Vec<FloorLease>, LeaseStoreError> {
        let mut conn = self.conn().await?;
        let floors: Vec<i32> = redis::cmd("SMEMBERS")
            .arg(index_key(building_id))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        if floors.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = floors
            .iter()
            .map(|floor| lease_key(&FloorKey::new(building_id, *floor)))
            .collect();
        let docs: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        let mut leases = docs
            .iter()
            .flatten()
            .map(|raw| decode(raw))
            .collect::<Result<Vec<_>, _>>()?;
        leases.sort_by_key(|lease| lease.floor);
        Ok(leases)
    }
}
