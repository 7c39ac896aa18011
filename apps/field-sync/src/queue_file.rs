use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::queue::{PendingMutation, QueueError, QueueStore};

pub const SCHEMA_VERSION: u32 = 1;

/// On-disk queue: one JSON document per namespace, replaced atomically via a
/// temp file and rename.
pub struct FileQueueStore {
    dir: PathBuf,
    path: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredQueue {
    Versioned {
        version: u32,
        entries: Vec<PendingMutation>,
    },
    /// Bare array written before the layout carried a version.
    Legacy(Vec<PendingMutation>),
}

#[derive(Serialize)]
struct StoredQueueRef<'a> {
    version: u32,
    entries: &'a [PendingMutation],
}

impl FileQueueStore {
    pub fn new(dir: impl Into<PathBuf>, namespace: &str) -> Self {
        let dir = dir.into();
        let path = dir.join(format!("{namespace}.json"));
        Self { dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(bytes: &[u8]) -> Result<Vec<PendingMutation>, QueueError> {
        match serde_json::from_slice::<StoredQueue>(bytes)? {
            StoredQueue::Versioned { version, entries } if version == SCHEMA_VERSION => Ok(entries),
            StoredQueue::Versioned { version, .. } => Err(QueueError::UnsupportedVersion(version)),
            StoredQueue::Legacy(entries) => {
                info!(
                    target = "field.queue",
                    entries = entries.len(),
                    "read unversioned queue file"
                );
                Ok(entries)
            }
        }
    }
}

fn storage(err: std::io::Error) -> QueueError {
    QueueError::Storage(err.to_string())
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn load(&self) -> Result<Vec<PendingMutation>, QueueError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Self::parse(&bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(storage(err)),
        }
    }

    async fn save(&self, entries: &[PendingMutation]) -> Result<(), QueueError> {
        let doc = serde_json::to_vec(&StoredQueueRef {
            version: SCHEMA_VERSION,
            entries,
        })?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(storage)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &doc).await.map_err(storage)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(storage)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EntityType, MutationAction, MutationQueue};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileQueueStore::new(dir.path(), "pending_mutations"));
        let queue = MutationQueue::open(store.clone(), 100).await.unwrap();
        let queued = queue
            .enqueue(
                EntityType::Room,
                MutationAction::Update,
                "r1",
                json!({"status": "donated"}),
                Some("v-a"),
            )
            .await
            .unwrap();
        drop(queue);

        let reopened = MutationQueue::open(store.clone(), 100).await.unwrap();
        assert_eq!(reopened.pending().await, vec![queued]);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert!(!dir.path().join("pending_mutations.json.tmp").exists());
    }

    #[tokio::test]
    async fn reads_unversioned_array() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileQueueStore::new(dir.path(), "legacy");
        std::fs::write(
            store.path(),
            concat!(
                r#"[{"id":"7c9e6679-7425-40de-944b-e07fc1f90ae7","entity_type":"room","#,
                r#""action":"update","entity_id":"r1","payload":{"status":"callback"},"#,
                r#""enqueued_at":"2024-05-01T10:00:00Z"}]"#,
            ),
        )
        .unwrap();
        let entries = store.load().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entity_id, "r1");
        assert!(entries[0].actor_id.is_none());
    }

    #[tokio::test]
    async fn rejects_future_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileQueueStore::new(dir.path(), "future");
        std::fs::write(store.path(), r#"{"version":9,"entries":[]}"#).unwrap();
        assert!(matches!(store.load().await, Err(QueueError::UnsupportedVersion(9))));
    }

    #[tokio::test]
    async fn missing_file_is_an_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileQueueStore::new(dir.path().join("nested"), "pending_mutations");
        assert!(store.load().await.unwrap().is_empty());
    }
}
