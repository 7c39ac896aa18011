use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row-level change as emitted by a backing store's change feed.
/// `new` is absent for deletes, `old` is absent for inserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub table: String,
    pub kind: ChangeKind,
    #[serde(default)]
    pub new: Option<serde_json::Value>,
    #[serde(default)]
    pub old: Option<serde_json::Value>,
}

impl RowChange {
    /// The row image a column filter should look at.
    pub fn record(&self) -> Option<&serde_json::Value> {
        match self.kind {
            ChangeKind::Delete => self.old.as_ref(),
            ChangeKind::Insert | ChangeKind::Update => self.new.as_ref().or(self.old.as_ref()),
        }
    }

    pub fn column(&self, column: &str) -> Option<&serde_json::Value> {
        self.record().and_then(|row| row.get(column))
    }
}

/// Application-level message on a topic, distinct from row changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    RowChange(RowChange),
    Broadcast(BroadcastMessage),
}

impl Envelope {
    pub fn encode(&self) -> Result<Bytes, BusError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| BusError::Codec(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BusError> {
        serde_json::from_slice(bytes).map_err(|err| BusError::Codec(err.to_string()))
    }
}
