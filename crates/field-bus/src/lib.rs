//! In-process pub/sub bus shared by the field sync agent and its stores.
//!
//! Topics are plain strings. Row-level change feeds live under `rows:{table}`;
//! everything else (team and building channels) is application-defined.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod envelope;

pub use envelope::{BroadcastMessage, ChangeKind, Envelope, RowChange};

const TOPIC_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("envelope codec error: {0}")]
    Codec(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
}

/// Topic carrying row-level changes for `table`.
pub fn rows_topic(table: &str) -> String {
    format!("rows:{table}")
}

/// Encode and publish an envelope. A topic with no live subscribers is not an
/// error here: change feeds fire whether or not anyone is listening.
pub fn publish_envelope<B: Bus + ?Sized>(
    bus: &B,
    topic: &str,
    envelope: &Envelope,
) -> BusResult<()> {
    let payload = envelope.encode()?;
    match bus.publish(topic, payload) {
        Ok(()) | Err(BusError::Closed) => Ok(()),
        Err(err) => Err(err),
    }
}

/// In-process bus. Senders are created on first subscribe and pruned once the
/// last receiver is gone, so publishing to a quiet topic never allocates.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        let mut topics = self.topics.write();
        topics.retain(|_, tx| tx.receiver_count() > 0);
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let Some(tx) = self.topics.read().get(topic).cloned() else {
            return Err(BusError::Closed);
        };
        tx.send(BusMessage {
            topic: topic.to_string(),
            payload,
        })
        .map(|_| ())
        .map_err(|_| BusError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_topic_subscribers() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("team:t1");
        bus.publish("team:t1", Bytes::from_static(b"ping"))
            .expect("publish ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "team:t1");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = LocalBus::new();
        drop(bus.subscribe("building:b1"));
        let _live = bus.subscribe("building:b2");
        assert!(bus.topics.read().get("building:b1").is_none());
        assert_eq!(bus.subscriber_count("building:b2"), 1);
    }

    #[test]
    fn publish_without_subscribers_is_closed() {
        let bus = LocalBus::new();
        let err = bus
            .publish("building:b1", Bytes::from_static(b"x"))
            .unwrap_err();
        assert!(matches!(err, BusError::Closed));
    }

    #[test]
    fn envelope_publish_tolerates_empty_topic() {
        let bus = LocalBus::new();
        let envelope = Envelope::Broadcast(BroadcastMessage {
            event: "noop".into(),
            payload: serde_json::Value::Null,
        });
        publish_envelope(&bus, "team:nobody", &envelope).expect("no subscribers is fine");
        assert_eq!(bus.subscriber_count("team:nobody"), 0);
    }
}
