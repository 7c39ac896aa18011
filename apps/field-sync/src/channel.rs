//! Change Channel Multiplexer.
//!
//! One transport handle per topic key, any number of filtered listeners per
//! handle, and a single connection state machine for the whole process:
//!
//! ```text
//! disconnected -> connecting -> connected -> reconnecting -> disconnected
//!                      |            |              |
//!                      v            v              v
//!                 disconnected  disconnected    connected
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use field_bus::{rows_topic, BroadcastMessage, Bus, BusError, BusMessage, RowChange};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics;

pub use field_bus::Envelope as ChannelEvent;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel transport unavailable: {0}")]
    Unavailable(String),
    #[error("channel closed")]
    Closed,
    #[error("channel payload error: {0}")]
    Serde(String),
}

impl From<BusError> for ChannelError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Closed => ChannelError::Closed,
            BusError::Transport(msg) => ChannelError::Unavailable(msg),
            BusError::Codec(msg) => ChannelError::Serde(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
        )
    }

    /// States to walk through when `event` is observed in this state.
    fn path_for(self, event: &TransportEvent) -> Vec<ConnectionState> {
        use ConnectionState::*;
        match (self, event) {
            (Disconnected, TransportEvent::Joining) => vec![Connecting],
            (Disconnected, TransportEvent::Joined) => vec![Connecting, Connected],
            (Connecting | Reconnecting, TransportEvent::Joined) => vec![Connected],
            (Connected, TransportEvent::Error { retrying: true, .. }) => vec![Reconnecting],
            (
                Connecting | Connected | Reconnecting,
                TransportEvent::Error {
                    retrying: false, ..
                },
            ) => vec![Disconnected],
            (
                Connecting | Connected | Reconnecting,
                TransportEvent::GaveUp | TransportEvent::Closed,
            ) => vec![Disconnected],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle signals reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Joining,
    Joined,
    Error { retrying: bool, reason: String },
    GaveUp,
    Closed,
}

/// Logical topic a device can listen on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicKey {
    /// Device-level control channel used to establish connectivity.
    System,
    Team(String),
    Building(String),
    Table {
        table: String,
        filter: Option<(String, String)>,
    },
}

impl TopicKey {
    pub fn table_where(table: &str, column: &str, value: &str) -> Self {
        TopicKey::Table {
            table: table.to_string(),
            filter: Some((column.to_string(), value.to_string())),
        }
    }

    pub fn key(&self) -> String {
        match self {
            TopicKey::System => "system".to_string(),
            TopicKey::Team(id) => format!("team:{id}"),
            TopicKey::Building(id) => format!("building:{id}"),
            TopicKey::Table { table, filter: None } => format!("table:{table}"),
            TopicKey::Table {
                table,
                filter: Some((column, value)),
            } => format!("table:{table}:{column}=eq.{value}"),
        }
    }

    /// Bus topic backing this key. Table keys share the table's row feed and
    /// narrow it per listener.
    pub fn transport_topic(&self) -> String {
        match self {
            TopicKey::Table { table, .. } => rows_topic(table),
            other => other.key(),
        }
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventFilter {
    All,
    Rows {
        table: String,
        column: Option<(String, serde_json::Value)>,
    },
    Broadcast {
        event: Option<String>,
    },
}

impl EventFilter {
    pub fn rows(table: &str) -> Self {
        EventFilter::Rows {
            table: table.to_string(),
            column: None,
        }
    }

    pub fn rows_where(table: &str, column: &str, value: serde_json::Value) -> Self {
        EventFilter::Rows {
            table: table.to_string(),
            column: Some((column.to_string(), value)),
        }
    }

    pub fn broadcast(event: &str) -> Self {
        EventFilter::Broadcast {
            event: Some(event.to_string()),
        }
    }

    pub fn matches(&self, event: &ChannelEvent) -> bool {
        match (self, event) {
            (EventFilter::All, _) => true,
            (EventFilter::Rows { table, column }, ChannelEvent::RowChange(change)) => {
                change.table == *table && column_matches(change, column.as_ref())
            }
            (EventFilter::Broadcast { event }, ChannelEvent::Broadcast(msg)) => event
                .as_deref()
                .map(|name| name == msg.event)
                .unwrap_or(true),
            _ => false,
        }
    }
}

fn column_matches(change: &RowChange, column: Option<&(String, serde_json::Value)>) -> bool {
    match column {
        None => true,
        Some((name, expected)) => change.column(name) == Some(expected),
    }
}

/// Transport seam under the multiplexer.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Join `topic`, completing once the transport has acknowledged it.
    async fn join(&self, topic: &str) -> Result<broadcast::Receiver<BusMessage>, ChannelError>;
    async fn leave(&self, topic: &str);
    fn send(&self, topic: &str, payload: Bytes) -> Result<(), ChannelError>;
    /// Connectivity changes that happen outside of join/leave.
    fn lifecycle(&self) -> broadcast::Receiver<TransportEvent>;
}

/// [`ChannelTransport`] over a [`Bus`], with connectivity driven by the host
/// (a network monitor in the app, the test body in tests).
pub struct BusTransport {
    bus: Arc<dyn Bus>,
    online: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl BusTransport {
    pub fn new(bus: Arc<dyn Bus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            online: AtomicBool::new(true),
            events: broadcast::channel(32).0,
        })
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Losing the network reports a retrying error; regaining it reports an ack.
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was == online {
            return;
        }
        let event = if online {
            TransportEvent::Joined
        } else {
            TransportEvent::Error {
                retrying: true,
                reason: "network lost".into(),
            }
        };
        let _ = self.events.send(event);
    }

    /// Stop retrying after a prolonged outage.
    pub fn give_up(&self) {
        self.online.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::GaveUp);
    }
}

#[async_trait]
impl ChannelTransport for BusTransport {
    async fn join(&self, topic: &str) -> Result<broadcast::Receiver<BusMessage>, ChannelError> {
        if !self.is_online() {
            return Err(ChannelError::Unavailable(format!("cannot join {topic} while offline")));
        }
        Ok(self.bus.subscribe(topic))
    }

    async fn leave(&self, _topic: &str) {}

    fn send(&self, topic: &str, payload: Bytes) -> Result<(), ChannelError> {
        if !self.is_online() {
            return Err(ChannelError::Unavailable("offline".into()));
        }
        match self.bus.publish(topic, payload) {
            // Nobody listening is not a failure for a broadcast.
            Ok(()) | Err(BusError::Closed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn lifecycle(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

pub type EventCallback = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;
pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct Listener {
    filter: EventFilter,
    callback: EventCallback,
}

type ListenerMap = Arc<RwLock<HashMap<u64, Listener>>>;

struct ChannelSubscription {
    topic: TopicKey,
    listeners: ListenerMap,
    pump: Option<JoinHandle<()>>,
}

impl ChannelSubscription {
    fn is_joined(&self) -> bool {
        self.pump
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

struct StateHub {
    current: ConnectionState,
    listeners: HashMap<u64, StateCallback>,
}

/// Handle for one listener registered through [`ChannelMultiplexer::subscribe`].
pub struct Subscription {
    key: String,
    id: u64,
    listeners: Weak<RwLock<HashMap<u64, Listener>>>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remove this listener only. The transport handle stays up.
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.write().remove(&self.id);
        }
    }
}

/// Handle for a connection state listener.
pub struct StateListener {
    id: u64,
    hub: Weak<Mutex<StateHub>>,
}

impl StateListener {
    pub fn unsubscribe(self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.lock().listeners.remove(&self.id);
        }
    }
}

pub struct ChannelMultiplexer {
    transport: Arc<dyn ChannelTransport>,
    channels: tokio::sync::Mutex<HashMap<String, ChannelSubscription>>,
    hub: Arc<Mutex<StateHub>>,
    state_tx: watch::Sender<ConnectionState>,
    next_id: AtomicU64,
    lifecycle_pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelMultiplexer {
    /// Must be called inside a tokio runtime: a task follows the transport's
    /// lifecycle events for as long as the multiplexer lives.
    pub fn new(transport: Arc<dyn ChannelTransport>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let mux = Arc::new(Self {
            transport: transport.clone(),
            channels: tokio::sync::Mutex::new(HashMap::new()),
            hub: Arc::new(Mutex::new(StateHub {
                current: ConnectionState::Disconnected,
                listeners: HashMap::new(),
            })),
            state_tx,
            next_id: AtomicU64::new(1),
            lifecycle_pump: Mutex::new(None),
        });

        let weak = Arc::downgrade(&mux);
        let mut events = transport.lifecycle();
        let pump = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target = "field.channel", skipped, "lifecycle events lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(mux) = weak.upgrade() else {
                    break;
                };
                debug!(target = "field.channel", event = ?event, "transport lifecycle event");
                let rejoin = event == TransportEvent::Joined;
                mux.apply_event(&event);
                if rejoin {
                    mux.reconnect().await;
                }
            }
        });
        *mux.lifecycle_pump.lock() = Some(pump);
        mux
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Register `on_event` for events on `topic` that pass `filter`, creating the
    /// transport handle for the topic on first use. A failed join is not
    /// returned to the caller; it moves the connection state and the listener
    /// is attached once [`reconnect`](Self::reconnect) succeeds.
    pub async fn subscribe<F>(
        &self,
        topic: TopicKey,
        filter: EventFilter,
        on_event: F,
    ) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = topic.key();
        let mut channels = self.channels.lock().await;
        let entry = channels
            .entry(key.clone())
            .or_insert_with(|| ChannelSubscription {
                topic,
                listeners: Arc::new(RwLock::new(HashMap::new())),
                pump: None,
            });
        entry.listeners.write().insert(
            id,
            Listener {
                filter,
                callback: Arc::new(on_event),
            },
        );
        let listeners = Arc::downgrade(&entry.listeners);
        if !entry.is_joined() {
            self.join_channel(&key, entry).await;
        }
        Subscription { key, id, listeners }
    }

    /// Publish an application message to every subscriber of `topic`.
    pub fn broadcast(
        &self,
        topic: &TopicKey,
        message: BroadcastMessage,
    ) -> Result<(), ChannelError> {
        let payload = ChannelEvent::Broadcast(message).encode()?;
        self.transport.send(&topic.transport_topic(), payload)
    }

    /// Tear down every transport handle. Used on sign-out and shutdown.
    pub async fn unsubscribe_all(&self) {
        let drained: Vec<ChannelSubscription> = {
            let mut channels = self.channels.lock().await;
            channels.drain().map(|(_, sub)| sub).collect()
        };
        for sub in drained {
            if let Some(pump) = sub.pump {
                pump.abort();
            }
            self.transport.leave(&sub.topic.transport_topic()).await;
        }
        self.apply_event(&TransportEvent::Closed);
        info!(target = "field.channel", "all channels torn down");
    }

    /// Re-join every channel whose transport handle is missing.
    pub async fn reconnect(&self) {
        let mut channels = self.channels.lock().await;
        for (key, entry) in channels.iter_mut() {
            if !entry.is_joined() {
                self.join_channel(key, entry).await;
            }
        }
    }

    /// Call `callback` now with the current state, then on every transition.
    /// Callbacks run under the state lock and must not register listeners.
    pub fn on_connection_state_change<F>(&self, callback: F) -> StateListener
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: StateCallback = Arc::new(callback);
        let mut hub = self.hub.lock();
        callback(hub.current);
        hub.listeners.insert(id, callback);
        StateListener {
            id,
            hub: Arc::downgrade(&self.hub),
        }
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn listener_count(&self, topic: &TopicKey) -> usize {
        self.channels
            .lock()
            .await
            .get(&topic.key())
            .map(|sub| sub.listeners.read().len())
            .unwrap_or(0)
    }

    async fn join_channel(&self, key: &str, entry: &mut ChannelSubscription) {
        self.apply_event(&TransportEvent::Joining);
        match self.transport.join(&entry.topic.transport_topic()).await {
            Ok(rx) => {
                entry.pump = Some(spawn_pump(key.to_string(), rx, entry.listeners.clone()));
                debug!(target = "field.channel", key, "channel joined");
                self.apply_event(&TransportEvent::Joined);
            }
            Err(err) => {
                warn!(target = "field.channel", key, error = %err, "channel join failed");
                self.apply_event(&TransportEvent::Error {
                    retrying: false,
                    reason: err.to_string(),
                });
            }
        }
    }

    fn apply_event(&self, event: &TransportEvent) {
        let mut hub = self.hub.lock();
        for next in hub.current.path_for(event) {
            if !hub.current.can_transition_to(next) {
                warn!(
                    target = "field.channel",
                    from = %hub.current,
                    to = %next,
                    "ignoring invalid connection transition"
                );
                continue;
            }
            info!(
                target = "field.channel",
                from = %hub.current,
                to = %next,
                "connection state changed"
            );
            hub.current = next;
            self.state_tx.send_replace(next);
            metrics::CONNECTION_TRANSITIONS
                .with_label_values(&[next.as_str()])
                .inc();
            for callback in hub.listeners.values() {
                callback(next);
            }
        }
    }
}

impl Drop for ChannelMultiplexer {
    fn drop(&mut self) {
        if let Some(pump) = self.lifecycle_pump.get_mut().take() {
            pump.abort();
        }
        for sub in self.channels.get_mut().values_mut() {
            if let Some(pump) = sub.pump.take() {
                pump.abort();
            }
        }
    }
}

fn spawn_pump(
    key: String,
    mut rx: broadcast::Receiver<BusMessage>,
    listeners: ListenerMap,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => match ChannelEvent::decode(&msg.payload) {
                    Ok(event) => dispatch(&listeners, &event),
                    Err(err) => {
                        warn!(
                            target = "field.channel",
                            key = %key,
                            error = %err,
                            "dropping undecodable frame"
                        )
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target = "field.channel", key = %key, skipped, "channel receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn dispatch(listeners: &ListenerMap, event: &ChannelEvent) {
    let targets: Vec<EventCallback> = listeners
        .read()
        .values()
        .filter(|listener| listener.filter.matches(event))
        .map(|listener| listener.callback.clone())
        .collect();
    for callback in targets {
        callback(event);
    }
}
