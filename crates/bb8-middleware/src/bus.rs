//! Message Bus Client capability and an in-process implementation.
//!
//! [`MessageBusClient`] is the seam between the bridge and whatever
//! publish/subscribe transport carries its traffic.  The dispatcher only ever
//! calls `connect`, `subscribe`, `publish`, and drains [`events`]; a broker
//! client (MQTT or otherwise) plugs in behind the trait.
//!
//! [`InMemoryBus`] implements the trait without a broker.  It uses a
//! [`tokio::sync::broadcast`] channel for inbound delivery so every
//! [`events`] stream receives every [`BusEvent`], and it records everything
//! published through it so tests can inspect the outbound side.
//!
//! [`events`]: MessageBusClient::events

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bb8_types::BridgeError;
use futures_util::stream::{self, BoxStream};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::topics::topic_matches;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow consumers).
const DEFAULT_CAPACITY: usize = 256;

/// A single message travelling over the bus in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// What a [`MessageBusClient`] delivers to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// An inbound message on a subscribed topic.
    Message(BusMessage),
    /// The transport dropped.  Subscriptions are gone and must be re-issued
    /// after the next successful [`MessageBusClient::connect`].
    Disconnected,
}

/// The publish/subscribe transport the bridge runs on.
///
/// # Contract
///
/// * `connect` – establish (or re-establish) the session.  Subscriptions do
///   not survive a disconnect.
/// * `subscribe` – register an MQTT-style topic filter (`+`, `#`).  Retained
///   values matching the filter are delivered as events with `retain` set.
/// * `publish` – send `payload` to `topic`; `retain` asks the broker to keep
///   the last value for late subscribers.
/// * `events` – a stream of inbound messages and connection drops.  Obtain it
///   once and keep it across reconnects.
#[async_trait]
pub trait MessageBusClient: Send + Sync {
    async fn connect(&self) -> Result<(), BridgeError>;

    async fn subscribe(&self, filter: &str) -> Result<(), BridgeError>;

    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), BridgeError>;

    fn events(&self) -> BoxStream<'static, BusEvent>;
}

#[derive(Default)]
struct BusState {
    connected: bool,
    subscriptions: Vec<String>,
    published: Vec<BusMessage>,
    retained: HashMap<String, String>,
    refused_connects: u32,
    connect_attempts: u32,
}

struct Inner {
    events: broadcast::Sender<BusEvent>,
    state: Mutex<BusState>,
}

/// Broker-less [`MessageBusClient`].  Clone it cheaply – all clones share the
/// same channel and state.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

impl InMemoryBus {
    /// Create a bus whose event channel buffers up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                events,
                state: Mutex::new(BusState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Simulation hooks
    // -----------------------------------------------------------------------

    /// Inject an inbound message as if a remote client had published it.
    ///
    /// Returns `true` when the message was routed to the consumer.  Messages
    /// arriving while disconnected, or on topics nobody subscribed to, are
    /// dropped.
    pub fn deliver(&self, topic: &str, payload: &str) -> bool {
        {
            let state = self.state();
            if !state.connected {
                debug!(topic, "bus offline; inbound message dropped");
                return false;
            }
            if !state.subscriptions.iter().any(|f| topic_matches(f, topic)) {
                return false;
            }
        }
        let message = BusMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain: false,
        };
        // No live consumer is a normal condition, not an error.
        self.inner.events.send(BusEvent::Message(message)).is_ok()
    }

    /// Simulate a transport drop.
    pub fn drop_connection(&self) {
        {
            let mut state = self.state();
            state.connected = false;
            state.subscriptions.clear();
        }
        let _ = self.inner.events.send(BusEvent::Disconnected);
    }

    /// Make the next `count` calls to `connect` fail.
    pub fn refuse_next_connects(&self, count: u32) {
        self.state().refused_connects = count;
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state().subscriptions.clone()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    /// Every message published so far, oldest first.
    pub fn published(&self) -> Vec<BusMessage> {
        self.state().published.clone()
    }

    /// Messages published to exactly `topic`, oldest first.
    pub fn published_to(&self, topic: &str) -> Vec<BusMessage> {
        self.state()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// The retained value for `topic`, if any.
    pub fn retained(&self, topic: &str) -> Option<String> {
        self.state().retained.get(topic).cloned()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl MessageBusClient for InMemoryBus {
    async fn connect(&self) -> Result<(), BridgeError> {
        let mut state = self.state();
        state.connect_attempts += 1;
        if state.refused_connects > 0 {
            state.refused_connects -= 1;
            return Err(BridgeError::Transport("connection refused".to_string()));
        }
        state.connected = true;
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), BridgeError> {
        let mut state = self.state();
        if !state.connected {
            return Err(BridgeError::NotConnected);
        }
        if !state.subscriptions.iter().any(|f| f == filter) {
            state.subscriptions.push(filter.to_string());
        }
        // Retained values are replayed to each new subscription, as a broker does.
        let mut replay: Vec<(&String, &String)> = state
            .retained
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .collect();
        replay.sort();
        for (topic, payload) in replay {
            let _ = self.inner.events.send(BusEvent::Message(BusMessage {
                topic: topic.clone(),
                payload: payload.clone(),
                retain: true,
            }));
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), BridgeError> {
        let mut state = self.state();
        if !state.connected {
            return Err(BridgeError::NotConnected);
        }
        if retain {
            state.retained.insert(topic.to_string(), payload.to_string());
        }
        state.published.push(BusMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain,
        });
        Ok(())
    }

    fn events(&self) -> BoxStream<'static, BusEvent> {
        let receiver = self.inner.events.subscribe();
        Box::pin(stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged_by = n, "bus consumer lagged; events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }))
    }
}
