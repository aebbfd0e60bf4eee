//! Command Dispatcher – the single actor between the bus and the robot.
//!
//! ```text
//!   Disconnected ──connect()──▶ Connecting ──ok──▶ Connected
//!        ▲                          │                  │
//!        └────── backoff ◀──fail────┘     transport drop
//!        └─────────────────────────────────────────────┘
//! ```
//!
//! Entering `Connected` subscribes to `<base>/cmd/+` and to this device's
//! discovery config topics, publishes retained `online` to `<base>/status`,
//! collects retained descriptors from other owners for the settle window,
//! runs a discovery cycle, and refreshes the presence and RSSI state topics.
//! Commands that arrive during the settle window are queued and handled
//! once the run loop resumes.
//!
//! Each inbound command goes through the same pipeline:
//!
//! 1. decode (malformed JSON becomes an empty field map),
//! 2. [`CommandValidator::validate`],
//! 3. the estop motion gate,
//! 4. the device operation via [`BleLink`] or [`LightingController`],
//! 5. one [`Acknowledgment`] on `<base>/ack/<name>`,
//! 6. a best-effort state echo on `<base>/state/<name>` (LED transitions are
//!    held in the [`BusLightSink`] until the ack is out).
//!
//! Commands are processed one at a time by [`Dispatcher::run`], so the estop
//! latch and the lighting controller need no locking.  Messages that arrive
//! while the bus is down are dropped; nothing is queued or replayed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bb8_hal::{BleLink, DriveCommand, LightingController, ResolvedDevice};
use bb8_kernel::{CommandValidator, correlation_id};
use bb8_middleware::{BusEvent, BusMessage, MessageBusClient, Topics};
use bb8_types::{Acknowledgment, BridgeError, CommandName, FieldMap, LightingState, Rgb};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::discovery::{DeviceIdentity, DiscoveryPublisher, DiscoverySession};
use crate::light_sink::BusLightSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Exponential reconnect backoff: `initial`, doubling, capped at `max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl ReconnectPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// The delay before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.checked_mul(2).unwrap_or(self.max).min(self.max);
        delay
    }

    /// Back to `initial` after a successful connect.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// State published after an accepted command's acknowledgment.
#[derive(Debug, Clone, PartialEq)]
enum Echo {
    /// Processed fields, to `<base>/state/<name>`.
    Command(Value),
    /// The estop latch, retained on `<base>/state/estop`.
    Estop(bool),
}

/// Snapshot published on every state change for observers such as the REPL.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeStatus {
    pub connection: ConnectionState,
    pub estop_active: bool,
    pub lighting: LightingState,
    pub device_id: String,
    pub commands_processed: u64,
}

pub struct Dispatcher {
    bus: Arc<dyn MessageBusClient>,
    events: BoxStream<'static, BusEvent>,
    pending: VecDeque<BusMessage>,
    link: Arc<dyn BleLink>,
    topics: Topics,
    validator: CommandValidator,
    lighting: LightingController,
    light_sink: Arc<BusLightSink>,
    discovery: DiscoveryPublisher,
    discovery_topics: Vec<String>,
    discovery_settle: Duration,
    identity: DeviceIdentity,
    scanned_rssi: Option<i16>,
    connection: ConnectionState,
    reconnect: ReconnectPolicy,
    status: watch::Sender<BridgeStatus>,
    processed: u64,
}

impl Dispatcher {
    pub fn new(bus: Arc<dyn MessageBusClient>, link: Arc<dyn BleLink>, config: &BridgeConfig) -> Self {
        let topics = config.topics();
        let sink = Arc::new(BusLightSink::new(Arc::clone(&bus), &topics));
        let lighting = LightingController::new(Arc::clone(&link), Some(sink.clone()));
        let discovery = DiscoveryPublisher::new(
            Arc::clone(&bus),
            topics.clone(),
            config.discovery(),
            DiscoverySession::new(),
        );
        let identity = DeviceIdentity::unresolved();
        let (status, _) = watch::channel(BridgeStatus {
            connection: ConnectionState::Disconnected,
            estop_active: false,
            lighting: LightingState::default(),
            device_id: identity.device_id(),
            commands_processed: 0,
        });
        let discovery_topics = discovery.descriptor_topics(&identity);
        Self {
            events: bus.events(),
            bus,
            pending: VecDeque::new(),
            link,
            topics,
            validator: CommandValidator::new(),
            lighting,
            light_sink: sink,
            discovery,
            discovery_topics,
            discovery_settle: config.discovery_settle(),
            identity,
            scanned_rssi: None,
            connection: ConnectionState::Disconnected,
            reconnect: config.reconnect_policy(),
            status,
            processed: 0,
        }
    }

    /// Bind descriptors and state to a located robot.
    pub fn with_device(mut self, device: &ResolvedDevice) -> Self {
        self.identity = DeviceIdentity::from_device(device);
        self.discovery_topics = self.discovery.descriptor_topics(&self.identity);
        self.scanned_rssi = device.rssi;
        self.publish_status();
        self
    }

    pub fn status(&self) -> watch::Receiver<BridgeStatus> {
        self.status.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn estop_active(&self) -> bool {
        self.validator.estop().is_active()
    }

    pub fn lighting_state(&self) -> LightingState {
        self.lighting.state()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn discovery(&self) -> &DiscoveryPublisher {
        &self.discovery
    }

    fn set_connection(&mut self, state: ConnectionState) {
        if self.connection != state {
            debug!(from = %self.connection, to = %state, "connection state changed");
            self.connection = state;
            self.publish_status();
        }
    }

    fn publish_status(&self) {
        self.status.send_replace(BridgeStatus {
            connection: self.connection,
            estop_active: self.validator.estop().is_active(),
            lighting: self.lighting.state(),
            device_id: self.identity.device_id(),
            commands_processed: self.processed,
        });
    }

    // ── Connection lifecycle ───────────────────────────────────────────────

    /// One connect attempt.  On failure the state falls back to
    /// `Disconnected` and the caller decides when to retry.
    pub async fn connect(&mut self) -> Result<(), BridgeError> {
        self.set_connection(ConnectionState::Connecting);
        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_connection(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(&mut self) -> Result<(), BridgeError> {
        self.discard_stale_events().await;
        self.bus.connect().await?;
        self.bus.subscribe(&self.topics.command_filter()).await?;
        for topic in &self.discovery_topics {
            self.bus.subscribe(topic).await?;
        }
        self.set_connection(ConnectionState::Connected);
        info!(filter = %self.topics.command_filter(), "bus connected; command topics subscribed");

        self.bus.publish(&self.topics.status(), "online", true).await?;
        self.settle_discovery().await?;
        match self.discovery.publish_cycle(&self.identity).await {
            Ok(0) => debug!("discovery already announced"),
            Ok(n) => info!(descriptors = n, "discovery cycle complete"),
            Err(e) => warn!(error = %e, "discovery cycle failed"),
        }
        self.publish_device_state().await;
        Ok(())
    }

    /// Events left over from the previous connection are meaningless once we
    /// reconnect.
    async fn discard_stale_events(&mut self) {
        let mut discarded = self.pending.len();
        self.pending.clear();
        while let Ok(Some(_)) = tokio::time::timeout(Duration::ZERO, self.events.next()).await {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "stale bus events dropped before reconnect");
        }
    }

    /// Collect retained descriptors until the settle window closes.  Commands
    /// seen meanwhile are queued for the run loop.
    async fn settle_discovery(&mut self) -> Result<(), BridgeError> {
        let deadline = Instant::now() + self.discovery_settle;
        loop {
            match tokio::time::timeout_at(deadline, self.events.next()).await {
                Err(_) => return Ok(()),
                Ok(Some(BusEvent::Message(message))) => {
                    if self.discovery_topics.contains(&message.topic) {
                        self.observe_descriptor(&message);
                    } else {
                        self.pending.push_back(message);
                    }
                }
                Ok(Some(BusEvent::Disconnected)) => {
                    return Err(BridgeError::Transport(
                        "connection lost during discovery settle".to_string(),
                    ));
                }
                Ok(None) => {
                    return Err(BridgeError::Transport("bus event stream closed".to_string()));
                }
            }
        }
    }

    fn observe_descriptor(&mut self, message: &BusMessage) {
        if let Some(claim) = self.discovery.observe_descriptor(&message.payload) {
            info!(
                topic = %message.topic,
                owner = %claim.owner_id,
                claimed_at = claim.timestamp,
                "foreign discovery descriptor seen"
            );
        }
    }

    async fn route(&mut self, message: BusMessage) {
        if self.discovery_topics.contains(&message.topic) {
            self.observe_descriptor(&message);
        } else {
            self.handle_message(&message.topic, &message.payload).await;
        }
    }

    /// Presence from the BLE link, RSSI from the link or the last scan.
    async fn publish_device_state(&mut self) {
        let presence = if self.link.is_connected() { "ON" } else { "OFF" };
        self.publish(&self.topics.state("presence"), presence.to_string(), true)
            .await;
        if let Some(rssi) = self.link.rssi().or(self.scanned_rssi) {
            self.publish(&self.topics.state("rssi"), rssi.to_string(), true)
                .await;
        }
    }

    /// Drive the connection state machine and process commands until
    /// `shutdown` flips or its sender is dropped.
    ///
    /// The first connect is immediate.  Every later attempt, whether after a
    /// failed connect or a lost connection, waits for the next backoff delay.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), BridgeError> {
        info!(base = %self.topics.base(), device = %self.identity.device_id(), "dispatcher started");
        let mut first_attempt = true;

        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.connection != ConnectionState::Connected {
                if !first_attempt {
                    let delay = self.reconnect.next_delay();
                    debug!(retry_in_ms = delay.as_millis() as u64, "reconnect scheduled");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                first_attempt = false;
                match self.connect().await {
                    Ok(()) => self.reconnect.reset(),
                    Err(e) => {
                        warn!(error = %e, "bus connect failed");
                        continue;
                    }
                }
            }

            let event = match self.pending.pop_front() {
                Some(message) => Some(BusEvent::Message(message)),
                None => tokio::select! {
                    _ = shutdown.changed() => break,
                    event = self.events.next() => event,
                },
            };
            match event {
                Some(BusEvent::Message(message)) => self.route(message).await,
                Some(BusEvent::Disconnected) => {
                    warn!("bus connection lost; scheduling reconnect");
                    self.set_connection(ConnectionState::Disconnected);
                }
                None => {
                    self.lighting.cancel_active().await;
                    return Err(BridgeError::Transport("bus event stream closed".to_string()));
                }
            }
        }

        self.lighting.cancel_active().await;
        info!("dispatcher stopped");
        Ok(())
    }

    // ── Command pipeline ───────────────────────────────────────────────────

    /// Process one inbound message.  Returns the acknowledgment that was
    /// emitted, or `None` when the message was ignored or dropped.
    pub async fn handle_message(&mut self, topic: &str, payload: &str) -> Option<Acknowledgment> {
        let name = self.topics.command_suffix(topic)?;
        if self.connection != ConnectionState::Connected {
            debug!(topic, "bus not connected; command dropped");
            return None;
        }

        let raw = decode_fields(payload);
        let cid = correlation_id(&raw);
        let outcome = self.validator.validate(name, &raw);
        self.processed += 1;

        self.light_sink.hold();
        let (ack, echo) = match outcome.command {
            Some(command) if outcome.accepted => match self.validator.estop().gate(command) {
                Err(reason) => {
                    warn!(%command, cid = ?cid, "motion command blocked by estop");
                    (Acknowledgment::rejected(cid, reason), None)
                }
                Ok(()) => match self.execute(command, &outcome.fields).await {
                    Ok(echo) => (Acknowledgment::accepted(cid, outcome.message), echo),
                    Err(reason) => (Acknowledgment::rejected(cid, reason), None),
                },
            },
            _ => (
                Acknowledgment::rejected(
                    cid,
                    outcome
                        .message
                        .unwrap_or_else(|| "rejected".to_string()),
                ),
                None,
            ),
        };

        if !ack.ok
            && let Some(reason) = &ack.reason
        {
            info!(command = name, reason = %reason, "command rejected");
        }
        self.emit_ack(name, &ack).await;
        match echo {
            Some(Echo::Command(fields)) => {
                self.publish(&self.topics.state(name), fields.to_string(), false)
                    .await;
            }
            Some(Echo::Estop(active)) => {
                self.publish(&self.topics.state("estop"), estop_echo(active), true)
                    .await;
            }
            None => {}
        }
        self.light_sink.release().await;
        self.publish_status();
        Some(ack)
    }

    /// Perform the device side of an accepted command.  Returns the state
    /// echo, if the command has one, or a rejection reason.
    async fn execute(&mut self, command: CommandName, fields: &FieldMap) -> Result<Option<Echo>, String> {
        match command {
            CommandName::Drive => {
                let drive = DriveCommand {
                    speed: u8::try_from(int_field(fields, "speed")).unwrap_or(u8::MAX),
                    heading: u16::try_from(int_field(fields, "heading")).unwrap_or(0),
                    duration_ms: fields
                        .get("ms")
                        .and_then(Value::as_i64)
                        .and_then(|ms| u16::try_from(ms).ok()),
                };
                self.link.drive(drive).await.map_err(device_error)?;
                Ok(Some(Echo::Command(device_echo(fields))))
            }
            CommandName::Stop => {
                self.link.stop().await.map_err(device_error)?;
                Ok(Some(Echo::Command(device_echo(fields))))
            }
            CommandName::Sleep => {
                self.link.sleep().await.map_err(device_error)?;
                Ok(Some(Echo::Command(device_echo(fields))))
            }
            CommandName::Power => {
                let result = match fields.get("action").and_then(Value::as_str) {
                    Some("wake") => self.link.wake().await,
                    _ => self.link.sleep().await,
                };
                result.map_err(device_error)?;
                Ok(Some(Echo::Command(device_echo(fields))))
            }
            CommandName::Led => {
                let rgb = Rgb::new(
                    channel(fields, "r"),
                    channel(fields, "g"),
                    channel(fields, "b"),
                );
                // The held lighting sink publishes the LED echo after the ack.
                self.lighting.set_static(rgb).await;
                Ok(None)
            }
            CommandName::Preset => {
                let name = fields.get("name").and_then(Value::as_str).unwrap_or_default();
                if !self.lighting.run_preset(name).await {
                    return Err(format!("unknown preset '{name}'"));
                }
                Ok(None)
            }
            CommandName::Estop => {
                if let Err(e) = self.link.stop().await {
                    warn!(error = %e, "estop: motor stop not delivered");
                }
                self.lighting.cancel_active().await;
                Ok(Some(Echo::Estop(true)))
            }
            CommandName::ClearEstop => Ok(Some(Echo::Estop(false))),
        }
    }

    async fn emit_ack(&mut self, name: &str, ack: &Acknowledgment) {
        if let Some(payload) = encode(ack) {
            self.publish(&self.topics.ack(name), payload, false).await;
        }
    }

    /// Publish without retry.  A transport failure marks the connection down
    /// so the run loop reconnects.
    async fn publish(&mut self, topic: &str, payload: String, retain: bool) {
        match self.bus.publish(topic, &payload, retain).await {
            Ok(()) => {}
            Err(e @ (BridgeError::NotConnected | BridgeError::Transport(_))) => {
                warn!(error = %e, topic, "publish failed; connection marked down");
                self.set_connection(ConnectionState::Disconnected);
            }
            Err(e) => warn!(error = %e, topic, "publish failed"),
        }
    }
}

fn decode_fields(payload: &str) -> FieldMap {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(fields)) => fields,
        Ok(other) => {
            debug!(kind = json_kind(&other), "command payload is not an object; using empty map");
            FieldMap::new()
        }
        Err(e) => {
            debug!(error = %e, "malformed command payload; using empty map");
            FieldMap::new()
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn encode<T: Serialize>(value: &T) -> Option<String> {
    serde_json::to_string(value)
        .map_err(|e| warn!(error = %e, "failed to encode payload"))
        .ok()
}

fn int_field(fields: &FieldMap, name: &str) -> i64 {
    fields.get(name).and_then(Value::as_i64).unwrap_or(0)
}

fn channel(fields: &FieldMap, name: &str) -> u8 {
    u8::try_from(int_field(fields, name).clamp(0, 255)).unwrap_or(0)
}

fn device_error(e: BridgeError) -> String {
    format!("device error: {e}")
}

/// Processed fields minus the correlation id, tagged as device-originated.
fn device_echo(fields: &FieldMap) -> Value {
    let mut echo: FieldMap = fields
        .iter()
        .filter(|(k, _)| k.as_str() != "cid")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    echo.insert("source".to_string(), Value::from("device"));
    Value::Object(echo)
}

fn estop_echo(active: bool) -> String {
    json!({"active": active, "source": "device"}).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bb8_hal::{LinkCall, SimBleLink};
    use bb8_kernel::MOTION_BLOCKED;
    use bb8_middleware::InMemoryBus;
    use bb8_types::LightingMode;

    struct Harness {
        bus: InMemoryBus,
        link: Arc<SimBleLink>,
        dispatcher: Dispatcher,
    }

    const PRESENCE_CONFIG: &str = "homeassistant/binary_sensor/bb8_EDED6201A1B2_presence/config";
    const LIGHT_CONFIG: &str = "homeassistant/light/bb8_EDED6201A1B2_light/config";

    fn fast_config() -> BridgeConfig {
        BridgeConfig {
            reconnect_initial_ms: 5,
            reconnect_max_ms: 20,
            discovery_settle_ms: 0,
            ..BridgeConfig::default()
        }
    }

    fn device() -> ResolvedDevice {
        ResolvedDevice {
            mac: "ED:ED:62:01:A1:B2".to_string(),
            name: "BB-A1B2".to_string(),
            rssi: Some(-61),
            from_cache: false,
        }
    }

    async fn connected() -> Harness {
        let bus = InMemoryBus::default();
        let link = Arc::new(SimBleLink::connected());
        let mut dispatcher =
            Dispatcher::new(Arc::new(bus.clone()), link.clone(), &fast_config()).with_device(&device());
        dispatcher.connect().await.expect("connect");
        Harness {
            bus,
            link,
            dispatcher,
        }
    }

    fn payload(bus: &InMemoryBus, topic: &str) -> Value {
        let sent = bus.published_to(topic);
        let last = sent.last().unwrap_or_else(|| panic!("nothing published to {topic}"));
        serde_json::from_str(&last.payload).unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn backoff_doubles_caps_and_resets() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(100), Duration::from_millis(350));
        let delays: Vec<u64> = (0..5).map(|_| policy.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 350, 350, 350]);
        policy.reset();
        assert_eq!(policy.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn malformed_payloads_decode_to_empty_maps() {
        assert!(decode_fields("{not json").is_empty());
        assert!(decode_fields("[1,2,3]").is_empty());
        assert!(decode_fields("").is_empty());
        assert_eq!(decode_fields(r#"{"r":1}"#).len(), 1);
    }

    #[tokio::test]
    async fn connect_announces_everything() {
        let h = connected().await;
        assert_eq!(h.dispatcher.connection_state(), ConnectionState::Connected);
        assert_eq!(
            h.bus.subscriptions(),
            vec![
                "bb8/cmd/+".to_string(),
                PRESENCE_CONFIG.to_string(),
                "homeassistant/sensor/bb8_EDED6201A1B2_rssi/config".to_string(),
                LIGHT_CONFIG.to_string(),
            ]
        );
        assert_eq!(h.bus.retained("bb8/status").as_deref(), Some("online"));
        assert_eq!(h.bus.retained("bb8/state/presence").as_deref(), Some("ON"));
        assert_eq!(h.bus.retained("bb8/state/rssi").as_deref(), Some("-58"));
        assert!(h.bus.retained(PRESENCE_CONFIG).is_some());
        assert_eq!(h.dispatcher.discovery().session().announced_count(), 3);
    }

    #[tokio::test]
    async fn newer_retained_foreign_descriptor_blocks_discovery() {
        let bus = InMemoryBus::default();
        bus.connect().await.unwrap();
        let claim = json!({
            "name": "Presence",
            "origin": {"name": "other-bridge", "claimed_at": chrono::Utc::now().timestamp() + 3600},
        });
        bus.publish(PRESENCE_CONFIG, &claim.to_string(), true).await.unwrap();

        let mut dispatcher =
            Dispatcher::new(Arc::new(bus.clone()), Arc::new(SimBleLink::connected()), &fast_config())
                .with_device(&device());
        dispatcher.connect().await.expect("connect");

        assert!(!dispatcher.discovery().owns_discovery());
        assert_eq!(dispatcher.discovery().session().announced_count(), 0);
        assert_eq!(bus.published_to(PRESENCE_CONFIG).len(), 1, "only the foreign descriptor");
        assert!(bus.retained(LIGHT_CONFIG).is_none());
        assert_eq!(bus.retained("bb8/status").as_deref(), Some("online"));

        let ack = dispatcher.handle_message("bb8/cmd/stop", "{}").await.unwrap();
        assert!(ack.ok, "commands still flow without discovery ownership");
    }

    #[tokio::test]
    async fn own_retained_descriptors_do_not_block_discovery() {
        let bus = InMemoryBus::default();
        let mut first = Dispatcher::new(Arc::new(bus.clone()), Arc::new(SimBleLink::connected()), &fast_config())
            .with_device(&device());
        first.connect().await.expect("connect");
        assert!(bus.retained(PRESENCE_CONFIG).is_some());

        // A restarted bridge sees its previous retained descriptors.
        let mut second = Dispatcher::new(Arc::new(bus.clone()), Arc::new(SimBleLink::connected()), &fast_config())
            .with_device(&device());
        second.connect().await.expect("connect");
        assert!(second.discovery().owns_discovery());
        assert_eq!(second.discovery().session().announced_count(), 3);
        assert_eq!(bus.published_to(PRESENCE_CONFIG).len(), 2);
    }

    #[tokio::test]
    async fn light_entity_off_payload_turns_the_led_off() {
        let mut h = connected().await;
        h.dispatcher.handle_message("bb8/cmd/led", r#"{"r":40,"g":50,"b":60}"#).await;

        let light = h
            .dispatcher
            .discovery()
            .light_descriptor(h.dispatcher.identity())
            .expect("light enabled");
        let command_topic = light.payload["command_topic"].as_str().unwrap().to_string();
        let payload_off = light.payload["payload_off"].as_str().unwrap().to_string();
        let payload_on = light.payload["payload_on"].as_str().unwrap().to_string();
        h.link.clear_calls();

        let ack = h.dispatcher.handle_message(&command_topic, &payload_off).await.unwrap();
        assert!(ack.ok);
        assert_eq!(payload(&h.bus, "bb8/state/led")["mode"], "off");
        assert_eq!(h.link.calls(), vec![LinkCall::SetLed(Rgb::BLACK)]);

        let ack = h.dispatcher.handle_message(&command_topic, &payload_on).await.unwrap();
        assert!(ack.ok);
        assert_ne!(payload(&h.bus, "bb8/state/led")["mode"], "off");
        assert!(!h.link.calls().contains(&LinkCall::Sleep), "the light entity never sleeps the robot");
    }

    #[tokio::test]
    async fn led_ack_precedes_state_echo() {
        let mut h = connected().await;
        let before = h.bus.published().len();
        h.dispatcher.handle_message("bb8/cmd/led", r#"{"r":1,"g":2,"b":3}"#).await;
        h.dispatcher.handle_message("bb8/cmd/preset", r#"{"name":"police"}"#).await;

        let topics: Vec<String> = h.bus.published()[before..]
            .iter()
            .map(|m| m.topic.clone())
            .collect();
        assert_eq!(
            topics,
            vec![
                "bb8/ack/led".to_string(),
                "bb8/state/led".to_string(),
                "bb8/ack/preset".to_string(),
                "bb8/state/led".to_string(),
            ]
        );
        assert_eq!(payload(&h.bus, "bb8/state/led")["mode"], "police");

        let before = h.bus.published().len();
        h.dispatcher.handle_message("bb8/cmd/estop", "{}").await;
        let topics: Vec<String> = h.bus.published()[before..]
            .iter()
            .map(|m| m.topic.clone())
            .collect();
        assert_eq!(
            topics,
            vec![
                "bb8/ack/estop".to_string(),
                "bb8/state/estop".to_string(),
                "bb8/state/led".to_string(),
            ]
        );
        assert!(h.bus.published_to("bb8/state/estop")[0].retain);
    }

    #[tokio::test]
    async fn drive_is_clamped_forwarded_and_acknowledged() {
        let mut h = connected().await;
        let ack = h
            .dispatcher
            .handle_message("bb8/cmd/drive", r#"{"speed":300,"heading":400,"ms":10000,"cid":"d-1"}"#)
            .await
            .expect("ack");
        assert!(ack.ok);
        assert_eq!(ack.cid.as_deref(), Some("d-1"));
        assert!(ack.reason.unwrap().contains("clamped"));

        assert_eq!(
            h.link.calls(),
            vec![LinkCall::Drive(DriveCommand {
                speed: 255,
                heading: 40,
                duration_ms: Some(5000)
            })]
        );

        let ack_json = payload(&h.bus, "bb8/ack/drive");
        assert_eq!(ack_json["ok"], true);
        assert_eq!(ack_json["cid"], "d-1");

        let echo = payload(&h.bus, "bb8/state/drive");
        assert_eq!(echo["speed"], 255);
        assert_eq!(echo["source"], "device");
        assert!(echo.get("cid").is_none());
    }

    #[tokio::test]
    async fn estop_gates_motion_but_not_lighting() {
        let mut h = connected().await;
        h.dispatcher.handle_message("bb8/cmd/preset", r#"{"name":"rainbow"}"#).await;

        let ack = h.dispatcher.handle_message("bb8/cmd/estop", r#"{"cid":"e1"}"#).await.unwrap();
        assert!(ack.ok);
        assert!(h.dispatcher.estop_active());
        assert!(h.link.calls().contains(&LinkCall::Stop));
        assert_eq!(h.dispatcher.lighting_state().mode, LightingMode::Static);
        assert_eq!(payload(&h.bus, "bb8/state/estop")["active"], true);

        h.link.clear_calls();
        let ack = h
            .dispatcher
            .handle_message("bb8/cmd/drive", r#"{"speed":10,"heading":0,"cid":"d2"}"#)
            .await
            .unwrap();
        assert!(!ack.ok);
        assert_eq!(ack.reason.as_deref(), Some(MOTION_BLOCKED));
        assert_eq!(ack.cid.as_deref(), Some("d2"));
        assert!(h.link.calls().is_empty(), "blocked drive must not touch hardware");

        let ack = h.dispatcher.handle_message("bb8/cmd/led", r#"{"r":1,"g":2,"b":3}"#).await.unwrap();
        assert!(ack.ok);
        assert_eq!(h.link.led_writes(), vec![Rgb::new(1, 2, 3)]);

        let ack = h.dispatcher.handle_message("bb8/cmd/clear_estop", "{}").await.unwrap();
        assert!(ack.ok);
        assert_eq!(payload(&h.bus, "bb8/state/estop")["active"], false);
        let ack = h
            .dispatcher
            .handle_message("bb8/cmd/drive", r#"{"speed":10,"heading":0}"#)
            .await
            .unwrap();
        assert!(ack.ok);
    }

    #[tokio::test]
    async fn clear_estop_while_inactive_is_nacked() {
        let mut h = connected().await;
        let ack = h.dispatcher.handle_message("bb8/cmd/clear_estop", "{}").await.unwrap();
        assert!(!ack.ok);
        assert!(ack.reason.unwrap().contains("not active"));
        assert_eq!(payload(&h.bus, "bb8/ack/clear_estop")["ok"], false);
    }

    #[tokio::test]
    async fn malformed_json_is_an_empty_map() {
        let mut h = connected().await;
        let ack = h.dispatcher.handle_message("bb8/cmd/drive", "{\"speed\": 4").await.unwrap();
        assert!(!ack.ok);
        assert!(ack.reason.unwrap().contains("missing required field"));

        let ack = h.dispatcher.handle_message("bb8/cmd/led", "garbage").await.unwrap();
        assert!(ack.ok);
        assert_eq!(h.link.led_writes(), vec![Rgb::BLACK]);
    }

    #[tokio::test]
    async fn unknown_topics_are_ignored_and_unknown_commands_nacked() {
        let mut h = connected().await;
        let before = h.bus.published().len();
        assert!(h.dispatcher.handle_message("bb8/telemetry", "{}").await.is_none());
        assert!(h.dispatcher.handle_message("bb8/cmd/led/extra", "{}").await.is_none());
        assert!(h.dispatcher.handle_message("other/cmd/led", "{}").await.is_none());
        assert_eq!(h.bus.published().len(), before);

        let ack = h.dispatcher.handle_message("bb8/cmd/dance", "{}").await.unwrap();
        assert!(!ack.ok);
        assert!(ack.reason.unwrap().contains("unsupported command"));
        assert_eq!(h.bus.published_to("bb8/ack/dance").len(), 1);
    }

    #[tokio::test]
    async fn unknown_preset_is_nacked_without_hardware() {
        let mut h = connected().await;
        let ack = h.dispatcher.handle_message("bb8/cmd/preset", r#"{"name":"disco"}"#).await.unwrap();
        assert!(!ack.ok);
        assert_eq!(ack.reason.as_deref(), Some("unknown preset 'disco'"));
        assert!(h.link.calls().is_empty());
    }

    #[tokio::test]
    async fn power_maps_to_wake_and_sleep() {
        let mut h = connected().await;
        h.dispatcher.handle_message("bb8/cmd/power", r#"{"action":"wake"}"#).await;
        h.dispatcher.handle_message("bb8/cmd/power", r#"{"action":"sleep"}"#).await;
        assert_eq!(h.link.calls(), vec![LinkCall::Wake, LinkCall::Sleep]);
        assert_eq!(payload(&h.bus, "bb8/state/power")["action"], "sleep");
    }

    #[tokio::test]
    async fn ble_failure_is_a_nack_not_a_crash() {
        let mut h = connected().await;
        h.link.set_connected(false);
        let ack = h
            .dispatcher
            .handle_message("bb8/cmd/drive", r#"{"speed":1,"heading":1}"#)
            .await
            .unwrap();
        assert!(!ack.ok);
        assert!(ack.reason.unwrap().starts_with("device error"));

        // LED stays available and keeps state while the link is down.
        let ack = h.dispatcher.handle_message("bb8/cmd/led", r#"{"r":9}"#).await.unwrap();
        assert!(ack.ok);
        assert_eq!(h.dispatcher.lighting_state().rgb, Rgb::new(9, 0, 0));
    }

    #[tokio::test]
    async fn commands_while_disconnected_are_dropped() {
        let mut h = connected().await;
        h.bus.drop_connection();
        // Publishing the ack fails, which marks the connection down.
        h.dispatcher.handle_message("bb8/cmd/stop", "{}").await;
        assert_eq!(h.dispatcher.connection_state(), ConnectionState::Disconnected);

        h.link.clear_calls();
        assert!(h.dispatcher.handle_message("bb8/cmd/stop", "{}").await.is_none());
        assert!(h.link.calls().is_empty());
    }

    #[tokio::test]
    async fn lost_connection_waits_for_backoff_before_reconnecting() {
        let bus = InMemoryBus::default();
        let config = BridgeConfig {
            reconnect_initial_ms: 200,
            reconnect_max_ms: 400,
            ..fast_config()
        };
        let dispatcher = Dispatcher::new(Arc::new(bus.clone()), Arc::new(SimBleLink::connected()), &config);
        let status = dispatcher.status();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(dispatcher.run(shutdown_rx));

        wait_until(|| status.borrow().connection == ConnectionState::Connected).await;
        assert_eq!(bus.connect_attempts(), 1, "the first connect is immediate");

        let dropped_at = tokio::time::Instant::now();
        bus.drop_connection();
        wait_until(|| status.borrow().connection == ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.connect_attempts(), 1, "no reconnect before the backoff delay");

        wait_until(|| status.borrow().connection == ConnectionState::Connected).await;
        assert_eq!(bus.connect_attempts(), 2);
        assert!(dropped_at.elapsed() >= Duration::from_millis(200));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("dispatcher exits on shutdown")
            .expect("task not panicked")
            .expect("clean shutdown");
    }

    #[tokio::test]
    async fn run_loop_reconnects_with_backoff_and_resubscribes() {
        let bus = InMemoryBus::default();
        bus.refuse_next_connects(2);
        let link = Arc::new(SimBleLink::connected());
        let dispatcher = Dispatcher::new(Arc::new(bus.clone()), link.clone(), &fast_config());
        let status = dispatcher.status();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(dispatcher.run(shutdown_rx));

        wait_until(|| bus.is_connected() && !bus.subscriptions().is_empty()).await;
        assert_eq!(bus.connect_attempts(), 3);
        assert_eq!(status.borrow().connection, ConnectionState::Connected);

        bus.deliver("bb8/cmd/led", r#"{"r":10,"g":20,"b":30}"#);
        wait_until(|| !bus.published_to("bb8/ack/led").is_empty()).await;

        bus.drop_connection();
        assert!(!bus.deliver("bb8/cmd/stop", "{}"), "nothing is delivered while down");
        wait_until(|| bus.is_connected() && !bus.subscriptions().is_empty()).await;
        assert_eq!(bus.connect_attempts(), 4);

        bus.deliver("bb8/cmd/stop", "{}");
        wait_until(|| !bus.published_to("bb8/ack/stop").is_empty()).await;
        assert_eq!(link.calls().iter().filter(|c| **c == LinkCall::Stop).count(), 1);

        // Discovery is announced once per boot, not once per connection.
        let presence = "homeassistant/binary_sensor/bb8_sphero_presence/config";
        assert_eq!(bus.published_to(presence).len(), 1);

        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("dispatcher exits on shutdown")
            .expect("task not panicked");
        assert!(result.is_ok());
    }
}
