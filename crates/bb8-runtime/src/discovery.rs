//! Discovery Publisher – self-describing entity descriptors for the
//! home-automation platform.
//!
//! Three entities describe one robot:
//!
//! | Entity | Component | State topic |
//! |---|---|---|
//! | presence | `binary_sensor` (connectivity) | `<base>/state/presence` |
//! | signal strength | `sensor` (dBm) | `<base>/state/rssi` |
//! | light (optional) | `light` | `<base>/state/led` |
//!
//! Every descriptor embeds the same [`DeviceBlock`], serialised from one
//! value, so the platform groups the entities under a single device.
//!
//! Which descriptors have already been announced lives in a
//! [`DiscoverySession`] owned by the publisher.  A fresh session means a fresh
//! boot: each descriptor is published (retained) once per session, and
//! repeating a publish cycle is a no-op.
//!
//! Each descriptor's `origin` carries the publisher's owner id and
//! `claimed_at` (session start, epoch seconds).  Retained descriptors from
//! other owners are fed back through [`DiscoveryPublisher::observe_descriptor`]
//! and [`select_owner`] decides who may publish.

use std::collections::HashSet;
use std::sync::Arc;

use bb8_hal::{Preset, ResolvedDevice};
use bb8_middleware::{MessageBusClient, Topics};
use bb8_types::{BridgeError, OwnerCandidate, mac_token};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifier used when no device address is known.
pub const FALLBACK_DEVICE_ID: &str = "bb8_sphero";

/// Settings that shape descriptors.  Built from
/// [`BridgeConfig::discovery`](crate::config::BridgeConfig::discovery).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub owner_id: String,
    pub enable_light: bool,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
    pub suggested_area: String,
}

/// The physical robot the descriptors are bound to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub mac: Option<String>,
    pub name: Option<String>,
}

impl DeviceIdentity {
    pub fn unresolved() -> Self {
        Self::default()
    }

    pub fn from_device(device: &ResolvedDevice) -> Self {
        Self {
            mac: Some(device.mac.to_uppercase()),
            name: Some(device.name.clone()).filter(|n| !n.is_empty()),
        }
    }

    /// `bb8_<MAC without delimiters>`, or [`FALLBACK_DEVICE_ID`].
    pub fn device_id(&self) -> String {
        match &self.mac {
            Some(mac) if !mac_token(mac).is_empty() => format!("bb8_{}", mac_token(mac)),
            _ => FALLBACK_DEVICE_ID.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceBlock {
    pub identifiers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<[String; 2]>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
    pub suggested_area: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryDescriptor {
    pub component: &'static str,
    pub object_id: String,
    pub topic: String,
    pub payload: Value,
}

/// Announcement bookkeeping for one process lifetime.
#[derive(Debug, Clone)]
pub struct DiscoverySession {
    boot_id: Uuid,
    started_at: DateTime<Utc>,
    announced: HashSet<String>,
    observed: Vec<OwnerCandidate>,
}

impl DiscoverySession {
    pub fn new() -> Self {
        Self {
            boot_id: Uuid::new_v4(),
            started_at: Utc::now(),
            announced: HashSet::new(),
            observed: Vec::new(),
        }
    }

    pub fn boot_id(&self) -> Uuid {
        self.boot_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_announced(&self, topic: &str) -> bool {
        self.announced.contains(topic)
    }

    pub fn announced_count(&self) -> usize {
        self.announced.len()
    }

    /// Start over as if the process had just booted.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for DiscoverySession {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick the single authoritative publisher among `candidates`.
///
/// The latest timestamp wins; equal timestamps go to the lexicographically
/// smallest owner id.  The result does not depend on input order, and within
/// one owner the newest entry is always the one returned.
pub fn select_owner(candidates: &[OwnerCandidate]) -> Option<&OwnerCandidate> {
    candidates.iter().max_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| b.owner_id.cmp(&a.owner_id))
    })
}

pub struct DiscoveryPublisher {
    bus: Arc<dyn MessageBusClient>,
    topics: Topics,
    config: DiscoveryConfig,
    session: DiscoverySession,
}

impl DiscoveryPublisher {
    pub fn new(
        bus: Arc<dyn MessageBusClient>,
        topics: Topics,
        config: DiscoveryConfig,
        session: DiscoverySession,
    ) -> Self {
        Self {
            bus,
            topics,
            config,
            session,
        }
    }

    pub fn session(&self) -> &DiscoverySession {
        &self.session
    }

    pub fn reset_session(&mut self) {
        self.session.reset();
    }

    /// Record another publisher claiming the same entities.
    pub fn observe_owner(&mut self, candidate: OwnerCandidate) {
        if self.session.observed.contains(&candidate) {
            return;
        }
        debug!(owner = %candidate.owner_id, ts = candidate.timestamp, "discovery owner observed");
        self.session.observed.push(candidate);
    }

    /// Read the owner claim out of a retained descriptor payload and record
    /// it when it belongs to someone else.
    ///
    /// Empty payloads (cleared descriptors) and our own claims are ignored.  A
    /// foreign descriptor without `claimed_at` counts as the oldest possible
    /// claim.
    pub fn observe_descriptor(&mut self, payload: &str) -> Option<OwnerCandidate> {
        if payload.trim().is_empty() {
            return None;
        }
        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "unparsable discovery descriptor ignored");
                return None;
            }
        };
        let origin = value.get("origin")?;
        let owner = origin.get("name").and_then(Value::as_str)?;
        if owner == self.config.owner_id {
            return None;
        }
        let claimed_at = origin.get("claimed_at").and_then(Value::as_i64).unwrap_or(0);
        let candidate = OwnerCandidate::new(owner, claimed_at);
        self.observe_owner(candidate.clone());
        Some(candidate)
    }

    /// This publisher's own claim: its owner id stamped with the session start.
    pub fn own_candidate(&self) -> OwnerCandidate {
        OwnerCandidate::new(self.config.owner_id.clone(), self.session.started_at.timestamp())
    }

    /// `true` when this publisher currently wins ownership.
    pub fn owns_discovery(&self) -> bool {
        let mut candidates = self.session.observed.clone();
        candidates.push(self.own_candidate());
        select_owner(&candidates).is_some_and(|w| w.owner_id == self.config.owner_id)
    }

    pub fn device_block(&self, identity: &DeviceIdentity) -> DeviceBlock {
        DeviceBlock {
            identifiers: vec![identity.device_id()],
            connections: identity
                .mac
                .iter()
                .map(|mac| ["mac".to_string(), mac.clone()])
                .collect(),
            name: identity
                .name
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            manufacturer: self.config.manufacturer.clone(),
            model: self.config.model.clone(),
            sw_version: self.config.sw_version.clone(),
            suggested_area: self.config.suggested_area.clone(),
        }
    }

    fn common_fields(&self, identity: &DeviceIdentity, entity: &str, label: &str) -> (String, Value) {
        let object_id = format!("{}_{entity}", identity.device_id());
        let payload = json!({
            "name": label,
            "unique_id": object_id,
            "object_id": object_id,
            "availability_topic": self.topics.status(),
            "payload_available": "online",
            "payload_not_available": "offline",
            "device": self.device_block(identity),
            "origin": {
                "name": self.config.owner_id,
                "sw": self.config.sw_version,
                "claimed_at": self.session.started_at.timestamp(),
            },
        });
        (object_id, payload)
    }

    fn descriptor(&self, component: &'static str, object_id: String, mut payload: Value, extra: Value) -> DiscoveryDescriptor {
        if let (Some(base), Value::Object(extra)) = (payload.as_object_mut(), extra) {
            base.extend(extra);
        }
        DiscoveryDescriptor {
            component,
            topic: self.topics.discovery_config(component, &object_id),
            object_id,
            payload,
        }
    }

    pub fn presence_descriptor(&self, identity: &DeviceIdentity) -> DiscoveryDescriptor {
        let (object_id, payload) = self.common_fields(identity, "presence", "Presence");
        self.descriptor(
            "binary_sensor",
            object_id,
            payload,
            json!({
                "device_class": "connectivity",
                "state_topic": self.topics.state("presence"),
                "payload_on": "ON",
                "payload_off": "OFF",
            }),
        )
    }

    pub fn rssi_descriptor(&self, identity: &DeviceIdentity) -> DiscoveryDescriptor {
        let (object_id, payload) = self.common_fields(identity, "rssi", "Signal Strength");
        self.descriptor(
            "sensor",
            object_id,
            payload,
            json!({
                "device_class": "signal_strength",
                "state_class": "measurement",
                "unit_of_measurement": "dBm",
                "state_topic": self.topics.state("rssi"),
                "entity_category": "diagnostic",
            }),
        )
    }

    /// `None` when light discovery is disabled.
    pub fn light_descriptor(&self, identity: &DeviceIdentity) -> Option<DiscoveryDescriptor> {
        if !self.config.enable_light {
            return None;
        }
        let (object_id, payload) = self.common_fields(identity, "light", "LED");
        let effects: Vec<&str> = Preset::ALL.iter().map(Preset::name).collect();
        Some(self.descriptor(
            "light",
            object_id,
            payload,
            json!({
                "command_topic": self.topics.command(bb8_types::CommandName::Preset),
                "payload_on": "{\"name\":\"white\"}",
                "payload_off": "{\"name\":\"off\"}",
                "on_command_type": "first",
                "state_topic": self.topics.state("led"),
                "state_value_template": "{{ 'OFF' if value_json.mode == 'off' else 'ON' }}",
                "rgb_command_topic": self.topics.command(bb8_types::CommandName::Led),
                "rgb_command_template": "{\"r\": {{ red }}, \"g\": {{ green }}, \"b\": {{ blue }}}",
                "rgb_state_topic": self.topics.state("led"),
                "rgb_value_template": "{{ value_json.r }},{{ value_json.g }},{{ value_json.b }}",
                "effect_command_topic": self.topics.command(bb8_types::CommandName::Preset),
                "effect_command_template": "{\"name\": \"{{ value }}\"}",
                "effect_state_topic": self.topics.state("led"),
                "effect_value_template": "{{ value_json.mode }}",
                "effect_list": effects,
            }),
        ))
    }

    /// Config topics of every enabled descriptor for `identity`.
    pub fn descriptor_topics(&self, identity: &DeviceIdentity) -> Vec<String> {
        self.descriptors(identity).into_iter().map(|d| d.topic).collect()
    }

    /// Every enabled descriptor for `identity`, presence first.
    pub fn descriptors(&self, identity: &DeviceIdentity) -> Vec<DiscoveryDescriptor> {
        let mut out = vec![
            self.presence_descriptor(identity),
            self.rssi_descriptor(identity),
        ];
        out.extend(self.light_descriptor(identity));
        out
    }

    /// Publish every descriptor not yet announced this session.
    ///
    /// Returns how many were published.  Skips everything when another owner
    /// currently wins.  A publish failure stops the cycle; descriptors already
    /// sent stay marked and the rest are retried on the next cycle.
    pub async fn publish_cycle(&mut self, identity: &DeviceIdentity) -> Result<usize, BridgeError> {
        if !self.owns_discovery() {
            warn!(owner = %self.config.owner_id, "another discovery owner is newer; not publishing");
            return Ok(0);
        }

        let mut published = 0;
        for descriptor in self.descriptors(identity) {
            if self.session.is_announced(&descriptor.topic) {
                continue;
            }
            let payload = serde_json::to_string(&descriptor.payload)
                .map_err(|e| BridgeError::Serialization(e.to_string()))?;
            self.bus.publish(&descriptor.topic, &payload, true).await?;
            info!(topic = %descriptor.topic, component = descriptor.component, "discovery published");
            self.session.announced.insert(descriptor.topic);
            published += 1;
        }
        Ok(published)
    }
}
