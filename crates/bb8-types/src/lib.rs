use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw JSON object carried by an inbound command.
pub type FieldMap = serde_json::Map<String, serde_json::Value>;

/// The fixed vocabulary of commands the bridge accepts on `<base>/cmd/<name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandName {
    Drive,
    Stop,
    Sleep,
    Power,
    Led,
    Preset,
    Estop,
    ClearEstop,
}

impl CommandName {
    /// Every command, in topic-subscription order.
    pub const ALL: [CommandName; 8] = [
        CommandName::Drive,
        CommandName::Stop,
        CommandName::Sleep,
        CommandName::Power,
        CommandName::Led,
        CommandName::Preset,
        CommandName::Estop,
        CommandName::ClearEstop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::Drive => "drive",
            CommandName::Stop => "stop",
            CommandName::Sleep => "sleep",
            CommandName::Power => "power",
            CommandName::Led => "led",
            CommandName::Preset => "preset",
            CommandName::Estop => "estop",
            CommandName::ClearEstop => "clear_estop",
        }
    }

    /// Commands that physically move the robot and are blocked while the
    /// emergency stop is latched.
    pub fn is_motion(&self) -> bool {
        matches!(self, CommandName::Drive)
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandName {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandName::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| BridgeError::Serialization(format!("unsupported command '{s}'")))
    }
}

/// Reply published on `<base>/ack/<name>` for every processed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Acknowledgment {
    /// Positive acknowledgment. `note` carries any non-fatal coercion message.
    pub fn accepted(cid: Option<String>, note: Option<String>) -> Self {
        Self {
            ok: true,
            cid,
            reason: note,
            timestamp: Utc::now(),
        }
    }

    pub fn rejected(cid: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            cid,
            reason: Some(reason.into()),
            timestamp: Utc::now(),
        }
    }
}

/// An 8-bit-per-channel LED colour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Scale every channel by `level / 255`.
    pub fn dimmed(self, level: u8) -> Self {
        let scale = |c: u8| ((c as u16 * level as u16) / 255) as u8;
        Self::new(scale(self.r), scale(self.g), scale(self.b))
    }
}

/// What the LED is currently doing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "preset", rename_all = "snake_case")]
pub enum LightingMode {
    #[default]
    Off,
    Static,
    Preset(String),
}

impl LightingMode {
    pub fn label(&self) -> &str {
        match self {
            LightingMode::Off => "off",
            LightingMode::Static => "static",
            LightingMode::Preset(name) => name,
        }
    }
}

/// Snapshot of the lighting controller's view of the LED.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LightingState {
    pub mode: LightingMode,
    pub rgb: Rgb,
}

/// The persisted last-known device address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAddress {
    pub mac: String,
    pub advertised_name: String,
    pub last_seen_epoch: i64,
}

/// One observed discovery publisher competing for ownership of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerCandidate {
    pub owner_id: String,
    pub timestamp: i64,
}

impl OwnerCandidate {
    pub fn new(owner_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            owner_id: owner_id.into(),
            timestamp,
        }
    }
}

/// Strict `AA:BB:CC:DD:EE:FF` check: six colon-separated hex pairs.
pub fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Uppercase, delimiter-free form used to derive stable identifiers.
pub fn mac_token(mac: &str) -> String {
    mac.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

/// Errors surfaced across the bridge crates.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgeError {
    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Transport not connected")]
    NotConnected,

    #[error("BLE Fault during {operation}: {details}")]
    Ble { operation: String, details: String },

    #[error("Scan Error: {0}")]
    Scan(String),

    #[error("Device Not Found: {0}")]
    DeviceNotFound(String),

    #[error("Address Cache Error: {0}")]
    Cache(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}
