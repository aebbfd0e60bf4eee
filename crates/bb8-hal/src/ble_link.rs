//! The BLE Link capability.
//!
//! Packet framing and GATT plumbing live behind this trait.  The rest of the
//! bridge only issues the handful of high-level operations below, so a real
//! radio driver and [`SimBleLink`][crate::sim::SimBleLink] are
//! interchangeable.

use async_trait::async_trait;
use bb8_types::{BridgeError, Rgb};

/// A validated roll command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveCommand {
    /// 0–255.
    pub speed: u8,
    /// Degrees, already normalised to 0–359.
    pub heading: u16,
    /// How long to roll, 0–5000 ms.  `None` lets the device decide.
    pub duration_ms: Option<u16>,
}

/// The short-range wireless link to the robot.
///
/// Every operation returns [`BridgeError::NotConnected`] when the link is
/// down and [`BridgeError::Ble`] when the device rejects or drops a write.
#[async_trait]
pub trait BleLink: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Most recent received signal strength in dBm, when known.
    fn rssi(&self) -> Option<i16>;

    async fn drive(&self, command: DriveCommand) -> Result<(), BridgeError>;

    async fn stop(&self) -> Result<(), BridgeError>;

    async fn sleep(&self) -> Result<(), BridgeError>;

    async fn wake(&self) -> Result<(), BridgeError>;

    async fn set_led(&self, rgb: Rgb) -> Result<(), BridgeError>;
}
