//! In-process doubles for CI and the bench REPL.
//!
//! [`SimBleLink`] records every operation it accepts so tests can assert on
//! the exact hardware traffic a command produced.  [`SimScanner`] replays a
//! scripted sequence of scan results.
//!
//! # Example
//!
//! ```rust
//! use bb8_hal::sim::{LinkCall, SimBleLink};
//! use bb8_hal::BleLink;
//! use bb8_types::Rgb;
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let link = SimBleLink::connected();
//! runtime.block_on(link.set_led(Rgb::new(1, 2, 3))).unwrap();
//! assert_eq!(link.calls(), vec![LinkCall::SetLed(Rgb::new(1, 2, 3))]);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bb8_types::{BridgeError, Rgb};

use crate::ble_link::{BleLink, DriveCommand};
use crate::locator::{Advertisement, Scanner};

// ────────────────────────────────────────────────────────────────────────────
// Simulated link
// ────────────────────────────────────────────────────────────────────────────

/// One operation accepted by a [`SimBleLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCall {
    Drive(DriveCommand),
    Stop,
    Sleep,
    Wake,
    SetLed(Rgb),
}

/// A simulated BLE link.  While disconnected every operation fails with
/// [`BridgeError::NotConnected`] and nothing is recorded.
pub struct SimBleLink {
    connected: AtomicBool,
    rssi: Mutex<Option<i16>>,
    calls: Mutex<Vec<LinkCall>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimBleLink {
    pub fn connected() -> Self {
        Self {
            connected: AtomicBool::new(true),
            rssi: Mutex::new(Some(-58)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn disconnected() -> Self {
        let link = Self::connected();
        link.set_connected(false);
        link
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_rssi(&self, rssi: Option<i16>) {
        *lock(&self.rssi) = rssi;
    }

    /// Every accepted operation, oldest first.
    pub fn calls(&self) -> Vec<LinkCall> {
        lock(&self.calls).clone()
    }

    /// Only the LED writes, oldest first.
    pub fn led_writes(&self) -> Vec<Rgb> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                LinkCall::SetLed(rgb) => Some(*rgb),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, call: LinkCall) -> Result<(), BridgeError> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        lock(&self.calls).push(call);
        Ok(())
    }
}

#[async_trait]
impl BleLink for SimBleLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn rssi(&self) -> Option<i16> {
        *lock(&self.rssi)
    }

    async fn drive(&self, command: DriveCommand) -> Result<(), BridgeError> {
        self.record(LinkCall::Drive(command))
    }

    async fn stop(&self) -> Result<(), BridgeError> {
        self.record(LinkCall::Stop)
    }

    async fn sleep(&self) -> Result<(), BridgeError> {
        self.record(LinkCall::Sleep)
    }

    async fn wake(&self) -> Result<(), BridgeError> {
        self.record(LinkCall::Wake)
    }

    async fn set_led(&self, rgb: Rgb) -> Result<(), BridgeError> {
        self.record(LinkCall::SetLed(rgb))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated scanner
// ────────────────────────────────────────────────────────────────────────────

/// A scanner that replays scripted results, one per call.  Once the script
/// runs out every further scan sees an empty airspace.
#[derive(Default)]
pub struct SimScanner {
    script: Mutex<VecDeque<Result<Vec<Advertisement>, BridgeError>>>,
    scans: AtomicU32,
}

impl SimScanner {
    /// A scanner whose first scan sees `advertisements`.
    pub fn seeing(advertisements: Vec<Advertisement>) -> Self {
        Self::scripted(vec![Ok(advertisements)])
    }

    /// A scanner whose first scan fails with `details`.
    pub fn failing(details: impl Into<String>) -> Self {
        Self::scripted(vec![Err(BridgeError::Scan(details.into()))])
    }

    pub fn scripted(script: Vec<Result<Vec<Advertisement>, BridgeError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            scans: AtomicU32::new(0),
        }
    }

    /// Number of scans performed so far.
    pub fn scan_count(&self) -> u32 {
        self.scans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scanner for SimScanner {
    async fn discover(
        &self,
        _duration: Duration,
        _adapter: Option<&str>,
    ) -> Result<Vec<Advertisement>, BridgeError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        lock(&self.script).pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connected_link_records_calls() {
        let link = SimBleLink::connected();
        link.wake().await.unwrap();
        link.set_led(Rgb::WHITE).await.unwrap();
        link.stop().await.unwrap();
        assert_eq!(
            link.calls(),
            vec![LinkCall::Wake, LinkCall::SetLed(Rgb::WHITE), LinkCall::Stop]
        );
        assert_eq!(link.led_writes(), vec![Rgb::WHITE]);
    }

    #[tokio::test]
    async fn disconnected_link_rejects_and_records_nothing() {
        let link = SimBleLink::disconnected();
        assert_eq!(link.sleep().await, Err(BridgeError::NotConnected));
        assert!(link.calls().is_empty());
    }

    #[tokio::test]
    async fn scanner_replays_script_then_goes_quiet() {
        let scanner = SimScanner::failing("adapter busy");
        assert!(scanner.discover(Duration::ZERO, None).await.is_err());
        assert_eq!(scanner.discover(Duration::ZERO, None).await, Ok(vec![]));
        assert_eq!(scanner.scan_count(), 2);
    }
}
