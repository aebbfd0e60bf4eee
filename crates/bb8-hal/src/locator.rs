//! [`DeviceLocator`] – finds the robot's address.
//!
//! Resolution order:
//!
//! 1. A cached address that is still well-formed and fresh.
//! 2. A timed scan, keeping advertisers whose name looks like a BB-8, ranked
//!    strongest signal first.  The winner is written back to the cache.
//! 3. When `rescan_on_fail` is set and the first scan found nothing, one more
//!    scan before giving up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bb8_types::{BridgeError, CachedAddress, is_valid_mac};
use chrono::Utc;
use tracing::{info, warn};

use crate::address_cache::AddressCache;

/// One advertising peripheral seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl Advertisement {
    pub fn new(address: impl Into<String>, name: Option<&str>, rssi: Option<i16>) -> Self {
        Self {
            address: address.into(),
            name: name.map(str::to_string),
            rssi,
        }
    }
}

/// The radio's discovery capability.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Listen for advertisements for `duration` on `adapter` (or the system
    /// default adapter).
    async fn discover(
        &self,
        duration: Duration,
        adapter: Option<&str>,
    ) -> Result<Vec<Advertisement>, BridgeError>;
}

/// The outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevice {
    pub mac: String,
    pub name: String,
    pub rssi: Option<i16>,
    pub from_cache: bool,
}

/// Case-insensitive name heuristic: Sphero BB-8 units advertise as `BB-XXXX`
/// and some firmware as `BB8…`.
pub fn is_bb8_name(name: &str) -> bool {
    let lower = name.trim().to_ascii_lowercase();
    lower.starts_with("bb-") || lower.contains("bb-8") || lower.contains("bb8")
}

pub struct DeviceLocator {
    scanner: Arc<dyn Scanner>,
    cache: Arc<dyn AddressCache>,
    adapter: Option<String>,
}

impl DeviceLocator {
    pub fn new(
        scanner: Arc<dyn Scanner>,
        cache: Arc<dyn AddressCache>,
        adapter: Option<String>,
    ) -> Self {
        Self {
            scanner,
            cache,
            adapter,
        }
    }

    /// Scan for `scan_seconds` and return BB-8 candidates, strongest first.
    ///
    /// Advertisers with malformed addresses are dropped.  Scanner failures are
    /// logged and reported as an empty result.
    pub async fn scan_for_bb8(&self, scan_seconds: u64, adapter: Option<&str>) -> Vec<Advertisement> {
        let found = match self
            .scanner
            .discover(Duration::from_secs(scan_seconds), adapter)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "BLE scan failed");
                return Vec::new();
            }
        };
        let mut candidates: Vec<Advertisement> = found
            .into_iter()
            .filter(|ad| ad.name.as_deref().is_some_and(is_bb8_name))
            .filter(|ad| is_valid_mac(&ad.address))
            .collect();
        // Unknown RSSI sorts after every measured value.
        candidates.sort_by_key(|ad| std::cmp::Reverse(ad.rssi.unwrap_or(i16::MIN)));
        candidates
    }

    /// Return the device address, preferring the cache.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DeviceNotFound`] when no candidate was seen.
    pub async fn resolve_bb8_mac(
        &self,
        scan_seconds: u64,
        cache_ttl_hours: u64,
        rescan_on_fail: bool,
    ) -> Result<ResolvedDevice, BridgeError> {
        let now = Utc::now().timestamp();
        if let Some(cached) = self.cache.load(now, cache_ttl_hours) {
            info!(mac = %cached.mac, "using cached BB-8 address");
            return Ok(ResolvedDevice {
                mac: cached.mac,
                name: cached.advertised_name,
                rssi: None,
                from_cache: true,
            });
        }

        let attempts = if rescan_on_fail { 2 } else { 1 };
        for attempt in 1..=attempts {
            let candidates = self.scan_for_bb8(scan_seconds, self.adapter.as_deref()).await;
            let Some(best) = candidates.into_iter().next() else {
                warn!(attempt, attempts, "no BB-8 seen during scan");
                continue;
            };
            let name = best.name.unwrap_or_default();
            let record = CachedAddress {
                mac: best.address.to_uppercase(),
                advertised_name: name.clone(),
                last_seen_epoch: Utc::now().timestamp(),
            };
            if let Err(e) = self.cache.store(&record) {
                warn!(error = %e, "failed to persist BB-8 address");
            }
            info!(mac = %record.mac, name = %name, rssi = ?best.rssi, "BB-8 located");
            return Ok(ResolvedDevice {
                mac: record.mac,
                name,
                rssi: best.rssi,
                from_cache: false,
            });
        }

        Err(BridgeError::DeviceNotFound(format!(
            "no BB-8 advertiser found after {attempts} scan(s) of {scan_seconds}s; \
             wake the robot or set bb8_mac explicitly"
        )))
    }
}
