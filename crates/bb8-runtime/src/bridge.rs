//! Start-up wiring: decide which robot the bridge is bound to.

use std::sync::Arc;

use bb8_hal::{AddressCache, DeviceLocator, FileAddressCache, ResolvedDevice, Scanner};
use bb8_types::BridgeError;
use tracing::info;

use crate::config::BridgeConfig;

/// Resolve the robot's address.
///
/// A configured `bb8_mac` wins outright.  Otherwise the address cache is
/// consulted and, on a miss, the radio is scanned.
pub async fn locate_device(
    config: &BridgeConfig,
    scanner: Arc<dyn Scanner>,
    cache: Arc<dyn AddressCache>,
) -> Result<ResolvedDevice, BridgeError> {
    if let Some(mac) = &config.bb8_mac {
        info!(mac = %mac, "using configured BB-8 address");
        return Ok(ResolvedDevice {
            mac: mac.to_uppercase(),
            name: String::new(),
            rssi: None,
            from_cache: false,
        });
    }

    let locator = DeviceLocator::new(scanner, cache, config.ble_adapter.clone());
    locator
        .resolve_bb8_mac(config.scan_seconds, config.cache_ttl_hours, config.rescan_on_fail)
        .await
}

/// The on-disk cache named by `config.cache_path`.
pub fn file_cache(config: &BridgeConfig) -> Arc<dyn AddressCache> {
    Arc::new(FileAddressCache::new(config.resolved_cache_path()))
}
