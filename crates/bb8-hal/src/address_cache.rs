//! Address Cache – the single persisted record of the last resolved device.
//!
//! The record is a small JSON document:
//!
//! ```json
//! {"mac": "ED:ED:62:01:A1:B2", "advertised_name": "BB-A1B2", "last_seen_epoch": 1760000000}
//! ```
//!
//! A record is served only while it is simultaneously well-formed (parses,
//! all fields present, strict `AA:BB:CC:DD:EE:FF` address) and fresh
//! (`now - last_seen_epoch <= ttl`).  Anything else is a cache miss; corrupt
//! files never surface as errors on the read path.

use std::fs;
use std::path::{Path, PathBuf};

use bb8_types::{BridgeError, CachedAddress, is_valid_mac};
use tracing::debug;

const SECONDS_PER_HOUR: i64 = 3600;

/// Storage for the last-known device address.
pub trait AddressCache: Send + Sync {
    /// Return the cached record when it is valid at `now` (epoch seconds)
    /// under a `ttl_hours` freshness window.
    fn load(&self, now: i64, ttl_hours: u64) -> Option<CachedAddress>;

    /// Replace the cached record.
    fn store(&self, record: &CachedAddress) -> Result<(), BridgeError>;
}

/// [`AddressCache`] backed by a JSON file.
#[derive(Debug, Clone)]
pub struct FileAddressCache {
    path: PathBuf,
}

impl FileAddressCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AddressCache for FileAddressCache {
    fn load(&self, now: i64, ttl_hours: u64) -> Option<CachedAddress> {
        load_cache(now, ttl_hours, &self.path)
    }

    fn store(&self, record: &CachedAddress) -> Result<(), BridgeError> {
        save_cache(&self.path, record)
    }
}

/// Read the record at `path` and return it only if it is well-formed and no
/// older than `ttl_hours` at `now`.
pub fn load_cache(now: i64, ttl_hours: u64, path: &Path) -> Option<CachedAddress> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "address cache unreadable");
            return None;
        }
    };
    let record: CachedAddress = match serde_json::from_str(&raw) {
        Ok(record) => record,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "address cache corrupt");
            return None;
        }
    };
    if !is_valid_mac(&record.mac) {
        debug!(mac = %record.mac, "cached address malformed");
        return None;
    }
    let ttl_seconds = i64::try_from(ttl_hours)
        .unwrap_or(i64::MAX)
        .saturating_mul(SECONDS_PER_HOUR);
    let age = now.saturating_sub(record.last_seen_epoch);
    if age < 0 {
        debug!(last_seen_epoch = record.last_seen_epoch, now, "cached address dated in the future");
        return None;
    }
    if age > ttl_seconds {
        debug!(age_seconds = age, ttl_seconds, "cached address stale");
        return None;
    }
    Some(record)
}

/// Write `record` to `path`, creating parent directories as needed.  The
/// file is replaced atomically via a sibling temp file.
pub fn save_cache(path: &Path, record: &CachedAddress) -> Result<(), BridgeError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            BridgeError::Cache(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    let raw = serde_json::to_string_pretty(record)
        .map_err(|e| BridgeError::Serialization(e.to_string()))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, raw)
        .map_err(|e| BridgeError::Cache(format!("failed to write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| BridgeError::Cache(format!("failed to replace {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_760_000_000;

    fn record(mac: &str, last_seen_epoch: i64) -> CachedAddress {
        CachedAddress {
            mac: mac.to_string(),
            advertised_name: "BB-A1B2".to_string(),
            last_seen_epoch,
        }
    }

    #[test]
    fn fresh_valid_record_is_a_hit() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("mac_cache.json");
        let rec = record("ED:ED:62:01:A1:B2", NOW - 3600);
        save_cache(&path, &rec).expect("save");

        assert_eq!(load_cache(NOW, 2, &path), Some(rec));
    }

    #[test]
    fn record_exactly_at_ttl_is_still_fresh() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("mac_cache.json");
        save_cache(&path, &record("ED:ED:62:01:A1:B2", NOW - 2 * 3600)).expect("save");
        assert!(load_cache(NOW, 2, &path).is_some());
    }

    #[test]
    fn stale_record_is_a_miss() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("mac_cache.json");
        save_cache(&path, &record("ED:ED:62:01:A1:B2", NOW - 2 * 3600 - 1)).expect("save");
        assert_eq!(load_cache(NOW, 2, &path), None);
    }

    #[test]
    fn record_from_the_future_is_a_miss() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("mac_cache.json");
        save_cache(&path, &record("ED:ED:62:01:A1:B2", NOW + 1)).expect("save");
        assert_eq!(load_cache(NOW, 24, &path), None);

        save_cache(&path, &record("ED:ED:62:01:A1:B2", i64::MAX)).expect("save");
        assert_eq!(load_cache(NOW, 24, &path), None);
    }

    #[test]
    fn malformed_address_is_a_miss() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("mac_cache.json");
        save_cache(&path, &record("ED-ED-62-01-A1-B2", NOW)).expect("save");
        assert_eq!(load_cache(NOW, 24, &path), None);
    }

    #[test]
    fn corrupted_or_partial_file_is_a_miss() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("mac_cache.json");

        std::fs::write(&path, b"\x00\xffnot json at all").unwrap();
        assert_eq!(load_cache(NOW, 24, &path), None);

        std::fs::write(&path, r#"{"mac": "ED:ED:62:01:A1:B2"}"#).unwrap();
        assert_eq!(load_cache(NOW, 24, &path), None);

        std::fs::write(&path, r#"{"mac": "ED:ED:62:01:A1:B2", "advertised_name": "BB", "last_seen_epoch": "yesterday"}"#).unwrap();
        assert_eq!(load_cache(NOW, 24, &path), None);
    }

    #[test]
    fn missing_file_is_a_miss() {
        let dir = tempfile::tempdir().expect("tmp dir");
        assert_eq!(load_cache(NOW, 24, &dir.path().join("absent.json")), None);
    }

    #[test]
    fn file_cache_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cache = FileAddressCache::new(dir.path().join("nested").join("mac_cache.json"));
        let rec = record("AA:BB:CC:DD:EE:FF", NOW);
        cache.store(&rec).expect("store");
        assert_eq!(cache.load(NOW, 1), Some(rec));
    }
}
