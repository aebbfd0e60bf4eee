//! Bridge configuration – `~/.bb8/config.toml` plus `BB8_*` overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bb8_middleware::{DEFAULT_BASE_TOPIC, DEFAULT_DISCOVERY_PREFIX, Topics};
use bb8_types::{BridgeError, is_valid_mac};
use serde::{Deserialize, Serialize};

use crate::discovery::DiscoveryConfig;
use crate::dispatcher::ReconnectPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Prefix of every command, ack, and state topic.
    #[serde(default = "default_base_topic")]
    pub base_topic: String,

    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,

    /// Publish the light entity descriptor alongside presence and RSSI.
    #[serde(default = "default_true")]
    pub enable_light_discovery: bool,

    /// Identifies this process when competing discovery publishers appear.
    #[serde(default = "default_owner_id")]
    pub owner_id: String,

    /// Fixed device address; skips scanning entirely when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bb8_mac: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ble_adapter: Option<String>,

    #[serde(default = "default_scan_seconds")]
    pub scan_seconds: u64,

    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: u64,

    #[serde(default = "default_true")]
    pub rescan_on_fail: bool,

    /// Address cache location.  A leading `~/` expands to the home directory.
    #[serde(default = "default_cache_path")]
    pub cache_path: String,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// How long to collect retained descriptors from other publishers after
    /// subscribing, before the first discovery cycle.
    #[serde(default = "default_discovery_settle_ms")]
    pub discovery_settle_ms: u64,

    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_sw_version")]
    pub sw_version: String,

    #[serde(default = "default_suggested_area")]
    pub suggested_area: String,
}

fn default_base_topic() -> String {
    DEFAULT_BASE_TOPIC.to_string()
}
fn default_discovery_prefix() -> String {
    DEFAULT_DISCOVERY_PREFIX.to_string()
}
fn default_true() -> bool {
    true
}
fn default_owner_id() -> String {
    "bb8-bridge".to_string()
}
fn default_scan_seconds() -> u64 {
    5
}
fn default_cache_ttl_hours() -> u64 {
    72
}
fn default_cache_path() -> String {
    "~/.bb8/mac_cache.json".to_string()
}
fn default_reconnect_initial_ms() -> u64 {
    1_000
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_discovery_settle_ms() -> u64 {
    250
}
fn default_manufacturer() -> String {
    "Sphero".to_string()
}
fn default_model() -> String {
    "BB-8".to_string()
}
fn default_sw_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_suggested_area() -> String {
    "Living Room".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_topic: default_base_topic(),
            discovery_prefix: default_discovery_prefix(),
            enable_light_discovery: true,
            owner_id: default_owner_id(),
            bb8_mac: None,
            ble_adapter: None,
            scan_seconds: default_scan_seconds(),
            cache_ttl_hours: default_cache_ttl_hours(),
            rescan_on_fail: true,
            cache_path: default_cache_path(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            discovery_settle_ms: default_discovery_settle_ms(),
            manufacturer: default_manufacturer(),
            model: default_model(),
            sw_version: default_sw_version(),
            suggested_area: default_suggested_area(),
        }
    }
}

impl BridgeConfig {
    pub fn topics(&self) -> Topics {
        Topics::new(self.base_topic.clone(), self.discovery_prefix.clone())
    }

    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            owner_id: self.owner_id.clone(),
            enable_light: self.enable_light_discovery,
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            sw_version: self.sw_version.clone(),
            suggested_area: self.suggested_area.clone(),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_initial_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
    }

    pub fn discovery_settle(&self) -> Duration {
        Duration::from_millis(self.discovery_settle_ms)
    }

    /// The cache path with `~/` expanded.
    pub fn resolved_cache_path(&self) -> PathBuf {
        expand_home(&self.cache_path, &home_dir())
    }

    /// Reject settings the bridge cannot run with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let base = self.base_topic.trim_matches('/');
        if base.is_empty() {
            return Err(BridgeError::Config("base_topic must not be empty".to_string()));
        }
        if base.contains(['+', '#']) {
            return Err(BridgeError::Config(format!(
                "base_topic '{}' must not contain MQTT wildcards",
                self.base_topic
            )));
        }
        if self.discovery_prefix.trim_matches('/').is_empty() {
            return Err(BridgeError::Config("discovery_prefix must not be empty".to_string()));
        }
        if self.reconnect_initial_ms > self.reconnect_max_ms {
            return Err(BridgeError::Config(format!(
                "reconnect_initial_ms ({}) exceeds reconnect_max_ms ({})",
                self.reconnect_initial_ms, self.reconnect_max_ms
            )));
        }
        if let Some(mac) = &self.bb8_mac
            && !is_valid_mac(mac)
        {
            return Err(BridgeError::Config(format!("bb8_mac '{mac}' is not AA:BB:CC:DD:EE:FF")));
        }
        Ok(())
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn expand_home(path: &str, home: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => PathBuf::from(home).join(rest),
        None => PathBuf::from(path),
    }
}

/// `~/.bb8/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".bb8").join("config.toml")
}

/// Load from [`config_path`] and apply `BB8_*` overrides.  `Ok(None)` when
/// the file does not exist.
pub fn load() -> Result<Option<BridgeConfig>, BridgeError> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

/// Parse the file at `path` without looking at the environment.
pub fn load_from(path: &Path) -> Result<Option<BridgeConfig>, BridgeError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        BridgeError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg: BridgeConfig = toml::from_str(&raw)
        .map_err(|e| BridgeError::Config(format!("failed to parse config: {e}")))?;
    Ok(Some(cfg))
}

/// Apply `BB8_*` environment overrides.  Unparsable values are ignored.
///
/// | Variable | Field |
/// |---|---|
/// | `BB8_BASE_TOPIC` | `base_topic` |
/// | `BB8_MAC` | `bb8_mac` |
/// | `BB8_ENABLE_LIGHT_DISCOVERY` | `enable_light_discovery` |
/// | `BB8_SCAN_SECONDS` | `scan_seconds` |
/// | `BB8_CACHE_TTL_HOURS` | `cache_ttl_hours` |
pub fn apply_env_overrides(cfg: &mut BridgeConfig) {
    if let Ok(v) = std::env::var("BB8_BASE_TOPIC") {
        cfg.base_topic = v;
    }
    if let Ok(v) = std::env::var("BB8_MAC") {
        cfg.bb8_mac = Some(v).filter(|m| !m.trim().is_empty());
    }
    if let Ok(v) = std::env::var("BB8_ENABLE_LIGHT_DISCOVERY")
        && let Some(flag) = parse_flag(&v)
    {
        cfg.enable_light_discovery = flag;
    }
    if let Ok(v) = std::env::var("BB8_SCAN_SECONDS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.scan_seconds = secs;
    }
    if let Ok(v) = std::env::var("BB8_CACHE_TTL_HOURS")
        && let Ok(hours) = v.parse::<u64>()
    {
        cfg.cache_ttl_hours = hours;
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn save(cfg: &BridgeConfig) -> Result<(), BridgeError> {
    save_to(cfg, &config_path())
}

/// Write `cfg` with owner-only permissions on Unix (dir 0700, file 0600).
pub fn save_to(cfg: &BridgeConfig, path: &Path) -> Result<(), BridgeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| BridgeError::Config(format!("failed to create config directory: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                BridgeError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| BridgeError::Config(format!("failed to serialize config: {e}")))?;
    let write_err =
        |e: std::io::Error| BridgeError::Config(format!("failed to write config at {}: {e}", path.display()));
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.base_topic, "bb8");
        assert_eq!(cfg.discovery_prefix, "homeassistant");
        assert!(cfg.enable_light_discovery);
        assert_eq!(cfg.scan_seconds, 5);
        assert_eq!(cfg.cache_ttl_hours, 72);
        assert!(cfg.rescan_on_fail);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "base_topic = \"droid\"\nenable_light_discovery = false\n").unwrap();

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.base_topic, "droid");
        assert!(!cfg.enable_light_discovery);
        assert_eq!(cfg.model, "BB-8");
        assert_eq!(cfg.reconnect_max_ms, 30_000);
    }

    #[test]
    fn broker_keys_are_not_part_of_the_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "mqtt_host = \"broker.lan\"\nmqtt_port = 8883\nscan_seconds = 3\n").unwrap();
        let cfg = load_from(&path).expect("unknown keys are tolerated").expect("some");
        assert_eq!(cfg.scan_seconds, 3);

        save_to(&cfg, &path).expect("save");
        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("mqtt"), "saved config: {raw}");
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "scan_seconds = \"soon\"").unwrap();
        assert!(matches!(load_from(&path), Err(BridgeError::Config(_))));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn roundtrip_through_disk() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let cfg = BridgeConfig {
            bb8_mac: Some("ED:ED:62:01:A1:B2".to_string()),
            scan_seconds: 12,
            ..BridgeConfig::default()
        };
        save_to(&cfg, &path).expect("save");
        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.bb8_mac.as_deref(), Some("ED:ED:62:01:A1:B2"));
        assert_eq!(loaded.scan_seconds, 12);
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&BridgeConfig::default(), &path).expect("save");

        let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn validate_rejects_bad_settings() {
        let wildcard = BridgeConfig {
            base_topic: "bb8/#".to_string(),
            ..BridgeConfig::default()
        };
        assert!(wildcard.validate().is_err());

        let empty = BridgeConfig {
            base_topic: "/".to_string(),
            ..BridgeConfig::default()
        };
        assert!(empty.validate().is_err());

        let backoff = BridgeConfig {
            reconnect_initial_ms: 60_000,
            ..BridgeConfig::default()
        };
        assert!(backoff.validate().is_err());

        let mac = BridgeConfig {
            bb8_mac: Some("not-a-mac".to_string()),
            ..BridgeConfig::default()
        };
        assert!(mac.validate().is_err());
    }

    #[test]
    fn cache_path_expands_home() {
        assert_eq!(
            expand_home("~/.bb8/mac_cache.json", "/home/pi"),
            PathBuf::from("/home/pi/.bb8/mac_cache.json")
        );
        assert_eq!(expand_home("/var/lib/bb8.json", "/home/pi"), PathBuf::from("/var/lib/bb8.json"));
    }

    #[test]
    fn flag_parsing() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    // All environment mutation lives in one test so parallel tests never
    // observe each other's variables.
    #[test]
    fn env_overrides() {
        // SAFETY: the only test in this binary that touches BB8_* variables.
        unsafe {
            std::env::set_var("BB8_BASE_TOPIC", "lab/bb8");
            std::env::set_var("BB8_CACHE_TTL_HOURS", "not-a-number");
            std::env::set_var("BB8_ENABLE_LIGHT_DISCOVERY", "0");
            std::env::set_var("BB8_SCAN_SECONDS", "9");
            std::env::set_var("BB8_MAC", "AA:BB:CC:DD:EE:FF");
        }
        let mut cfg = BridgeConfig::default();
        apply_env_overrides(&mut cfg);
        unsafe {
            for key in [
                "BB8_BASE_TOPIC",
                "BB8_CACHE_TTL_HOURS",
                "BB8_ENABLE_LIGHT_DISCOVERY",
                "BB8_SCAN_SECONDS",
                "BB8_MAC",
            ] {
                std::env::remove_var(key);
            }
        }

        assert_eq!(cfg.base_topic, "lab/bb8");
        assert_eq!(cfg.cache_ttl_hours, 72, "unparsable override is ignored");
        assert!(!cfg.enable_light_discovery);
        assert_eq!(cfg.scan_seconds, 9);
        assert_eq!(cfg.bb8_mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
    }
}
