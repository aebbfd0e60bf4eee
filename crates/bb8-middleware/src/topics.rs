//! Topic layout.
//!
//! | Purpose | Topic |
//! |---|---|
//! | Command in | `<base>/cmd/<name>` |
//! | Acknowledgment out | `<base>/ack/<name>` |
//! | State echo out | `<base>/state/<name>` |
//! | Availability | `<base>/status` |
//! | Discovery config | `<prefix>/<component>/<object_id>/config` |

use bb8_types::CommandName;

pub const DEFAULT_BASE_TOPIC: &str = "bb8";
pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";

/// Builds every topic the bridge reads or writes from one base prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
    discovery_prefix: String,
}

impl Topics {
    pub fn new(base: impl Into<String>, discovery_prefix: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            discovery_prefix: discovery_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn command(&self, name: CommandName) -> String {
        format!("{}/cmd/{}", self.base, name)
    }

    /// Single-level wildcard covering every command topic.
    pub fn command_filter(&self) -> String {
        format!("{}/cmd/+", self.base)
    }

    pub fn ack(&self, name: &str) -> String {
        format!("{}/ack/{}", self.base, name)
    }

    pub fn state(&self, name: &str) -> String {
        format!("{}/state/{}", self.base, name)
    }

    pub fn status(&self) -> String {
        format!("{}/status", self.base)
    }

    pub fn discovery_config(&self, component: &str, object_id: &str) -> String {
        format!("{}/{}/{}/config", self.discovery_prefix, component, object_id)
    }

    /// Return the command-name segment of `<base>/cmd/<name>`, or `None` for
    /// any topic outside the command namespace.
    pub fn command_suffix<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.base.as_str())?.strip_prefix("/cmd/")?;
        if rest.is_empty() || rest.contains('/') {
            return None;
        }
        Some(rest)
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_TOPIC, DEFAULT_DISCOVERY_PREFIX)
    }
}

/// MQTT filter matching: `+` matches one level, a trailing `#` matches the
/// remainder (including the parent level itself).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
