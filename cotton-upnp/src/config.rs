//! Tunable parameters for discovery and device tracking
//!
//! Every field has a sensible default, so an empty YAML document is a
//! valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// The largest MX (maximum search wait, seconds) we will ask for
pub const MAX_SEARCH_MX: u32 = 5;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for discovery, advertisement and device tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port on which SSDP multicasts are sent and received
    pub ssdp_port: u16,

    /// The `max-age` of our own announcements, in seconds
    pub advertise_max_age: u32,

    /// The MX of our own searches; clamped to [`MAX_SEARCH_MX`]
    pub search_mx: u32,

    /// What the control point searches for
    pub search_target: String,

    /// Whether to open sessions on IPv6 addresses too
    pub enable_ipv6: bool,

    /// Shortest lifetime granted to any device, in seconds
    pub ttl_floor_secs: u64,

    /// How long a device must stay at a new location before we move it
    pub source_change_debounce_secs: u64,

    /// A device announced this recently at its old location won't move
    pub anti_flap_guard_secs: u64,

    /// Limit on each description or SCPD fetch
    pub fetch_timeout_secs: u64,

    /// How often to poll for interface changes
    pub interface_poll_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ssdp_port: crate::ssdp::SSDP_PORT,
            advertise_max_age: 1800,
            search_mx: 3,
            search_target: "upnp:rootdevice".to_string(),
            enable_ipv6: true,
            ttl_floor_secs: 5,
            source_change_debounce_secs: 3,
            anti_flap_guard_secs: 10,
            fetch_timeout_secs: 10,
            interface_poll_interval_secs: 5,
        }
    }
}

impl Config {
    /// Load and validate configuration from a YAML string
    ///
    /// # Errors
    ///
    /// Fails on malformed YAML, or if [`Config::validate`] fails.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a YAML file
    ///
    /// # Errors
    ///
    /// As for [`Config::from_yaml_str`], plus I/O errors.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_yaml_str(&std::fs::read_to_string(path)?)
    }

    /// Check for values which cannot work
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.advertise_max_age == 0 {
            return Err(ConfigError::Invalid(
                "advertise_max_age must be positive".into(),
            ));
        }
        if self.search_mx == 0 {
            return Err(ConfigError::Invalid("search_mx must be positive".into()));
        }
        if self.search_target.trim().is_empty() {
            return Err(ConfigError::Invalid("search_target is empty".into()));
        }
        for (name, value) in [
            ("ttl_floor_secs", self.ttl_floor_secs),
            ("fetch_timeout_secs", self.fetch_timeout_secs),
            (
                "interface_poll_interval_secs",
                self.interface_poll_interval_secs,
            ),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be positive"
                )));
            }
        }
        Ok(())
    }

    /// The MX to put in our searches
    pub fn effective_search_mx(&self) -> u32 {
        self.search_mx.clamp(1, MAX_SEARCH_MX)
    }

    /// [`Config::ttl_floor_secs`] as a `Duration`
    pub fn ttl_floor(&self) -> Duration {
        Duration::from_secs(self.ttl_floor_secs)
    }

    pub fn source_change_debounce(&self) -> Duration {
        Duration::from_secs(self.source_change_debounce_secs)
    }

    pub fn anti_flap_guard(&self) -> Duration {
        Duration::from_secs(self.anti_flap_guard_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn interface_poll_interval(&self) -> Duration {
        Duration::from_secs(self.interface_poll_interval_secs)
    }
}
