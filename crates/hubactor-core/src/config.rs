//! Actor configuration.
//!
//! Loaded from TOML:
//!
//! ```toml
//! [actor]
//! name = "tcc"
//!
//! [queue]
//! default_priority = 0
//!
//! [priorities]
//! init = "immediate"
//! move = 2
//! status = 1
//!
//! [[rules]]
//! action = "cancel_queued"
//! new = ["move"]
//! queued = ["move"]
//!
//! [devices]
//! default_time_limit_secs = 10
//!
//! [[devices.slots]]
//! slot = "rot"
//! name = "rotator"
//! verbs = ["home"]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::queue::{Priority, QueuePolicy, RuleAction};

/// Default values.
pub mod defaults {
    pub const ACTOR_NAME: &str = "hubactor";
    /// Device command time limit, seconds
    pub const DEVICE_TIME_LIMIT_SECS: u64 = 10;
    /// Log filter used when `RUST_LOG` is not set
    pub const LOG_FILTER: &str = "hubactor=info";
}

/// Environment variable names.
pub mod env_vars {
    /// `true` selects JSON log output
    pub const LOG_JSON: &str = "HUBACTOR_LOG_JSON";
    /// Config file used when none is given on the command line
    pub const CONFIG: &str = "HUBACTOR_CONFIG";

    /// True if [`LOG_JSON`] is set to `true` or `1`.
    pub fn log_json() -> bool {
        std::env::var(LOG_JSON)
            .map(|value| value.eq_ignore_ascii_case("true") || value == "1")
            .unwrap_or(false)
    }
}

/// Whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActorConfig {
    #[serde(default)]
    pub actor: ActorSection,
    #[serde(default)]
    pub queue: QueueSection,
    /// verb → priority
    #[serde(default)]
    pub priorities: BTreeMap<String, Priority>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub devices: DevicesConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActorSection {
    #[serde(default = "default_actor_name")]
    pub name: String,
}

impl Default for ActorSection {
    fn default() -> Self {
        Self {
            name: default_actor_name(),
        }
    }
}

fn default_actor_name() -> String {
    defaults::ACTOR_NAME.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueSection {
    /// Priority for verbs missing from `[priorities]`
    #[serde(default)]
    pub default_priority: Option<Priority>,
}

/// One `[[rules]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// `cancel_new`, `cancel_queued` or `kill_running`
    pub action: String,
    pub new: Vec<String>,
    pub queued: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevicesConfig {
    #[serde(default = "default_device_time_limit")]
    pub default_time_limit_secs: u64,
    #[serde(default)]
    pub slots: Vec<SlotConfig>,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            default_time_limit_secs: default_device_time_limit(),
            slots: Vec::new(),
        }
    }
}

fn default_device_time_limit() -> u64 {
    defaults::DEVICE_TIME_LIMIT_SECS
}

/// One `[[devices.slots]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotConfig {
    pub slot: String,
    /// Device name; defaults to the slot name. Omit with `empty = true` for an empty slot.
    #[serde(default)]
    pub name: Option<String>,
    /// Leave the slot without a device
    #[serde(default)]
    pub empty: bool,
    /// User verbs forwarded to this device unchanged
    #[serde(default)]
    pub verbs: Vec<String>,
}

impl SlotConfig {
    /// Device name, or `None` for an empty slot.
    pub fn device_name(&self) -> Option<&str> {
        if self.empty {
            None
        } else {
            Some(self.name.as_deref().unwrap_or(&self.slot))
        }
    }
}

impl ActorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ActorConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check the queue policy and device slots.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue_policy()?;

        let mut slots = HashSet::new();
        let mut names = HashSet::new();
        for slot in &self.devices.slots {
            if slot.slot.trim().is_empty() {
                return Err(ConfigError::Devices("slot name must not be empty".to_string()));
            }
            if !slots.insert(slot.slot.as_str()) {
                return Err(ConfigError::Devices(format!("duplicate slot {:?}", slot.slot)));
            }
            if let Some(name) = slot.device_name() {
                if !names.insert(name) {
                    return Err(ConfigError::Devices(format!("duplicate device name {name:?}")));
                }
            }
        }
        Ok(())
    }

    /// Build the priority table and collision rules.
    pub fn queue_policy(&self) -> Result<QueuePolicy, ConfigError> {
        let mut policy = QueuePolicy::from_priorities(
            self.priorities
                .iter()
                .map(|(verb, priority)| (verb.as_str(), *priority)),
        );
        policy.set_default_priority(self.queue.default_priority);
        for rule in &self.rules {
            let action: RuleAction = rule.action.parse()?;
            policy.add_rule(action, &rule.new, &rule.queued)?;
        }
        Ok(policy)
    }

    /// Time limit for device commands; `None` when set to 0.
    pub fn device_time_limit(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.devices.default_time_limit_secs))
            .filter(|limit| !limit.is_zero())
    }
}
