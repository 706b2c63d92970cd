//! Broker-side scheduling configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::loader::{env_properties, ConfigError, Properties};
use crate::core::{ResourceLimits, DEFAULT_MAX_FRAGMENTATION};

const KEYS: &[&str] = &[
    "maxFragmentation",
    "initialHeapCapacity",
    "sharedSecret",
    "globalResourceLimits",
];

/// Broker configuration relevant to scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Blocked candidates visited per extraction before giving up.
    pub max_fragmentation: usize,
    /// Capacity hint for the task heap.
    pub initial_heap_capacity: usize,
    /// Secret workers must present on connect.
    pub shared_secret: String,
    /// Broker-wide resource ceilings.
    pub global_resource_limits: ResourceLimits,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_fragmentation: DEFAULT_MAX_FRAGMENTATION,
            initial_heap_capacity: 1024,
            shared_secret: "dodo".into(),
            global_resource_limits: ResourceLimits::new(),
        }
    }
}

impl BrokerConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_fragmentation == 0 {
            return Err("max_fragmentation must be greater than 0".into());
        }
        if self.shared_secret.is_empty() {
            return Err("shared_secret must not be empty".into());
        }
        if self.global_resource_limits.keys().any(String::is_empty) {
            return Err("global_resource_limits contains an empty resource id".into());
        }
        Ok(())
    }

    /// Populate from string properties, starting from defaults.
    pub fn from_properties(source: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let props = Properties::new(source);
        let mut cfg = Self::default();
        if let Some(v) = props.parse("maxFragmentation")? {
            cfg.max_fragmentation = v;
        }
        if let Some(v) = props.parse("initialHeapCapacity")? {
            cfg.initial_heap_capacity = v;
        }
        if let Some(v) = props.string("sharedSecret") {
            cfg.shared_secret = v;
        }
        if let Some(v) = props.map("globalResourceLimits")? {
            cfg.global_resource_limits = v;
        }
        cfg.validate().map_err(ConfigError::Validation)?;
        Ok(cfg)
    }

    /// Load from `DODO_`-prefixed environment variables (and `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_properties(&env_properties("DODO_", KEYS))
    }

    /// Parse from JSON (snake_case field names) and validate.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let cfg: Self =
            serde_json::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate().map_err(ConfigError::Validation)?;
        Ok(cfg)
    }
}
