//! Environment-driven configuration.
//!
//! | variable | default |
//! |---|---|
//! | `TIDEWATER_STRICT` | `false` |
//! | `TIDEWATER_IGNORED_EVENTS` | empty (comma separated) |
//! | `TIDEWATER_PLACEHOLDER_EVERY` | unset |
//! | `TIDEWATER_BUS_PARTITIONS` | `32` |
//! | `TIDEWATER_BUS_CAPACITY` | `1` |
//! | `TIDEWATER_RELAY_INTERVAL_MS` | `5000` |
//! | `TIDEWATER_RELAY_BATCH` | `100` |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tidewater_core::VersionPolicy;
use tidewater_events::BusConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Parse { key: &'static str, value: String },

    #[error("{key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Report ignored, unrouted and unpicked events as errors.
    pub strict: bool,
    /// Event names the engine never routes (its own output).
    pub ignored_events: Vec<String>,
    /// Reserve every n-th event version.
    pub placeholder_every: Option<u64>,
}

impl EngineConfig {
    pub fn version_policy(&self) -> VersionPolicy {
        self.placeholder_every
            .and_then(VersionPolicy::reserve_every)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub interval_ms: u64,
    /// Maximum pending batches republished per pass.
    pub batch: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            batch: 100,
        }
    }
}

impl RelayConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineConfig,
    pub bus: BusConfig,
    pub relay: RelayConfig,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(strict) = parse::<bool>(&lookup, "TIDEWATER_STRICT")? {
            settings.engine.strict = strict;
        }
        if let Some(raw) = lookup("TIDEWATER_IGNORED_EVENTS") {
            settings.engine.ignored_events = raw
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(every) = parse::<u64>(&lookup, "TIDEWATER_PLACEHOLDER_EVERY")? {
            if every < 2 {
                return Err(ConfigError::Invalid {
                    key: "TIDEWATER_PLACEHOLDER_EVERY",
                    reason: format!("must be at least 2, got {every}"),
                });
            }
            settings.engine.placeholder_every = Some(every);
        }

        if let Some(partitions) = parse::<usize>(&lookup, "TIDEWATER_BUS_PARTITIONS")? {
            settings.bus.partitions = partitions;
        }
        if let Some(capacity) = parse::<usize>(&lookup, "TIDEWATER_BUS_CAPACITY")? {
            settings.bus.capacity = capacity;
        }
        settings.bus.validate().map_err(|e| ConfigError::Invalid {
            key: "TIDEWATER_BUS_*",
            reason: e.to_string(),
        })?;

        if let Some(interval) = parse::<u64>(&lookup, "TIDEWATER_RELAY_INTERVAL_MS")? {
            settings.relay.interval_ms = interval;
        }
        if let Some(batch) = parse::<usize>(&lookup, "TIDEWATER_RELAY_BATCH")? {
            if batch == 0 {
                return Err(ConfigError::Invalid {
                    key: "TIDEWATER_RELAY_BATCH",
                    reason: "must be at least 1".to_string(),
                });
            }
            settings.relay.batch = batch;
        }

        Ok(settings)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => {
            tracing::warn!(key, "empty value, using default");
            Ok(None)
        }
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse { key, value: raw }),
    }
}
