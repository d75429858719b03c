//! Session and relay configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::CollabError;
use crate::features::{CollabFeature, FeatureSet};

/// Exponential reconnect backoff settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Client-side collaboration settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Quiet window of the trailing-edge cursor debounce.
    pub debounce_window_ms: u64,
    /// A presence record with no traffic for this long is stale.
    pub presence_ttl_ms: u64,
    /// Period of own-presence republishing. Must stay below ttl/2.
    pub heartbeat_interval_ms: u64,
    /// Period of the stale-record reaper. At most ttl/2.
    pub reaper_interval_ms: u64,
    /// Delay before the single retry of a failed editing-status publish.
    pub editing_retry_delay_ms: u64,
    /// Capacity of the host-facing event channel.
    pub event_buffer: usize,
    pub backoff: BackoffConfig,
    pub features: Vec<CollabFeature>,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: 50,
            presence_ttl_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            reaper_interval_ms: 10_000,
            editing_retry_delay_ms: 250,
            event_buffer: 256,
            backoff: BackoffConfig::default(),
            features: CollabFeature::ALL.to_vec(),
        }
    }
}

impl CollabConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, CollabError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CollabError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check timing relations and resolve the feature list.
    pub fn validate(&self) -> Result<FeatureSet, CollabError> {
        if self.debounce_window_ms == 0 {
            return Err(CollabError::Config("debounce_window_ms must be > 0".into()));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.presence_ttl_ms.div_ceil(2)
        {
            return Err(CollabError::Config(format!(
                "heartbeat_interval_ms ({}) must be non-zero and below presence_ttl_ms/2 ({})",
                self.heartbeat_interval_ms,
                self.presence_ttl_ms / 2
            )));
        }
        if self.reaper_interval_ms == 0 || self.reaper_interval_ms > self.presence_ttl_ms / 2 {
            return Err(CollabError::Config(format!(
                "reaper_interval_ms ({}) must be non-zero and at most presence_ttl_ms/2 ({})",
                self.reaper_interval_ms,
                self.presence_ttl_ms / 2
            )));
        }
        if self.event_buffer == 0 {
            return Err(CollabError::Config("event_buffer must be > 0".into()));
        }
        if self.backoff.initial_ms == 0
            || self.backoff.max_ms < self.backoff.initial_ms
            || self.backoff.multiplier < 1.0
        {
            return Err(CollabError::Config(format!(
                "invalid backoff: {:?}",
                self.backoff
            )));
        }
        FeatureSet::resolve(&self.features)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_millis(self.presence_ttl_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn editing_retry_delay(&self) -> Duration {
        Duration::from_millis(self.editing_retry_delay_ms)
    }
}

/// Relay server settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Envelopes buffered per connection before fan-out starts dropping
    pub member_buffer: usize,
    /// Commands buffered per room actor mailbox
    pub room_buffer: usize,
    /// How long a dropped session stays resumable
    pub resume_window_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            member_buffer: 256,
            room_buffer: 128,
            resume_window_ms: 60_000,
        }
    }
}

impl RelayConfig {
    pub fn resume_window(&self) -> Duration {
        Duration::from_millis(self.resume_window_ms)
    }
}
