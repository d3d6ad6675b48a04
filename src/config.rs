use crate::sync::protocol::ValidationLimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid session config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid session config: {0}")]
    Invalid(&'static str),
}

/// Tunables for one collaboration session. Durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub heartbeat_interval_ms: u64,
    pub awareness_timeout_ms: u64,
    /// How long to wait in `Syncing` for a peer to answer before assuming
    /// the room is empty.
    pub sync_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Consecutive undecodable frames tolerated before the link is dropped.
    pub max_malformed_messages: u32,
    pub outbox_warn_threshold: usize,
    pub event_capacity: usize,
    pub limits: ValidationLimits,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 15_000,
            awareness_timeout_ms: 30_000,
            sync_timeout_ms: 3_000,
            backoff_base_ms: 250,
            backoff_max_ms: 30_000,
            max_malformed_messages: 8,
            outbox_warn_threshold: 10_000,
            event_capacity: 1_024,
            limits: ValidationLimits::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval_ms must be positive"));
        }
        if self.awareness_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "awareness_timeout_ms must exceed heartbeat_interval_ms",
            ));
        }
        if self.backoff_base_ms == 0 || self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid("backoff_max_ms must be >= backoff_base_ms > 0"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be positive"));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn awareness_timeout(&self) -> Duration {
        Duration::from_millis(self.awareness_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}
