//! Client configuration.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Client configuration.
///
/// Every field has a default, so a JSON document only needs the fields it
/// overrides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Messages buffered between a subscription's read loop and its handler.
    /// A full queue blocks the read loop.
    /// Default: 1024
    pub delivery_queue_depth: usize,

    /// Ack deadline for publishes that don't set one.
    /// Default: 5000
    pub default_ack_deadline_ms: u64,

    /// Longest a read loop waits on the network before re-checking for
    /// unsubscribe. Bounds unsubscribe latency.
    /// Default: 50
    pub poll_interval_ms: u64,

    /// Pause before re-opening a dropped subscription stream.
    /// Default: 100
    pub resume_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            delivery_queue_depth: 1024,
            default_ack_deadline_ms: 5000,
            poll_interval_ms: 50,
            resume_backoff_ms: 100,
        }
    }
}

impl ClientConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.delivery_queue_depth == 0 {
            return Err(ClientError::Config(
                "delivery_queue_depth must be at least 1".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ClientError::Config(
                "poll_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn default_ack_deadline(&self) -> Duration {
        Duration::from_millis(self.default_ack_deadline_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn resume_backoff(&self) -> Duration {
        Duration::from_millis(self.resume_backoff_ms)
    }
}
