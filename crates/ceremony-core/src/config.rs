//! Ceremony timing and relay configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Public relay used when devices do not share a local network
pub const PUBLIC_RELAY_URL: &str = "https://api.vultisig.com/router";

/// Tunables shared by every component of a ceremony
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CeremonyConfig {
    /// Public relay base URL
    pub relay_url: String,

    /// Interval between polls of discovery, start, puller and completion loops
    pub poll_interval: Duration,

    /// Ceiling for the global completion poll
    pub completion_timeout: Duration,

    /// Attempts per sign task (and per key generation) before giving up
    pub max_attempts: u32,

    /// Pause between two attempts of the same task
    pub retry_backoff: Duration,

    /// Per request HTTP timeout
    pub request_timeout: Duration,
}

impl Default for CeremonyConfig {
    fn default() -> Self {
        Self {
            relay_url: PUBLIC_RELAY_URL.to_string(),
            poll_interval: Duration::from_secs(1),
            completion_timeout: Duration::from_secs(60),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl CeremonyConfig {
    /// Set the public relay URL
    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = url.into();
        self
    }

    /// Set the polling interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the completion ceiling
    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    /// Set the retry backoff
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_attempts == 0 {
            return Err(crate::Error::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(crate::Error::InvalidConfig(
                "poll_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}
