//! Polling and event-delivery configuration.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default remote session time-to-live without a heartbeat (30 seconds).
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30);

/// Heartbeats are sent this many times per TTL.
pub const HEARTBEATS_PER_TTL: u32 = 5;

/// Default heartbeat interval (6 seconds, one fifth of the TTL).
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(6);

/// Default refresh interval (1.5 seconds).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(1500);

/// Default capacity of the broadcast event channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 64;

/// Shortest period a polling task will tick at.
pub const MIN_POLL_PERIOD: Duration = Duration::from_millis(1);

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("heartbeat interval {heartbeat:?} must be shorter than session ttl {ttl:?}")]
    HeartbeatTooSlow { heartbeat: Duration, ttl: Duration },
}

/// Timing for the background polling tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// How long the service keeps a session alive without a heartbeat
    pub session_ttl: Duration,

    /// Host liveness ping period
    pub heartbeat_interval: Duration,

    /// Snapshot pull period
    pub refresh_interval: Duration,

    /// Capacity of the broadcast event channel
    pub event_channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            session_ttl: DEFAULT_SESSION_TTL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// On-disk shape; all durations in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    session_ttl_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    refresh_interval_ms: Option<u64>,
    event_channel_capacity: Option<usize>,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the heartbeat interval from a session TTL, keeping a safety
    /// margin of four missed beats.
    pub fn from_ttl(ttl: Duration) -> Self {
        Self {
            session_ttl: ttl,
            heartbeat_interval: ttl / HEARTBEATS_PER_TTL,
            ..Self::default()
        }
    }

    /// Parse a TOML table such as:
    ///
    /// ```toml
    /// session_ttl_ms = 30000
    /// refresh_interval_ms = 1500
    /// ```
    ///
    /// A missing heartbeat interval is derived from the TTL.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(input)?;

        let mut config = match raw.session_ttl_ms {
            Some(ms) => Self::from_ttl(Duration::from_millis(ms)),
            None => Self::default(),
        };
        if let Some(ms) = raw.heartbeat_interval_ms {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.refresh_interval_ms {
            config.refresh_interval = Duration::from_millis(ms);
        }
        if let Some(capacity) = raw.event_channel_capacity {
            config.event_channel_capacity = capacity;
        }

        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Check the intervals can drive the polling tasks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_ttl.is_zero() {
            return Err(ConfigError::Zero {
                field: "session_ttl",
            });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "heartbeat_interval",
            });
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "refresh_interval",
            });
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "event_channel_capacity",
            });
        }
        if self.heartbeat_interval >= self.session_ttl {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                ttl: self.session_ttl,
            });
        }
        Ok(())
    }

    /// Replace values [`validate`](Self::validate) would reject with
    /// usable ones: a zero TTL or refresh interval falls back to its
    /// default, a zero or too slow heartbeat is derived from the TTL, and
    /// capacity is at least 1.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.session_ttl.is_zero() {
            self.session_ttl = DEFAULT_SESSION_TTL;
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.session_ttl {
            self.heartbeat_interval = (self.session_ttl / HEARTBEATS_PER_TTL).max(MIN_POLL_PERIOD);
        }
        if self.refresh_interval.is_zero() {
            self.refresh_interval = DEFAULT_REFRESH_INTERVAL;
        }
        self.event_channel_capacity = self.event_channel_capacity.max(1);
        self
    }
}
