//! Session configuration.
//!
//! All intervals are stored in milliseconds so the structures round-trip
//! through JSON configuration files unchanged.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for a synchronization session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub queue: QueueConfig,
    pub presence: PresenceConfig,
    /// How long to wait for a document sync response.
    pub sync_timeout_ms: u64,
    /// Timer tick driving flushes and sweeps.
    pub tick_interval_ms: u64,
    /// Delay before the first reconnect attempt.
    pub reconnect_initial_ms: u64,
    /// Upper bound for reconnect backoff.
    pub reconnect_max_ms: u64,
    /// Canonical operations kept for position mapping.
    pub history_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            presence: PresenceConfig::default(),
            sync_timeout_ms: 10_000,
            tick_interval_ms: 50,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            history_capacity: 1024,
        }
    }
}

impl SyncConfig {
    /// Load a configuration file, falling back to defaults when it is
    /// missing or malformed.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                tracing::debug!("No sync config at {:?} ({}), using defaults", path, e);
                return Self::default();
            }
        };

        match serde_json::from_str::<SyncConfig>(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to parse sync config, using defaults: {}", e);
                Self::default()
            }
        }
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_presence(mut self, presence: PresenceConfig) -> Self {
        self.presence = presence;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

/// Operation queue batching and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum operations per batch.
    pub max_batch_size: usize,
    /// Idle time after the last enqueue before a partial batch is sent.
    pub flush_interval_ms: u64,
    /// How long an operation may wait for its acknowledgment.
    pub ack_timeout_ms: u64,
    /// Retransmissions before an operation is reported as failed.
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            flush_interval_ms: 100,
            ack_timeout_ms: 10_000,
            max_retries: 3,
        }
    }
}

impl QueueConfig {
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Presence broadcast and liveness settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Minimum gap between two cursor broadcasts (100 ms is ~10/sec).
    pub cursor_throttle_ms: u64,
    /// How often stale entries are swept.
    pub sweep_interval_ms: u64,
    /// Typing indicator lifetime without a new keystroke.
    pub typing_timeout_ms: u64,
    /// Presence lifetime without any activity.
    pub presence_timeout_ms: u64,
    /// Keep-alive period for an otherwise idle session.
    pub heartbeat_interval_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            cursor_throttle_ms: 100,
            sweep_interval_ms: 5_000,
            typing_timeout_ms: 8_000,
            presence_timeout_ms: 30_000,
            heartbeat_interval_ms: 5_000,
        }
    }
}

impl PresenceConfig {
    pub fn cursor_throttle(&self) -> Duration {
        Duration::from_millis(self.cursor_throttle_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Document channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Maximum number of sessions subscribed to one document.
    pub max_subscribers: usize,
    /// Accepted operations kept for catch-up syncs and duplicate detection.
    pub log_capacity: usize,
    /// Silence after which a subscriber is dropped.
    pub subscriber_timeout_ms: u64,
    /// How often silent subscribers are swept.
    pub sweep_interval_ms: u64,
    /// How often a changed document is written to the store.
    pub autosave_interval_ms: u64,
    /// Cursor colors handed out round-robin.
    pub colors: Vec<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_subscribers: 100,
            log_capacity: 1024,
            subscriber_timeout_ms: 30_000,
            sweep_interval_ms: 5_000,
            autosave_interval_ms: 10_000,
            colors: crate::presence::default_colors(),
        }
    }
}

impl ChannelConfig {
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity.max(1);
        self
    }

    pub fn with_subscriber_timeout(mut self, timeout: Duration) -> Self {
        self.subscriber_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_autosave_interval(mut self, interval: Duration) -> Self {
        self.autosave_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn subscriber_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_millis(self.autosave_interval_ms.max(1))
    }
}
