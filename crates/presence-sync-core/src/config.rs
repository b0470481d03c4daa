//! Session configuration.
//!
//! Every tunable has a default so a config file only needs to name the
//! values it changes:
//!
//! ```json
//! { "ackTimeoutMs": 500, "maxRetries": 5, "telemetry": false }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::types::{ClientId, Role, SessionId};

/// Default base retransmission timeout
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 1_000;
/// Default retransmission budget per delta
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default presence heartbeat period
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
/// Default full-snapshot period (Authority only)
pub const DEFAULT_SNAPSHOT_INTERVAL_MS: u64 = 15_000;
/// Default outgoing cursor rate cap
pub const DEFAULT_CURSOR_FPS: u32 = 20;
/// Default scroll broadcast throttle window
pub const DEFAULT_SCROLL_THROTTLE_MS: u64 = 100;
/// Default capacity of the recent-delta ring
pub const DEFAULT_HISTORY_SIZE: usize = 50;
/// Delay before a fresh Replica asks for its bootstrap snapshot
pub const DEFAULT_BOOTSTRAP_DELAY_MS: u64 = 250;
/// Age after which an unrefreshed cursor is pruned
pub const DEFAULT_CURSOR_TTL_MS: u64 = 5_000;
/// Envelopes above this size are flagged
pub const DEFAULT_MAX_ENVELOPE_BYTES: usize = 8 * 1024;

/// Protocol tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Base retransmission timeout; attempt `n` waits `ack_timeout * 2^(n-1)`
    pub ack_timeout_ms: u64,
    /// Retransmissions allowed after the original send
    pub max_retries: u32,
    pub heartbeat_interval_ms: u64,
    pub snapshot_interval_ms: u64,
    pub cursor_fps: u32,
    pub scroll_throttle_ms: u64,
    /// Capacity of the recent-delta ring
    pub history_size: usize,
    /// Publish diagnostic events to subscribers
    pub telemetry: bool,
    pub bootstrap_delay_ms: u64,
    pub cursor_ttl_ms: u64,
    pub max_envelope_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            snapshot_interval_ms: DEFAULT_SNAPSHOT_INTERVAL_MS,
            cursor_fps: DEFAULT_CURSOR_FPS,
            scroll_throttle_ms: DEFAULT_SCROLL_THROTTLE_MS,
            history_size: DEFAULT_HISTORY_SIZE,
            telemetry: true,
            bootstrap_delay_ms: DEFAULT_BOOTSTRAP_DELAY_MS,
            cursor_ttl_ms: DEFAULT_CURSOR_TTL_MS,
            max_envelope_bytes: DEFAULT_MAX_ENVELOPE_BYTES,
        }
    }
}

impl SyncConfig {
    /// Parse from a JSON document; missing keys take defaults.
    pub fn from_json_str(json: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Reject values that would make timers spin or divide by zero.
    pub fn validate(&self) -> SyncResult<()> {
        let positive = [
            ("ackTimeoutMs", self.ack_timeout_ms),
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("snapshotIntervalMs", self.snapshot_interval_ms),
            ("cursorFps", u64::from(self.cursor_fps)),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SyncError::InvalidConfig(format!("{} must be > 0", name)));
            }
        }
        Ok(())
    }

    pub fn with_ack_timeout_ms(mut self, ms: u64) -> Self {
        self.ack_timeout_ms = ms;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_snapshot_interval_ms(mut self, ms: u64) -> Self {
        self.snapshot_interval_ms = ms;
        self
    }

    pub fn with_cursor_fps(mut self, fps: u32) -> Self {
        self.cursor_fps = fps;
        self
    }

    pub fn with_scroll_throttle_ms(mut self, ms: u64) -> Self {
        self.scroll_throttle_ms = ms;
        self
    }

    pub fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = size;
        self
    }

    pub fn with_telemetry(mut self, enabled: bool) -> Self {
        self.telemetry = enabled;
        self
    }

    pub fn with_bootstrap_delay_ms(mut self, ms: u64) -> Self {
        self.bootstrap_delay_ms = ms;
        self
    }

    pub fn with_cursor_ttl_ms(mut self, ms: u64) -> Self {
        self.cursor_ttl_ms = ms;
        self
    }

    pub fn with_max_envelope_bytes(mut self, bytes: usize) -> Self {
        self.max_envelope_bytes = bytes;
        self
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn scroll_throttle(&self) -> Duration {
        Duration::from_millis(self.scroll_throttle_ms)
    }

    pub fn bootstrap_delay(&self) -> Duration {
        Duration::from_millis(self.bootstrap_delay_ms)
    }

    /// Minimum spacing between outgoing cursor frames
    pub fn cursor_interval(&self) -> Duration {
        Duration::from_millis(1_000 / u64::from(self.cursor_fps.max(1)))
    }
}

/// Everything `SyncSession::init` binds: who we are, where, and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub role: Role,
    pub client_id: ClientId,
    pub session_id: SessionId,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl SessionConfig {
    pub fn new(role: Role, client_id: impl Into<ClientId>, session_id: SessionId) -> Self {
        Self {
            role,
            client_id: client_id.into(),
            session_id,
            sync: SyncConfig::default(),
        }
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Required identity fields must be present.
    pub fn validate(&self) -> SyncResult<()> {
        if self.client_id.as_str().is_empty() {
            return Err(SyncError::InvalidConfig("clientId is required".into()));
        }
        if self.session_id.as_str().is_empty() {
            return Err(SyncError::InvalidConfig("sessionId is required".into()));
        }
        self.sync.validate()
    }
}
