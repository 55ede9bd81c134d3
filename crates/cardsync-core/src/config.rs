//! Session configuration
//!
//! Every tunable of the protocol lives here. Defaults match the values the
//! wire protocol was designed around; hosts usually only touch the timing
//! fields.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Binary chunk payload size: the largest size known to pass every transport
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Outstanding bytes on the binary channel above which senders suspend
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

/// Tunables for a sync session.
///
/// Durations are stored as milliseconds so the config round-trips through
/// plain JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub chunk_size: usize,
    pub high_water_mark: usize,
    /// Senders resume once buffered bytes drop to this level
    pub buffered_low_threshold: usize,
    /// Control messages queued before the channel opens
    pub control_queue_limit: usize,
    pub max_control_frame: usize,
    /// Bytes of binary chunks held while waiting for their `chunk_start`
    pub max_pending_chunk_bytes: usize,
    pub gathering_timeout_ms: u64,
    pub negotiation_timeout_ms: u64,
    pub handshake_validity_secs: i64,
    pub heartbeat_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub max_probe_attempts: u32,
    pub role_deny_revert_ms: u64,
    pub role_request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            buffered_low_threshold: DEFAULT_HIGH_WATER_MARK,
            control_queue_limit: 256,
            max_control_frame: 1024 * 1024,
            max_pending_chunk_bytes: 4 * 1024 * 1024,
            gathering_timeout_ms: 10_000,
            negotiation_timeout_ms: 30_000,
            handshake_validity_secs: 600,
            heartbeat_interval_ms: 5_000,
            pong_timeout_ms: 15_000,
            probe_interval_ms: 2_000,
            max_probe_attempts: 3,
            role_deny_revert_ms: 3_000,
            role_request_timeout_ms: 30_000,
        }
    }
}

impl SyncConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&data)
            .map_err(|e| SyncError::Serialization(format!("Invalid config: {}", e)))
    }

    /// Reject configs the protocol cannot run with
    pub fn validate(&self) -> SyncResult<()> {
        if self.chunk_size == 0 || self.chunk_size > DEFAULT_CHUNK_SIZE {
            return Err(SyncError::InvalidOperation(format!(
                "chunk_size must be 1..={}",
                DEFAULT_CHUNK_SIZE
            )));
        }
        if self.buffered_low_threshold > self.high_water_mark {
            return Err(SyncError::InvalidOperation(
                "buffered_low_threshold must not exceed high_water_mark".into(),
            ));
        }
        if self.pong_timeout_ms <= self.heartbeat_interval_ms {
            return Err(SyncError::InvalidOperation(
                "pong_timeout must be longer than heartbeat_interval".into(),
            ));
        }
        Ok(())
    }

    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.gathering_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn role_deny_revert(&self) -> Duration {
        Duration::from_millis(self.role_deny_revert_ms)
    }

    pub fn role_request_timeout(&self) -> Duration {
        Duration::from_millis(self.role_request_timeout_ms)
    }
}
