//! Runtime configuration
//!
//! Every timeout and capacity used by the outbox sync, the transport and the
//! team coordinator lives here. Durations are stored in milliseconds so the
//! config file stays readable; accessors hand out [`Duration`]s.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TidelinkError;

/// Top-level configuration for a Tidelink node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TidelinkConfig {
    /// Outbox flushing against the remote authority
    pub sync: SyncConfig,
    /// Proximity link behaviour
    pub transport: TransportConfig,
    /// Team state merging
    pub team: TeamConfig,
}

impl TidelinkConfig {
    /// Load a config from a JSON file.
    ///
    /// Missing fields fall back to their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TidelinkError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TidelinkError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| TidelinkError::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Configuration for the sync manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound on a single remote push
    pub push_timeout_ms: u64,
    /// First retry delay after a transient failure
    pub backoff_base_ms: u64,
    /// Maximum retry delay
    pub backoff_cap_ms: u64,
    /// Consecutive transient failures before the status reports an error
    pub max_transient_failures: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_timeout_ms: 10_000,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            max_transient_failures: 3,
        }
    }
}

impl SyncConfig {
    /// Push timeout as a Duration
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    /// First backoff delay as a Duration
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Backoff ceiling as a Duration
    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

/// Configuration for the transport adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Interval between advertise/scan rounds
    pub scan_interval_ms: u64,
    /// Upper bound on connection establishment
    pub connect_timeout_ms: u64,
    /// Minimum time between connect attempts to the same device
    pub reconnect_interval_ms: u64,
    /// Devices not sighted for this long are evicted
    pub device_timeout_ms: u64,
    /// Incomplete reassembly buffers are discarded after this long
    pub reassembly_timeout_ms: u64,
    /// Smoothed signal strength (dBm) needed before connecting
    pub connect_threshold_dbm: f64,
    /// Weight of a new raw sample in the signal moving average (0..=1)
    pub signal_smoothing: f64,
    /// Largest number of chunks a single message may span
    pub max_chunks_per_message: u16,
    /// Capacity of the inbound message channel
    pub inbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 2_000,
            connect_timeout_ms: 5_000,
            reconnect_interval_ms: 10_000,
            device_timeout_ms: 30_000,
            reassembly_timeout_ms: 15_000,
            connect_threshold_dbm: -85.0,
            signal_smoothing: 0.3,
            max_chunks_per_message: 1_024,
            inbound_capacity: 256,
        }
    }
}

impl TransportConfig {
    /// Scan interval as a Duration
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Connect timeout as a Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reconnect interval as a Duration
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Device timeout as a Duration
    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }

    /// Reassembly timeout as a Duration
    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }
}

/// Configuration for the team coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamConfig {
    /// Roster entries without a refresh for this long are evicted
    pub stale_after_ms: i64,
    /// How often the roster is swept for stale entries
    pub eviction_interval_ms: u64,
    /// Chat timeline capacity (oldest dropped)
    pub chat_capacity: usize,
    /// Recent completions kept for display and snapshots
    pub completions_capacity: usize,
    /// Recently-seen message id cache capacity
    pub dedup_capacity: usize,
    /// Chat messages included in a catch-up snapshot
    pub snapshot_chat_limit: usize,
    /// Forward accepted broadcasts to other connected peers
    pub relay_broadcasts: bool,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 15 * 60 * 1_000,
            eviction_interval_ms: 30_000,
            chat_capacity: 500,
            completions_capacity: 200,
            dedup_capacity: 2_048,
            snapshot_chat_limit: 100,
            relay_broadcasts: true,
        }
    }
}

impl TeamConfig {
    /// Eviction sweep interval as a Duration
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms)
    }
}
