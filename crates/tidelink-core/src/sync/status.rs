//! Sync status and activity events
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncStatus: outbox upload state                                │
//! │  ├── Idle: Nothing running, queue may be non-empty              │
//! │  ├── Syncing: A cycle is pushing events                         │
//! │  ├── Synced: Last cycle drained the queue                       │
//! │  ├── Offline: Remote unreachable                                │
//! │  └── Error: Last cycle ended in a failure                       │
//! │                                                                 │
//! │  SyncActivity: per-event notifications                          │
//! │  ├── Pushed / Rejected / Deferred                               │
//! │  └── CycleFinished                                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::time::Duration;

use crate::types::EventId;

/// State of the outbox upload machinery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SyncStatus {
    /// Not syncing
    #[default]
    Idle,
    /// A sync cycle is in flight
    Syncing,
    /// The outbox was drained by the last cycle
    Synced,
    /// The remote is unreachable
    Offline,
    /// The last cycle failed or had a rejection
    Error(String),
}

impl SyncStatus {
    /// Whether a cycle is in flight
    pub fn is_syncing(&self) -> bool {
        matches!(self, SyncStatus::Syncing)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "Idle"),
            SyncStatus::Syncing => write!(f, "Syncing"),
            SyncStatus::Synced => write!(f, "Synced"),
            SyncStatus::Offline => write!(f, "Offline"),
            SyncStatus::Error(msg) => write!(f, "Error: {}", msg),
        }
    }
}

/// What caused a sync cycle to be requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Reachability came back
    Reachability,
    /// The host returned to foreground
    Foreground,
    /// Explicit user request
    Force,
    /// Backoff timer fired
    Retry,
    /// A local event was appended while online
    Appended,
}

impl SyncTrigger {
    /// Whether the trigger must wait out a scheduled backoff retry
    pub fn waits_for_backoff(&self) -> bool {
        matches!(self, SyncTrigger::Appended)
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTrigger::Reachability => write!(f, "reachability"),
            SyncTrigger::Foreground => write!(f, "foreground"),
            SyncTrigger::Force => write!(f, "force"),
            SyncTrigger::Retry => write!(f, "retry"),
            SyncTrigger::Appended => write!(f, "appended"),
        }
    }
}

/// Notifications emitted while cycles run
#[derive(Debug, Clone, PartialEq)]
pub enum SyncActivity {
    /// The remote acknowledged an event
    Pushed {
        /// Acknowledged event
        event_id: EventId,
    },
    /// The remote permanently rejected an event
    Rejected {
        /// Rejected event
        event_id: EventId,
        /// Reason given by the remote
        reason: String,
    },
    /// A transient failure stopped the cycle
    Deferred {
        /// Event that could not be pushed
        event_id: EventId,
        /// Failure description
        reason: String,
        /// Delay before the automatic retry
        retry_in: Duration,
    },
    /// A cycle ended
    CycleFinished {
        /// Events acknowledged in this cycle
        pushed: usize,
        /// Events rejected in this cycle
        rejected: usize,
        /// Events still queued
        remaining: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_status_default_is_idle() {
        let status: SyncStatus = Default::default();
        assert_eq!(status, SyncStatus::Idle);
    }

    #[test]
    fn test_sync_status_display() {
        assert_eq!(format!("{}", SyncStatus::Synced), "Synced");
        assert_eq!(
            format!("{}", SyncStatus::Error("invalid points value".to_string())),
            "Error: invalid points value"
        );
    }

    #[test]
    fn test_is_syncing() {
        assert!(SyncStatus::Syncing.is_syncing());
        assert!(!SyncStatus::Offline.is_syncing());
        assert!(!SyncStatus::Error("x".into()).is_syncing());
    }
}
