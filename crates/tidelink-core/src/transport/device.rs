//! Nearby device records
//!
//! A [`NearbyDevice`] is a physical connection candidate seen by the radio.
//! It is not team membership: the same crew member may move between devices,
//! and a device may be sighted long before anyone on it says hello.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{DeviceId, Millis, UserId};

/// Connection lifecycle of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Sighted, no connection
    Discovered,
    /// Connection attempt in flight
    Connecting,
    /// Link open
    Connected,
    /// Teardown in progress
    Disconnecting,
    /// Link closed (explicitly or lost)
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Discovered => write!(f, "discovered"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A device in radio range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyDevice {
    /// Radio-level device ID
    pub id: DeviceId,
    /// Advertised name
    pub name: String,
    /// Smoothed signal strength (dBm)
    pub signal: f64,
    /// Connection lifecycle state
    pub state: ConnectionState,
    /// Last sighting (epoch millis)
    pub last_seen: Millis,
    /// Crew member known to be using this device
    pub linked_user: Option<UserId>,
}

impl NearbyDevice {
    /// Record a first sighting
    pub fn new(id: DeviceId, name: impl Into<String>, rssi: f64, seen_at: Millis) -> Self {
        Self {
            id,
            name: name.into(),
            signal: rssi,
            state: ConnectionState::Discovered,
            last_seen: seen_at,
            linked_user: None,
        }
    }

    /// Whether the link is open
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Fold a raw signal sample into the moving average.
    ///
    /// `weight` is the share given to the new sample; smaller values react
    /// slower and keep the metric from flapping around the connect threshold.
    pub fn observe_signal(&mut self, rssi: f64, weight: f64) {
        let weight = weight.clamp(0.0, 1.0);
        self.signal = weight * rssi + (1.0 - weight) * self.signal;
    }

    /// Whether a connection may be attempted from the current state
    pub fn can_connect(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Discovered | ConnectionState::Disconnected
        )
    }
}
