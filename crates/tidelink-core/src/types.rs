//! Core identifier types for Tidelink
//!
//! Entities refer to each other through these stable identifiers and indexed
//! lookups in the owning store, never through direct object references.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Milliseconds since the Unix epoch.
///
/// All timestamps that cross a device boundary use absolute epoch values so
/// that clocks on different devices stay comparable.
pub type Millis = i64;

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> Millis {
    chrono::Utc::now().timestamp_millis()
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the identifier as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of a physical radio device seen by the transport
    DeviceId
);

string_id!(
    /// Identifier of a crew member (team roster key)
    UserId
);

string_id!(
    /// Sender-generated identifier of a peer message
    MessageId
);

string_id!(
    /// Identifier of a queued outbox event
    EventId
);

impl MessageId {
    /// Create a new time-ordered message ID
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl EventId {
    /// Create a new time-ordered event ID
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Deterministic ID for an event about a specific entity.
    ///
    /// A completion announced by several peers, or re-announced after a
    /// restart, maps to the same outbox key and is therefore queued once.
    pub fn for_entity(scope: &str, entity_id: &str) -> Self {
        Self(format!("{}:{}", scope, entity_id))
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// A geographic position fix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
}

impl Position {
    /// Create a position from latitude/longitude degrees
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_are_unique() {
        let a = MessageId::new();
        let b = MessageId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_entity_event_id_is_deterministic() {
        let a = EventId::for_entity("task_completion", "42");
        let b = EventId::for_entity("task_completion", "42");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "task_completion:42");
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = UserId::from("bosun");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"bosun\"");
    }
}
