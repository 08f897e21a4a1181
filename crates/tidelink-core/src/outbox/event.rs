//! Outbox event records
//!
//! A [`SyncEvent`] is one local (or peer-relayed) mutation that has not yet
//! been acknowledged by the remote authority.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{now_millis, EventId, Millis};

/// Kind of domain entity a mutation touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A crew member finished a challenge task
    TaskCompletion,
    /// A crew member checked into a bar crawl stop
    BarStopVisit,
    /// A geofence check-in at a location
    LocationCheckIn,
    /// A chat message destined for the shared team log
    ChatMessage,
    /// Join/leave of a team member
    TeamMembership,
    /// A task definition
    Task,
}

impl EntityKind {
    /// Stable snake_case name, also used as the scope of entity-derived event IDs
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::TaskCompletion => "task_completion",
            EntityKind::BarStopVisit => "bar_stop_visit",
            EntityKind::LocationCheckIn => "location_check_in",
            EntityKind::ChatMessage => "chat_message",
            EntityKind::TeamMembership => "team_membership",
            EntityKind::Task => "task",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_completion" => Ok(EntityKind::TaskCompletion),
            "bar_stop_visit" => Ok(EntityKind::BarStopVisit),
            "location_check_in" => Ok(EntityKind::LocationCheckIn),
            "chat_message" => Ok(EntityKind::ChatMessage),
            "team_membership" => Ok(EntityKind::TeamMembership),
            "task" => Ok(EntityKind::Task),
            other => Err(format!("unknown entity kind: {}", other)),
        }
    }
}

/// Mutation applied to an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Entity was created
    Create,
    /// Entity was modified
    Update,
    /// Entity was removed
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation: {}", other)),
        }
    }
}

/// Create/update/delete of a given entity kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventType {
    /// What was mutated
    pub entity: EntityKind,
    /// How it was mutated
    pub operation: Operation,
}

impl EventType {
    /// Create an event type
    pub fn new(entity: EntityKind, operation: Operation) -> Self {
        Self { entity, operation }
    }

    /// Shorthand for a create of `entity`
    pub fn create(entity: EntityKind) -> Self {
        Self::new(entity, Operation::Create)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.operation)
    }
}

impl FromStr for EventType {
    type Err = String;

    /// Parse `entity.operation`; a bare entity means `create`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((entity, operation)) => Ok(EventType::new(entity.parse()?, operation.parse()?)),
            None => Ok(EventType::create(s.parse()?)),
        }
    }
}

/// A pending mutation awaiting remote acknowledgement.
///
/// Once appended, only `sync_attempts` and `last_attempt_at` ever change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Unique event ID (outbox key)
    pub id: EventId,
    /// Entity kind and operation
    pub event_type: EventType,
    /// ID of the mutated entity
    pub entity_id: String,
    /// Opaque serialized mutation body
    pub payload: Vec<u8>,
    /// Creation time (ordering key)
    pub created_at: Millis,
    /// Number of completed push attempts
    pub sync_attempts: u32,
    /// Time of the last completed push attempt
    pub last_attempt_at: Option<Millis>,
}

impl SyncEvent {
    /// Create a new event stamped with the current time
    pub fn new(event_type: EventType, entity_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            entity_id: entity_id.into(),
            payload,
            created_at: now_millis(),
            sync_attempts: 0,
            last_attempt_at: None,
        }
    }

    /// Replace the generated ID
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    /// Replace the creation timestamp
    pub fn with_created_at(mut self, created_at: Millis) -> Self {
        self.created_at = created_at;
        self
    }

    /// Encode for storage
    pub(crate) fn to_record(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode from storage
    pub(crate) fn from_record(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}
