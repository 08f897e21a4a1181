//! Peer message types exchanged over the proximity mesh

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{now_millis, MessageId, Millis, Position, UserId};

/// Message type tag carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    /// Free-form direct text
    Text,
    /// A crew member completed a task
    TaskCompletion,
    /// A crew member checked into a bar crawl stop
    BarStopVisit,
    /// Live position update
    TeamLocation,
    /// Team chat line
    TeamChat,
    /// Roster membership change (join/leave)
    TeamUpdate,
    /// Ask a peer for a catch-up snapshot
    SyncRequest,
    /// Catch-up snapshot reply
    SyncResponse,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Text => "text",
            MessageType::TaskCompletion => "taskCompletion",
            MessageType::BarStopVisit => "barStopVisit",
            MessageType::TeamLocation => "teamLocation",
            MessageType::TeamChat => "teamChat",
            MessageType::TeamUpdate => "teamUpdate",
            MessageType::SyncRequest => "syncRequest",
            MessageType::SyncResponse => "syncResponse",
        };
        f.write_str(name)
    }
}

/// A completed task announced to the team
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionPayload {
    /// Unique completion ID (dedup key across re-announcements)
    pub completion_id: String,
    /// Task that was completed
    pub task_id: String,
    /// Crew member who completed it
    pub user_id: UserId,
    /// Points awarded, if scored
    #[serde(default)]
    pub points: Option<i64>,
    /// When the task was completed
    pub completed_at: Millis,
    /// Fields added by newer peers, carried through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A bar crawl stop check-in announced to the team
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitPayload {
    /// Unique visit ID (dedup key across re-announcements)
    pub visit_id: String,
    /// Stop that was visited
    pub stop_id: String,
    /// Crew member who checked in
    pub user_id: UserId,
    /// When the check-in happened
    pub visited_at: Millis,
    /// Fields added by newer peers, carried through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Live position of the sender
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationPayload {
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
    /// Horizontal accuracy in meters, when known
    #[serde(default)]
    pub accuracy_m: Option<f64>,
}

impl LocationPayload {
    /// Position carried by this payload
    pub fn position(&self) -> Position {
        Position::new(self.latitude, self.longitude)
    }
}

/// Join or leave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MembershipAction {
    /// Member joined the team
    Join,
    /// Member left the team
    Leave,
}

/// Roster membership change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipPayload {
    /// Member whose membership changed
    pub user_id: UserId,
    /// Display name at the time of the change
    pub display_name: String,
    /// Join or leave
    pub action: MembershipAction,
}

/// Catch-up request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestPayload {
    /// Only include chat newer than this, when set
    #[serde(default)]
    pub since: Option<Millis>,
}

/// Roster entry as carried in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRecord {
    /// Member ID
    pub user_id: UserId,
    /// Display name
    pub display_name: String,
    /// Last known position
    #[serde(default)]
    pub position: Option<Position>,
    /// Timestamp of the last position update (0 when none)
    pub location_updated_at: Millis,
    /// Whether the member is on the team
    pub active: bool,
    /// Timestamp of the last membership change (0 when none)
    pub membership_updated_at: Millis,
    /// When the snapshot sender last heard from this member (0 when unknown)
    #[serde(default)]
    pub last_heard: Millis,
}

/// Chat line as carried in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    /// Original message ID
    pub message_id: MessageId,
    /// Author ID
    pub sender_id: UserId,
    /// Author display name
    pub sender_name: String,
    /// Message text
    pub text: String,
    /// Author timestamp
    pub timestamp: Millis,
}

/// Completion or visit as carried in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CompletionRecord {
    /// Task completion
    Task(CompletionPayload),
    /// Bar stop visit
    Visit(VisitPayload),
}

/// Bulk team state sent in reply to a sync request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    /// Roster
    pub members: Vec<MemberRecord>,
    /// Recent chat, oldest first
    pub chat: Vec<ChatRecord>,
    /// Recent completions and visits
    pub completions: Vec<CompletionRecord>,
    /// When the snapshot was taken
    pub generated_at: Millis,
}

/// Type-specific message body.
///
/// Each known message type has its own variant; `Opaque` carries structured
/// data this build does not interpret so it can still be relayed.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// No structured body
    None,
    /// Task completion
    TaskCompletion(CompletionPayload),
    /// Bar stop visit
    BarStopVisit(VisitPayload),
    /// Position update
    TeamLocation(LocationPayload),
    /// Membership change
    TeamUpdate(MembershipPayload),
    /// Catch-up request
    SyncRequest(SyncRequestPayload),
    /// Catch-up snapshot
    SyncResponse(SnapshotPayload),
    /// Uninterpreted structured value
    Opaque(serde_json::Value),
}

/// A message exchanged between nearby devices.
///
/// Messages whose `expires_at` has passed must never be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerMessage {
    /// Sender-generated unique ID
    pub id: MessageId,
    /// Originating crew member
    pub sender_id: UserId,
    /// Originating crew member's display name
    pub sender_name: String,
    /// Addressee, or `None` for a broadcast
    pub receiver_id: Option<UserId>,
    /// Message type tag
    pub message_type: MessageType,
    /// Optional human-readable text
    pub content: Option<String>,
    /// Type-specific body
    pub payload: Payload,
    /// Sender timestamp (epoch millis)
    pub timestamp: Millis,
    /// Expiry (epoch millis), if any
    pub expires_at: Option<Millis>,
}

impl PeerMessage {
    /// Create a broadcast message stamped with the current time
    pub fn new(
        sender_id: UserId,
        sender_name: impl Into<String>,
        message_type: MessageType,
        payload: Payload,
    ) -> Self {
        Self {
            id: MessageId::new(),
            sender_id,
            sender_name: sender_name.into(),
            receiver_id: None,
            message_type,
            content: None,
            payload,
            timestamp: now_millis(),
            expires_at: None,
        }
    }

    /// Team chat line
    pub fn team_chat(sender_id: UserId, sender_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(sender_id, sender_name, MessageType::TeamChat, Payload::None).with_content(text)
    }

    /// Position update for the sender
    pub fn team_location(
        sender_id: UserId,
        sender_name: impl Into<String>,
        location: LocationPayload,
    ) -> Self {
        Self::new(
            sender_id,
            sender_name,
            MessageType::TeamLocation,
            Payload::TeamLocation(location),
        )
    }

    /// Task completion announcement
    pub fn task_completion(
        sender_id: UserId,
        sender_name: impl Into<String>,
        completion: CompletionPayload,
    ) -> Self {
        Self::new(
            sender_id,
            sender_name,
            MessageType::TaskCompletion,
            Payload::TaskCompletion(completion),
        )
    }

    /// Bar stop visit announcement
    pub fn bar_stop_visit(sender_id: UserId, sender_name: impl Into<String>, visit: VisitPayload) -> Self {
        Self::new(
            sender_id,
            sender_name,
            MessageType::BarStopVisit,
            Payload::BarStopVisit(visit),
        )
    }

    /// Set the addressee
    pub fn to(mut self, receiver_id: UserId) -> Self {
        self.receiver_id = Some(receiver_id);
        self
    }

    /// Set the text content
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Override the sender timestamp
    pub fn with_timestamp(mut self, timestamp: Millis) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set an absolute expiry time
    pub fn expires_at(mut self, expires_at: Millis) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the message has expired at `now`
    pub fn is_expired(&self, now: Millis) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether the message is addressed to everyone
    pub fn is_broadcast(&self) -> bool {
        self.receiver_id.is_none()
    }

    /// Whether `user` should act on this message
    pub fn is_for(&self, user: &UserId) -> bool {
        self.receiver_id.as_ref().map_or(true, |r| r == user)
    }
}
