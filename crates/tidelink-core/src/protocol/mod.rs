//! Peer message protocol
//!
//! Typed messages exchanged between nearby crew devices, their wire encoding,
//! and the receive-side gate that drops duplicates and expired messages.
//!
//! ## Message Flow
//!
//! ```text
//! Device A                                   Device B
//!   |                                           |
//!   |-- teamLocation / teamChat (broadcast) --->|  merge: LWW roster, chat timeline
//!   |-- taskCompletion (broadcast) ------------>|  merge + queue in outbox
//!   |                                           |
//!   |     (B reconnects after a gap)            |
//!   |<-- syncRequest ---------------------------|
//!   |--- syncResponse {roster, chat, done} ---->|  merge with the same LWW rules
//! ```
//!
//! Decoding never panics: malformed bytes produce a [`DecodeError`] which the
//! caller logs before moving on to the next message.
//!
//! [`DecodeError`]: crate::error::DecodeError

pub mod codec;
pub mod filter;
pub mod message;

pub use codec::WIRE_VERSION;
pub use filter::{DropReason, IngestFilter, RecentlySeen};
pub use message::{
    ChatRecord, CompletionPayload, CompletionRecord, LocationPayload, MemberRecord,
    MembershipAction, MembershipPayload, MessageType, Payload, PeerMessage, SnapshotPayload,
    SyncRequestPayload, VisitPayload,
};
