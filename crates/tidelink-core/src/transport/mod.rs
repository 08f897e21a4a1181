//! Proximity transport
//!
//! Device discovery and connection management over a short-range radio
//! abstracted by [`ProximityLink`]. Messages are framed to the link MTU on the
//! way out and reassembled per peer on the way in.

pub mod adapter;
pub mod device;
pub mod framing;
pub mod link;
pub mod memory;

pub use adapter::{DisconnectReason, InboundMessage, LinkEvent, TransportAdapter};
pub use device::{ConnectionState, NearbyDevice};
pub use framing::{Frame, Reassembler};
pub use link::{LinkConnection, ProximityLink, Sighting};
pub use memory::{MemoryLink, MemoryRadio};
