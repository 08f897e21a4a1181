//! Tidelink Core Library
//!
//! Offline-first outbox sync and a proximity crew mesh.
//!
//! ## Overview
//!
//! Tidelink keeps a field crew coordinated when the network is unreliable.
//! Every local mutation is written to a durable outbox first and uploaded to
//! the remote authority whenever connectivity allows. Meanwhile nearby
//! devices exchange team state (positions, chat, completions) directly over
//! a short-range radio, with no server involved.
//!
//! ## Core Principles
//!
//! - **Durable first**: nothing is lost to a crash or a dead network
//! - **At-least-once upload**: the remote deduplicates by event ID
//! - **Convergent mesh**: peer messages may arrive late, twice, or relayed
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tidelink_core::{HttpRemote, LocalIdentity, TeamNode, TidelinkConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let remote = Arc::new(HttpRemote::new("https://api.example.com", timeout)?);
//!     let node = TeamNode::open(
//!         "~/.tidelink/data",
//!         LocalIdentity::new("ana", "Ana"),
//!         TidelinkConfig::default(),
//!         radio,
//!         remote,
//!         reachability,
//!     )?;
//!
//!     node.team().record_completion("task-42", Some(10)).await?;
//!     node.team().send_chat("Heading to the pier").await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod node;
pub mod outbox;
pub mod protocol;
pub mod sync;
pub mod team;
pub mod transport;
pub mod types;

// Re-exports
pub use config::{SyncConfig, TeamConfig, TidelinkConfig, TransportConfig};
pub use error::{DecodeError, FrameError, LinkError, OutboxError, Result, TidelinkError};
pub use node::{TeamNode, OUTBOX_FILE};
pub use outbox::{AppendOutcome, EntityKind, EventType, Operation, Outbox, SyncEvent};
pub use protocol::{MessageType, Payload, PeerMessage};
pub use sync::{
    CycleReport, HttpRemote, PushOutcome, RemoteEndpoint, SyncActivity, SyncManager, SyncStatus,
    SyncTrigger,
};
pub use team::{IngestOutcome, LocalIdentity, MeshSender, TeamCoordinator, TeamEvent};
pub use transport::{
    DisconnectReason, LinkEvent, MemoryRadio, NearbyDevice, ProximityLink, TransportAdapter,
};
pub use types::*;
