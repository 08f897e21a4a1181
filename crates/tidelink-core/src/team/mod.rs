//! Team coordination over the proximity mesh
//!
//! Holds the local view of the crew: who is on the team and where they are,
//! the shared chat timeline, and the recent task completions and bar stop
//! visits. Every piece of state converges regardless of the order or number
//! of times peer messages arrive.

pub mod chat;
pub mod completions;
pub mod coordinator;
pub mod roster;

pub use chat::ChatTimeline;
pub use completions::CompletionLog;
pub use coordinator::{IngestOutcome, LocalIdentity, MeshSender, TeamCoordinator, TeamEvent};
pub use roster::{Roster, TeamMember};
