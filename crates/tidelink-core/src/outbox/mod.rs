//! Durable outbox of local mutations
//!
//! The outbox is the single source of truth for "what has not yet reached
//! the remote authority". Every local mutation lands here first; peer-sourced
//! completions and visits accepted by the team coordinator land here too.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Outbox                                                         │
//! │  ├── append(event)        always, idempotent by event id        │
//! │  ├── pending()            snapshot, oldest first, paged         │
//! │  ├── mark_attempted(id)   attempts + last attempt time          │
//! │  └── remove(id)           after ack or permanent reject         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod event;
pub mod log;
#[cfg(test)]
pub(crate) mod testing;

pub use event::{EntityKind, EventType, Operation, SyncEvent};
pub use log::{AppendOutcome, Outbox, PendingEvents};
