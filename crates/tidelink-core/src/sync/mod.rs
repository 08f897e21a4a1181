//! Outbox upload to the remote backend
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Outbox (redb)  ──pending()──►  SyncManager  ──push()──►  Remote │
//! │       ▲                            │                            │
//! │       └──── remove / markAttempted ┘                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each pending event gets one of three answers from the [`RemoteEndpoint`]:
//! acknowledged (deleted locally), rejected (deleted and reported), or
//! transient (kept, cycle stopped, retried with exponential backoff).

pub mod backoff;
pub mod manager;
pub mod remote;
pub mod status;

pub use backoff::Backoff;
pub use manager::{CycleReport, SyncManager};
pub use remote::{classify_response, HttpRemote, PushOutcome, RemoteEndpoint};
pub use status::{SyncActivity, SyncStatus, SyncTrigger};
