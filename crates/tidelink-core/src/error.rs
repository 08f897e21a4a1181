//! Error types for Tidelink
//!
//! Each layer owns a focused error enum; [`TidelinkError`] aggregates them for
//! callers that drive several layers at once (the node assembly and the CLI).

use std::io::ErrorKind;

use thiserror::Error;

use crate::protocol::MessageType;
use crate::types::DeviceId;

/// Errors from the durable outbox log
#[derive(Error, Debug)]
pub enum OutboxError {
    /// The underlying storage has no room left for the write
    #[error("Storage exhausted: {0}")]
    StorageExhausted(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OutboxError {
    /// Whether this error means the disk is full.
    pub fn is_storage_full(&self) -> bool {
        let storage = match self {
            OutboxError::StorageExhausted(_) => return true,
            OutboxError::Io(e) => return e.kind() == ErrorKind::StorageFull,
            OutboxError::StorageOp(e) => Some(e),
            OutboxError::Commit(redb::CommitError::Storage(e)) => Some(e),
            OutboxError::Transaction(redb::TransactionError::Storage(e)) => Some(e),
            OutboxError::Table(redb::TableError::Storage(e)) => Some(e),
            _ => None,
        };
        matches!(storage, Some(redb::StorageError::Io(e)) if e.kind() == ErrorKind::StorageFull)
    }

    /// Promote disk-full failures to [`OutboxError::StorageExhausted`].
    pub(crate) fn classify(self) -> Self {
        if self.is_storage_full() && !matches!(self, OutboxError::StorageExhausted(_)) {
            OutboxError::StorageExhausted(self.to_string())
        } else {
            self
        }
    }
}

/// Errors from the proximity link and transport adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// No open connection to this peer
    #[error("Peer not connected: {0}")]
    NotConnected(DeviceId),

    /// The device was never sighted or has been evicted
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    /// Connection establishment did not finish in time
    #[error("Connection to {0} timed out")]
    ConnectTimeout(DeviceId),

    /// The link or adapter has shut down
    #[error("Link closed")]
    Closed,

    /// Failure reported by the radio below the link abstraction
    #[error("Radio error: {0}")]
    Radio(String),

    /// Outbound payload could not be framed
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Errors while splitting or reassembling link frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame shorter than its header
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    /// Unknown frame kind byte
    #[error("Unknown frame kind: {0:#04x}")]
    UnknownKind(u8),

    /// Chunk index outside of the declared total
    #[error("Chunk index {index} out of range for total {total}")]
    IndexOutOfRange {
        /// Received chunk index
        index: u16,
        /// Declared chunk count
        total: u16,
    },

    /// Message would need more chunks than allowed
    #[error("Message needs {0} chunks, above the limit")]
    TooManyChunks(usize),

    /// The link MTU leaves no room for chunk data
    #[error("MTU {0} is too small for the frame header")]
    MtuTooSmall(usize),
}

/// Errors while decoding a peer message from the wire
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Bytes are not a well-formed message (bad JSON, missing field, unknown type tag)
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Wire version from a newer (or corrupted) sender
    #[error("Wire version {0} is not supported")]
    UnsupportedVersion(u8),

    /// Payload does not match the schema of its message type
    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload {
        /// Declared message type
        kind: MessageType,
        /// Why the payload was rejected
        reason: String,
    },
}

/// Main error type for Tidelink operations
#[derive(Error, Debug)]
pub enum TidelinkError {
    /// Outbox failure
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    /// Proximity link failure
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Peer message decode failure
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Remote endpoint failure outside of a sync cycle
    #[error("Remote error: {0}")]
    Remote(String),
}

/// Result type alias using TidelinkError
pub type Result<T> = std::result::Result<T, TidelinkError>;
