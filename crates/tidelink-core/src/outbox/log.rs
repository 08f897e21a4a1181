//! Durable outbox log backed by redb.
//!
//! Two tables:
//! - `outbox_events`: event ID → postcard-encoded [`SyncEvent`]
//! - `outbox_order`: (created_at, event ID) → () ordering index
//!
//! Writers are serialized by a mutex in addition to redb's own single-writer
//! rule, so read-modify-write operations such as `mark_attempted` observe a
//! single consistent order. Readers use redb read transactions and therefore
//! see a snapshot.

use std::collections::VecDeque;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use redb::{
    Database, ReadOnlyTable, ReadableTable, ReadableTableMetadata, StorageBackend, TableDefinition,
};
use tokio::sync::watch;
use tracing::{debug, error};

use super::event::SyncEvent;
use crate::error::OutboxError;
use crate::types::{now_millis, EventId, Millis};

const EVENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("outbox_events");
const ORDER_INDEX: TableDefinition<(i64, &str), ()> = TableDefinition::new("outbox_order");

/// Events loaded per page while iterating `pending()`
const PENDING_BATCH: usize = 64;

/// Result of appending to the outbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The event was stored
    Appended,
    /// An event with the same ID is already queued; nothing changed
    Duplicate,
}

/// Append-only log of mutations awaiting remote acknowledgement
#[derive(Clone)]
pub struct Outbox {
    db: Arc<Database>,
    writer: Arc<Mutex<()>>,
    pending_tx: Arc<watch::Sender<usize>>,
}

impl Outbox {
    /// Open (or create) the outbox database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OutboxError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create an outbox that lives only in memory.
    pub fn in_memory() -> Result<Self, OutboxError> {
        Self::with_backend(redb::backends::InMemoryBackend::new())
    }

    /// Create an outbox over a custom redb storage backend.
    pub fn with_backend(backend: impl StorageBackend) -> Result<Self, OutboxError> {
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self, OutboxError> {
        let write_txn = db.begin_write()?;
        let count = {
            let events = write_txn.open_table(EVENTS_TABLE)?;
            let _ = write_txn.open_table(ORDER_INDEX)?;
            events.len()? as usize
        };
        write_txn.commit()?;

        debug!(pending = count, "Outbox opened");
        let (pending_tx, _) = watch::channel(count);
        Ok(Self {
            db: Arc::new(db),
            writer: Arc::new(Mutex::new(())),
            pending_tx: Arc::new(pending_tx),
        })
    }

    /// Store a new event.
    ///
    /// Appending an ID that is already queued is a no-op. A full disk is
    /// reported as [`OutboxError::StorageExhausted`] and never retried here.
    pub fn append(&self, event: &SyncEvent) -> Result<AppendOutcome, OutboxError> {
        let result = self.append_inner(event).map_err(OutboxError::classify);
        match &result {
            Ok(AppendOutcome::Appended) => {
                debug!(event_id = %event.id, event_type = %event.event_type, "Queued outbox event")
            }
            Ok(AppendOutcome::Duplicate) => {
                debug!(event_id = %event.id, "Outbox event already queued")
            }
            Err(e) if e.is_storage_full() => {
                error!(event_id = %event.id, error = %e, "Outbox storage exhausted")
            }
            Err(_) => {}
        }
        result
    }

    fn append_inner(&self, event: &SyncEvent) -> Result<AppendOutcome, OutboxError> {
        let record = event
            .to_record()
            .map_err(|e| OutboxError::Serialization(e.to_string()))?;

        let _guard = self.writer.lock();
        let write_txn = self.db.begin_write()?;
        let count = {
            let mut events = write_txn.open_table(EVENTS_TABLE)?;
            let exists = events.get(event.id.as_str())?.is_some();
            if exists {
                None
            } else {
                let mut order = write_txn.open_table(ORDER_INDEX)?;
                events.insert(event.id.as_str(), record.as_slice())?;
                order.insert((event.created_at, event.id.as_str()), ())?;
                Some(events.len()? as usize)
            }
        };

        match count {
            Some(count) => {
                write_txn.commit()?;
                self.pending_tx.send_replace(count);
                Ok(AppendOutcome::Appended)
            }
            None => {
                write_txn.abort()?;
                Ok(AppendOutcome::Duplicate)
            }
        }
    }

    /// Load a single event by ID
    pub fn get(&self, id: &EventId) -> Result<Option<SyncEvent>, OutboxError> {
        let read_txn = self.db.begin_read()?;
        let events = read_txn.open_table(EVENTS_TABLE)?;
        match events.get(id.as_str())? {
            Some(raw) => Ok(Some(decode(raw.value())?)),
            None => Ok(None),
        }
    }

    /// Lazily iterate pending events, oldest first.
    ///
    /// The iterator reads from a snapshot taken now; events appended later
    /// are not visible to it. Call again to restart from the head.
    pub fn pending(&self) -> Result<PendingEvents, OutboxError> {
        let read_txn = self.db.begin_read()?;
        Ok(PendingEvents {
            events: read_txn.open_table(EVENTS_TABLE)?,
            order: read_txn.open_table(ORDER_INDEX)?,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    /// Number of events awaiting acknowledgement
    pub fn pending_count(&self) -> Result<usize, OutboxError> {
        let read_txn = self.db.begin_read()?;
        let events = read_txn.open_table(EVENTS_TABLE)?;
        Ok(events.len()? as usize)
    }

    /// Subscribe to the pending count; updated after every write.
    pub fn watch_pending(&self) -> watch::Receiver<usize> {
        self.pending_tx.subscribe()
    }

    /// Record a completed push attempt for `id`.
    ///
    /// Returns `false` when the event is no longer queued.
    pub fn mark_attempted(&self, id: &EventId) -> Result<bool, OutboxError> {
        self.mark_attempted_at(id, now_millis())
    }

    pub(crate) fn mark_attempted_at(&self, id: &EventId, at: Millis) -> Result<bool, OutboxError> {
        let _guard = self.writer.lock();
        let write_txn = self.db.begin_write()?;
        let found = {
            let mut events = write_txn.open_table(EVENTS_TABLE)?;
            let existing = match events.get(id.as_str())? {
                Some(raw) => Some(decode(raw.value())?),
                None => None,
            };
            match existing {
                Some(mut event) => {
                    event.sync_attempts = event.sync_attempts.saturating_add(1);
                    event.last_attempt_at = Some(at);
                    let record = event
                        .to_record()
                        .map_err(|e| OutboxError::Serialization(e.to_string()))?;
                    events.insert(id.as_str(), record.as_slice())?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(found)
    }

    /// Delete an acknowledged (or permanently rejected) event.
    ///
    /// Removing an ID that is not queued is a no-op and returns `false`.
    pub fn remove(&self, id: &EventId) -> Result<bool, OutboxError> {
        let _guard = self.writer.lock();
        let write_txn = self.db.begin_write()?;
        let (removed, count) = {
            let mut events = write_txn.open_table(EVENTS_TABLE)?;
            let existing = match events.remove(id.as_str())? {
                Some(raw) => Some(decode(raw.value())?),
                None => None,
            };
            if let Some(event) = &existing {
                let mut order = write_txn.open_table(ORDER_INDEX)?;
                order.remove((event.created_at, event.id.as_str()))?;
            }
            (existing.is_some(), events.len()? as usize)
        };
        write_txn.commit()?;
        if removed {
            debug!(event_id = %id, "Removed outbox event");
            self.pending_tx.send_replace(count);
        }
        Ok(removed)
    }
}

fn decode(bytes: &[u8]) -> Result<SyncEvent, OutboxError> {
    SyncEvent::from_record(bytes).map_err(|e| OutboxError::Serialization(e.to_string()))
}

/// Snapshot iterator over pending events in creation order.
///
/// Pages through the ordering index so only a bounded number of events is
/// decoded at a time.
pub struct PendingEvents {
    events: ReadOnlyTable<&'static str, &'static [u8]>,
    order: ReadOnlyTable<(i64, &'static str), ()>,
    cursor: Option<(i64, String)>,
    buffer: VecDeque<SyncEvent>,
    exhausted: bool,
}

impl PendingEvents {
    fn refill(&mut self) -> Result<(), OutboxError> {
        let keys = {
            let range = match &self.cursor {
                Some((ts, id)) => self.order.range::<(i64, &str)>((
                    Bound::Excluded((*ts, id.as_str())),
                    Bound::Unbounded,
                ))?,
                None => self.order.range::<(i64, &str)>(..)?,
            };
            let mut keys = Vec::with_capacity(PENDING_BATCH);
            for entry in range.take(PENDING_BATCH) {
                let (key, _) = entry?;
                let (ts, id) = key.value();
                keys.push((ts, id.to_string()));
            }
            keys
        };

        if keys.len() < PENDING_BATCH {
            self.exhausted = true;
        }
        for (ts, id) in keys {
            if let Some(raw) = self.events.get(id.as_str())? {
                self.buffer.push_back(decode(raw.value())?);
            }
            self.cursor = Some((ts, id));
        }
        Ok(())
    }
}

impl Iterator for PendingEvents {
    type Item = Result<SyncEvent, OutboxError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.refill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
