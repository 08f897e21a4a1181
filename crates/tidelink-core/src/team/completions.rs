//! Recently recorded task completions and bar stop visits

use std::collections::VecDeque;

use crate::outbox::EntityKind;
use crate::protocol::{CompletionRecord, RecentlySeen};

impl CompletionRecord {
    /// Entity kind and ID that identify this record across re-announcements
    pub fn entity_key(&self) -> (EntityKind, &str) {
        match self {
            CompletionRecord::Task(c) => (EntityKind::TaskCompletion, c.completion_id.as_str()),
            CompletionRecord::Visit(v) => (EntityKind::BarStopVisit, v.visit_id.as_str()),
        }
    }
}

/// Dedup-by-entity log of completions with a bounded display list
#[derive(Debug, Clone)]
pub struct CompletionLog {
    seen: RecentlySeen<(EntityKind, String)>,
    recent: VecDeque<CompletionRecord>,
    capacity: usize,
}

impl CompletionLog {
    /// Keep `capacity` records for display and remember `dedup_capacity` keys
    pub fn new(capacity: usize, dedup_capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: RecentlySeen::new(dedup_capacity.max(capacity)),
            recent: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a completion; returns `false` if the entity was already seen.
    pub fn record(&mut self, record: CompletionRecord) -> bool {
        let (kind, id) = record.entity_key();
        if !self.seen.insert((kind, id.to_string())) {
            return false;
        }
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(record);
        true
    }

    /// Whether the entity has been recorded
    pub fn contains(&self, record: &CompletionRecord) -> bool {
        let (kind, id) = record.entity_key();
        self.seen.contains(&(kind, id.to_string()))
    }

    /// Recent records, oldest first
    pub fn recent(&self) -> Vec<CompletionRecord> {
        self.recent.iter().cloned().collect()
    }

    /// Number of records held for display
    pub fn len(&self) -> usize {
        self.recent.len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }
}
