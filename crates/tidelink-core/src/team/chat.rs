//! Bounded team chat timeline

use std::collections::HashSet;

use crate::protocol::ChatRecord;
use crate::types::{MessageId, Millis};

/// Chat lines ordered by (timestamp, message id), oldest first.
///
/// Late arrivals are inserted at their timestamp position rather than
/// appended. When full, the oldest line is dropped.
#[derive(Debug, Clone)]
pub struct ChatTimeline {
    entries: Vec<ChatRecord>,
    ids: HashSet<MessageId>,
    capacity: usize,
}

impl ChatTimeline {
    /// Create an empty timeline holding at most `capacity` lines
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert a line; returns `false` for a message already on the timeline
    /// or one older than everything on a full timeline.
    pub fn insert(&mut self, record: ChatRecord) -> bool {
        if self.ids.contains(&record.message_id) {
            return false;
        }
        let key = (record.timestamp, record.message_id.as_str());
        let pos = self
            .entries
            .partition_point(|e| (e.timestamp, e.message_id.as_str()) < key);
        if pos == 0 && self.entries.len() >= self.capacity {
            return false;
        }
        self.ids.insert(record.message_id.clone());
        self.entries.insert(pos, record);

        if self.entries.len() > self.capacity {
            let oldest = self.entries.remove(0);
            self.ids.remove(&oldest.message_id);
        }
        true
    }

    /// All lines, oldest first
    pub fn messages(&self) -> &[ChatRecord] {
        &self.entries
    }

    /// Up to `limit` most recent lines newer than `since`, oldest first
    pub fn recent(&self, limit: usize, since: Option<Millis>) -> Vec<ChatRecord> {
        let newer: Vec<&ChatRecord> = self
            .entries
            .iter()
            .filter(|e| since.map_or(true, |since| e.timestamp > since))
            .collect();
        let skip = newer.len().saturating_sub(limit);
        newer.into_iter().skip(skip).cloned().collect()
    }

    /// Number of lines held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the timeline is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserId;

    fn line(id: &str, timestamp: Millis) -> ChatRecord {
        ChatRecord {
            message_id: MessageId::from(id),
            sender_id: UserId::from("ana"),
            sender_name: "Ana".to_string(),
            text: format!("line {}", id),
            timestamp,
        }
    }

    fn ids(timeline: &ChatTimeline) -> Vec<&str> {
        timeline.messages().iter().map(|m| m.message_id.as_str()).collect()
    }

    #[test]
    fn test_late_message_inserted_in_order() {
        let mut timeline = ChatTimeline::new(10);
        timeline.insert(line("a", 100));
        timeline.insert(line("c", 300));
        timeline.insert(line("b", 200));
        assert_eq!(ids(&timeline), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_equal_timestamps_ordered_by_id() {
        let mut timeline = ChatTimeline::new(10);
        timeline.insert(line("z", 100));
        timeline.insert(line("m", 100));
        assert_eq!(ids(&timeline), vec!["m", "z"]);
    }

    #[test]
    fn test_duplicate_ignored() {
        let mut timeline = ChatTimeline::new(10);
        assert!(timeline.insert(line("a", 100)));
        assert!(!timeline.insert(line("a", 100)));
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut timeline = ChatTimeline::new(2);
        timeline.insert(line("b", 200));
        timeline.insert(line("c", 300));
        assert!(timeline.insert(line("d", 400)));
        assert_eq!(ids(&timeline), vec!["c", "d"]);
    }

    #[test]
    fn test_line_older_than_full_timeline_is_not_added() {
        let mut timeline = ChatTimeline::new(2);
        timeline.insert(line("b", 200));
        timeline.insert(line("c", 300));

        assert!(!timeline.insert(line("a", 100)));
        assert_eq!(ids(&timeline), vec!["b", "c"]);
    }

    #[test]
    fn test_recent_respects_limit_and_since() {
        let mut timeline = ChatTimeline::new(10);
        for (id, ts) in [("a", 100), ("b", 200), ("c", 300), ("d", 400)] {
            timeline.insert(line(id, ts));
        }
        let recent: Vec<String> = timeline
            .recent(2, None)
            .into_iter()
            .map(|m| m.message_id.to_string())
            .collect();
        assert_eq!(recent, vec!["c", "d"]);
        assert_eq!(timeline.recent(10, Some(250)).len(), 2);
    }
}
