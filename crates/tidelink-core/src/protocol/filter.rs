//! Receive-side admission: deduplication and expiry
//!
//! In a broadcast mesh the same message routinely arrives more than once
//! (relays, retransmissions, several neighbours). Every decoded message goes
//! through [`IngestFilter::admit`] before it reaches the team coordinator.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

use super::message::PeerMessage;
use crate::types::{MessageId, Millis};

/// Bounded set of recently seen keys; the oldest key is evicted first.
#[derive(Debug, Clone)]
pub struct RecentlySeen<K> {
    order: VecDeque<K>,
    keys: HashSet<K>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone> RecentlySeen<K> {
    /// Create a cache holding at most `capacity` keys
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            keys: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `key`; returns `false` if it was already present.
    pub fn insert(&mut self, key: K) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        true
    }

    /// Whether `key` is currently remembered
    pub fn contains(&self, key: &K) -> bool {
        self.keys.contains(key)
    }

    /// Forget `key`; returns whether it was remembered.
    pub fn remove(&mut self, key: &K) -> bool {
        if !self.keys.remove(key) {
            return false;
        }
        self.order.retain(|k| k != key);
        true
    }

    /// Number of remembered keys
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Why a message was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The message ID was seen recently
    Duplicate,
    /// `expires_at` had passed at receipt
    Expired,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::Duplicate => write!(f, "duplicate"),
            DropReason::Expired => write!(f, "expired"),
        }
    }
}

/// Dedup + expiry gate in front of message application
#[derive(Debug, Clone)]
pub struct IngestFilter {
    seen: RecentlySeen<MessageId>,
}

impl IngestFilter {
    /// Create a filter remembering up to `capacity` message IDs
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: RecentlySeen::new(capacity),
        }
    }

    /// Admit `message` received at `now`, or say why it must be dropped.
    ///
    /// Expired messages are rejected without being remembered.
    pub fn admit(&mut self, message: &PeerMessage, now: Millis) -> Result<(), DropReason> {
        if message.is_expired(now) {
            return Err(DropReason::Expired);
        }
        if !self.seen.insert(message.id.clone()) {
            return Err(DropReason::Duplicate);
        }
        Ok(())
    }

    /// Remember a locally originated message so echoes are dropped
    pub fn remember(&mut self, id: MessageId) {
        self.seen.insert(id);
    }

    /// Let `id` through again, for messages whose application failed
    pub fn forget(&mut self, id: &MessageId) {
        self.seen.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserId;

    #[test]
    fn test_recently_seen_evicts_oldest() {
        let mut seen = RecentlySeen::new(2);
        assert!(seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("c"));

        assert!(!seen.contains(&"a"));
        assert!(seen.contains(&"b"));
        assert!(seen.contains(&"c"));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_duplicate_is_dropped() {
        let mut filter = IngestFilter::new(16);
        let msg = PeerMessage::team_chat(UserId::from("u1"), "Ana", "ahoy");

        assert_eq!(filter.admit(&msg, 0), Ok(()));
        assert_eq!(filter.admit(&msg, 0), Err(DropReason::Duplicate));
    }

    #[test]
    fn test_expired_is_dropped() {
        let mut filter = IngestFilter::new(16);
        let msg = PeerMessage::team_chat(UserId::from("u1"), "Ana", "ahoy").expires_at(100);

        assert_eq!(filter.admit(&msg, 101), Err(DropReason::Expired));
        assert_eq!(filter.admit(&msg, 50), Ok(()));
    }

    #[test]
    fn test_remembered_local_message_is_duplicate() {
        let mut filter = IngestFilter::new(16);
        let msg = PeerMessage::team_chat(UserId::from("me"), "Me", "echo");
        filter.remember(msg.id.clone());
        assert_eq!(filter.admit(&msg, 0), Err(DropReason::Duplicate));
    }

    #[test]
    fn test_forgotten_message_is_admitted_again() {
        let mut filter = IngestFilter::new(16);
        let msg = PeerMessage::team_chat(UserId::from("u1"), "Ana", "ahoy");
        assert_eq!(filter.admit(&msg, 0), Ok(()));

        filter.forget(&msg.id);
        assert_eq!(filter.admit(&msg, 0), Ok(()));
        assert_eq!(filter.admit(&msg, 0), Err(DropReason::Duplicate));
    }
}
