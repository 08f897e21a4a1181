//! Team roster with last-writer-wins fields
//!
//! Position and membership are tracked independently, each stamped with the
//! sender timestamp of the update that set it. An update only lands if it is
//! strictly newer than what is stored, so replaying or reordering the same
//! set of updates always ends in the same roster.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::protocol::{MemberRecord, MembershipAction};
use crate::types::{Millis, Position, UserId};

/// One crew member as seen locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMember {
    /// Member ID
    pub user_id: UserId,
    /// Display name
    pub display_name: String,
    /// Last known position
    pub position: Option<Position>,
    /// Sender timestamp of the applied position
    pub location_updated_at: Millis,
    /// Whether the member is on the team
    pub active: bool,
    /// Sender timestamp of the applied membership change
    pub membership_updated_at: Millis,
    /// Local receipt time of the last message from this member
    pub last_heard: Millis,
    /// Whether this entry is the local crew member
    pub is_current_user: bool,
}

impl TeamMember {
    fn new(user_id: UserId, display_name: String, heard_at: Millis, is_current_user: bool) -> Self {
        Self {
            user_id,
            display_name,
            position: None,
            location_updated_at: 0,
            active: true,
            membership_updated_at: 0,
            last_heard: heard_at,
            is_current_user,
        }
    }

    /// Wire form for snapshots
    pub fn to_record(&self) -> MemberRecord {
        MemberRecord {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            position: self.position,
            location_updated_at: self.location_updated_at,
            active: self.active,
            membership_updated_at: self.membership_updated_at,
            last_heard: self.last_heard,
        }
    }
}

impl MemberRecord {
    /// Latest moment anyone is known to have heard from this member,
    /// never later than `received_at`.
    pub fn freshness(&self, received_at: Millis) -> Millis {
        self.last_heard
            .max(self.location_updated_at)
            .max(self.membership_updated_at)
            .min(received_at)
    }
}

fn position_order(a: &Position, b: &Position) -> Ordering {
    a.latitude
        .total_cmp(&b.latitude)
        .then(a.longitude.total_cmp(&b.longitude))
}

/// Everyone this device knows to be on (or recently on) the team
#[derive(Debug, Clone)]
pub struct Roster {
    self_id: UserId,
    members: HashMap<UserId, TeamMember>,
}

impl Roster {
    /// Create a roster containing only the local member
    pub fn new(self_id: UserId, display_name: impl Into<String>, now: Millis) -> Self {
        let mut members = HashMap::new();
        members.insert(
            self_id.clone(),
            TeamMember::new(self_id.clone(), display_name.into(), now, true),
        );
        Self { self_id, members }
    }

    fn entry(&mut self, user: &UserId, display_name: &str, heard_at: Millis) -> &mut TeamMember {
        let is_current_user = *user == self.self_id;
        let member = self.members.entry(user.clone()).or_insert_with(|| {
            TeamMember::new(user.clone(), display_name.to_string(), heard_at, is_current_user)
        });
        member.last_heard = member.last_heard.max(heard_at);
        member
    }

    /// Note that `user` was heard from, adding them if unknown
    pub fn heard_from(&mut self, user: &UserId, display_name: &str, heard_at: Millis) {
        self.entry(user, display_name, heard_at);
    }

    /// Apply a position update; returns whether it changed the roster.
    ///
    /// Equal timestamps are resolved by comparing coordinates so every device
    /// picks the same winner.
    pub fn apply_location(
        &mut self,
        user: &UserId,
        display_name: &str,
        position: Position,
        timestamp: Millis,
        heard_at: Millis,
    ) -> bool {
        let member = self.entry(user, display_name, heard_at);
        let newer = match timestamp.cmp(&member.location_updated_at) {
            Ordering::Greater => true,
            Ordering::Equal => member
                .position
                .map_or(true, |current| position_order(&position, &current) == Ordering::Greater),
            Ordering::Less => false,
        };
        if !newer {
            return false;
        }
        member.position = Some(position);
        member.location_updated_at = timestamp;
        if timestamp >= member.membership_updated_at && !display_name.is_empty() {
            member.display_name = display_name.to_string();
        }
        true
    }

    /// Apply a join/leave; returns whether it changed the roster.
    ///
    /// On equal timestamps a leave beats a join.
    pub fn apply_membership(
        &mut self,
        user: &UserId,
        display_name: &str,
        action: MembershipAction,
        timestamp: Millis,
        heard_at: Millis,
    ) -> bool {
        let member = self.entry(user, display_name, heard_at);
        let active = action == MembershipAction::Join;
        let newer = match timestamp.cmp(&member.membership_updated_at) {
            Ordering::Greater => true,
            Ordering::Equal => member.active && !active,
            Ordering::Less => false,
        };
        if !newer {
            return false;
        }
        member.active = active;
        member.membership_updated_at = timestamp;
        if !display_name.is_empty() {
            member.display_name = display_name.to_string();
        }
        true
    }

    /// Merge a snapshot entry field by field; returns whether anything changed.
    ///
    /// Freshness comes from the record itself, so relaying a snapshot never
    /// keeps a silent member alive.
    pub fn merge_record(&mut self, record: &MemberRecord, received_at: Millis) -> bool {
        let heard_at = record.freshness(received_at);
        let mut changed = !self.members.contains_key(&record.user_id);
        if let Some(position) = record.position {
            changed |= self.apply_location(
                &record.user_id,
                &record.display_name,
                position,
                record.location_updated_at,
                heard_at,
            );
        }
        if record.membership_updated_at > 0 {
            let action = if record.active {
                MembershipAction::Join
            } else {
                MembershipAction::Leave
            };
            changed |= self.apply_membership(
                &record.user_id,
                &record.display_name,
                action,
                record.membership_updated_at,
                heard_at,
            );
        }
        self.heard_from(&record.user_id, &record.display_name, heard_at);
        changed
    }

    /// Drop members not heard from within `stale_after`; the local member is kept.
    pub fn evict_stale(&mut self, now: Millis, stale_after: Millis) -> Vec<UserId> {
        let self_id = &self.self_id;
        let stale: Vec<UserId> = self
            .members
            .values()
            .filter(|m| m.user_id != *self_id && now.saturating_sub(m.last_heard) >= stale_after)
            .map(|m| m.user_id.clone())
            .collect();
        for user in &stale {
            self.members.remove(user);
        }
        stale
    }

    /// Look up one member
    pub fn get(&self, user: &UserId) -> Option<&TeamMember> {
        self.members.get(user)
    }

    /// All members sorted by ID
    pub fn members(&self) -> Vec<TeamMember> {
        let mut members: Vec<TeamMember> = self.members.values().cloned().collect();
        members.sort_by(|a, b| a.user_id.as_str().cmp(b.user_id.as_str()));
        members
    }

    /// Snapshot records sorted by ID
    pub fn records(&self) -> Vec<MemberRecord> {
        self.members().iter().map(TeamMember::to_record).collect()
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the roster is empty
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Roster {
        Roster::new(UserId::from("me"), "Me", 0)
    }

    #[test]
    fn test_older_location_does_not_overwrite() {
        let mut roster = roster();
        let ana = UserId::from("ana");
        assert!(roster.apply_location(&ana, "Ana", Position::new(1.0, 1.0), 105, 0));
        assert!(!roster.apply_location(&ana, "Ana", Position::new(2.0, 2.0), 100, 0));

        let member = roster.get(&ana).unwrap();
        assert_eq!(member.position, Some(Position::new(1.0, 1.0)));
        assert_eq!(member.location_updated_at, 105);
    }

    #[test]
    fn test_equal_timestamp_tie_break_is_order_independent() {
        let ana = UserId::from("ana");
        let p1 = Position::new(10.0, 5.0);
        let p2 = Position::new(10.0, 6.0);

        let mut a = roster();
        a.apply_location(&ana, "Ana", p1, 100, 0);
        a.apply_location(&ana, "Ana", p2, 100, 0);

        let mut b = roster();
        b.apply_location(&ana, "Ana", p2, 100, 0);
        b.apply_location(&ana, "Ana", p1, 100, 0);

        assert_eq!(a.records(), b.records());
    }

    #[test]
    fn test_membership_lww() {
        let mut roster = roster();
        let bo = UserId::from("bo");
        assert!(roster.apply_membership(&bo, "Bo", MembershipAction::Leave, 50, 0));
        assert!(!roster.apply_membership(&bo, "Bo", MembershipAction::Join, 40, 0));
        assert!(!roster.get(&bo).unwrap().active);
        assert!(roster.apply_membership(&bo, "Bo", MembershipAction::Join, 60, 0));
        assert!(roster.get(&bo).unwrap().active);
    }

    #[test]
    fn test_evict_stale_keeps_self() {
        let mut roster = roster();
        let ana = UserId::from("ana");
        roster.heard_from(&ana, "Ana", 1_000);

        assert!(roster.evict_stale(1_500, 1_000).is_empty());
        assert_eq!(roster.evict_stale(2_000, 1_000), vec![ana.clone()]);
        assert!(roster.get(&ana).is_none());
        assert!(roster.get(&UserId::from("me")).is_some());
    }

    #[test]
    fn test_merge_record_applies_both_fields() {
        let mut roster = roster();
        let record = MemberRecord {
            user_id: UserId::from("cy"),
            display_name: "Cy".to_string(),
            position: Some(Position::new(3.0, 4.0)),
            location_updated_at: 70,
            active: false,
            membership_updated_at: 65,
            last_heard: 70,
        };
        assert!(roster.merge_record(&record, 1_000));
        assert_eq!(roster.get(&record.user_id).unwrap().to_record(), record);
        assert!(!roster.merge_record(&record, 2_000));
    }

    #[test]
    fn test_replayed_snapshot_does_not_refresh_silent_member() {
        let mut roster = roster();
        let stale_after = 1_000;
        let record = MemberRecord {
            user_id: UserId::from("ghost"),
            display_name: "Ghost".to_string(),
            position: Some(Position::new(1.0, 1.0)),
            location_updated_at: 1_000,
            active: true,
            membership_updated_at: 0,
            last_heard: 1_000,
        };
        assert!(roster.merge_record(&record, 1_000));
        assert!(!roster.merge_record(&record, 1_000 + stale_after - 1));

        assert_eq!(roster.get(&record.user_id).unwrap().last_heard, 1_000);
        assert_eq!(
            roster.evict_stale(1_000 + stale_after, stale_after),
            vec![record.user_id.clone()]
        );
    }

    #[test]
    fn test_snapshot_freshness_never_in_the_future() {
        let mut roster = roster();
        let record = MemberRecord {
            user_id: UserId::from("skewed"),
            display_name: "Skewed".to_string(),
            position: None,
            location_updated_at: 0,
            active: true,
            membership_updated_at: 0,
            last_heard: 9_000,
        };
        assert!(roster.merge_record(&record, 5_000));
        assert_eq!(roster.get(&record.user_id).unwrap().last_heard, 5_000);
    }

    #[test]
    fn test_current_user_flag() {
        let mut roster = roster();
        roster.heard_from(&UserId::from("ana"), "Ana", 10);

        assert!(roster.get(&UserId::from("me")).unwrap().is_current_user);
        assert!(!roster.get(&UserId::from("ana")).unwrap().is_current_user);
    }
}
