//! Property-based tests for team state convergence
//!
//! Uses proptest to check that the roster and chat timeline end up identical
//! no matter in which order, or how many times, updates are delivered.

use proptest::prelude::*;
use tidelink_core::protocol::{ChatRecord, MembershipAction};
use tidelink_core::team::{ChatTimeline, Roster};
use tidelink_core::{MessageId, Position, UserId};

// ============================================================================
// Strategy Generators
// ============================================================================

/// One roster update as it would arrive from a peer
#[derive(Debug, Clone)]
enum RosterOp {
    Location {
        user: u8,
        lat: i16,
        lon: i16,
        timestamp: i64,
    },
    Membership {
        user: u8,
        join: bool,
        timestamp: i64,
    },
}

fn roster_op_strategy() -> impl Strategy<Value = RosterOp> {
    prop_oneof![
        3 => (0..4u8, any::<i16>(), any::<i16>(), 1..50i64).prop_map(|(user, lat, lon, timestamp)| {
            RosterOp::Location { user, lat, lon, timestamp }
        }),
        1 => (0..4u8, any::<bool>(), 1..50i64).prop_map(|(user, join, timestamp)| {
            RosterOp::Membership { user, join, timestamp }
        }),
    ]
}

/// A batch of updates plus a permutation and a duplication of it
fn shuffled_ops_strategy() -> impl Strategy<Value = (Vec<RosterOp>, Vec<RosterOp>)> {
    prop::collection::vec(roster_op_strategy(), 0..40).prop_flat_map(|ops| {
        let shuffled = Just(ops.clone()).prop_shuffle();
        (Just(ops), shuffled)
    })
}

fn user(n: u8) -> UserId {
    UserId::from(format!("user-{}", n))
}

fn apply_all(ops: &[RosterOp]) -> Roster {
    let mut roster = Roster::new(UserId::from("me"), "Me", 0);
    for op in ops {
        match *op {
            RosterOp::Location { user: u, lat, lon, timestamp } => {
                let position = Position::new(f64::from(lat) / 100.0, f64::from(lon) / 100.0);
                roster.apply_location(&user(u), "", position, timestamp, 0);
            }
            RosterOp::Membership { user: u, join, timestamp } => {
                let action = if join {
                    MembershipAction::Join
                } else {
                    MembershipAction::Leave
                };
                roster.apply_membership(&user(u), "", action, timestamp, 0);
            }
        }
    }
    roster
}

fn chat_strategy() -> impl Strategy<Value = Vec<ChatRecord>> {
    prop::collection::vec((0..1_000i64, "[a-z]{1,8}"), 0..30).prop_map(|lines| {
        lines
            .into_iter()
            .enumerate()
            .map(|(i, (timestamp, text))| ChatRecord {
                message_id: MessageId::from(format!("m-{:03}", i)),
                sender_id: UserId::from("ana"),
                sender_name: "Ana".to_string(),
                text,
                timestamp,
            })
            .collect()
    })
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Delivery order does not change the final roster
    #[test]
    fn roster_converges_under_reordering((ops, shuffled) in shuffled_ops_strategy()) {
        prop_assert_eq!(apply_all(&ops).records(), apply_all(&shuffled).records());
    }

    /// Delivering every update twice changes nothing
    #[test]
    fn roster_is_idempotent((ops, shuffled) in shuffled_ops_strategy()) {
        let mut doubled = ops.clone();
        doubled.extend(shuffled);
        prop_assert_eq!(apply_all(&ops).records(), apply_all(&doubled).records());
    }

    /// The applied location is always the one with the greatest timestamp
    #[test]
    fn roster_keeps_newest_location((ops, _) in shuffled_ops_strategy()) {
        let roster = apply_all(&ops);
        for member in roster.members() {
            let newest = ops
                .iter()
                .filter_map(|op| match op {
                    RosterOp::Location { user: u, timestamp, .. } if user(*u) == member.user_id => Some(*timestamp),
                    _ => None,
                })
                .max()
                .unwrap_or(0);
            prop_assert_eq!(member.location_updated_at, newest);
        }
    }

    /// The timeline is sorted and independent of arrival order
    #[test]
    fn chat_order_is_arrival_independent(lines in chat_strategy()) {
        let mut forward = ChatTimeline::new(100);
        let mut backward = ChatTimeline::new(100);
        for line in &lines {
            forward.insert(line.clone());
        }
        for line in lines.iter().rev() {
            backward.insert(line.clone());
            backward.insert(line.clone());
        }

        prop_assert_eq!(forward.messages(), backward.messages());
        let stamps: Vec<i64> = forward.messages().iter().map(|m| m.timestamp).collect();
        prop_assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
        prop_assert_eq!(forward.len(), lines.len());
    }
}
