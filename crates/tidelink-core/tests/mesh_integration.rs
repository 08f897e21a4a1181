//! Proximity Mesh Integration Tests
//!
//! Full nodes talking over the in-process radio: discovery, framing,
//! relaying, catch-up and convergence of team state.
//!
//! Topology used by most tests:
//!
//! ```text
//!   ana ─── bo ─── cy        (ana and cy are out of range of each other)
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tidelink_core::protocol::{LocationPayload, PeerMessage};
use tidelink_core::{
    DeviceId, EntityKind, EventId, LocalIdentity, MemoryRadio, Outbox, PushOutcome,
    RemoteEndpoint, SyncEvent, TeamNode, TidelinkConfig, UserId,
};
use tokio::sync::watch;

// ============================================================================
// Test Utilities
// ============================================================================

struct AckRemote;

#[async_trait]
impl RemoteEndpoint for AckRemote {
    async fn push(&self, _event: &SyncEvent) -> PushOutcome {
        PushOutcome::Ack
    }
}

/// Small frames so every message is split into several chunks
const TEST_MTU: usize = 48;

fn test_config() -> TidelinkConfig {
    let mut config = TidelinkConfig::default();
    config.transport.scan_interval_ms = 100;
    config.transport.reconnect_interval_ms = 200;
    config
}

/// A node kept offline so its outbox can be inspected
struct TestNode {
    node: TeamNode,
    device: DeviceId,
    _online: watch::Sender<bool>,
}

impl TestNode {
    fn start(radio: &MemoryRadio, name: &str) -> Self {
        let device = DeviceId::from(format!("radio-{}", name));
        let link = radio.station(device.clone(), name);
        let (online_tx, online_rx) = watch::channel(false);
        let node = TeamNode::start(
            LocalIdentity::new(name, name),
            test_config(),
            Outbox::in_memory().unwrap(),
            Arc::new(link),
            Arc::new(AckRemote),
            online_rx,
        );
        Self {
            node,
            device,
            _online: online_tx,
        }
    }
}

/// Poll `check` until it holds, failing after a generous timeout
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(60), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

async fn linked(a: &TestNode, b: &TestNode) {
    eventually("link to come up", || {
        a.node.transport().is_connected(&b.device) && b.node.transport().is_connected(&a.device)
    })
    .await;
}

async fn line_of_three(radio: &MemoryRadio) -> (TestNode, TestNode, TestNode) {
    let ana = TestNode::start(radio, "ana");
    let bo = TestNode::start(radio, "bo");
    let cy = TestNode::start(radio, "cy");
    radio.set_signal(ana.device.clone(), bo.device.clone(), -50.0);
    radio.set_signal(bo.device.clone(), cy.device.clone(), -50.0);
    linked(&ana, &bo).await;
    linked(&bo, &cy).await;
    (ana, bo, cy)
}

fn chat_texts(node: &TestNode) -> Vec<String> {
    node.node.team().chat().into_iter().map(|c| c.text).collect()
}

// ============================================================================
// Tests
// ============================================================================

/// A completion announced by ana reaches cy through bo and is queued for upload
#[tokio::test(start_paused = true)]
async fn test_completion_relayed_across_mesh() {
    let radio = MemoryRadio::new(TEST_MTU);
    let (ana, bo, cy) = line_of_three(&radio).await;

    let completion = ana
        .node
        .team()
        .record_completion("task-42", Some(10))
        .await
        .unwrap();
    let event_id = EventId::for_entity(EntityKind::TaskCompletion.as_str(), &completion.completion_id);

    eventually("completion at cy", || cy.node.team().completions().len() == 1).await;
    for node in [&ana, &bo, &cy] {
        let queued = node.node.outbox().get(&event_id).unwrap();
        assert!(queued.is_some(), "{} did not queue the completion", node.device);
        assert_eq!(node.node.outbox().pending_count().unwrap(), 1);
    }
    assert!(!cy.node.transport().is_connected(&ana.device));

    for node in [ana, bo, cy] {
        node.node.shutdown().await;
    }
}

/// Out-of-order location updates converge on the newest one
#[tokio::test(start_paused = true)]
async fn test_out_of_order_locations_converge() {
    let radio = MemoryRadio::new(TEST_MTU);
    let (ana, bo, cy) = line_of_three(&radio).await;

    let dora = UserId::from("dora");
    let at = |lat: f64, timestamp: i64| {
        PeerMessage::team_location(
            dora.clone(),
            "Dora",
            LocationPayload {
                latitude: lat,
                longitude: 4.0,
                accuracy_m: Some(5.0),
            },
        )
        .with_timestamp(timestamp)
        .encode()
        .unwrap()
    };
    let transport = ana.node.transport();
    transport.broadcast(&at(52.0, 105), None).await;
    transport.broadcast(&at(51.0, 100), None).await;
    ana.node.team().send_chat("marker").await.unwrap();

    eventually("marker at cy", || chat_texts(&cy).contains(&"marker".to_string())).await;
    for node in [&bo, &cy] {
        let member = node.node.team().member(&dora).expect("dora in roster");
        assert_eq!(member.location_updated_at, 105);
        assert_eq!(member.position.map(|p| p.latitude), Some(52.0));
    }

    for node in [ana, bo, cy] {
        node.node.shutdown().await;
    }
}

/// A device that comes into range catches up on chat it missed
#[tokio::test(start_paused = true)]
async fn test_catch_up_on_connect() {
    let radio = MemoryRadio::new(TEST_MTU);
    let ana = TestNode::start(&radio, "ana");
    let bo = TestNode::start(&radio, "bo");
    radio.set_signal(ana.device.clone(), bo.device.clone(), -50.0);
    linked(&ana, &bo).await;

    ana.node.team().send_chat("meet at the pier").await.unwrap();
    eventually("chat at bo", || chat_texts(&bo) == vec!["meet at the pier"]).await;

    let cy = TestNode::start(&radio, "cy");
    radio.set_signal(bo.device.clone(), cy.device.clone(), -50.0);
    linked(&bo, &cy).await;

    eventually("catch-up at cy", || chat_texts(&cy) == vec!["meet at the pier"]).await;
    let ana_id = UserId::from("ana");
    assert!(cy.node.team().member(&ana_id).is_some());

    for node in [ana, bo, cy] {
        node.node.shutdown().await;
    }
}

/// Moving out of range drops the connection; coming back reconnects
#[tokio::test(start_paused = true)]
async fn test_reconnect_after_leaving_range() {
    let radio = MemoryRadio::new(TEST_MTU);
    let ana = TestNode::start(&radio, "ana");
    let bo = TestNode::start(&radio, "bo");
    radio.set_signal(ana.device.clone(), bo.device.clone(), -50.0);
    linked(&ana, &bo).await;

    radio.set_in_range(ana.device.clone(), bo.device.clone(), false);
    eventually("link to drop", || {
        !ana.node.transport().is_connected(&bo.device) && !bo.node.transport().is_connected(&ana.device)
    })
    .await;

    radio.set_in_range(ana.device.clone(), bo.device.clone(), true);
    linked(&ana, &bo).await;

    ana.node.team().send_chat("back again").await.unwrap();
    eventually("chat after reconnect", || chat_texts(&bo).contains(&"back again".to_string())).await;

    for node in [ana, bo] {
        node.node.shutdown().await;
    }
}
