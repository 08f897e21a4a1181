//! Team coordinator
//!
//! Applies peer messages to local team state and turns local actions into
//! peer messages (and outbox events where the backend must hear about them).
//!
//! ## Ingest Path
//!
//! ```text
//! bytes ──decode──► IngestFilter ──► relay (broadcasts) ──► apply
//!   │                  │                                     ├── roster (LWW)
//!   └─ Malformed       └─ Duplicate / Expired                ├── chat timeline
//!                                                            ├── completions ──► outbox
//!                                                            └── sync request/response
//! ```
//!
//! State lives behind a `parking_lot::RwLock` that is never held across an
//! await; reads hand out clones.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use super::chat::ChatTimeline;
use super::completions::CompletionLog;
use super::roster::{Roster, TeamMember};
use crate::config::TeamConfig;
use crate::error::{LinkError, OutboxError, Result, TidelinkError};
use crate::outbox::{AppendOutcome, EntityKind, EventType, Operation, Outbox, SyncEvent};
use crate::protocol::{
    ChatRecord, CompletionPayload, CompletionRecord, DropReason, IngestFilter, LocationPayload,
    MembershipAction, MembershipPayload, MessageType, Payload, PeerMessage, SnapshotPayload,
    SyncRequestPayload, VisitPayload,
};
use crate::sync::SyncManager;
use crate::transport::{InboundMessage, LinkEvent, TransportAdapter};
use crate::types::{now_millis, DeviceId, EventId, Millis, Position, UserId};

/// Capacity of the team event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Outbound side of the mesh as the coordinator needs it
#[async_trait]
pub trait MeshSender: Send + Sync + 'static {
    /// Send to one connected device
    async fn send_to(&self, device: &DeviceId, bytes: &[u8]) -> std::result::Result<(), LinkError>;

    /// Send to every connected device except `except`; returns the count reached
    async fn broadcast(&self, bytes: &[u8], except: Option<&DeviceId>) -> usize;

    /// Remember which crew member a device carries
    fn link_user(&self, _device: &DeviceId, _user: &UserId) {}
}

#[async_trait]
impl MeshSender for TransportAdapter {
    async fn send_to(&self, device: &DeviceId, bytes: &[u8]) -> std::result::Result<(), LinkError> {
        self.send(device, bytes).await
    }

    async fn broadcast(&self, bytes: &[u8], except: Option<&DeviceId>) -> usize {
        TransportAdapter::broadcast(self, bytes, except).await
    }

    fn link_user(&self, device: &DeviceId, user: &UserId) {
        TransportAdapter::link_user(self, device, user.clone());
    }
}

/// The local crew member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Member ID
    pub user_id: UserId,
    /// Display name
    pub display_name: String,
}

impl LocalIdentity {
    /// Create an identity
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// What happened to an ingested message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Applied to team state
    Applied(MessageType),
    /// Dropped by the dedup/expiry gate
    Dropped(DropReason),
    /// Addressed to someone else (still relayed if broadcast)
    NotForUs,
    /// Could not be decoded
    Malformed,
    /// Admitted but its effects could not be stored; a redelivery is retried
    Failed,
}

/// Team state changes, for UI refresh
#[derive(Debug, Clone, PartialEq)]
pub enum TeamEvent {
    /// A roster entry changed
    RosterChanged {
        /// The member
        user_id: UserId,
    },
    /// A chat line was added
    ChatReceived(ChatRecord),
    /// A completion or visit was recorded
    CompletionRecorded(CompletionRecord),
    /// A member was dropped for staleness
    MemberEvicted {
        /// The member
        user_id: UserId,
    },
}

struct TeamState {
    roster: Roster,
    chat: ChatTimeline,
    completions: CompletionLog,
}

struct Inner {
    identity: LocalIdentity,
    config: TeamConfig,
    state: RwLock<TeamState>,
    filter: Mutex<IngestFilter>,
    outbox: Outbox,
    mesh: Arc<dyn MeshSender>,
    sync: Option<SyncManager>,
    event_tx: broadcast::Sender<TeamEvent>,
}

/// Applies peer messages and local actions to shared team state
#[derive(Clone)]
pub struct TeamCoordinator {
    inner: Arc<Inner>,
}

impl TeamCoordinator {
    /// Create a coordinator.
    ///
    /// `sync` is told about every queued outbox event so it can start a
    /// cycle right away.
    pub fn new(
        identity: LocalIdentity,
        config: TeamConfig,
        outbox: Outbox,
        mesh: Arc<dyn MeshSender>,
        sync: Option<SyncManager>,
    ) -> Self {
        let state = TeamState {
            roster: Roster::new(identity.user_id.clone(), identity.display_name.clone(), now_millis()),
            chat: ChatTimeline::new(config.chat_capacity),
            completions: CompletionLog::new(config.completions_capacity, config.dedup_capacity),
        };
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                filter: Mutex::new(IngestFilter::new(config.dedup_capacity)),
                identity,
                config,
                state: RwLock::new(state),
                outbox,
                mesh,
                sync,
                event_tx,
            }),
        }
    }

    /// The local crew member
    pub fn identity(&self) -> &LocalIdentity {
        &self.inner.identity
    }

    /// Subscribe to team state changes
    pub fn subscribe(&self) -> broadcast::Receiver<TeamEvent> {
        self.inner.event_tx.subscribe()
    }

    // ----- Ingest -----

    /// Decode, gate, relay and apply one message received from `device`.
    pub async fn ingest(&self, device: &DeviceId, bytes: &[u8]) -> IngestOutcome {
        let message = match PeerMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(%device, error = %e, "Dropping undecodable message");
                return IngestOutcome::Malformed;
            }
        };

        let now = now_millis();
        if let Err(reason) = self.inner.filter.lock().admit(&message, now) {
            debug!(%device, message_id = %message.id, %reason, "Dropping message");
            return IngestOutcome::Dropped(reason);
        }
        if message.sender_id == self.inner.identity.user_id {
            return IngestOutcome::Dropped(DropReason::Duplicate);
        }

        self.inner.mesh.link_user(device, &message.sender_id);

        if self.inner.config.relay_broadcasts && message.is_broadcast() && is_relayable(message.message_type) {
            let relayed = self.inner.mesh.broadcast(bytes, Some(device)).await;
            if relayed > 0 {
                debug!(message_id = %message.id, relayed, "Relayed broadcast");
            }
        }

        if !message.is_for(&self.inner.identity.user_id) {
            return IngestOutcome::NotForUs;
        }

        let message_type = message.message_type;
        let message_id = message.id.clone();
        match self.apply(device, message, now).await {
            Ok(()) => IngestOutcome::Applied(message_type),
            Err(e) => {
                error!(%device, %message_id, error = %e, "Failed to apply message");
                self.inner.filter.lock().forget(&message_id);
                IngestOutcome::Failed
            }
        }
    }

    /// Apply an admitted message to team state.
    async fn apply(
        &self,
        device: &DeviceId,
        message: PeerMessage,
        now: Millis,
    ) -> std::result::Result<(), OutboxError> {
        debug!(
            %device,
            message_id = %message.id,
            message_type = %message.message_type,
            sender = %message.sender_id,
            "Applying message"
        );
        let sender = message.sender_id.clone();
        let name = message.sender_name.clone();

        match message.payload {
            Payload::TeamLocation(location) => {
                let changed = self.inner.state.write().roster.apply_location(
                    &sender,
                    &name,
                    location.position(),
                    message.timestamp,
                    now,
                );
                if changed {
                    self.emit(TeamEvent::RosterChanged { user_id: sender });
                }
            }
            Payload::TeamUpdate(update) => {
                let changed = {
                    let mut state = self.inner.state.write();
                    state.roster.heard_from(&sender, &name, now);
                    state.roster.apply_membership(
                        &update.user_id,
                        &update.display_name,
                        update.action,
                        message.timestamp,
                        now,
                    )
                };
                if changed {
                    self.emit(TeamEvent::RosterChanged {
                        user_id: update.user_id,
                    });
                }
            }
            Payload::TaskCompletion(completion) => {
                self.inner.state.write().roster.heard_from(&sender, &name, now);
                self.absorb_completion(CompletionRecord::Task(completion))?;
            }
            Payload::BarStopVisit(visit) => {
                self.inner.state.write().roster.heard_from(&sender, &name, now);
                self.absorb_completion(CompletionRecord::Visit(visit))?;
            }
            Payload::SyncRequest(request) => {
                self.inner.state.write().roster.heard_from(&sender, &name, now);
                self.answer_sync_request(device, &sender, request).await;
            }
            Payload::SyncResponse(snapshot) => {
                self.merge_snapshot(snapshot, now)?;
            }
            Payload::None | Payload::Opaque(_) => match message.message_type {
                MessageType::TeamChat | MessageType::Text => {
                    let record = ChatRecord {
                        message_id: message.id,
                        sender_id: sender.clone(),
                        sender_name: name.clone(),
                        text: message.content.unwrap_or_default(),
                        timestamp: message.timestamp,
                    };
                    let added = {
                        let mut state = self.inner.state.write();
                        state.roster.heard_from(&sender, &name, now);
                        state.chat.insert(record.clone())
                    };
                    if added {
                        self.emit(TeamEvent::ChatReceived(record));
                    }
                }
                other => debug!(message_type = %other, "No handler for message"),
            },
        }
        Ok(())
    }

    /// Queue a new completion or visit for upload, then record it; returns
    /// whether it was new.
    ///
    /// The entity is only marked as seen once the outbox holds it.
    fn absorb_completion(&self, record: CompletionRecord) -> std::result::Result<bool, OutboxError> {
        if self.inner.state.read().completions.contains(&record) {
            return Ok(false);
        }
        if let Err(e) = self.queue_completion(&record) {
            if e.is_storage_full() {
                error!(error = %e, "Outbox full, completion not queued");
            } else {
                warn!(error = %e, "Failed to queue completion");
            }
            return Err(e);
        }
        if !self.inner.state.write().completions.record(record.clone()) {
            return Ok(false);
        }
        self.emit(TeamEvent::CompletionRecorded(record));
        Ok(true)
    }

    fn queue_completion(&self, record: &CompletionRecord) -> std::result::Result<AppendOutcome, OutboxError> {
        let (kind, entity_id) = record.entity_key();
        let payload = match record {
            CompletionRecord::Task(c) => serde_json::to_vec(c),
            CompletionRecord::Visit(v) => serde_json::to_vec(v),
        }
        .map_err(|e| OutboxError::Serialization(e.to_string()))?;
        let event = SyncEvent::new(EventType::create(kind), entity_id, payload)
            .with_id(EventId::for_entity(kind.as_str(), entity_id));
        self.queue(&event)
    }

    fn queue(&self, event: &SyncEvent) -> std::result::Result<AppendOutcome, OutboxError> {
        let outcome = self.inner.outbox.append(event)?;
        if outcome == AppendOutcome::Appended {
            if let Some(sync) = &self.inner.sync {
                sync.notify_appended();
            }
        }
        Ok(outcome)
    }

    async fn answer_sync_request(&self, device: &DeviceId, requester: &UserId, request: SyncRequestPayload) {
        let snapshot = self.snapshot(request.since);
        let reply = PeerMessage::new(
            self.inner.identity.user_id.clone(),
            self.inner.identity.display_name.clone(),
            MessageType::SyncResponse,
            Payload::SyncResponse(snapshot),
        )
        .to(requester.clone());
        match self.send_direct(device, &reply).await {
            Ok(()) => debug!(%device, %requester, "Sent catch-up snapshot"),
            Err(e) => warn!(%device, error = %e, "Failed to send catch-up snapshot"),
        }
    }

    /// Merge a catch-up snapshot with the same rules as live messages.
    ///
    /// Members already past the staleness window are skipped. Every
    /// completion is attempted; the first outbox failure is returned.
    pub fn merge_snapshot(&self, snapshot: SnapshotPayload, now: Millis) -> std::result::Result<(), OutboxError> {
        let stale_after = self.inner.config.stale_after_ms;
        let mut roster_changes = Vec::new();
        let mut chat_added = Vec::new();
        {
            let mut state = self.inner.state.write();
            for record in &snapshot.members {
                if record.user_id == self.inner.identity.user_id {
                    continue;
                }
                if now.saturating_sub(record.freshness(now)) >= stale_after {
                    continue;
                }
                if state.roster.merge_record(record, now) {
                    roster_changes.push(record.user_id.clone());
                }
            }
            for line in snapshot.chat {
                if state.chat.insert(line.clone()) {
                    chat_added.push(line);
                }
            }
        }
        let completions = snapshot.completions.len();
        let mut absorbed = 0;
        let mut failure = None;
        for record in snapshot.completions {
            match self.absorb_completion(record) {
                Ok(true) => absorbed += 1,
                Ok(false) => {}
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        debug!(
            members = snapshot.members.len(),
            roster_changes = roster_changes.len(),
            chat_added = chat_added.len(),
            completions,
            absorbed,
            "Merged snapshot"
        );
        for user_id in roster_changes {
            self.emit(TeamEvent::RosterChanged { user_id });
        }
        for line in chat_added {
            self.emit(TeamEvent::ChatReceived(line));
        }
        failure.map_or(Ok(()), Err)
    }

    // ----- Local actions -----

    /// Share our position with nearby crew; returns how many peers were reached.
    pub async fn share_location(&self, latitude: f64, longitude: f64, accuracy_m: Option<f64>) -> Result<usize> {
        let location = LocationPayload {
            latitude,
            longitude,
            accuracy_m,
        };
        let message = PeerMessage::team_location(
            self.inner.identity.user_id.clone(),
            self.inner.identity.display_name.clone(),
            location,
        );
        self.inner.state.write().roster.apply_location(
            &message.sender_id,
            &message.sender_name,
            Position::new(latitude, longitude),
            message.timestamp,
            message.timestamp,
        );
        self.publish(&message).await
    }

    /// Post a chat line to the team
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<usize> {
        let message = PeerMessage::team_chat(
            self.inner.identity.user_id.clone(),
            self.inner.identity.display_name.clone(),
            text,
        );
        self.inner.state.write().chat.insert(ChatRecord {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            sender_name: message.sender_name.clone(),
            text: message.content.clone().unwrap_or_default(),
            timestamp: message.timestamp,
        });
        self.publish(&message).await
    }

    /// Record that we completed a task: queued for upload and announced.
    pub async fn record_completion(
        &self,
        task_id: impl Into<String>,
        points: Option<i64>,
    ) -> Result<CompletionPayload> {
        let completion = CompletionPayload {
            completion_id: Ulid::new().to_string(),
            task_id: task_id.into(),
            user_id: self.inner.identity.user_id.clone(),
            points,
            completed_at: now_millis(),
            extra: Default::default(),
        };
        let record = CompletionRecord::Task(completion.clone());
        self.queue_completion(&record)?;
        self.inner.state.write().completions.record(record.clone());
        self.emit(TeamEvent::CompletionRecorded(record));

        let message = PeerMessage::task_completion(
            self.inner.identity.user_id.clone(),
            self.inner.identity.display_name.clone(),
            completion.clone(),
        );
        self.publish(&message).await?;
        Ok(completion)
    }

    /// Record that we checked into a bar crawl stop
    pub async fn record_visit(&self, stop_id: impl Into<String>) -> Result<VisitPayload> {
        let visit = VisitPayload {
            visit_id: Ulid::new().to_string(),
            stop_id: stop_id.into(),
            user_id: self.inner.identity.user_id.clone(),
            visited_at: now_millis(),
            extra: Default::default(),
        };
        let record = CompletionRecord::Visit(visit.clone());
        self.queue_completion(&record)?;
        self.inner.state.write().completions.record(record.clone());
        self.emit(TeamEvent::CompletionRecorded(record));

        let message = PeerMessage::bar_stop_visit(
            self.inner.identity.user_id.clone(),
            self.inner.identity.display_name.clone(),
            visit.clone(),
        );
        self.publish(&message).await?;
        Ok(visit)
    }

    /// Announce that we joined or left the team
    pub async fn announce_membership(&self, action: MembershipAction) -> Result<usize> {
        let identity = &self.inner.identity;
        let update = MembershipPayload {
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            action,
        };
        let message = PeerMessage::new(
            identity.user_id.clone(),
            identity.display_name.clone(),
            MessageType::TeamUpdate,
            Payload::TeamUpdate(update.clone()),
        );
        self.inner.state.write().roster.apply_membership(
            &identity.user_id,
            &identity.display_name,
            action,
            message.timestamp,
            message.timestamp,
        );

        let operation = match action {
            MembershipAction::Join => Operation::Create,
            MembershipAction::Leave => Operation::Delete,
        };
        let payload = serde_json::to_vec(&update).map_err(|e| TidelinkError::Serialization(e.to_string()))?;
        let event = SyncEvent::new(
            EventType::new(EntityKind::TeamMembership, operation),
            identity.user_id.as_str(),
            payload,
        )
        .with_created_at(message.timestamp);
        self.queue(&event)?;

        self.publish(&message).await
    }

    /// Ask a newly connected device for everything we missed
    pub async fn request_catch_up(&self, device: &DeviceId) -> Result<()> {
        let since = self.inner.state.read().chat.messages().last().map(|m| m.timestamp);
        let message = PeerMessage::new(
            self.inner.identity.user_id.clone(),
            self.inner.identity.display_name.clone(),
            MessageType::SyncRequest,
            Payload::SyncRequest(SyncRequestPayload { since }),
        );
        self.send_direct(device, &message).await
    }

    async fn publish(&self, message: &PeerMessage) -> Result<usize> {
        let bytes = encode(message)?;
        self.inner.filter.lock().remember(message.id.clone());
        let delivered = self.inner.mesh.broadcast(&bytes, None).await;
        debug!(message_id = %message.id, message_type = %message.message_type, delivered, "Published message");
        Ok(delivered)
    }

    async fn send_direct(&self, device: &DeviceId, message: &PeerMessage) -> Result<()> {
        let bytes = encode(message)?;
        self.inner.filter.lock().remember(message.id.clone());
        self.inner.mesh.send_to(device, &bytes).await?;
        Ok(())
    }

    // ----- Reads -----

    /// Roster snapshot sorted by member ID
    pub fn roster(&self) -> Vec<TeamMember> {
        self.inner.state.read().roster.members()
    }

    /// One roster entry
    pub fn member(&self, user: &UserId) -> Option<TeamMember> {
        self.inner.state.read().roster.get(user).cloned()
    }

    /// Chat timeline, oldest first
    pub fn chat(&self) -> Vec<ChatRecord> {
        self.inner.state.read().chat.messages().to_vec()
    }

    /// Recent completions and visits, oldest first
    pub fn completions(&self) -> Vec<CompletionRecord> {
        self.inner.state.read().completions.recent()
    }

    /// Snapshot of team state as sent in a `syncResponse`
    pub fn snapshot(&self, since: Option<Millis>) -> SnapshotPayload {
        let state = self.inner.state.read();
        SnapshotPayload {
            members: state.roster.records(),
            chat: state.chat.recent(self.inner.config.snapshot_chat_limit, since),
            completions: state.completions.recent(),
            generated_at: now_millis(),
        }
    }

    /// Drop roster entries not heard from within the staleness window
    pub fn evict_stale(&self, now: Millis) -> Vec<UserId> {
        let evicted = self
            .inner
            .state
            .write()
            .roster
            .evict_stale(now, self.inner.config.stale_after_ms);
        for user_id in &evicted {
            info!(%user_id, "Evicted stale member");
            self.emit(TeamEvent::MemberEvicted {
                user_id: user_id.clone(),
            });
        }
        evicted
    }

    // ----- Run loop -----

    /// Spawn the ingest loop: inbound messages, link lifecycle and the
    /// staleness sweep.
    pub fn spawn(
        &self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut link_events: broadcast::Receiver<LinkEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(this.inner.config.eviction_interval());
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = inbound.recv() => {
                        let Some(message) = message else { break };
                        this.ingest(&message.device_id, &message.bytes).await;
                    }
                    event = link_events.recv() => match event {
                        Ok(LinkEvent::Connected { device }) => {
                            if let Err(e) = this.request_catch_up(&device).await {
                                warn!(%device, error = %e, "Catch-up request failed");
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Link event receiver lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = sweep.tick() => {
                        this.evict_stale(now_millis());
                    }
                }
            }
            debug!("Team coordinator stopped");
        })
    }

    fn emit(&self, event: TeamEvent) {
        let _ = self.inner.event_tx.send(event);
    }
}

fn encode(message: &PeerMessage) -> Result<Vec<u8>> {
    message
        .encode()
        .map_err(|e| TidelinkError::Serialization(e.to_string()))
}

/// Catch-up traffic is point to point; everything else floods the mesh.
fn is_relayable(message_type: MessageType) -> bool {
    !matches!(
        message_type,
        MessageType::SyncRequest | MessageType::SyncResponse
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingMesh {
        direct: Mutex<Vec<(DeviceId, Vec<u8>)>>,
        broadcasts: Mutex<Vec<(Option<DeviceId>, Vec<u8>)>>,
    }

    #[async_trait]
    impl MeshSender for RecordingMesh {
        async fn send_to(&self, device: &DeviceId, bytes: &[u8]) -> std::result::Result<(), LinkError> {
            self.direct.lock().push((device.clone(), bytes.to_vec()));
            Ok(())
        }

        async fn broadcast(&self, bytes: &[u8], except: Option<&DeviceId>) -> usize {
            self.broadcasts.lock().push((except.cloned(), bytes.to_vec()));
            1
        }
    }

    fn coordinator() -> (TeamCoordinator, Arc<RecordingMesh>, Outbox) {
        coordinator_over(Outbox::in_memory().unwrap())
    }

    fn coordinator_over(outbox: Outbox) -> (TeamCoordinator, Arc<RecordingMesh>, Outbox) {
        let mesh = Arc::new(RecordingMesh::default());
        let coordinator = TeamCoordinator::new(
            LocalIdentity::new("me", "Me"),
            TeamConfig::default(),
            outbox.clone(),
            mesh.clone(),
            None,
        );
        (coordinator, mesh, outbox)
    }

    fn device() -> DeviceId {
        DeviceId::from("radio-ana")
    }

    fn location(lat: f64, lon: f64, timestamp: Millis) -> PeerMessage {
        PeerMessage::team_location(
            UserId::from("ana"),
            "Ana",
            LocationPayload {
                latitude: lat,
                longitude: lon,
                accuracy_m: None,
            },
        )
        .with_timestamp(timestamp)
    }

    fn completion(id: &str) -> CompletionPayload {
        CompletionPayload {
            completion_id: id.to_string(),
            task_id: "task-7".to_string(),
            user_id: UserId::from("ana"),
            points: Some(10),
            completed_at: 1_000,
            extra: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_out_of_order_locations_keep_newest() {
        let (team, _mesh, _outbox) = coordinator();
        let newer = location(1.0, 1.0, 105).encode().unwrap();
        let older = location(2.0, 2.0, 100).encode().unwrap();

        assert_eq!(
            team.ingest(&device(), &newer).await,
            IngestOutcome::Applied(MessageType::TeamLocation)
        );
        team.ingest(&device(), &older).await;

        let ana = team.member(&UserId::from("ana")).unwrap();
        assert_eq!(ana.location_updated_at, 105);
        assert_eq!(ana.position, Some(Position::new(1.0, 1.0)));
    }

    #[tokio::test]
    async fn test_duplicate_message_applied_once() {
        let (team, _mesh, _outbox) = coordinator();
        let chat = PeerMessage::team_chat(UserId::from("ana"), "Ana", "ahoy").encode().unwrap();

        team.ingest(&device(), &chat).await;
        assert_eq!(
            team.ingest(&device(), &chat).await,
            IngestOutcome::Dropped(DropReason::Duplicate)
        );
        assert_eq!(team.chat().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_message_never_applied() {
        let (team, _mesh, _outbox) = coordinator();
        let stale = location(1.0, 1.0, 100).expires_at(now_millis() - 1).encode().unwrap();

        assert_eq!(
            team.ingest(&device(), &stale).await,
            IngestOutcome::Dropped(DropReason::Expired)
        );
        assert!(team.member(&UserId::from("ana")).is_none());
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let (team, _mesh, _outbox) = coordinator();
        assert_eq!(team.ingest(&device(), b"\x00garbage").await, IngestOutcome::Malformed);

        // The next good message still goes through.
        let chat = PeerMessage::team_chat(UserId::from("ana"), "Ana", "ahoy").encode().unwrap();
        assert_eq!(
            team.ingest(&device(), &chat).await,
            IngestOutcome::Applied(MessageType::TeamChat)
        );
    }

    #[tokio::test]
    async fn test_peer_completion_queued_once() {
        let (team, _mesh, outbox) = coordinator();
        let first = PeerMessage::task_completion(UserId::from("ana"), "Ana", completion("c-42"));
        let again = PeerMessage::task_completion(UserId::from("ana"), "Ana", completion("c-42"));

        team.ingest(&device(), &first.encode().unwrap()).await;
        team.ingest(&device(), &again.encode().unwrap()).await;

        assert_eq!(outbox.pending_count().unwrap(), 1);
        let queued = outbox
            .get(&EventId::for_entity("task_completion", "c-42"))
            .unwrap()
            .unwrap();
        assert_eq!(queued.entity_id, "c-42");
        assert_eq!(team.completions().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_request_answered_with_snapshot() {
        let (team, mesh, _outbox) = coordinator();
        team.ingest(&device(), &location(1.0, 1.0, 105).encode().unwrap()).await;

        let request = PeerMessage::new(
            UserId::from("bo"),
            "Bo",
            MessageType::SyncRequest,
            Payload::SyncRequest(SyncRequestPayload::default()),
        );
        team.ingest(&DeviceId::from("radio-bo"), &request.encode().unwrap()).await;

        let direct = mesh.direct.lock().clone();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].0, DeviceId::from("radio-bo"));
        let reply = PeerMessage::decode(&direct[0].1).unwrap();
        assert_eq!(reply.message_type, MessageType::SyncResponse);
        assert_eq!(reply.receiver_id, Some(UserId::from("bo")));
        let Payload::SyncResponse(snapshot) = reply.payload else {
            panic!("expected snapshot");
        };
        let users: Vec<&str> = snapshot.members.iter().map(|m| m.user_id.as_str()).collect();
        assert_eq!(users, vec!["ana", "bo", "me"]);
    }

    #[tokio::test]
    async fn test_sync_response_merge_is_replay_safe() {
        let (source, _mesh, _outbox) = coordinator();
        source.ingest(&device(), &location(1.0, 1.0, 105).encode().unwrap()).await;
        let chat = PeerMessage::team_chat(UserId::from("ana"), "Ana", "ahoy").with_timestamp(50);
        source.ingest(&device(), &chat.encode().unwrap()).await;
        let done = PeerMessage::task_completion(UserId::from("ana"), "Ana", completion("c-1"));
        source.ingest(&device(), &done.encode().unwrap()).await;
        let snapshot = source.snapshot(None);

        let (target, _mesh, outbox) = coordinator();
        target.merge_snapshot(snapshot.clone(), 0).unwrap();
        target.merge_snapshot(snapshot, 0).unwrap();

        assert_eq!(target.member(&UserId::from("ana")).unwrap().location_updated_at, 105);
        assert_eq!(target.chat().len(), 1);
        assert_eq!(target.completions().len(), 1);
        assert_eq!(outbox.pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_broadcasts_are_relayed_but_catch_up_is_not() {
        let (team, mesh, _outbox) = coordinator();
        let chat = PeerMessage::team_chat(UserId::from("ana"), "Ana", "ahoy").encode().unwrap();
        team.ingest(&device(), &chat).await;

        let broadcasts = mesh.broadcasts.lock().clone();
        assert_eq!(broadcasts, vec![(Some(device()), chat)]);

        let request = PeerMessage::new(
            UserId::from("ana"),
            "Ana",
            MessageType::SyncRequest,
            Payload::SyncRequest(SyncRequestPayload::default()),
        );
        team.ingest(&device(), &request.encode().unwrap()).await;
        assert_eq!(mesh.broadcasts.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_direct_message_for_someone_else() {
        let (team, _mesh, _outbox) = coordinator();
        let chat = PeerMessage::team_chat(UserId::from("ana"), "Ana", "psst")
            .to(UserId::from("bo"))
            .encode()
            .unwrap();
        assert_eq!(team.ingest(&device(), &chat).await, IngestOutcome::NotForUs);
        assert!(team.chat().is_empty());
    }

    #[tokio::test]
    async fn test_local_completion_is_queued_and_announced() {
        let (team, mesh, outbox) = coordinator();
        let completion = team.record_completion("task-42", Some(25)).await.unwrap();

        let queued = outbox
            .get(&EventId::for_entity("task_completion", &completion.completion_id))
            .unwrap()
            .unwrap();
        let stored: CompletionPayload = serde_json::from_slice(&queued.payload).unwrap();
        assert_eq!(stored, completion);

        let broadcasts = mesh.broadcasts.lock().clone();
        assert_eq!(broadcasts.len(), 1);
        let announced = PeerMessage::decode(&broadcasts[0].1).unwrap();
        assert_eq!(announced.payload, Payload::TaskCompletion(completion));

        // Our own announcement echoed back by a neighbour is ignored.
        assert_eq!(
            team.ingest(&device(), &broadcasts[0].1).await,
            IngestOutcome::Dropped(DropReason::Duplicate)
        );
    }

    #[tokio::test]
    async fn test_membership_change_is_durable() {
        let (team, _mesh, outbox) = coordinator();
        team.announce_membership(MembershipAction::Leave).await.unwrap();

        assert!(!team.member(&UserId::from("me")).unwrap().active);
        let event = outbox.pending().unwrap().next().unwrap().unwrap();
        assert_eq!(event.event_type, EventType::new(EntityKind::TeamMembership, Operation::Delete));
        assert_eq!(event.entity_id, "me");
    }

    #[tokio::test]
    async fn test_late_chat_inserted_by_timestamp() {
        let (team, _mesh, _outbox) = coordinator();
        let later = PeerMessage::team_chat(UserId::from("ana"), "Ana", "second").with_timestamp(200);
        let earlier = PeerMessage::team_chat(UserId::from("bo"), "Bo", "first").with_timestamp(100);
        team.ingest(&device(), &later.encode().unwrap()).await;
        team.ingest(&device(), &earlier.encode().unwrap()).await;

        let texts: Vec<String> = team.chat().into_iter().map(|c| c.text).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_failed_completion_append_is_not_marked_seen() {
        let (outbox, full) = crate::outbox::testing::full_disk_outbox();
        let (team, _mesh, _outbox) = coordinator_over(outbox);
        let mut events = team.subscribe();
        let done = PeerMessage::task_completion(UserId::from("ana"), "Ana", completion("c-9"))
            .encode()
            .unwrap();

        full.store(true, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(team.ingest(&device(), &done).await, IngestOutcome::Failed);
        assert!(team.completions().is_empty());
        assert!(events.try_recv().is_err());

        // A redelivery tries the append again instead of being deduplicated.
        assert_eq!(team.ingest(&device(), &done).await, IngestOutcome::Failed);

        let snapshot = SnapshotPayload {
            members: Vec::new(),
            chat: Vec::new(),
            completions: vec![CompletionRecord::Task(completion("c-9"))],
            generated_at: now_millis(),
        };
        assert!(team.merge_snapshot(snapshot, now_millis()).is_err());
        assert!(team.completions().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_skips_members_past_staleness() {
        let (team, _mesh, _outbox) = coordinator();
        let now = now_millis();
        let stale_after = TeamConfig::default().stale_after_ms;
        let member = |id: &str, last_heard: Millis| crate::protocol::MemberRecord {
            user_id: UserId::from(id),
            display_name: id.to_string(),
            position: None,
            location_updated_at: 0,
            active: true,
            membership_updated_at: 0,
            last_heard,
        };
        let snapshot = SnapshotPayload {
            members: vec![member("ghost", now - stale_after - 1), member("dora", now - 1_000)],
            chat: Vec::new(),
            completions: Vec::new(),
            generated_at: now,
        };
        team.merge_snapshot(snapshot, now).unwrap();

        assert!(team.member(&UserId::from("ghost")).is_none());
        assert_eq!(team.member(&UserId::from("dora")).unwrap().last_heard, now - 1_000);
    }
}
