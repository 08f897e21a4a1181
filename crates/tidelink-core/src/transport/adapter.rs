//! Transport adapter over a [`ProximityLink`]
//!
//! Owns device discovery, per-device connection lifecycle, framing and
//! reassembly. Upper layers only see whole messages as `(device, bytes)` on
//! the inbound channel and lifecycle changes on a broadcast channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  TransportAdapter                                             │
//! │  ├── discovery task: advertise → scan → connect → evict       │
//! │  ├── devices: RwLock<HashMap<DeviceId, DeviceEntry>>          │
//! │  │   └── session: receive task + reassembler per connection   │
//! │  ├── inbound_tx: mpsc::Sender<InboundMessage>                 │
//! │  └── event_tx: broadcast::Sender<LinkEvent>                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The device map lock is never held across an await.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::device::{ConnectionState, NearbyDevice};
use super::framing::{goodbye_frame, split_message, Frame, Reassembler};
use super::link::{ProximityLink, Sighting};
use crate::config::TransportConfig;
use crate::error::LinkError;
use crate::types::{now_millis, DeviceId, UserId};

/// Capacity of the lifecycle event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A reassembled message from a connected device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Device the message arrived from
    pub device_id: DeviceId,
    /// Encoded message bytes
    pub bytes: Vec<u8>,
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// We closed it
    Local,
    /// The peer said goodbye
    Remote,
    /// The link dropped without a goodbye
    LinkLost,
    /// The device was not resighted in time
    OutOfRange,
    /// The host went to background
    Background,
    /// The adapter is shutting down
    Shutdown,
}

/// Device lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// First sighting of a device
    Discovered {
        /// The device
        device: DeviceId,
        /// Advertised name
        name: String,
    },
    /// A connection opened
    Connected {
        /// The device
        device: DeviceId,
    },
    /// A connection closed
    Disconnected {
        /// The device
        device: DeviceId,
        /// Why it closed
        reason: DisconnectReason,
    },
    /// The device aged out of the nearby list
    Evicted {
        /// The device
        device: DeviceId,
    },
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    generation: u64,
}

struct DeviceEntry {
    info: NearbyDevice,
    last_seen: Instant,
    last_attempt: Option<Instant>,
    session: Option<Session>,
}

struct Inner {
    link: Arc<dyn ProximityLink>,
    config: TransportConfig,
    devices: RwLock<HashMap<DeviceId, DeviceEntry>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    event_tx: broadcast::Sender<LinkEvent>,
    next_seq: AtomicU32,
    next_generation: AtomicU64,
    paused: AtomicBool,
    cancel: CancellationToken,
}

/// Discovery, connections and framing for the proximity mesh
#[derive(Clone)]
pub struct TransportAdapter {
    inner: Arc<Inner>,
}

impl TransportAdapter {
    /// Create an adapter over `link`.
    ///
    /// Returns the adapter and the receiver of reassembled inbound messages.
    pub fn new(
        link: Arc<dyn ProximityLink>,
        config: TransportConfig,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let adapter = Self {
            inner: Arc::new(Inner {
                link,
                config,
                devices: RwLock::new(HashMap::new()),
                inbound_tx,
                event_tx,
                next_seq: AtomicU32::new(0),
                next_generation: AtomicU64::new(0),
                paused: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        };
        (adapter, inbound_rx)
    }

    /// Subscribe to device lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Spawn the periodic discovery loop; it stops on [`shutdown`](Self::shutdown).
    pub fn spawn_discovery(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.inner.config.scan_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = this.inner.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = this.discovery_round().await {
                            warn!(error = %e, "Discovery round failed");
                        }
                    }
                }
            }
            debug!("Discovery loop stopped");
        })
    }

    /// Run one advertise/scan/connect/evict pass.
    ///
    /// Connection attempts triggered by this round finish before it returns.
    pub async fn discovery_round(&self) -> Result<(), LinkError> {
        if self.is_paused() {
            return Ok(());
        }
        self.inner.link.advertise().await?;
        let sightings = self.inner.link.scan().await?;

        let now = Instant::now();
        let candidates: Vec<DeviceId> = sightings
            .into_iter()
            .filter_map(|sighting| self.observe(sighting, now))
            .collect();

        let attempts = candidates.iter().map(|device| async move {
            if let Err(e) = self.connect(device).await {
                debug!(%device, error = %e, "Connection attempt failed");
            }
        });
        futures::future::join_all(attempts).await;

        self.evict_stale(now).await;
        Ok(())
    }

    /// Fold one sighting into the device table; returns the device if a
    /// connection attempt should follow.
    fn observe(&self, sighting: Sighting, now: Instant) -> Option<DeviceId> {
        let config = &self.inner.config;
        let mut discovered = None;
        let eligible = {
            let mut devices = self.inner.devices.write();
            let entry = match devices.entry(sighting.device_id.clone()) {
                Entry::Occupied(occupied) => {
                    let entry = occupied.into_mut();
                    entry.info.observe_signal(sighting.rssi, config.signal_smoothing);
                    entry.info.name = sighting.name;
                    entry.info.last_seen = now_millis();
                    entry.last_seen = now;
                    entry
                }
                Entry::Vacant(vacant) => {
                    discovered = Some(sighting.name.clone());
                    vacant.insert(DeviceEntry {
                        info: NearbyDevice::new(
                            sighting.device_id.clone(),
                            sighting.name,
                            sighting.rssi,
                            now_millis(),
                        ),
                        last_seen: now,
                        last_attempt: None,
                        session: None,
                    })
                }
            };
            let retry_ok = entry.last_attempt.map_or(true, |at| {
                now.saturating_duration_since(at) >= config.reconnect_interval()
            });
            entry.info.can_connect() && entry.info.signal >= config.connect_threshold_dbm && retry_ok
        };

        if let Some(name) = discovered {
            debug!(device = %sighting.device_id, %name, "Discovered device");
            let _ = self.inner.event_tx.send(LinkEvent::Discovered {
                device: sighting.device_id.clone(),
                name,
            });
        }
        eligible.then_some(sighting.device_id)
    }

    /// Open a connection to a sighted device.
    ///
    /// Already connected or connecting devices are left alone. A failed or
    /// timed out attempt returns the device to `Discovered`.
    pub async fn connect(&self, device: &DeviceId) -> Result<(), LinkError> {
        if self.inner.cancel.is_cancelled() {
            return Err(LinkError::Closed);
        }
        {
            let mut devices = self.inner.devices.write();
            let entry = devices
                .get_mut(device)
                .ok_or_else(|| LinkError::UnknownDevice(device.clone()))?;
            if !entry.info.can_connect() {
                return Ok(());
            }
            entry.info.state = ConnectionState::Connecting;
            entry.last_attempt = Some(Instant::now());
        }
        debug!(%device, "Connecting");

        let attempt =
            tokio::time::timeout(self.inner.config.connect_timeout(), self.inner.link.connect(device))
                .await;
        let connection = match attempt {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                self.set_state(device, ConnectionState::Discovered);
                return Err(e);
            }
            Err(_) => {
                self.set_state(device, ConnectionState::Discovered);
                return Err(LinkError::ConnectTimeout(device.clone()));
            }
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.cancel.child_token();
        let installed = {
            let mut devices = self.inner.devices.write();
            match devices.get_mut(device) {
                Some(entry) if entry.info.state == ConnectionState::Connecting && !self.is_paused() => {
                    let task = tokio::spawn(self.clone().receive_loop(
                        device.clone(),
                        connection.frames,
                        cancel.clone(),
                        generation,
                    ));
                    entry.info.state = ConnectionState::Connected;
                    entry.session = Some(Session {
                        cancel,
                        task,
                        generation,
                    });
                    true
                }
                Some(entry) => {
                    entry.info.state = ConnectionState::Discovered;
                    false
                }
                None => false,
            }
        };

        if !installed {
            // Evicted, paused or shut down while the attempt was in flight.
            let _ = self.inner.link.disconnect(device).await;
            return Err(LinkError::Closed);
        }

        info!(%device, "Connected");
        let _ = self.inner.event_tx.send(LinkEvent::Connected {
            device: device.clone(),
        });
        Ok(())
    }

    /// Per-connection receive path: parse frames, reassemble, forward.
    async fn receive_loop(
        self,
        device: DeviceId,
        mut frames: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let config = &self.inner.config;
        let mut reassembler =
            Reassembler::new(config.reassembly_timeout(), config.max_chunks_per_message);
        let mut sweep = tokio::time::interval(config.reassembly_timeout());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        break DisconnectReason::LinkLost;
                    };
                    match Frame::parse(frame) {
                        Ok(Frame::Goodbye) => break DisconnectReason::Remote,
                        Ok(Frame::Chunk { seq, index, total, data }) => {
                            match reassembler.push(seq, index, total, data, Instant::now()) {
                                Ok(Some(bytes)) => {
                                    debug!(%device, bytes = bytes.len(), "Received message");
                                    let message = InboundMessage { device_id: device.clone(), bytes };
                                    if self.inner.inbound_tx.send(message).await.is_err() {
                                        debug!(%device, "Inbound receiver dropped");
                                        return;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => warn!(%device, error = %e, "Dropping bad chunk"),
                            }
                        }
                        Err(e) => warn!(%device, error = %e, "Dropping malformed frame"),
                    }
                }
                _ = sweep.tick() => {
                    let dropped = reassembler.discard_expired(Instant::now());
                    if dropped > 0 {
                        debug!(%device, dropped, "Discarded incomplete messages");
                    }
                }
            }
        };

        self.finish_session(&device, generation, reason).await;
    }

    /// Clean up after the peer ended the connection.
    async fn finish_session(&self, device: &DeviceId, generation: u64, reason: DisconnectReason) {
        let ended = {
            let mut devices = self.inner.devices.write();
            match devices.get_mut(device) {
                Some(entry) if entry.session.as_ref().is_some_and(|s| s.generation == generation) => {
                    entry.session = None;
                    entry.info.state = ConnectionState::Disconnected;
                    true
                }
                _ => false,
            }
        };
        if !ended {
            return;
        }
        let _ = self.inner.link.disconnect(device).await;
        info!(%device, ?reason, "Disconnected");
        let _ = self.inner.event_tx.send(LinkEvent::Disconnected {
            device: device.clone(),
            reason,
        });
    }

    /// Send one message to a connected device.
    pub async fn send(&self, device: &DeviceId, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.is_connected(device) {
            return Err(LinkError::NotConnected(device.clone()));
        }
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let frames = split_message(
            seq,
            bytes,
            self.inner.link.mtu(),
            self.inner.config.max_chunks_per_message,
        )?;
        let count = frames.len();
        for frame in frames {
            self.inner.link.send(device, frame).await?;
        }
        debug!(%device, bytes = bytes.len(), frames = count, "Sent message");
        Ok(())
    }

    /// Send one message to every connected device except `except`.
    ///
    /// Returns how many devices it was delivered to.
    pub async fn broadcast(&self, bytes: &[u8], except: Option<&DeviceId>) -> usize {
        let mut delivered = 0;
        for device in self.connected_devices() {
            if except == Some(&device) {
                continue;
            }
            match self.send(&device, bytes).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(%device, error = %e, "Broadcast send failed"),
            }
        }
        delivered
    }

    /// Close the connection to `device` (goodbye frame first, best effort).
    pub async fn disconnect(&self, device: &DeviceId) -> Result<(), LinkError> {
        self.teardown(device, DisconnectReason::Local).await
    }

    async fn teardown(&self, device: &DeviceId, reason: DisconnectReason) -> Result<(), LinkError> {
        let session = {
            let mut devices = self.inner.devices.write();
            let entry = devices
                .get_mut(device)
                .ok_or_else(|| LinkError::UnknownDevice(device.clone()))?;
            let session = entry.session.take();
            if session.is_some() {
                entry.info.state = ConnectionState::Disconnecting;
            }
            session
        };
        let Some(session) = session else {
            return Ok(());
        };

        if let Err(e) = self.inner.link.send(device, goodbye_frame()).await {
            debug!(%device, error = %e, "Goodbye not delivered");
        }
        session.cancel.cancel();
        session.task.abort();
        if let Err(e) = self.inner.link.disconnect(device).await {
            debug!(%device, error = %e, "Link disconnect failed");
        }

        self.set_state(device, ConnectionState::Disconnected);
        info!(%device, ?reason, "Disconnected");
        let _ = self.inner.event_tx.send(LinkEvent::Disconnected {
            device: device.clone(),
            reason,
        });
        Ok(())
    }

    /// Close every open connection
    pub async fn disconnect_all(&self, reason: DisconnectReason) {
        for device in self.connected_devices() {
            if let Err(e) = self.teardown(&device, reason).await {
                debug!(%device, error = %e, "Teardown failed");
            }
        }
    }

    /// Disconnect and forget devices not resighted within the device timeout.
    pub async fn evict_stale(&self, now: Instant) -> Vec<DeviceId> {
        let timeout = self.inner.config.device_timeout();
        let stale: Vec<DeviceId> = self
            .inner
            .devices
            .read()
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for device in &stale {
            let _ = self.teardown(device, DisconnectReason::OutOfRange).await;
            self.inner.devices.write().remove(device);
            info!(%device, "Evicted stale device");
            let _ = self.inner.event_tx.send(LinkEvent::Evicted {
                device: device.clone(),
            });
        }
        stale
    }

    /// Record which crew member is using `device`
    pub fn link_user(&self, device: &DeviceId, user: UserId) -> bool {
        match self.inner.devices.write().get_mut(device) {
            Some(entry) => {
                entry.info.linked_user = Some(user);
                true
            }
            None => false,
        }
    }

    /// Snapshot of every known device
    pub fn devices(&self) -> Vec<NearbyDevice> {
        let mut devices: Vec<NearbyDevice> = self
            .inner
            .devices
            .read()
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        devices.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        devices
    }

    /// Snapshot of one device
    pub fn device(&self, device: &DeviceId) -> Option<NearbyDevice> {
        self.inner.devices.read().get(device).map(|entry| entry.info.clone())
    }

    /// Devices with an open connection
    pub fn connected_devices(&self) -> Vec<DeviceId> {
        let mut connected: Vec<DeviceId> = self
            .inner
            .devices
            .read()
            .values()
            .filter(|entry| entry.info.is_connected())
            .map(|entry| entry.info.id.clone())
            .collect();
        connected.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        connected
    }

    /// Whether `device` has an open connection
    pub fn is_connected(&self, device: &DeviceId) -> bool {
        self.inner
            .devices
            .read()
            .get(device)
            .is_some_and(|entry| entry.info.is_connected())
    }

    /// Stop discovery and tear down connections while the host is backgrounded
    pub async fn suspend(&self) {
        info!("Suspending proximity transport");
        self.inner.paused.store(true, Ordering::SeqCst);
        self.disconnect_all(DisconnectReason::Background).await;
    }

    /// Resume discovery after [`suspend`](Self::suspend)
    pub fn resume(&self) {
        info!("Resuming proximity transport");
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    /// Whether discovery is suspended
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Say goodbye to every peer, close all connections and stop all tasks
    pub async fn shutdown(&self) {
        info!("Shutting down transport adapter");
        self.inner.paused.store(true, Ordering::SeqCst);
        self.disconnect_all(DisconnectReason::Shutdown).await;
        self.inner.cancel.cancel();
    }

    fn set_state(&self, device: &DeviceId, state: ConnectionState) {
        if let Some(entry) = self.inner.devices.write().get_mut(device) {
            entry.info.state = state;
        }
    }
}
