//! In-process radio medium
//!
//! [`MemoryRadio`] stands in for the air between devices: each station gets
//! a [`MemoryLink`], and the test or simulator decides who is in range and at
//! what signal strength. A connection opened from either side shares the same
//! pair of frame pipes, so the second side to connect picks up everything the
//! first side already sent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::link::{LinkConnection, ProximityLink, Sighting};
use crate::error::LinkError;
use crate::types::DeviceId;

/// Frames buffered per direction before sends start failing
const PIPE_CAPACITY: usize = 4096;

type Pair = (DeviceId, DeviceId);

fn unordered(a: &DeviceId, b: &DeviceId) -> Pair {
    if a.as_str() <= b.as_str() {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

struct Station {
    name: String,
    refusing: bool,
}

#[derive(Default)]
struct Medium {
    mtu: usize,
    stations: HashMap<DeviceId, Station>,
    signal: HashMap<Pair, f64>,
    /// Senders keyed by (from, to)
    pipes: HashMap<Pair, mpsc::Sender<Bytes>>,
    /// Receivers keyed by (from, to) whose recipient has not connected yet
    unclaimed: HashMap<Pair, mpsc::Receiver<Bytes>>,
}

impl Medium {
    fn in_range(&self, a: &DeviceId, b: &DeviceId) -> bool {
        self.signal.contains_key(&unordered(a, b))
    }

    fn sever(&mut self, a: &DeviceId, b: &DeviceId) {
        for key in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
            self.pipes.remove(&key);
            self.unclaimed.remove(&key);
        }
    }
}

/// Shared simulated radio medium
#[derive(Clone)]
pub struct MemoryRadio {
    medium: Arc<Mutex<Medium>>,
}

impl MemoryRadio {
    /// Create a medium whose links carry frames of at most `mtu` bytes
    pub fn new(mtu: usize) -> Self {
        Self {
            medium: Arc::new(Mutex::new(Medium {
                mtu,
                ..Medium::default()
            })),
        }
    }

    /// Register a station and return its link
    pub fn station(&self, id: impl Into<DeviceId>, name: impl Into<String>) -> MemoryLink {
        let id = id.into();
        self.medium.lock().stations.insert(
            id.clone(),
            Station {
                name: name.into(),
                refusing: false,
            },
        );
        MemoryLink {
            id,
            medium: self.medium.clone(),
        }
    }

    /// Put two stations in range of each other at the given signal strength
    pub fn set_signal(&self, a: impl Into<DeviceId>, b: impl Into<DeviceId>, rssi: f64) {
        let (a, b) = (a.into(), b.into());
        self.medium.lock().signal.insert(unordered(&a, &b), rssi);
    }

    /// Move two stations in or out of range; going out of range severs their link
    pub fn set_in_range(&self, a: impl Into<DeviceId>, b: impl Into<DeviceId>, in_range: bool) {
        let (a, b) = (a.into(), b.into());
        let mut medium = self.medium.lock();
        if in_range {
            medium.signal.entry(unordered(&a, &b)).or_insert(-50.0);
        } else {
            medium.signal.remove(&unordered(&a, &b));
            medium.sever(&a, &b);
        }
    }

    /// Make a station refuse (or accept again) incoming connections
    pub fn set_refusing(&self, id: impl Into<DeviceId>, refusing: bool) {
        if let Some(station) = self.medium.lock().stations.get_mut(&id.into()) {
            station.refusing = refusing;
        }
    }

    /// Take a station off the air entirely
    pub fn remove_station(&self, id: impl Into<DeviceId>) {
        let id = id.into();
        let mut medium = self.medium.lock();
        medium.stations.remove(&id);
        medium.signal.retain(|(a, b), _| *a != id && *b != id);
        medium.pipes.retain(|(from, to), _| *from != id && *to != id);
        medium.unclaimed.retain(|(from, to), _| *from != id && *to != id);
    }
}

/// One station's view of the [`MemoryRadio`]
pub struct MemoryLink {
    id: DeviceId,
    medium: Arc<Mutex<Medium>>,
}

impl MemoryLink {
    /// This station's device ID
    pub fn id(&self) -> &DeviceId {
        &self.id
    }
}

#[async_trait]
impl ProximityLink for MemoryLink {
    fn mtu(&self) -> usize {
        self.medium.lock().mtu
    }

    async fn advertise(&self) -> Result<(), LinkError> {
        if self.medium.lock().stations.contains_key(&self.id) {
            Ok(())
        } else {
            Err(LinkError::Closed)
        }
    }

    async fn scan(&self) -> Result<Vec<Sighting>, LinkError> {
        let medium = self.medium.lock();
        if !medium.stations.contains_key(&self.id) {
            return Err(LinkError::Closed);
        }
        let mut sightings: Vec<Sighting> = medium
            .stations
            .iter()
            .filter(|(id, _)| **id != self.id)
            .filter_map(|(id, station)| {
                medium.signal.get(&unordered(&self.id, id)).map(|rssi| Sighting {
                    device_id: id.clone(),
                    name: station.name.clone(),
                    rssi: *rssi,
                })
            })
            .collect();
        sightings.sort_by(|a, b| a.device_id.as_str().cmp(b.device_id.as_str()));
        Ok(sightings)
    }

    async fn connect(&self, device: &DeviceId) -> Result<LinkConnection, LinkError> {
        let mut medium = self.medium.lock();
        let station = medium
            .stations
            .get(device)
            .ok_or_else(|| LinkError::UnknownDevice(device.clone()))?;
        if station.refusing {
            return Err(LinkError::Radio(format!("{} refused the connection", device)));
        }
        if !medium.in_range(&self.id, device) {
            return Err(LinkError::Radio(format!("{} is out of range", device)));
        }

        // The peer connected first: pick up the frames it has been sending us.
        if let Some(frames) = medium.unclaimed.remove(&(device.clone(), self.id.clone())) {
            return Ok(LinkConnection {
                device_id: device.clone(),
                frames,
            });
        }

        let (to_peer_tx, to_peer_rx) = mpsc::channel(PIPE_CAPACITY);
        let (from_peer_tx, from_peer_rx) = mpsc::channel(PIPE_CAPACITY);
        medium
            .pipes
            .insert((self.id.clone(), device.clone()), to_peer_tx);
        medium
            .pipes
            .insert((device.clone(), self.id.clone()), from_peer_tx);
        medium
            .unclaimed
            .insert((self.id.clone(), device.clone()), to_peer_rx);

        Ok(LinkConnection {
            device_id: device.clone(),
            frames: from_peer_rx,
        })
    }

    async fn send(&self, device: &DeviceId, frame: Bytes) -> Result<(), LinkError> {
        let pipe = {
            let medium = self.medium.lock();
            if frame.len() > medium.mtu {
                return Err(LinkError::Radio(format!(
                    "frame of {} bytes exceeds mtu {}",
                    frame.len(),
                    medium.mtu
                )));
            }
            medium
                .pipes
                .get(&(self.id.clone(), device.clone()))
                .cloned()
                .ok_or_else(|| LinkError::NotConnected(device.clone()))?
        };
        pipe.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => LinkError::Radio(format!("send buffer to {} is full", device)),
            TrySendError::Closed(_) => LinkError::NotConnected(device.clone()),
        })
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<(), LinkError> {
        self.medium.lock().sever(&self.id, device);
        Ok(())
    }
}
