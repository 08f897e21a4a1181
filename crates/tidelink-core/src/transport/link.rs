//! Abstract short-range radio link
//!
//! Everything below this trait (advertising packets, GATT, Wi-Fi Aware, ...)
//! is out of scope. The adapter only needs advertise/scan/connect/send and a
//! per-connection stream of received frames.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::LinkError;
use crate::types::DeviceId;

/// One device seen during a scan
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    /// Radio-level device ID
    pub device_id: DeviceId,
    /// Advertised name
    pub name: String,
    /// Raw signal strength (dBm)
    pub rssi: f64,
}

/// An open link to one device.
///
/// `frames` yields every frame the device sends us and ends when the link
/// goes down.
#[derive(Debug)]
pub struct LinkConnection {
    /// The remote device
    pub device_id: DeviceId,
    /// Received frames
    pub frames: mpsc::Receiver<Bytes>,
}

/// Short-range wireless transport
#[async_trait]
pub trait ProximityLink: Send + Sync + 'static {
    /// Largest frame the link carries in one transmission
    fn mtu(&self) -> usize;

    /// Make this device discoverable
    async fn advertise(&self) -> Result<(), LinkError>;

    /// Report devices currently in range
    async fn scan(&self) -> Result<Vec<Sighting>, LinkError>;

    /// Open a link to `device`
    async fn connect(&self, device: &DeviceId) -> Result<LinkConnection, LinkError>;

    /// Transmit one frame (at most `mtu()` bytes)
    async fn send(&self, device: &DeviceId, frame: Bytes) -> Result<(), LinkError>;

    /// Close the link to `device`
    async fn disconnect(&self, device: &DeviceId) -> Result<(), LinkError>;
}
