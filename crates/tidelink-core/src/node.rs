//! TeamNode - one device's complete Tidelink stack
//!
//! Wires the outbox, the sync manager, the proximity transport and the team
//! coordinator together and owns their background tasks.
//!
//! ```text
//!  ProximityLink ──► TransportAdapter ──inbound──► TeamCoordinator
//!                          ▲                          │
//!                          └────── relay / publish ───┤
//!                                                     ▼
//!  RemoteEndpoint ◄── SyncManager ◄──notify── Outbox (redb)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tidelink_core::{LocalIdentity, TeamNode, TidelinkConfig};
//!
//! let node = TeamNode::open("~/.tidelink/data", identity, config, link, remote, reachable)?;
//! node.team().record_completion("task-42", Some(10)).await?;
//! node.shutdown().await;
//! ```

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::TidelinkConfig;
use crate::error::Result;
use crate::outbox::Outbox;
use crate::sync::{CycleReport, RemoteEndpoint, SyncManager};
use crate::team::{LocalIdentity, TeamCoordinator};
use crate::transport::{ProximityLink, TransportAdapter};

/// File name of the outbox database inside a data directory
pub const OUTBOX_FILE: &str = "outbox.redb";

/// A running device: outbox, sync, transport and team state
pub struct TeamNode {
    outbox: Outbox,
    sync: SyncManager,
    transport: TransportAdapter,
    team: TeamCoordinator,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TeamNode {
    /// Open the outbox under `data_dir` and start a node on it.
    pub fn open(
        data_dir: impl AsRef<Path>,
        identity: LocalIdentity,
        config: TidelinkConfig,
        link: Arc<dyn ProximityLink>,
        remote: Arc<dyn RemoteEndpoint>,
        reachable: watch::Receiver<bool>,
    ) -> Result<Self> {
        let outbox = Outbox::open(data_dir.as_ref().join(OUTBOX_FILE))?;
        Ok(Self::start(identity, config, outbox, link, remote, reachable))
    }

    /// Start every component and its background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        identity: LocalIdentity,
        config: TidelinkConfig,
        outbox: Outbox,
        link: Arc<dyn ProximityLink>,
        remote: Arc<dyn RemoteEndpoint>,
        reachable: watch::Receiver<bool>,
    ) -> Self {
        info!(user_id = %identity.user_id, "Starting Tidelink node");

        let sync = SyncManager::new(outbox.clone(), remote, reachable, config.sync);
        let (transport, inbound) = TransportAdapter::new(link, config.transport);
        let team = TeamCoordinator::new(
            identity,
            config.team,
            outbox.clone(),
            Arc::new(transport.clone()),
            Some(sync.clone()),
        );

        let cancel = CancellationToken::new();
        let tasks = vec![
            sync.spawn_driver(),
            team.spawn(inbound, transport.subscribe(), cancel.clone()),
            transport.spawn_discovery(),
        ];

        Self {
            outbox,
            sync,
            transport,
            team,
            cancel,
            tasks: Mutex::new(tasks),
        }
    }

    /// The durable outbox
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// The outbox uploader
    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    /// The proximity transport
    pub fn transport(&self) -> &TransportAdapter {
        &self.transport
    }

    /// Team state and local actions
    pub fn team(&self) -> &TeamCoordinator {
        &self.team
    }

    /// Run a sync cycle now, bypassing any backoff wait
    pub async fn force_sync(&self) -> Option<CycleReport> {
        self.sync.force_sync().await
    }

    /// The host app moved to the background: stop uploading and release the radio.
    pub async fn enter_background(&self) {
        self.sync.enter_background();
        self.transport.suspend().await;
    }

    /// The host app came back: resume discovery and catch up with the remote.
    pub fn enter_foreground(&self) {
        self.transport.resume();
        self.sync.enter_foreground();
    }

    /// Stop all background tasks and close every peer connection.
    pub async fn shutdown(&self) {
        info!("Shutting down Tidelink node");
        self.cancel.cancel();
        self.sync.shutdown();
        self.transport.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Background task failed");
                }
            }
        }
        info!("Tidelink node stopped");
    }
}
