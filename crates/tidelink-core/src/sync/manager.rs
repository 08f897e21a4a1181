//! Outbox sync manager
//!
//! Drains the outbox to the remote endpoint, one event at a time in creation
//! order, whenever the remote is reachable.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncManager                                                     │
//! │  ├── status_tx: watch::Sender<SyncStatus>                        │
//! │  │   └── compare-and-set Idle/Synced/Error/Offline → Syncing     │
//! │  ├── driver task                                                 │
//! │  │   ├── reachability changes → Offline / Reachability trigger   │
//! │  │   └── backoff timer → Retry trigger                           │
//! │  └── activity_tx: broadcast::Sender<SyncActivity>                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! At most one cycle runs at a time. Winning the compare-and-set on the status
//! channel is what grants a cycle; no lock is held while it runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::remote::{PushOutcome, RemoteEndpoint};
use super::status::{SyncActivity, SyncStatus, SyncTrigger};
use crate::config::SyncConfig;
use crate::error::OutboxError;
use crate::outbox::{Outbox, SyncEvent};

/// Default capacity for the activity broadcast channel
const ACTIVITY_CHANNEL_CAPACITY: usize = 256;

/// Summary of one finished cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Events acknowledged
    pub pushed: usize,
    /// Events permanently rejected
    pub rejected: usize,
    /// Events still queued when the cycle ended
    pub remaining: usize,
    /// Status the cycle ended in
    pub status: SyncStatus,
}

struct Inner {
    outbox: Outbox,
    remote: Arc<dyn RemoteEndpoint>,
    config: SyncConfig,
    reachable: watch::Receiver<bool>,
    status_tx: watch::Sender<SyncStatus>,
    activity_tx: broadcast::Sender<SyncActivity>,
    retry_tx: watch::Sender<Option<Instant>>,
    backoff: Mutex<Backoff>,
    background: AtomicBool,
    cancel: CancellationToken,
}

/// Pushes outbox events to the remote and tracks sync status
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

/// How a single pass over the pending snapshot ended
enum PassEnd {
    Drained,
    Stopped(SyncStatus),
}

impl SyncManager {
    /// Create a manager over `outbox`, pushing to `remote` while `reachable`
    /// reports `true`.
    pub fn new(
        outbox: Outbox,
        remote: Arc<dyn RemoteEndpoint>,
        reachable: watch::Receiver<bool>,
        config: SyncConfig,
    ) -> Self {
        let initial = if *reachable.borrow() {
            SyncStatus::Idle
        } else {
            SyncStatus::Offline
        };
        let (status_tx, _) = watch::channel(initial);
        let (activity_tx, _) = broadcast::channel(ACTIVITY_CHANNEL_CAPACITY);
        let (retry_tx, _) = watch::channel(None);
        let backoff = Backoff::new(config.backoff_base(), config.backoff_cap());
        Self {
            inner: Arc::new(Inner {
                outbox,
                remote,
                config,
                reachable,
                status_tx,
                activity_tx,
                retry_tx,
                backoff: Mutex::new(backoff),
                background: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Current status
    pub fn status(&self) -> SyncStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Watch status transitions
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Subscribe to per-event activity
    pub fn subscribe(&self) -> broadcast::Receiver<SyncActivity> {
        self.inner.activity_tx.subscribe()
    }

    /// Number of events awaiting upload, independent of status
    pub fn pending_sync_count(&self) -> Result<usize, OutboxError> {
        self.inner.outbox.pending_count()
    }

    /// Whether the remote is currently reachable
    pub fn is_online(&self) -> bool {
        *self.inner.reachable.borrow()
    }

    /// Consecutive transient failures since the last acknowledgement
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.backoff.lock().failures()
    }

    /// When the next automatic retry is due, if one is scheduled
    pub fn next_retry(&self) -> Option<Instant> {
        *self.inner.retry_tx.borrow()
    }

    fn retry_pending(&self) -> bool {
        self.next_retry().map_or(false, |at| at > Instant::now())
    }

    /// Run a cycle now and wait for it; `None` if the trigger was refused.
    pub async fn sync_now(&self, trigger: SyncTrigger) -> Option<CycleReport> {
        if !self.try_begin(trigger) {
            return None;
        }
        Some(self.run_cycle(trigger).await)
    }

    /// Start a cycle in the background; returns whether one was started.
    pub fn request_sync(&self, trigger: SyncTrigger) -> bool {
        if !self.try_begin(trigger) {
            return false;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.run_cycle(trigger).await;
        });
        true
    }

    /// Explicit user-requested sync
    pub async fn force_sync(&self) -> Option<CycleReport> {
        self.sync_now(SyncTrigger::Force).await
    }

    /// A local event was appended; start uploading if nothing else is and no
    /// backoff retry is pending.
    pub fn notify_appended(&self) -> bool {
        if !self.is_online() {
            return false;
        }
        self.request_sync(SyncTrigger::Appended)
    }

    /// Host went to background: the running cycle stops after its current
    /// event and no new cycle starts until foreground.
    pub fn enter_background(&self) {
        info!("Sync entering background");
        self.inner.background.store(true, Ordering::SeqCst);
    }

    /// Host returned to foreground; triggers a cycle.
    pub fn enter_foreground(&self) -> bool {
        info!("Sync entering foreground");
        self.inner.background.store(false, Ordering::SeqCst);
        self.request_sync(SyncTrigger::Foreground)
    }

    /// Whether the host is backgrounded
    pub fn is_background(&self) -> bool {
        self.inner.background.load(Ordering::SeqCst)
    }

    /// Claim the single cycle slot for `trigger`.
    fn try_begin(&self, trigger: SyncTrigger) -> bool {
        if self.is_background() {
            debug!(%trigger, "Sync trigger refused in background");
            return false;
        }
        if !self.is_online() {
            self.inner.status_tx.send_if_modified(|status| {
                if status.is_syncing() || *status == SyncStatus::Offline {
                    false
                } else {
                    *status = SyncStatus::Offline;
                    true
                }
            });
            debug!(%trigger, "Sync trigger refused while offline");
            return false;
        }
        if trigger.waits_for_backoff() && self.retry_pending() {
            debug!(%trigger, "Sync trigger deferred to backoff retry");
            return false;
        }
        let started = self.inner.status_tx.send_if_modified(|status| {
            if status.is_syncing() {
                false
            } else {
                *status = SyncStatus::Syncing;
                true
            }
        });
        if started {
            info!(%trigger, "Sync cycle started");
        } else {
            debug!(%trigger, "Sync cycle already in flight");
        }
        started
    }

    /// Push pending events until drained or stopped. Caller holds the slot.
    async fn run_cycle(&self, trigger: SyncTrigger) -> CycleReport {
        let mut pushed = 0;
        let mut rejected = 0;
        let mut last_reject: Option<String> = None;

        let mut status = loop {
            let before = pushed + rejected;
            match self
                .run_pass(&mut pushed, &mut rejected, &mut last_reject)
                .await
            {
                Ok(PassEnd::Stopped(status)) => break status,
                Ok(PassEnd::Drained) => {}
                Err(e) => {
                    warn!(error = %e, "Outbox failure during sync");
                    break SyncStatus::Error(e.to_string());
                }
            }
            // Events appended while the pass ran are not in its snapshot.
            let remaining = match self.inner.outbox.pending_count() {
                Ok(remaining) => remaining,
                Err(e) => {
                    warn!(error = %e, "Could not read outbox count");
                    break SyncStatus::Error(e.to_string());
                }
            };
            if remaining == 0 || pushed + rejected == before {
                break match &last_reject {
                    Some(reason) => SyncStatus::Error(reason.clone()),
                    None => SyncStatus::Synced,
                };
            }
        };

        let remaining = match self.inner.outbox.pending_count() {
            Ok(remaining) => Some(remaining),
            Err(e) => {
                warn!(error = %e, "Could not read outbox count");
                status = SyncStatus::Error(e.to_string());
                None
            }
        };
        if remaining == Some(0) {
            self.inner.retry_tx.send_replace(None);
        }
        // Unknown counts are reported as zero alongside the error status.
        let remaining = remaining.unwrap_or(0);
        self.inner.status_tx.send_replace(status.clone());
        let _ = self.inner.activity_tx.send(SyncActivity::CycleFinished {
            pushed,
            rejected,
            remaining,
        });
        info!(%trigger, pushed, rejected, remaining, %status, "Sync cycle finished");

        CycleReport {
            pushed,
            rejected,
            remaining,
            status,
        }
    }

    async fn run_pass(
        &self,
        pushed: &mut usize,
        rejected: &mut usize,
        last_reject: &mut Option<String>,
    ) -> Result<PassEnd, OutboxError> {
        let mut reachable = self.inner.reachable.clone();

        for item in self.inner.outbox.pending()? {
            if self.is_background() {
                debug!("Background: not starting another push");
                let status = last_reject.clone().map_or(SyncStatus::Idle, SyncStatus::Error);
                return Ok(PassEnd::Stopped(status));
            }
            if !*reachable.borrow_and_update() {
                return Ok(PassEnd::Stopped(SyncStatus::Offline));
            }
            let event = item?;

            let outcome = tokio::select! {
                biased;
                _ = wait_offline(&mut reachable) => None,
                outcome = self.push_with_timeout(&event) => Some(outcome),
            };

            match outcome {
                None => {
                    // Abandoned mid-flight: not a completed attempt.
                    info!(event_id = %event.id, "Went offline during push");
                    return Ok(PassEnd::Stopped(SyncStatus::Offline));
                }
                Some(PushOutcome::Ack) => {
                    self.inner.outbox.remove(&event.id)?;
                    self.inner.backoff.lock().reset();
                    *pushed += 1;
                    debug!(event_id = %event.id, event_type = %event.event_type, "Event acknowledged");
                    let _ = self.inner.activity_tx.send(SyncActivity::Pushed {
                        event_id: event.id.clone(),
                    });
                }
                Some(PushOutcome::Reject(reason)) => {
                    self.inner.outbox.remove(&event.id)?;
                    *rejected += 1;
                    warn!(event_id = %event.id, %reason, "Event rejected by remote");
                    let _ = self.inner.activity_tx.send(SyncActivity::Rejected {
                        event_id: event.id.clone(),
                        reason: reason.clone(),
                    });
                    *last_reject = Some(reason);
                }
                Some(PushOutcome::Transient(reason)) => {
                    self.inner.outbox.mark_attempted(&event.id)?;
                    return Ok(PassEnd::Stopped(self.defer(&event, reason)));
                }
            }
        }
        Ok(PassEnd::Drained)
    }

    async fn push_with_timeout(&self, event: &SyncEvent) -> PushOutcome {
        let timeout = self.inner.config.push_timeout();
        match tokio::time::timeout(timeout, self.inner.remote.push(event)).await {
            Ok(outcome) => outcome,
            Err(_) => PushOutcome::Transient(format!("push timed out after {:?}", timeout)),
        }
    }

    /// Record a transient failure, schedule the retry and pick the end status.
    fn defer(&self, event: &SyncEvent, reason: String) -> SyncStatus {
        if !self.is_online() {
            return SyncStatus::Offline;
        }
        let (delay, failures) = {
            let mut backoff = self.inner.backoff.lock();
            let delay = backoff.next_delay();
            (delay, backoff.failures())
        };
        self.inner.retry_tx.send_replace(Some(Instant::now() + delay));
        warn!(
            event_id = %event.id,
            %reason,
            failures,
            retry_in_ms = delay.as_millis() as u64,
            "Push failed, will retry"
        );
        let _ = self.inner.activity_tx.send(SyncActivity::Deferred {
            event_id: event.id.clone(),
            reason: reason.clone(),
            retry_in: delay,
        });
        if failures >= self.inner.config.max_transient_failures {
            SyncStatus::Error(reason)
        } else {
            SyncStatus::Idle
        }
    }

    /// React to a reachability change.
    fn on_reachability(&self, online: bool) {
        if !online {
            info!("Remote unreachable");
            self.inner.retry_tx.send_replace(None);
            self.inner.status_tx.send_if_modified(|status| {
                if status.is_syncing() || *status == SyncStatus::Offline {
                    false
                } else {
                    *status = SyncStatus::Offline;
                    true
                }
            });
            return;
        }

        info!("Remote reachable");
        self.inner.status_tx.send_if_modified(|status| {
            if *status == SyncStatus::Offline {
                *status = SyncStatus::Idle;
                true
            } else {
                false
            }
        });
        match self.inner.outbox.pending_count() {
            Ok(0) => {}
            Ok(_) => {
                self.request_sync(SyncTrigger::Reachability);
            }
            Err(e) => warn!(error = %e, "Could not read outbox count"),
        }
    }

    /// Spawn the task that reacts to reachability and runs backoff retries.
    pub fn spawn_driver(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut reachable = this.inner.reachable.clone();
            let mut retry_rx = this.inner.retry_tx.subscribe();

            // Catch up on anything queued while the app was closed.
            let online = *reachable.borrow_and_update();
            this.on_reachability(online);

            loop {
                let retry_at = *retry_rx.borrow_and_update();
                tokio::select! {
                    _ = this.inner.cancel.cancelled() => break,
                    changed = reachable.changed() => {
                        if changed.is_err() {
                            warn!("Reachability source closed");
                            break;
                        }
                        let online = *reachable.borrow_and_update();
                        this.on_reachability(online);
                    }
                    changed = retry_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sleep_until_opt(retry_at) => {
                        this.inner.retry_tx.send_replace(None);
                        debug!("Backoff retry due");
                        this.request_sync(SyncTrigger::Retry);
                    }
                }
            }
            debug!("Sync driver stopped");
        })
    }

    /// Stop the driver task
    pub fn shutdown(&self) {
        info!("Shutting down SyncManager");
        self.inner.cancel.cancel();
    }
}

async fn wait_offline(reachable: &mut watch::Receiver<bool>) {
    if reachable.wait_for(|online| !*online).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
