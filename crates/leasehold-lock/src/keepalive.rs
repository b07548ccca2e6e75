//! Lease renewal task
//!
//! One task per held lease. It renews on a fixed cadence and forwards each
//! confirmation, in order, on a bounded channel. The task owns the receiving
//! half of a oneshot stop signal; sending on it or dropping the sender stops
//! the task, which closes the confirmation channel.
//!
//! Transient store errors are retried on the next tick for as long as the
//! lease can still be alive. A missing lease, or a local deadline that has
//! passed, ends renewal as a failure and the lease is revoked best-effort.

use std::sync::Arc;
use std::time::Duration;

use leasehold_store::{KvStore, LeaseId, LeaseKeepAliveResponse, StoreError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, trace, warn};

/// State of a lease renewal task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalStatus {
    /// Renewing on schedule
    Active,
    /// Stopped by the holder
    Stopped,
    /// Stopped because the lease could not be renewed
    Failed(String),
}

/// Parameters for one renewal task
#[derive(Debug, Clone, Copy)]
pub(crate) struct KeepAliveOptions {
    pub lease_id: LeaseId,
    pub ttl: Duration,
    pub interval: Duration,
    pub request_timeout: Duration,
    pub buffer: usize,
}

/// Control side of a running renewal task
pub(crate) struct KeepAlive {
    lease_id: LeaseId,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    status_rx: watch::Receiver<RenewalStatus>,
}

impl KeepAlive {
    /// Spawn the renewal task, returning its control and confirmation stream
    pub(crate) fn spawn(
        store: Arc<dyn KvStore>,
        options: KeepAliveOptions,
    ) -> (Self, mpsc::Receiver<LeaseKeepAliveResponse>) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (status_tx, status_rx) = watch::channel(RenewalStatus::Active);
        let (renew_tx, renew_rx) = mpsc::channel(options.buffer.max(1));

        let task = tokio::spawn(run(store, options, stop_rx, status_tx, renew_tx));

        (
            Self {
                lease_id: options.lease_id,
                stop_tx: Some(stop_tx),
                task: Some(task),
                status_rx,
            },
            renew_rx,
        )
    }

    pub(crate) fn status(&self) -> RenewalStatus {
        self.status_rx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<RenewalStatus> {
        self.status_rx.clone()
    }

    /// Stop renewing and wait for the task to exit. Idempotent.
    pub(crate) async fn cancel(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(lease_id = self.lease_id, "Renewal task ended abnormally: {}", e);
        }
    }
}

async fn run(
    store: Arc<dyn KvStore>,
    options: KeepAliveOptions,
    mut stop_rx: oneshot::Receiver<()>,
    status_tx: watch::Sender<RenewalStatus>,
    renew_tx: mpsc::Sender<LeaseKeepAliveResponse>,
) {
    let lease_id = options.lease_id;
    let mut ticker = interval_at(Instant::now() + options.interval, options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut deadline = Instant::now() + options.ttl;

    let outcome = loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break RenewalStatus::Stopped,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = &mut stop_rx => break RenewalStatus::Stopped,
            r = tokio::time::timeout(options.request_timeout, store.lease_keep_alive(lease_id)) => r,
        };

        match result {
            Ok(Ok(response)) if response.ttl > 0 => {
                deadline = Instant::now() + Duration::from_secs(response.ttl as u64);
                trace!(lease_id, ttl = response.ttl, "Lease renewed");
                match renew_tx.try_send(response) {
                    Ok(()) | Err(TrySendError::Closed(_)) => {}
                    Err(TrySendError::Full(_)) => {
                        trace!(lease_id, "Renewal confirmation dropped, consumer is behind");
                    }
                }
            }
            Ok(Ok(_)) => break RenewalStatus::Failed("lease expired".to_string()),
            Ok(Err(StoreError::LeaseNotFound(_))) => {
                break RenewalStatus::Failed("lease not found".to_string());
            }
            Ok(Err(e)) if Instant::now() < deadline => {
                warn!(lease_id, "Lease renewal failed, retrying: {}", e);
            }
            Err(_) if Instant::now() < deadline => {
                warn!(lease_id, timeout = ?options.request_timeout, "Lease renewal timed out, retrying");
            }
            Ok(Err(e)) => break RenewalStatus::Failed(e.to_string()),
            Err(_) => break RenewalStatus::Failed("lease deadline passed".to_string()),
        }
    };

    if let RenewalStatus::Failed(reason) = &outcome {
        warn!(lease_id, reason = %reason, "Lease renewal stopped");
        metrics::counter!("leasehold_lease_renewal_failed_total").increment(1);

        // Do not leave a lease behind that nobody renews or releases
        match tokio::time::timeout(options.request_timeout, store.lease_revoke(lease_id)).await {
            Ok(Ok(_)) | Ok(Err(StoreError::LeaseNotFound(_))) => {}
            Ok(Err(e)) => debug!(lease_id, "Revoke after renewal failure failed: {}", e),
            Err(_) => debug!(lease_id, "Revoke after renewal failure timed out"),
        }
    } else {
        debug!(lease_id, "Lease renewal stopped by holder");
    }

    let _ = status_tx.send(outcome);
}
