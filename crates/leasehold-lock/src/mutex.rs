//! Lease-guarded mutual exclusion
//!
//! Acquire grants a lease, starts renewing it, then runs one transaction:
//! if the lock key has never been created (`create_revision == 0`) put the
//! lock record attached to the lease, otherwise read the current record.
//! The store's transaction is the only arbiter; the manager holds no state
//! shared between keys.
//!
//! Acquiring is not reentrant. A second acquire of a key the caller already
//! holds fails with [`LockError::LockHeld`]; use [`MutexHandle::is_owner`] to
//! check ownership instead.

use std::sync::Arc;
use std::time::Duration;

use leasehold_common::LockConfig;
use leasehold_store::{
    Compare, CompareOp, GetOptions, KvStore, LeaseId, LeaseKeepAliveResponse, Op, PutOptions,
    Revision, StoreError, Txn,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{LockError, with_deadline};
use crate::keepalive::{KeepAlive, KeepAliveOptions, RenewalStatus};

/// Hands out lease-guarded locks against an injected store
pub struct LockManager {
    store: Arc<dyn KvStore>,
    config: LockConfig,
    owner_id: String,
}

impl LockManager {
    pub fn new(store: Arc<dyn KvStore>, config: LockConfig) -> Self {
        let owner_id = config.resolve_owner_id();
        Self {
            store,
            config,
            owner_id,
        }
    }

    /// Value written into lock records by [`LockManager::acquire`]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire `key` with the configured default TTL
    pub async fn acquire_default(&self, key: &str) -> Result<MutexHandle, LockError> {
        self.acquire(key, self.config.default_ttl_secs).await
    }

    /// Acquire `key` with a lease of `ttl` seconds, writing the owner id
    pub async fn acquire(&self, key: &str, ttl: i64) -> Result<MutexHandle, LockError> {
        self.acquire_with_value(key, self.owner_id.as_bytes(), ttl)
            .await
    }

    /// Acquire `key` with a lease of `ttl` seconds, writing `value` as the
    /// lock record
    pub async fn acquire_with_value(
        &self,
        key: &str,
        value: &[u8],
        ttl: i64,
    ) -> Result<MutexHandle, LockError> {
        self.acquire_with_timeout(key, value, ttl, self.config.request_timeout())
            .await
    }

    /// Like [`LockManager::acquire_with_value`], bounding each store call by
    /// `timeout` instead of the configured request timeout. The handle keeps
    /// using `timeout` for its own calls.
    pub async fn acquire_with_timeout(
        &self,
        key: &str,
        value: &[u8],
        ttl: i64,
        timeout: Duration,
    ) -> Result<MutexHandle, LockError> {

        let lease = match with_deadline("lease_grant", timeout, self.store.lease_grant(ttl)).await
        {
            Ok(lease) => lease,
            Err(LockError::Store(e)) => return Err(LockError::LeaseGrant(e)),
            Err(e) => return Err(e),
        };
        debug!(key, lease_id = lease.id, ttl = lease.ttl, "Lease granted for lock");

        let (mut keepalive, renewals) = KeepAlive::spawn(
            self.store.clone(),
            KeepAliveOptions {
                lease_id: lease.id,
                ttl: Duration::from_secs(lease.ttl.max(1) as u64),
                interval: self.config.keepalive_interval(lease.ttl),
                request_timeout: timeout,
                buffer: self.config.renewal_buffer,
            },
        );

        let txn = Txn::new()
            .when([Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then([Op::put(key, value, PutOptions::new().with_lease(lease.id))])
            .or_else([Op::get(key, GetOptions::new())]);

        let response = match with_deadline("txn", timeout, self.store.txn(txn)).await {
            Ok(response) => response,
            Err(e) => {
                abandon(&self.store, &mut keepalive, lease.id, timeout).await;
                return Err(e);
            }
        };

        if !response.succeeded {
            abandon(&self.store, &mut keepalive, lease.id, timeout).await;

            let holder = response
                .responses
                .first()
                .and_then(|r| r.as_get())
                .and_then(|get| get.kvs.first())
                .map(|kv| kv.value.clone());

            metrics::counter!("leasehold_lock_contended_total").increment(1);
            debug!(key, "Lock is held by another lease");
            return Err(LockError::LockHeld {
                key: key.to_string(),
                holder,
            });
        }

        metrics::counter!("leasehold_lock_acquired_total").increment(1);
        info!(key, lease_id = lease.id, revision = response.header.revision, "Lock acquired");

        Ok(MutexHandle {
            key: key.to_string(),
            value: value.to_vec(),
            lease_id: lease.id,
            ttl: lease.ttl,
            revision: response.header.revision,
            store: self.store.clone(),
            request_timeout: timeout,
            keepalive,
            renewals,
        })
    }

    /// Release a lock. Same as [`MutexHandle::release`].
    pub async fn release(&self, handle: MutexHandle) -> Result<(), LockError> {
        handle.release().await
    }
}

/// Undo a grant whose lock was not obtained
async fn abandon(
    store: &Arc<dyn KvStore>,
    keepalive: &mut KeepAlive,
    lease_id: LeaseId,
    timeout: Duration,
) {
    keepalive.cancel().await;
    match with_deadline("lease_revoke", timeout, store.lease_revoke(lease_id)).await {
        Ok(_) | Err(LockError::Store(StoreError::LeaseNotFound(_))) => {}
        Err(e) => warn!(lease_id, "Failed to revoke unused lease: {}", e),
    }
}

/// A held lock.
///
/// Dropping the handle without releasing stops renewal, so the lock lapses
/// once the lease TTL runs out.
pub struct MutexHandle {
    key: String,
    value: Vec<u8>,
    lease_id: LeaseId,
    ttl: i64,
    revision: Revision,
    store: Arc<dyn KvStore>,
    request_timeout: Duration,
    keepalive: KeepAlive,
    renewals: mpsc::Receiver<LeaseKeepAliveResponse>,
}

impl MutexHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    /// Granted lease TTL in seconds
    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    /// Creation revision of the lock record. Later holders of the same key
    /// always see a larger one, so it can serve as a fencing token.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn renewal_status(&self) -> RenewalStatus {
        self.keepalive.status()
    }

    /// Next renewal confirmation, `None` once renewal has stopped
    pub async fn next_renewal(&mut self) -> Option<LeaseKeepAliveResponse> {
        self.renewals.recv().await
    }

    /// Wait until renewal stops. Returns the failure if the lease could not
    /// be renewed, `None` if renewal was stopped by the holder.
    pub async fn lost(&self) -> Option<LockError> {
        let mut status = self.keepalive.subscribe();
        let outcome = match status.wait_for(|s| *s != RenewalStatus::Active).await {
            Ok(s) => s.clone(),
            Err(_) => RenewalStatus::Stopped,
        };

        match outcome {
            RenewalStatus::Failed(reason) => Some(LockError::RenewalFailed {
                lease_id: self.lease_id,
                reason,
            }),
            _ => None,
        }
    }

    /// Whether the lock record still exists and belongs to this handle's lease
    pub async fn is_owner(&self) -> Result<bool, LockError> {
        let response = with_deadline(
            "get",
            self.request_timeout,
            self.store.get(self.key.as_bytes(), GetOptions::new()),
        )
        .await?;

        Ok(response
            .kvs
            .first()
            .is_some_and(|kv| kv.lease == self.lease_id && kv.create_revision == self.revision))
    }

    /// Stop renewal and revoke the lease.
    ///
    /// A lease the store no longer knows counts as released. Renewal is
    /// stopped before the revoke is sent, so on any error the lock still
    /// lapses after the TTL.
    pub async fn release(mut self) -> Result<(), LockError> {
        self.keepalive.cancel().await;

        let result = with_deadline(
            "lease_revoke",
            self.request_timeout,
            self.store.lease_revoke(self.lease_id),
        )
        .await;

        match result {
            Ok(_) => {}
            Err(LockError::Store(StoreError::LeaseNotFound(_))) => {
                debug!(key = %self.key, lease_id = self.lease_id, "Lease already gone on release");
            }
            Err(e) => {
                warn!(key = %self.key, lease_id = self.lease_id, "Failed to revoke lease: {}", e);
                return Err(e);
            }
        }

        metrics::counter!("leasehold_lock_released_total").increment(1);
        info!(key = %self.key, lease_id = self.lease_id, "Lock released");
        Ok(())
    }
}

impl std::fmt::Debug for MutexHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexHandle")
            .field("key", &self.key)
            .field("lease_id", &self.lease_id)
            .field("ttl", &self.ttl)
            .field("revision", &self.revision)
            .field("status", &self.keepalive.status())
            .finish()
    }
}
