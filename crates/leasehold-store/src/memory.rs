//! In-memory store implementation
//!
//! Provides:
//! - Revisioned key space with create/mod revision and version tracking
//! - Leases with TTL expiry, keep-alive and revoke
//! - Prefix watches with history replay from a start revision
//! - Atomic compare-and-branch transactions
//!
//! All state sits behind one mutex, which makes every request linearizable.
//! Lease expiry is applied before each request and by an optional background
//! scanner, so watchers also see expiry deletes on an idle store.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use leasehold_common::MemoryStoreConfig;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval};
use tracing::{debug, trace};

use crate::error::{Result, StoreError};
use crate::model::*;
use crate::store::KvStore;
use crate::watch::WatchStream;

/// In-memory linearizable key-value store
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<StoreState>,
    faults: Mutex<Faults>,
    config: MemoryStoreConfig,
}

/// Longest lease TTL in seconds the store accepts
pub const MAX_LEASE_TTL: i64 = 9_000_000_000;

/// Injected failures, used to exercise client error paths
#[derive(Default)]
struct Faults {
    unavailable: Option<String>,
    latency: Option<Duration>,
    /// Extra delay for a single operation, keyed by operation name
    operation_latency: HashMap<&'static str, Duration>,
}

struct LeaseEntry {
    ttl: i64,
    deadline: Instant,
    keys: BTreeSet<Vec<u8>>,
}

struct Watcher {
    id: i64,
    key: Vec<u8>,
    prefix: bool,
    prev_kv: bool,
    tx: mpsc::UnboundedSender<WatchResponse>,
}

impl Watcher {
    fn matches(&self, key: &[u8]) -> bool {
        key_matches(&self.key, self.prefix, key)
    }

    fn filter(&self, events: &[Event]) -> Vec<Event> {
        events
            .iter()
            .filter(|e| self.matches(&e.kv.key))
            .map(|e| {
                let mut e = e.clone();
                if !self.prev_kv {
                    e.prev_kv = None;
                }
                e
            })
            .collect()
    }
}

fn key_matches(watched: &[u8], prefix: bool, key: &[u8]) -> bool {
    if prefix {
        key.starts_with(watched)
    } else {
        key == watched
    }
}

struct StoreState {
    revision: Revision,
    kvs: BTreeMap<Vec<u8>, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    next_lease_id: LeaseId,
    history: VecDeque<Event>,
    /// Highest revision whose events were dropped from history
    compacted_revision: Revision,
    watchers: Vec<Watcher>,
    next_watch_id: i64,
    history_limit: usize,
}

impl StoreState {
    fn new(history_limit: usize) -> Self {
        Self {
            revision: 1,
            kvs: BTreeMap::new(),
            leases: HashMap::new(),
            next_lease_id: 1,
            history: VecDeque::new(),
            compacted_revision: 0,
            watchers: Vec::new(),
            next_watch_id: 1,
            history_limit,
        }
    }

    fn header(&self) -> ResponseHeader {
        ResponseHeader {
            revision: self.revision,
        }
    }

    fn range_keys(&self, key: &[u8], prefix: bool) -> Vec<Vec<u8>> {
        if prefix {
            self.kvs
                .range(key.to_vec()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(k, _)| k.clone())
                .collect()
        } else if self.kvs.contains_key(key) {
            vec![key.to_vec()]
        } else {
            Vec::new()
        }
    }

    // ------------------------------------------------------------------------
    // Mutations. `rev` is the revision the enclosing request commits at.
    // ------------------------------------------------------------------------

    fn apply_put(
        &mut self,
        rev: Revision,
        key: &[u8],
        value: &[u8],
        options: PutOptions,
        events: &mut Vec<Event>,
    ) -> Result<PutResponse> {
        let lease = options.lease.unwrap_or(0);
        if lease != 0 && !self.leases.contains_key(&lease) {
            return Err(StoreError::LeaseNotFound(lease));
        }

        let prev = self.kvs.get(key).cloned();
        if let Some(prev) = &prev
            && prev.lease != 0
            && prev.lease != lease
            && let Some(old) = self.leases.get_mut(&prev.lease)
        {
            old.keys.remove(key);
        }
        if lease != 0
            && let Some(entry) = self.leases.get_mut(&lease)
        {
            entry.keys.insert(key.to_vec());
        }

        let kv = KeyValue {
            key: key.to_vec(),
            value: value.to_vec(),
            create_revision: prev.as_ref().map_or(rev, |p| p.create_revision),
            mod_revision: rev,
            version: prev.as_ref().map_or(1, |p| p.version + 1),
            lease,
        };
        self.kvs.insert(key.to_vec(), kv.clone());
        events.push(Event {
            event_type: EventType::Put,
            kv,
            prev_kv: prev.clone(),
        });

        Ok(PutResponse {
            header: ResponseHeader { revision: rev },
            prev_kv: if options.prev_kv { prev } else { None },
        })
    }

    fn apply_delete(
        &mut self,
        rev: Revision,
        key: &[u8],
        options: DeleteOptions,
        events: &mut Vec<Event>,
    ) -> DeleteResponse {
        let keys = self.range_keys(key, options.prefix);
        let mut prev_kvs = Vec::new();

        for k in &keys {
            if let Some(removed) = self.remove_key(rev, k, events)
                && options.prev_kv
            {
                prev_kvs.push(removed);
            }
        }

        DeleteResponse {
            header: ResponseHeader {
                revision: if keys.is_empty() { self.revision } else { rev },
            },
            deleted: keys.len() as i64,
            prev_kvs,
        }
    }

    fn remove_key(&mut self, rev: Revision, key: &[u8], events: &mut Vec<Event>) -> Option<KeyValue> {
        let removed = self.kvs.remove(key)?;
        if removed.lease != 0
            && let Some(entry) = self.leases.get_mut(&removed.lease)
        {
            entry.keys.remove(key);
        }
        events.push(Event {
            event_type: EventType::Delete,
            kv: KeyValue {
                key: key.to_vec(),
                mod_revision: rev,
                ..Default::default()
            },
            prev_kv: Some(removed.clone()),
        });
        Some(removed)
    }

    fn apply_get(&self, key: &[u8], options: GetOptions) -> GetResponse {
        let keys = self.range_keys(key, options.prefix);
        let count = keys.len();
        let take = if options.limit == 0 {
            count
        } else {
            options.limit.min(count)
        };

        let kvs = if options.count_only {
            Vec::new()
        } else {
            keys.iter()
                .take(take)
                .filter_map(|k| self.kvs.get(k).cloned())
                .collect()
        };

        GetResponse {
            header: self.header(),
            kvs,
            count: count as i64,
            more: take < count,
        }
    }

    fn apply_op(&mut self, rev: Revision, op: &Op, events: &mut Vec<Event>) -> Result<OpResponse> {
        match op {
            Op::Put {
                key,
                value,
                options,
            } => self
                .apply_put(rev, key, value, *options, events)
                .map(OpResponse::Put),
            Op::Get { key, options } => {
                let mut response = self.apply_get(key, *options);
                // Reads inside a writing transaction observe its earlier writes
                if !events.is_empty() {
                    response.header.revision = rev;
                }
                Ok(OpResponse::Get(response))
            }
            Op::Delete { key, options } => Ok(OpResponse::Delete(
                self.apply_delete(rev, key, *options, events),
            )),
        }
    }

    /// Remove a lease and its keys, committing a revision if any key went away
    fn revoke_lease(&mut self, id: LeaseId) -> Option<Revision> {
        let entry = self.leases.remove(&id)?;
        let rev = self.revision + 1;
        let mut events = Vec::new();
        for key in &entry.keys {
            self.remove_key(rev, key, &mut events);
        }
        self.commit(rev, events);
        Some(self.revision)
    }

    fn expire_leases(&mut self, now: Instant) -> usize {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| now >= lease.deadline)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            debug!(lease_id = id, "Lease expired");
            self.revoke_lease(*id);
        }
        expired.len()
    }

    /// Publish the events of one request. A request without events does not
    /// advance the revision.
    fn commit(&mut self, rev: Revision, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        self.revision = rev;

        let header = ResponseHeader { revision: rev };
        self.watchers.retain(|watcher| {
            let matched = watcher.filter(&events);
            if matched.is_empty() {
                return !watcher.tx.is_closed();
            }
            watcher
                .tx
                .send(WatchResponse {
                    header,
                    watch_id: watcher.id,
                    events: matched,
                })
                .is_ok()
        });

        self.history.extend(events);
        while self.history.len() > self.history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted_revision = dropped.revision();
            }
        }
    }

    fn replay(&self, watcher: &Watcher, start: Revision) -> Result<()> {
        if start <= self.compacted_revision {
            return Err(StoreError::Compacted {
                requested: start,
                oldest: self.compacted_revision + 1,
            });
        }

        let mut batch: Vec<Event> = Vec::new();
        let mut batch_rev = 0;
        for event in self.history.iter().filter(|e| e.revision() >= start) {
            if event.revision() != batch_rev && !batch.is_empty() {
                send_batch(watcher, batch_rev, std::mem::take(&mut batch));
            }
            batch_rev = event.revision();
            batch.push(event.clone());
        }
        if !batch.is_empty() {
            send_batch(watcher, batch_rev, batch);
        }
        Ok(())
    }
}

fn send_batch(watcher: &Watcher, rev: Revision, events: Vec<Event>) {
    let matched = watcher.filter(&events);
    if !matched.is_empty() {
        let _ = watcher.tx.send(WatchResponse {
            header: ResponseHeader { revision: rev },
            watch_id: watcher.id,
            events: matched,
        });
    }
}

fn remaining_secs(deadline: Instant, now: Instant) -> i64 {
    let remaining = deadline.saturating_duration_since(now);
    remaining.as_millis().div_ceil(1000) as i64
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(StoreState::new(config.history_limit)),
                faults: Mutex::new(Faults::default()),
                config,
            }),
        }
    }

    /// Start the background lease expiry scanner.
    ///
    /// Must be called inside a tokio runtime. The scanner stops once every
    /// clone of the store is dropped.
    pub fn with_expiry_scanner(self) -> Self {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.expiry_scan_interval();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let (expired, alive) = {
                    let mut state = inner.state.lock();
                    (state.expire_leases(Instant::now()), state.leases.len())
                };

                if expired > 0 {
                    trace!(expired, alive, "Expiry scan removed leases");
                }
                metrics::gauge!("leasehold_store_leases_alive").set(alive as f64);
            }
            debug!("Lease expiry scanner stopped");
        });

        self
    }

    /// Current store revision
    pub fn revision(&self) -> Revision {
        self.inner.state.lock().revision
    }

    /// Make every request fail with [`StoreError::Unavailable`] until cleared
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.inner.faults.lock().unavailable = reason.map(str::to_string);
    }

    /// Delay every request by `latency` before it is applied
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.faults.lock().latency = latency;
    }

    /// Delay only requests of one operation, named after the [`KvStore`]
    /// method (`"txn"`, `"lease_revoke"`, ...)
    pub fn set_operation_latency(&self, operation: &'static str, latency: Option<Duration>) {
        let mut faults = self.inner.faults.lock();
        match latency {
            Some(latency) => {
                faults.operation_latency.insert(operation, latency);
            }
            None => {
                faults.operation_latency.remove(operation);
            }
        }
    }

    async fn before_request(&self, operation: &'static str) -> Result<()> {
        let (unavailable, latency) = {
            let faults = self.inner.faults.lock();
            let latency = match (faults.latency, faults.operation_latency.get(operation)) {
                (Some(all), Some(one)) => Some(all + *one),
                (all, one) => all.or(one.copied()),
            };
            (faults.unavailable.clone(), latency)
        };
        if let Some(latency) = latency {
            trace!(operation, ?latency, "Delaying request");
            tokio::time::sleep(latency).await;
        }
        match unavailable {
            Some(reason) => Err(StoreError::Unavailable(reason)),
            None => Ok(()),
        }
    }

    /// Lock the state with expired leases already removed
    fn state(&self) -> parking_lot::MutexGuard<'_, StoreState> {
        let mut state = self.inner.state.lock();
        state.expire_leases(Instant::now());
        state
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn put(&self, key: &[u8], value: &[u8], options: PutOptions) -> Result<PutResponse> {
        self.before_request("put").await?;
        if key.is_empty() {
            return Err(StoreError::InvalidArgument("key is not provided".to_string()));
        }

        let mut state = self.state();
        let rev = state.revision + 1;
        let mut events = Vec::new();
        let response = state.apply_put(rev, key, value, options, &mut events)?;
        state.commit(rev, events);
        Ok(response)
    }

    async fn get(&self, key: &[u8], options: GetOptions) -> Result<GetResponse> {
        self.before_request("get").await?;
        Ok(self.state().apply_get(key, options))
    }

    async fn delete(&self, key: &[u8], options: DeleteOptions) -> Result<DeleteResponse> {
        self.before_request("delete").await?;

        let mut state = self.state();
        let rev = state.revision + 1;
        let mut events = Vec::new();
        let response = state.apply_delete(rev, key, options, &mut events);
        state.commit(rev, events);
        Ok(response)
    }

    async fn lease_grant(&self, ttl: i64) -> Result<LeaseGrantResponse> {
        self.before_request("lease_grant").await?;
        if ttl <= 0 || ttl > MAX_LEASE_TTL {
            return Err(StoreError::InvalidArgument(format!(
                "lease TTL must be in 1..={}, got {}",
                MAX_LEASE_TTL, ttl
            )));
        }
        let deadline = Instant::now()
            .checked_add(Duration::from_secs(ttl as u64))
            .ok_or_else(|| StoreError::InvalidArgument(format!("lease TTL {} is too large", ttl)))?;

        let mut state = self.state();
        let id = state.next_lease_id;
        state.next_lease_id += 1;
        state.leases.insert(
            id,
            LeaseEntry {
                ttl,
                deadline,
                keys: BTreeSet::new(),
            },
        );
        debug!(lease_id = id, ttl, "Lease granted");

        Ok(LeaseGrantResponse {
            header: state.header(),
            id,
            ttl,
        })
    }

    async fn lease_keep_alive(&self, id: LeaseId) -> Result<LeaseKeepAliveResponse> {
        self.before_request("lease_keep_alive").await?;

        let mut state = self.state();
        let header = state.header();
        let lease = state
            .leases
            .get_mut(&id)
            .ok_or(StoreError::LeaseNotFound(id))?;
        lease.deadline = Instant::now() + Duration::from_secs(lease.ttl as u64);

        Ok(LeaseKeepAliveResponse {
            header,
            id,
            ttl: lease.ttl,
        })
    }

    async fn lease_revoke(&self, id: LeaseId) -> Result<LeaseRevokeResponse> {
        self.before_request("lease_revoke").await?;

        let mut state = self.state();
        state
            .revoke_lease(id)
            .ok_or(StoreError::LeaseNotFound(id))?;
        debug!(lease_id = id, "Lease revoked");

        Ok(LeaseRevokeResponse {
            header: state.header(),
        })
    }

    async fn lease_time_to_live(&self, id: LeaseId) -> Result<LeaseTimeToLiveResponse> {
        self.before_request("lease_time_to_live").await?;

        let state = self.state();
        let response = match state.leases.get(&id) {
            Some(lease) => LeaseTimeToLiveResponse {
                header: state.header(),
                id,
                ttl: remaining_secs(lease.deadline, Instant::now()),
                granted_ttl: lease.ttl,
                keys: lease.keys.iter().cloned().collect(),
            },
            None => LeaseTimeToLiveResponse {
                header: state.header(),
                id,
                ttl: -1,
                granted_ttl: 0,
                keys: Vec::new(),
            },
        };
        Ok(response)
    }

    async fn watch(&self, key: &[u8], options: WatchOptions) -> Result<WatchStream> {
        self.before_request("watch").await?;

        let mut state = self.state();
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Watcher {
            id: state.next_watch_id,
            key: key.to_vec(),
            prefix: options.prefix,
            prev_kv: options.prev_kv,
            tx,
        };

        if let Some(start) = options.start_revision
            && start > 0
        {
            state.replay(&watcher, start)?;
        }

        state.next_watch_id += 1;
        let id = watcher.id;
        state.watchers.push(watcher);
        debug!(watch_id = id, prefix = options.prefix, "Watch created");

        Ok(WatchStream::new(id, rx))
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        self.before_request("txn").await?;

        let mut state = self.state();
        let succeeded = txn
            .compare
            .iter()
            .all(|cmp| cmp.evaluate(state.kvs.get(&cmp.key)));
        let ops = if succeeded { &txn.success } else { &txn.failure };

        // Reject the whole branch up front so a failing put cannot leave
        // earlier writes of the same transaction applied
        for op in ops {
            if let Op::Put { options, .. } = op
                && let Some(lease) = options.lease
                && lease != 0
                && !state.leases.contains_key(&lease)
            {
                return Err(StoreError::LeaseNotFound(lease));
            }
        }

        let rev = state.revision + 1;
        let mut events = Vec::new();
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            responses.push(state.apply_op(rev, op, &mut events)?);
        }
        state.commit(rev, events);

        Ok(TxnResponse {
            header: state.header(),
            succeeded,
            responses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();

        let put = store.put(b"/a", b"1", PutOptions::new()).await.unwrap();
        assert_eq!(put.header.revision, 2);
        assert!(put.prev_kv.is_none());

        let get = store.get(b"/a", GetOptions::new()).await.unwrap();
        assert_eq!(get.count, 1);
        assert_eq!(get.kvs[0].value, b"1");
        assert_eq!(get.kvs[0].create_revision, 2);
        assert_eq!(get.kvs[0].version, 1);

        let del = store.delete(b"/a", DeleteOptions::new()).await.unwrap();
        assert_eq!(del.deleted, 1);
        assert_eq!(del.header.revision, 3);

        let get = store.get(b"/a", GetOptions::new()).await.unwrap();
        assert_eq!(get.count, 0);
    }

    #[tokio::test]
    async fn test_overwrite_keeps_create_revision() {
        let store = MemoryStore::new();
        store.put(b"k", b"v1", PutOptions::new()).await.unwrap();
        let put = store
            .put(b"k", b"v2", PutOptions::new().with_prev_kv())
            .await
            .unwrap();
        assert_eq!(put.prev_kv.unwrap().value, b"v1");

        let kv = store.get(b"k", GetOptions::new()).await.unwrap().kvs.remove(0);
        assert_eq!(kv.create_revision, 2);
        assert_eq!(kv.mod_revision, 3);
        assert_eq!(kv.version, 2);
    }

    #[tokio::test]
    async fn test_empty_delete_does_not_advance_revision() {
        let store = MemoryStore::new();
        let before = store.revision();
        let del = store.delete(b"missing", DeleteOptions::new()).await.unwrap();
        assert_eq!(del.deleted, 0);
        assert_eq!(store.revision(), before);
    }

    #[tokio::test]
    async fn test_get_limit_and_count_only() {
        let store = MemoryStore::new();
        for k in ["/p/1", "/p/2", "/p/3", "/q/1"] {
            store.put(k.as_bytes(), b"v", PutOptions::new()).await.unwrap();
        }

        let limited = store
            .get(b"/p/", GetOptions::new().with_prefix().with_limit(2))
            .await
            .unwrap();
        assert_eq!(limited.kvs.len(), 2);
        assert_eq!(limited.count, 3);
        assert!(limited.more);

        let counted = store
            .get(b"/p/", GetOptions::new().with_prefix().with_count_only())
            .await
            .unwrap();
        assert!(counted.kvs.is_empty());
        assert_eq!(counted.count, 3);
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = MemoryStore::new();
        let err = store
            .put(b"k", b"v", PutOptions::new().with_lease(42))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::LeaseNotFound(42));
    }

    #[tokio::test]
    async fn test_lease_grant_rejects_non_positive_ttl() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.lease_grant(0).await,
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_lease_grant_rejects_oversized_ttl() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.lease_grant(i64::MAX).await,
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.lease_grant(MAX_LEASE_TTL + 1).await,
            Err(StoreError::InvalidArgument(_))
        ));

        let lease = store.lease_grant(MAX_LEASE_TTL).await.unwrap();
        assert_eq!(lease.ttl, MAX_LEASE_TTL);
        let ka = store.lease_keep_alive(lease.id).await.unwrap();
        assert_eq!(ka.ttl, MAX_LEASE_TTL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_removes_keys() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(2).await.unwrap();
        store
            .put(b"k", b"v", PutOptions::new().with_lease(lease.id))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.get(b"k", GetOptions::new()).await.unwrap().count, 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.get(b"k", GetOptions::new()).await.unwrap().count, 0);

        let ttl = store.lease_time_to_live(lease.id).await.unwrap();
        assert_eq!(ttl.ttl, -1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_extends_deadline() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(2).await.unwrap();
        store
            .put(b"k", b"v", PutOptions::new().with_lease(lease.id))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let ka = store.lease_keep_alive(lease.id).await.unwrap();
        assert_eq!(ka.id, lease.id);
        assert_eq!(ka.ttl, 2);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.get(b"k", GetOptions::new()).await.unwrap().count, 1);

        let ttl = store.lease_time_to_live(lease.id).await.unwrap();
        assert_eq!(ttl.ttl, 1);
        assert_eq!(ttl.granted_ttl, 2);
        assert_eq!(ttl.keys, vec![b"k".to_vec()]);
    }

    #[tokio::test]
    async fn test_revoke_deletes_attached_keys() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(60).await.unwrap();
        for k in ["a", "b"] {
            store
                .put(k.as_bytes(), b"v", PutOptions::new().with_lease(lease.id))
                .await
                .unwrap();
        }
        let before = store.revision();

        store.lease_revoke(lease.id).await.unwrap();
        assert_eq!(store.revision(), before + 1);
        assert_eq!(store.get(b"", GetOptions::new().with_prefix()).await.unwrap().count, 0);

        assert_eq!(
            store.lease_revoke(lease.id).await.unwrap_err(),
            StoreError::LeaseNotFound(lease.id)
        );
        assert_eq!(
            store.lease_keep_alive(lease.id).await.unwrap_err(),
            StoreError::LeaseNotFound(lease.id)
        );
    }

    #[tokio::test]
    async fn test_put_without_lease_detaches_key() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(60).await.unwrap();
        store
            .put(b"k", b"v", PutOptions::new().with_lease(lease.id))
            .await
            .unwrap();
        store.put(b"k", b"v2", PutOptions::new()).await.unwrap();

        store.lease_revoke(lease.id).await.unwrap();
        let get = store.get(b"k", GetOptions::new()).await.unwrap();
        assert_eq!(get.kvs[0].value, b"v2");
        assert_eq!(get.kvs[0].lease, 0);
    }

    #[tokio::test]
    async fn test_txn_commits_at_single_revision() {
        let store = MemoryStore::new();
        let before = store.revision();

        let resp = store
            .txn(Txn::new().and_then([
                Op::put("x", "1", PutOptions::new()),
                Op::put("y", "2", PutOptions::new()),
                Op::get("x", GetOptions::new()),
            ]))
            .await
            .unwrap();
        assert!(resp.succeeded);
        assert_eq!(resp.header.revision, before + 1);
        assert_eq!(resp.responses[2].as_get().unwrap().kvs[0].value, b"1");
    }

    #[tokio::test]
    async fn test_txn_branch_with_missing_lease_applies_nothing() {
        let store = MemoryStore::new();
        let err = store
            .txn(Txn::new().and_then([
                Op::put("a", "1", PutOptions::new()),
                Op::put("b", "2", PutOptions::new().with_lease(99)),
            ]))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::LeaseNotFound(99));
        assert_eq!(store.get(b"a", GetOptions::new()).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_watch_single_key_and_prev_kv() {
        let store = MemoryStore::new();
        let mut watch = store
            .watch(b"k", WatchOptions::new().with_prev_kv())
            .await
            .unwrap();

        store.put(b"k", b"1", PutOptions::new()).await.unwrap();
        store.put(b"other", b"x", PutOptions::new()).await.unwrap();
        store.put(b"k", b"2", PutOptions::new()).await.unwrap();

        let first = watch.message().await.unwrap();
        assert_eq!(first.events[0].event_type, EventType::Put);
        assert!(first.events[0].prev_kv.is_none());

        let second = watch.message().await.unwrap();
        assert_eq!(second.events[0].kv.value, b"2");
        assert_eq!(second.events[0].prev_kv.as_ref().unwrap().value, b"1");
    }

    #[tokio::test]
    async fn test_watch_compacted_start_revision() {
        let store = MemoryStore::with_config(MemoryStoreConfig {
            history_limit: 2,
            ..Default::default()
        });
        for v in ["1", "2", "3", "4"] {
            store.put(b"k", v.as_bytes(), PutOptions::new()).await.unwrap();
        }

        let err = store
            .watch(b"k", WatchOptions::new().with_start_revision(2))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::Compacted {
                requested: 2,
                oldest: 4
            }
        );

        let mut watch = store
            .watch(b"k", WatchOptions::new().with_start_revision(4))
            .await
            .unwrap();
        assert_eq!(watch.message().await.unwrap().events[0].kv.value, b"3");
    }

    #[tokio::test]
    async fn test_cancelled_watcher_is_pruned() {
        let store = MemoryStore::new();
        let mut watch = store.watch(b"k", WatchOptions::new()).await.unwrap();
        watch.cancel();

        store.put(b"k", b"v", PutOptions::new()).await.unwrap();
        assert!(watch.message().await.is_none());
        assert!(store.inner.state.lock().watchers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_scanner_notifies_watchers() {
        let store = MemoryStore::new().with_expiry_scanner();
        let lease = store.lease_grant(1).await.unwrap();
        store
            .put(b"/lock/a", b"v", PutOptions::new().with_lease(lease.id))
            .await
            .unwrap();
        let mut watch = store
            .watch(b"/lock/", WatchOptions::new().with_prefix())
            .await
            .unwrap();

        // No further requests: only the scanner can observe the expiry
        let resp = watch.message().await.unwrap();
        assert_eq!(resp.events[0].event_type, EventType::Delete);
        assert_eq!(resp.events[0].kv.key, b"/lock/a");
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new();
        store.set_unavailable(Some("partitioned"));
        assert_eq!(
            store.lease_grant(5).await.unwrap_err(),
            StoreError::Unavailable("partitioned".to_string())
        );

        store.set_unavailable(None);
        assert!(store.lease_grant(5).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_latency_only_delays_that_operation() {
        let store = MemoryStore::new();
        store.set_operation_latency("txn", Some(Duration::from_secs(5)));

        let start = Instant::now();
        store.put(b"k", b"v", PutOptions::new()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        store.txn(Txn::new()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));

        store.set_operation_latency("txn", None);
        let start = Instant::now();
        store.txn(Txn::new()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
