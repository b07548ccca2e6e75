//! Key-value store contract
//!
//! The lock manager only talks to the store through this trait, so any
//! linearizable store with leases and compare-and-branch transactions can
//! back it.

use async_trait::async_trait;

use crate::error::{Result, StoreError};
use crate::model::*;
use crate::watch::WatchStream;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Write a pair, optionally attached to a lease
    async fn put(&self, key: &[u8], value: &[u8], options: PutOptions) -> Result<PutResponse>;

    /// Read a key or a prefix range in key order
    async fn get(&self, key: &[u8], options: GetOptions) -> Result<GetResponse>;

    /// Delete a key or a prefix range
    async fn delete(&self, key: &[u8], options: DeleteOptions) -> Result<DeleteResponse>;

    /// Create a lease with the given TTL in seconds
    async fn lease_grant(&self, ttl: i64) -> Result<LeaseGrantResponse>;

    /// Renew a lease once
    async fn lease_keep_alive(&self, id: LeaseId) -> Result<LeaseKeepAliveResponse>;

    /// Revoke a lease and delete every key attached to it
    async fn lease_revoke(&self, id: LeaseId) -> Result<LeaseRevokeResponse>;

    /// Remaining TTL and attached keys of a lease
    async fn lease_time_to_live(&self, id: LeaseId) -> Result<LeaseTimeToLiveResponse>;

    /// Subscribe to changes of a key or prefix
    async fn watch(&self, key: &[u8], options: WatchOptions) -> Result<WatchStream>;

    /// Run a compare-and-branch transaction atomically
    async fn txn(&self, txn: Txn) -> Result<TxnResponse>;

    /// Run a single operation
    async fn do_op(&self, op: Op) -> Result<OpResponse> {
        let mut response = self.txn(Txn::new().and_then([op])).await?;
        response
            .responses
            .pop()
            .ok_or_else(|| StoreError::Unavailable("empty operation response".to_string()))
    }
}
