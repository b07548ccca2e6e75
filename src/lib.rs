//! Leasehold - lease-guarded distributed mutual exclusion
//!
//! Re-exports the workspace crates:
//! - `common`: settings and tracing setup
//! - `store`: the key-value store contract and the in-memory store
//! - `lock`: the lock manager

pub use leasehold_common as common;
pub use leasehold_lock as lock;
pub use leasehold_store as store;

pub use leasehold_common::{Settings, init_tracing};
pub use leasehold_lock::{LockError, LockManager, MutexHandle, RenewalStatus};
pub use leasehold_store::{KvStore, MemoryStore, StoreError};
