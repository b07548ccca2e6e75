//! Leasehold Lock - lease-guarded distributed mutual exclusion
//!
//! This crate provides:
//! - `LockManager`: acquire/release of named locks against any `KvStore`
//! - `MutexHandle`: a held lock with its lease renewal stream
//! - Lease renewal task with cancellation and failure detection
//! - `LockError`: contention vs. infrastructure failures

mod error;
mod keepalive;
mod mutex;

pub use error::LockError;
pub use keepalive::RenewalStatus;
pub use mutex::{LockManager, MutexHandle};
