//! Leasehold Store - key-value store contract
//!
//! This crate provides:
//! - The `KvStore` trait the lock manager is written against
//! - Request/response model (options, compares, transactions, watch events)
//! - `MemoryStore`, an in-process linearizable implementation with leases,
//!   watches and transactions

pub mod error;
pub mod memory;
pub mod model;
pub mod store;
pub mod watch;

pub use error::{Result, StoreError};
pub use memory::{MAX_LEASE_TTL, MemoryStore};
pub use model::*;
pub use store::KvStore;
pub use watch::WatchStream;
