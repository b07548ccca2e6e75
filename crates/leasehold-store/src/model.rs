//! Request and response model for the key-value store
//!
//! Keys and values are raw bytes. Revisions and lease ids are `i64` with 0
//! meaning "none".

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Store revision, increases by one per mutating request
pub type Revision = i64;

/// Lease identifier, 0 means no lease
pub type LeaseId = i64;

/// A stored key-value pair with its revision metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Revision of the first write since the key last did not exist
    pub create_revision: Revision,
    /// Revision of the latest write
    pub mod_revision: Revision,
    /// Number of writes since creation
    pub version: i64,
    /// Lease the key is attached to, 0 if none
    pub lease: LeaseId,
}

impl KeyValue {
    pub fn key_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }

    pub fn value_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// Header attached to every response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Store revision when the response was produced
    pub revision: Revision,
}

// ============================================================================
// KV options and responses
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Attach the key to this lease
    pub lease: Option<LeaseId>,
    /// Return the pair being overwritten
    pub prev_kv: bool,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease(mut self, lease: LeaseId) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Treat the key as a prefix
    pub prefix: bool,
    /// Maximum number of pairs returned, 0 for no limit
    pub limit: usize,
    /// Only report the count
    pub count_only: bool,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_count_only(mut self) -> Self {
        self.count_only = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Treat the key as a prefix
    pub prefix: bool,
    /// Return the deleted pairs
    pub prev_kv: bool,
}

impl DeleteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutResponse {
    pub header: ResponseHeader,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetResponse {
    pub header: ResponseHeader,
    pub kvs: Vec<KeyValue>,
    /// Number of matching keys, regardless of limit
    pub count: i64,
    /// More keys matched than were returned
    pub more: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteResponse {
    pub header: ResponseHeader,
    pub deleted: i64,
    pub prev_kvs: Vec<KeyValue>,
}

// ============================================================================
// Leases
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseGrantResponse {
    pub header: ResponseHeader,
    pub id: LeaseId,
    /// Granted TTL in seconds
    pub ttl: i64,
}

/// One renewal confirmation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseKeepAliveResponse {
    pub header: ResponseHeader,
    pub id: LeaseId,
    /// TTL in seconds the lease was extended to
    pub ttl: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseRevokeResponse {
    pub header: ResponseHeader,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseTimeToLiveResponse {
    pub header: ResponseHeader,
    pub id: LeaseId,
    /// Remaining TTL in seconds, -1 if the lease does not exist
    pub ttl: i64,
    pub granted_ttl: i64,
    pub keys: Vec<Vec<u8>>,
}

// ============================================================================
// Watch
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Put => write!(f, "PUT"),
            EventType::Delete => write!(f, "DELETE"),
        }
    }
}

/// A single change. For deletes `kv` carries the key and the delete revision
/// in `mod_revision`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

impl Event {
    pub fn revision(&self) -> Revision {
        self.kv.mod_revision
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Treat the key as a prefix
    pub prefix: bool,
    /// Replay changes starting at this revision
    pub start_revision: Option<Revision>,
    /// Include the previous pair in events
    pub prev_kv: bool,
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    pub fn with_start_revision(mut self, revision: Revision) -> Self {
        self.start_revision = Some(revision);
        self
    }

    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }
}

/// A batch of events that happened at one revision
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchResponse {
    pub header: ResponseHeader,
    pub watch_id: i64,
    pub events: Vec<Event>,
}

// ============================================================================
// Operations and transactions
// ============================================================================

/// A single operation, runnable alone or inside a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        options: PutOptions,
    },
    Get {
        key: Vec<u8>,
        options: GetOptions,
    },
    Delete {
        key: Vec<u8>,
        options: DeleteOptions,
    },
}

impl Op {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, options: PutOptions) -> Self {
        Op::Put {
            key: key.into(),
            value: value.into(),
            options,
        }
    }

    pub fn get(key: impl Into<Vec<u8>>, options: GetOptions) -> Self {
        Op::Get {
            key: key.into(),
            options,
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>, options: DeleteOptions) -> Self {
        Op::Delete {
            key: key.into(),
            options,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Op::Get { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResponse {
    Put(PutResponse),
    Get(GetResponse),
    Delete(DeleteResponse),
}

impl OpResponse {
    pub fn header(&self) -> ResponseHeader {
        match self {
            OpResponse::Put(r) => r.header,
            OpResponse::Get(r) => r.header,
            OpResponse::Delete(r) => r.header,
        }
    }

    pub fn as_put(&self) -> Option<&PutResponse> {
        match self {
            OpResponse::Put(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_get(&self) -> Option<&GetResponse> {
        match self {
            OpResponse::Get(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_delete(&self) -> Option<&DeleteResponse> {
        match self {
            OpResponse::Delete(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    Less,
}

impl CompareOp {
    fn holds<T: Ord>(self, actual: T, expected: T) -> bool {
        match self {
            CompareOp::Equal => actual == expected,
            CompareOp::NotEqual => actual != expected,
            CompareOp::Greater => actual > expected,
            CompareOp::Less => actual < expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    CreateRevision(Revision),
    ModRevision(Revision),
    Version(i64),
    Value(Vec<u8>),
    Lease(LeaseId),
}

/// A condition on a single key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: Vec<u8>,
    pub op: CompareOp,
    pub target: CompareTarget,
}

impl Compare {
    pub fn new(key: impl Into<Vec<u8>>, op: CompareOp, target: CompareTarget) -> Self {
        Self {
            key: key.into(),
            op,
            target,
        }
    }

    pub fn create_revision(key: impl Into<Vec<u8>>, op: CompareOp, revision: Revision) -> Self {
        Self::new(key, op, CompareTarget::CreateRevision(revision))
    }

    pub fn mod_revision(key: impl Into<Vec<u8>>, op: CompareOp, revision: Revision) -> Self {
        Self::new(key, op, CompareTarget::ModRevision(revision))
    }

    pub fn version(key: impl Into<Vec<u8>>, op: CompareOp, version: i64) -> Self {
        Self::new(key, op, CompareTarget::Version(version))
    }

    pub fn value(key: impl Into<Vec<u8>>, op: CompareOp, value: impl Into<Vec<u8>>) -> Self {
        Self::new(key, op, CompareTarget::Value(value.into()))
    }

    pub fn lease(key: impl Into<Vec<u8>>, op: CompareOp, lease: LeaseId) -> Self {
        Self::new(key, op, CompareTarget::Lease(lease))
    }

    /// Evaluate against the current pair, `None` if the key is absent.
    ///
    /// Numeric targets read 0 for an absent key; a value compare against an
    /// absent key never holds.
    pub fn evaluate(&self, current: Option<&KeyValue>) -> bool {
        match &self.target {
            CompareTarget::CreateRevision(expected) => self
                .op
                .holds(current.map_or(0, |kv| kv.create_revision), *expected),
            CompareTarget::ModRevision(expected) => self
                .op
                .holds(current.map_or(0, |kv| kv.mod_revision), *expected),
            CompareTarget::Version(expected) => {
                self.op.holds(current.map_or(0, |kv| kv.version), *expected)
            }
            CompareTarget::Lease(expected) => {
                self.op.holds(current.map_or(0, |kv| kv.lease), *expected)
            }
            CompareTarget::Value(expected) => match current {
                Some(kv) => self.op.holds(kv.value.as_slice(), expected.as_slice()),
                None => false,
            },
        }
    }
}

/// Compare-and-branch transaction: all compares must hold for `success` to
/// run, otherwise `failure` runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compare: Vec<Compare>,
    pub success: Vec<Op>,
    pub failure: Vec<Op>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: impl IntoIterator<Item = Compare>) -> Self {
        self.compare.extend(compare);
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.failure.extend(ops);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnResponse {
    pub header: ResponseHeader,
    /// Whether the compares held and the success branch ran
    pub succeeded: bool,
    /// Responses of the branch that ran, in op order
    pub responses: Vec<OpResponse>,
}
