//! Store error types

use crate::model::{LeaseId, Revision};

/// Errors returned by a [`KvStore`](crate::KvStore)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("requested lease not found: {0}")]
    LeaseNotFound(LeaseId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("required revision {requested} has been compacted, oldest available is {oldest}")]
    Compacted {
        requested: Revision,
        oldest: Revision,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether the same request may succeed if retried later
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
