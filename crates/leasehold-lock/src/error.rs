//! Lock manager error types

use std::future::Future;
use std::time::Duration;

use leasehold_store::{LeaseId, StoreError};

/// Errors returned by [`LockManager`](crate::LockManager) and
/// [`MutexHandle`](crate::MutexHandle)
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("failed to grant lease: {0}")]
    LeaseGrant(#[source] StoreError),

    #[error("lock '{key}' is held by another lease")]
    LockHeld {
        key: String,
        /// Value of the current lock record, if it was still present
        holder: Option<Vec<u8>>,
    },

    #[error("renewal of lease {lease_id} failed: {reason}")]
    RenewalFailed { lease_id: LeaseId, reason: String },

    #[error("{operation} timed out after {timeout:?}")]
    StoreTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl LockError {
    /// The resource is contended, as opposed to an infrastructure failure
    pub fn is_contention(&self) -> bool {
        matches!(self, LockError::LockHeld { .. })
    }

    /// Retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            LockError::LockHeld { .. } | LockError::StoreTimeout { .. } => true,
            LockError::LeaseGrant(e) | LockError::Store(e) => e.is_transient(),
            LockError::RenewalFailed { .. } => false,
        }
    }

    /// Current holder's value as text
    pub fn holder_str(&self) -> Option<String> {
        match self {
            LockError::LockHeld {
                holder: Some(holder),
                ..
            } => Some(String::from_utf8_lossy(holder).into_owned()),
            _ => None,
        }
    }
}

/// Bound a store call by `timeout`
pub(crate) async fn with_deadline<T>(
    operation: &'static str,
    timeout: Duration,
    fut: impl Future<Output = leasehold_store::Result<T>>,
) -> Result<T, LockError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(LockError::Store),
        Err(_) => Err(LockError::StoreTimeout { operation, timeout }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LockError::LockHeld {
            key: "jobs/cron".to_string(),
            holder: Some(b"worker-1".to_vec()),
        };
        assert_eq!(err.to_string(), "lock 'jobs/cron' is held by another lease");
        assert_eq!(err.holder_str().as_deref(), Some("worker-1"));

        let err = LockError::StoreTimeout {
            operation: "txn",
            timeout: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "txn timed out after 250ms");

        let err = LockError::LeaseGrant(StoreError::Unavailable("down".to_string()));
        assert_eq!(err.to_string(), "failed to grant lease: store unavailable: down");
    }

    #[test]
    fn test_contention_is_distinguishable() {
        let held = LockError::LockHeld {
            key: "k".to_string(),
            holder: None,
        };
        assert!(held.is_contention());
        assert!(held.is_retryable());

        let grant = LockError::LeaseGrant(StoreError::InvalidArgument("ttl".to_string()));
        assert!(!grant.is_contention());
        assert!(!grant.is_retryable());

        let unavailable = LockError::Store(StoreError::Unavailable("down".to_string()));
        assert!(unavailable.is_retryable());

        let renewal = LockError::RenewalFailed {
            lease_id: 1,
            reason: "lease expired".to_string(),
        };
        assert!(!renewal.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_times_out() {
        let result = with_deadline("lease_grant", Duration::from_millis(100), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, StoreError>(())
        })
        .await;

        assert!(matches!(
            result,
            Err(LockError::StoreTimeout {
                operation: "lease_grant",
                ..
            })
        ));
    }
}
