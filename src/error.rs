//! Error types used by the broker core and its store collaborators.
//!
//! This module defines two main error enums:
//!
//! - [`BrokerError`]: errors raised by sessions, the registry and the lifecycle.
//! - [`StoreError`]: errors raised by a [`RequestStore`](crate::RequestStore) implementation.
//!
//! Both types provide helper methods (`as_label`, `as_message`) for logging/metrics.
//! [`BrokerError`] variants map one-to-one onto the cases a transport layer must tell apart:
//!
//! | Case                | Variants                                                            |
//! |---------------------|---------------------------------------------------------------------|
//! | protocol violation  | `AlreadyGettingResponses`, `AlreadyEndedRequests`, `Rejected`       |
//! | timeout             | `FlushTimeout`                                                      |
//! | collaborator        | `Store`                                                             |
//! | fatal               | `Fatal`                                                             |
//! | disposal            | `Disposed`                                                          |

use std::time::Duration;
use thiserror::Error;

use crate::session::{ClientId, SessionState};

/// # Errors produced by the broker core.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The session already moved to serving responses only; no more requests or flushes.
    #[error("client '{client}' is already getting responses")]
    AlreadyGettingResponses {
        /// Client that attempted the operation.
        client: ClientId,
    },

    /// End-of-message was already accepted for this session.
    #[error("client '{client}' already ended its requests")]
    AlreadyEndedRequests {
        /// Client that attempted the operation.
        client: ClientId,
    },

    /// The session is in a state that forbids the operation.
    #[error("client '{client}' rejected operation in state {state:?}")]
    Rejected {
        /// Client that attempted the operation.
        client: ClientId,
        /// State observed when the operation was rejected.
        state: SessionState,
    },

    /// A flush waited for its batch epoch to arrive and ran out of time.
    #[error("client '{client}' flush for epoch {epoch} timed out after {waited:?}")]
    FlushTimeout {
        /// Client whose flush timed out.
        client: ClientId,
        /// Epoch the flush was waiting for.
        epoch: i64,
        /// Time spent waiting.
        waited: Duration,
    },

    /// Caller principal does not own the session.
    #[error("access to client '{client}' denied")]
    AccessDenied {
        /// Client the caller tried to reach.
        client: ClientId,
    },

    /// No session is registered under this id.
    #[error("client '{client}' not found")]
    ClientNotFound {
        /// Missing client id.
        client: ClientId,
    },

    /// The persistent store failed.
    #[error("store failure for client '{client}': {source}")]
    Store {
        /// Client whose store failed.
        client: ClientId,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },

    /// Unrecoverable failure escalated to the whole broker job.
    #[error("fatal broker failure: {reason}")]
    Fatal {
        /// The underlying error message.
        reason: String,
    },

    /// The session was disposed while the operation was in progress.
    #[error("client '{client}' session disposed")]
    Disposed {
        /// Disposed client.
        client: ClientId,
    },

    /// The broker decided to unload and no longer accepts attachments.
    #[error("broker is unloading")]
    Unloading,

    /// Shutdown grace period was exceeded; some sessions did not close in time.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Clients whose sessions were still open.
        stuck: Vec<String>,
    },
}

impl BrokerError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use brokerline::BrokerError;
    ///
    /// assert_eq!(BrokerError::Unloading.as_label(), "broker_unloading");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            BrokerError::AlreadyGettingResponses { .. } => "session_already_getting_responses",
            BrokerError::AlreadyEndedRequests { .. } => "session_already_ended_requests",
            BrokerError::Rejected { .. } => "session_rejected",
            BrokerError::FlushTimeout { .. } => "session_flush_timeout",
            BrokerError::AccessDenied { .. } => "session_access_denied",
            BrokerError::ClientNotFound { .. } => "session_not_found",
            BrokerError::Store { .. } => "store_failed",
            BrokerError::Fatal { .. } => "broker_fatal",
            BrokerError::Disposed { .. } => "session_disposed",
            BrokerError::Unloading => "broker_unloading",
            BrokerError::GraceExceeded { .. } => "broker_grace_exceeded",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            BrokerError::Rejected { client, state } => {
                format!("client={client} state={state:?}")
            }
            BrokerError::FlushTimeout {
                client,
                epoch,
                waited,
            } => format!("client={client} epoch={epoch} waited={waited:?}"),
            BrokerError::Store { client, source } => {
                format!("client={client} store={}", source.as_message())
            }
            BrokerError::GraceExceeded { grace, stuck } => {
                format!("grace exceeded after {grace:?}; stuck clients={stuck:?}")
            }
            other => other.to_string(),
        }
    }

    /// True for caller protocol violations (operation issued in a forbidding state).
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            BrokerError::AlreadyGettingResponses { .. }
                | BrokerError::AlreadyEndedRequests { .. }
                | BrokerError::Rejected { .. }
        )
    }

    /// Indicates whether the caller may retry the same operation.
    ///
    /// Returns `true` for [`BrokerError::FlushTimeout`] and non-fatal store failures.
    ///
    /// # Example
    /// ```
    /// use brokerline::{BrokerError, StoreError};
    /// use brokerline::ClientId;
    ///
    /// let err = BrokerError::Store {
    ///     client: ClientId::new("c1"),
    ///     source: StoreError::Failed { reason: "io".into() },
    /// };
    /// assert!(err.is_retryable());
    /// assert!(!BrokerError::Unloading.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::FlushTimeout { .. } => true,
            BrokerError::Store { source, .. } => !source.is_fatal(),
            _ => false,
        }
    }
}

/// # Errors produced by request stores.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Generic, possibly transient, failure.
    #[error("store operation failed: {reason}")]
    Failed {
        /// The underlying error message.
        reason: String,
    },

    /// The store ran out of a resource (disk, quota, memory). Fails the whole job.
    #[error("store resource exhausted: {reason}")]
    ResourceExhausted {
        /// The underlying error message.
        reason: String,
    },

    /// The store did not finish the operation in time.
    #[error("store operation timed out after {timeout:?}")]
    Timeout {
        /// Budget that was exceeded.
        timeout: Duration,
    },

    /// The store was closed concurrently with the call.
    #[error("store already disposed")]
    Disposed,
}

impl StoreError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            StoreError::Failed { .. } => "store_failed",
            StoreError::ResourceExhausted { .. } => "store_resource_exhausted",
            StoreError::Timeout { .. } => "store_timeout",
            StoreError::Disposed => "store_disposed",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            StoreError::Failed { reason } => format!("error: {reason}"),
            StoreError::ResourceExhausted { reason } => format!("exhausted: {reason}"),
            StoreError::Timeout { timeout } => format!("timeout: {timeout:?}"),
            StoreError::Disposed => "disposed".to_string(),
        }
    }

    /// True when the failure must fail the whole job rather than one session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::ResourceExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_violations_are_not_retryable() {
        let client = ClientId::new("alpha");
        let errs = [
            BrokerError::AlreadyGettingResponses {
                client: client.clone(),
            },
            BrokerError::AlreadyEndedRequests {
                client: client.clone(),
            },
            BrokerError::Rejected {
                client,
                state: SessionState::Disconnected,
            },
        ];
        for err in errs {
            assert!(err.is_protocol_violation(), "{err}");
            assert!(!err.is_retryable(), "{err}");
        }
    }

    #[test]
    fn fatal_store_errors_are_not_retryable() {
        let err = BrokerError::Store {
            client: ClientId::new("alpha"),
            source: StoreError::ResourceExhausted {
                reason: "disk full".into(),
            },
        };
        assert!(!err.is_retryable());
        assert_eq!(err.as_label(), "store_failed");
        assert!(err.as_message().contains("exhausted: disk full"));
    }

    #[test]
    fn flush_timeout_is_distinct_and_retryable() {
        let err = BrokerError::FlushTimeout {
            client: ClientId::new("alpha"),
            epoch: 3,
            waited: Duration::from_millis(50),
        };
        assert_eq!(err.as_label(), "session_flush_timeout");
        assert!(err.is_retryable());
        assert!(!err.is_protocol_violation());
    }
}
