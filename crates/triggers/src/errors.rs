//! Error taxonomy and retry-policy types for the relay domain.
//!
//! [`RelayError`] is what registration callers see. Transport-level errors
//! ([`StorageError`], [`BrokerError`]) are produced by the infrastructure
//! adapters and wrapped by the registry. [`DeliveryError`] is recovered inside
//! the listener by abandoning the message and never reaches a caller.
//!
//! [`RetryPolicy`] is the cross-cutting answer to "should the caller try
//! again?": every [`RelayError`] can produce one.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::WorkflowId;

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// - `Retryable`: storage transport failures, broker unreachable at start.
/// - `NonRetryable`: invalid input, scope mismatch, unknown workflow id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// Retrying with the same input cannot succeed.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// One rejected field of a registration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Request field the problem is attributed to (wire name).
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every problem found in a registration request. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    pub(crate) fn from_vec(errors: Vec<ValidationError>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self(errors))
        }
    }

    /// A single error attributed to `field`.
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self(vec![ValidationError {
            field: field.into(),
            message: message.into(),
        }])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    /// Returns `true` if any error is attributed to `field`.
    pub fn has_field(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

/// Durable store failure.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying store reported an error.
    #[error("store transport failed: {message}")]
    Transport { message: String },

    /// A stored value could not be encoded or decoded.
    #[error("record serialisation failed: {message}")]
    Serialization { message: String },

    /// A key read back from the store is not a valid escaped workflow id.
    #[error("invalid stored key '{key}': {message}")]
    InvalidKey { key: String, message: String },
}

/// Broker failure: connection, receive, or settlement.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Connection settings are missing or malformed.
    #[error("broker configuration error: {message}")]
    Configuration { message: String },

    /// The broker could not be reached or rejected the connection.
    #[error("broker connection failed: {message}")]
    Connection { message: String },

    /// The credentials were rejected.
    #[error("broker rejected credentials: {message}")]
    Unauthorized { message: String },

    /// The queue, topic or subscription does not exist.
    #[error("broker entity '{entity}' not found")]
    EntityNotFound { entity: String },

    /// The message lock expired or was already released.
    #[error("message lock lost: {message}")]
    LockLost { message: String },

    /// The receiver or connection has been closed.
    #[error("broker handle is closed")]
    Closed,

    /// A temporary failure; the same call may succeed later.
    #[error("transient broker failure: {message}")]
    Transient { message: String },
}

impl BrokerError {
    /// Returns `true` if the receive loop cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::Unauthorized { .. }
                | Self::EntityNotFound { .. }
                | Self::Closed
        )
    }
}

/// Failure relaying one message. Handled by abandoning the message.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The callback POST failed at the transport level.
    #[error("callback request failed: {message}")]
    Callback { message: String },

    /// The callback payload could not be serialised.
    #[error("callback payload serialisation failed: {message}")]
    Serialization { message: String },

    /// Acknowledging the message to the broker failed.
    #[error("acknowledging message failed: {0}")]
    Settlement(#[source] BrokerError),
}

// ---------------------------------------------------------------------------
// Registration errors
// ---------------------------------------------------------------------------

/// Errors reported to registration callers.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The trigger configuration is malformed or contradictory.
    #[error("invalid trigger configuration: {0}")]
    Validation(ValidationErrors),

    /// The workflow id does not belong to the scope this process serves.
    #[error("workflow '{workflow_id}' is not in the configured scope")]
    ScopeMismatch { workflow_id: WorkflowId },

    /// The durable store failed; no state was changed.
    #[error("could not persist trigger '{workflow_id}': {source}")]
    Storage {
        workflow_id: WorkflowId,
        #[source]
        source: StorageError,
    },

    /// The trigger is registered but its listener could not be started.
    #[error("trigger '{workflow_id}' is registered but its listener failed to start: {source}")]
    ListenerStart {
        workflow_id: WorkflowId,
        #[source]
        source: BrokerError,
    },

    /// No trigger exists for the workflow id.
    #[error("no trigger registered for '{workflow_id}'")]
    NotFound { workflow_id: WorkflowId },
}

impl RelayError {
    /// Whether the caller may retry the same request.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Validation(_) | Self::ScopeMismatch { .. } | Self::NotFound { .. } => {
                RetryPolicy::NonRetryable
            }
            Self::Storage { .. } => RetryPolicy::Retryable { after: None },
            Self::ListenerStart { source, .. } => match source {
                BrokerError::Configuration { .. } | BrokerError::Unauthorized { .. } => {
                    RetryPolicy::NonRetryable
                }
                _ => RetryPolicy::Retryable { after: None },
            },
        }
    }

    /// Returns `true` if the error is about the caller's input rather than
    /// about this process's ability to serve it.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::ScopeMismatch { .. })
    }
}
