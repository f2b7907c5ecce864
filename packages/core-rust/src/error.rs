//! Error types shared by producers, consumers, and service implementations.
//!
//! - [`ServiceError`]: a failure raised by service code. It is captured into
//!   the envelope on the executing thread and re-raised verbatim on the
//!   consuming thread, so it is `Clone` and comparable.
//! - [`CallError`]: what a caller of an asynchronous service can observe.
//! - [`PoolError`]: misuse of the envelope pool.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::ServiceGroupId;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Discriminant of a [`ServiceError`], preserved across the thread hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidArgument,
    NotSupported,
    InvalidState,
    UnknownMethod,
    Custom,
    Panicked,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::UnknownMethod => "unknown method",
            ErrorKind::Custom => "custom",
            ErrorKind::Panicked => "panicked",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// ServiceError
// ---------------------------------------------------------------------------

/// A failure raised while executing a service call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("unknown method {method}")]
    UnknownMethod { method: u32 },
    /// Application-defined failure kind with an optional structured detail.
    #[error("{kind}: {message}")]
    Custom {
        kind: String,
        message: String,
        detail: Option<String>,
    },
    /// The service panicked while handling the call. The worker survived.
    #[error("service panicked: {0}")]
    Panicked(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Creates an application-defined error without detail.
    pub fn custom(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ServiceError::Custom {
            kind: kind.into(),
            message: message.into(),
            detail: None,
        }
    }

    /// Creates an application-defined error carrying a structured detail.
    pub fn custom_with_detail(
        kind: impl Into<String>,
        message: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        ServiceError::Custom {
            kind: kind.into(),
            message: message.into(),
            detail: Some(detail.into()),
        }
    }

    /// Converts a panic payload caught by `catch_unwind` into an error.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        ServiceError::Panicked(message)
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ServiceError::NotSupported(_) => ErrorKind::NotSupported,
            ServiceError::InvalidState(_) => ErrorKind::InvalidState,
            ServiceError::UnknownMethod { .. } => ErrorKind::UnknownMethod,
            ServiceError::Custom { .. } => ErrorKind::Custom,
            ServiceError::Panicked(_) => ErrorKind::Panicked,
            ServiceError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The message without the kind prefix.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            ServiceError::InvalidArgument(message)
            | ServiceError::NotSupported(message)
            | ServiceError::InvalidState(message)
            | ServiceError::Custom { message, .. }
            | ServiceError::Panicked(message)
            | ServiceError::Internal(message) => message.clone(),
            ServiceError::UnknownMethod { method } => format!("method {method}"),
        }
    }

    /// Structured detail, only carried by custom errors.
    #[must_use]
    pub fn detail(&self) -> Option<&str> {
        match self {
            ServiceError::Custom { detail, .. } => detail.as_deref(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        ServiceError::Internal(format!("{err:#}"))
    }
}

// ---------------------------------------------------------------------------
// CallError
// ---------------------------------------------------------------------------

/// Errors observed by the caller of an asynchronous service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The target group is draining or stopped and accepts no new envelopes.
    #[error("service group {group} has shut down")]
    GroupShutDown { group: ServiceGroupId },
    /// The group's bounded queue is full and the caller is the thread that
    /// executes the group, so waiting for room would never end.
    #[error("service group {group} queue is full and the caller is its executing thread")]
    QueueFull { group: ServiceGroupId },
    /// The pending result was already taken.
    #[error("result already consumed")]
    AlreadyConsumed,
    /// The call executed and raised an error on the service's thread.
    #[error(transparent)]
    Remote(#[from] ServiceError),
    /// The service replied with something the caller could not decode.
    #[error("unexpected reply, expected {expected}")]
    UnexpectedReply { expected: &'static str },
}

impl CallError {
    /// Returns the captured remote error, if this is one.
    #[must_use]
    pub fn as_remote(&self) -> Option<&ServiceError> {
        match self {
            CallError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// PoolError
// ---------------------------------------------------------------------------

/// Misuse of the envelope pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("envelope is still in flight")]
    InFlight,
    #[error("envelope is not checked out")]
    NotCheckedOut,
    #[error("envelope belongs to a different pool")]
    ForeignPool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
