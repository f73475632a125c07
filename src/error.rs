//! Error taxonomy shared by the pool and the resilience layer
//!
//! Every failure that crosses a component boundary is an [`Error`]. Remote
//! failures carry an [`ErrorKind`] classification which decides whether the
//! retry layer may try again; failures synthesized locally (open circuit,
//! disposed pool, acquire timeout) are never retried.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::resilience::CircuitState;

/// Result alias used across the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification of a failure, independent of where it was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    Forbidden,
    Conflict,
    Validation,
    Unavailable,
    Timeout,
    RateLimited,
    Network,
    CircuitOpen,
    PoolDisposed,
    AcquireTimeout,
}

impl ErrorKind {
    /// Kinds the retry layer is allowed to try again
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Unavailable | ErrorKind::Timeout | ErrorKind::RateLimited | ErrorKind::Network
        )
    }

    /// Map an HTTP status code returned by the API server to a kind
    pub fn from_status_code(status: u16) -> Option<Self> {
        match status {
            400 | 422 => Some(ErrorKind::Validation),
            401 => Some(ErrorKind::Unauthorized),
            403 => Some(ErrorKind::Forbidden),
            404 => Some(ErrorKind::NotFound),
            408 | 504 => Some(ErrorKind::Timeout),
            409 => Some(ErrorKind::Conflict),
            429 => Some(ErrorKind::RateLimited),
            500 | 502 | 503 => Some(ErrorKind::Unavailable),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Network => "network",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::PoolDisposed => "pool_disposed",
            ErrorKind::AcquireTimeout => "acquire_timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by sessions, the pool and the resilience layer
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("{kind} error{}: {message}", status_suffix(.status_code))]
    Api {
        kind: ErrorKind,
        status_code: Option<u16>,
        message: String,
    },

    #[error("Circuit breaker is open for operation '{operation}' (retry in {retry_in:?})")]
    CircuitOpen { operation: String, retry_in: Duration },

    #[error("Connection pool '{pool}' has been disposed")]
    PoolDisposed { pool: String },

    #[error("Timed out after {timeout:?} waiting for a connection from pool '{pool}'")]
    AcquireTimeout { pool: String, timeout: Duration },

    #[error("Operation '{operation}' exceeded its deadline of {timeout:?} after {attempts} attempt(s)")]
    DeadlineExceeded {
        operation: String,
        timeout: Duration,
        attempts: u32,
    },

    #[error("New session for pool '{pool}' failed its initial health check")]
    HealthCheckFailed { pool: String },

    #[error("Operation '{operation}' failed after {attempts} attempt(s) (circuit {circuit_state}): {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        circuit_state: CircuitState,
        #[source]
        source: Box<Error>,
    },

    #[error("{0}")]
    Other(String),

    #[error("Fatal: {0}")]
    Fatal(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {})", s)).unwrap_or_default()
}

impl Error {
    /// Classified remote failure
    pub fn api(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::Api {
            kind,
            status_code: None,
            message: message.into(),
        }
    }

    /// Remote failure classified from its HTTP status code
    ///
    /// Unknown status codes are kept as unclassified errors.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match ErrorKind::from_status_code(status) {
            Some(kind) => Error::Api {
                kind,
                status_code: Some(status),
                message,
            },
            None => Error::Other(format!("status {}: {}", status, message)),
        }
    }

    /// The classification, if this error carries one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Api { kind, .. } => Some(*kind),
            Error::CircuitOpen { .. } => Some(ErrorKind::CircuitOpen),
            Error::PoolDisposed { .. } => Some(ErrorKind::PoolDisposed),
            Error::AcquireTimeout { .. } => Some(ErrorKind::AcquireTimeout),
            Error::DeadlineExceeded { .. } => Some(ErrorKind::Timeout),
            Error::HealthCheckFailed { .. } => Some(ErrorKind::Unavailable),
            Error::Exhausted { source, .. } => source.kind(),
            Error::Other(_) | Error::Fatal(_) => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Api { status_code, .. } => *status_code,
            Error::Exhausted { source, .. } => source.status_code(),
            _ => None,
        }
    }

    /// Whether the retry layer may try the failed call again
    ///
    /// Unclassified errors are retried unless raised as [`Error::Fatal`].
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Api { kind, .. } => kind.is_retryable(),
            Error::HealthCheckFailed { .. } | Error::Other(_) => true,
            Error::CircuitOpen { .. }
            | Error::PoolDisposed { .. }
            | Error::AcquireTimeout { .. }
            | Error::DeadlineExceeded { .. }
            | Error::Exhausted { .. }
            | Error::Fatal(_) => false,
        }
    }

    /// Failures raised by this crate rather than by the remote server
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Error::CircuitOpen { .. }
                | Error::PoolDisposed { .. }
                | Error::AcquireTimeout { .. }
                | Error::DeadlineExceeded { .. }
        )
    }
}
