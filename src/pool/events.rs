//! Lifecycle events emitted by the connection pool

use serde::Serialize;
use std::fmt;

/// Why an entry left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Evicted on release to shrink the idle set
    IdleShrink,
    /// Idle for longer than `max_idle_time`
    IdleTimeout,
    /// Failed `health_check_retries` consecutive probes
    HealthCheckFailed,
    /// The pool itself was disposed
    PoolDisposed,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemovalReason::IdleShrink => "idle_shrink",
            RemovalReason::IdleTimeout => "idle_timeout",
            RemovalReason::HealthCheckFailed => "health_check_failed",
            RemovalReason::PoolDisposed => "pool_disposed",
        };
        f.write_str(name)
    }
}

/// Pool lifecycle event, emitted at most once per transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    Created { id: String },
    Acquired { id: String },
    Released { id: String },
    Removed { id: String, reason: RemovalReason },
    Disposed { pool: String },
}

impl PoolEvent {
    /// Entry id the event refers to, if any
    pub fn entry_id(&self) -> Option<&str> {
        match self {
            PoolEvent::Created { id }
            | PoolEvent::Acquired { id }
            | PoolEvent::Released { id }
            | PoolEvent::Removed { id, .. } => Some(id),
            PoolEvent::Disposed { .. } => None,
        }
    }
}
