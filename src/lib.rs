//! kubeguard - pooled API sessions and resilient calls for Kubernetes clients

pub mod config;
pub mod core;
pub mod error;
pub mod pool;
pub mod resilience;
pub mod simulate;

pub use crate::core::{Core, CoreStats};
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use pool::{ConnectionManager, ConnectionPool, PoolConfig, PooledConnection, SessionManager};
pub use resilience::{
    CircuitBreaker, CircuitState, ErrorMonitor, OperationContext, RetryStrategy, RetryableOperation,
    RetryableOperationFactory,
};
