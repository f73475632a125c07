//! Retry, circuit breaking and error tracking for remote calls

pub mod circuit;
pub mod monitor;
pub mod operation;
pub mod retry;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitEvent, CircuitState, CircuitStats};
pub use monitor::{ErrorMonitor, ErrorMonitorConfig, ErrorRecord, ErrorStats};
pub use operation::{
    CircuitOverride, OperationConfig, OperationContext, OperationOverride, OperationResult,
    RetryOverride, RetryableOperation, RetryableOperationFactory,
};
pub use retry::{RetryConfig, RetryOutcome, RetryStrategy};
