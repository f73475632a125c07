//! Named operations guarded by a retry strategy and a circuit breaker
//!
//! The circuit breaker sees one logical call per [`RetryableOperation::execute`]:
//! retries happen inside it, so the circuit only counts a failure once the
//! retry budget is spent.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
use super::monitor::ErrorMonitor;
use super::retry::{RetryConfig, RetryStrategy};
use crate::error::{Error, Result};

/// Caller-supplied description of what an operation touched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Free-form label such as "list" or "patch"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl OperationContext {
    pub fn resource(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_kind: Some(kind.into()),
            resource_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn labelled(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }
}

/// Retry and circuit settings for one operation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationConfig {
    pub retry: RetryConfig,
    pub circuit: CircuitBreakerConfig,
}

/// Partial retry settings; `None` keeps the default
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryOverride {
    pub max_attempts: Option<u32>,
    pub initial_delay: Option<Duration>,
    pub max_delay: Option<Duration>,
    pub backoff_multiplier: Option<f64>,
    pub jitter_factor: Option<f64>,
    pub timeout: Option<Duration>,
}

/// Partial circuit settings; `None` keeps the default
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CircuitOverride {
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub reset_timeout: Option<Duration>,
    pub failure_count_window: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationOverride {
    pub retry: RetryOverride,
    pub circuit: CircuitOverride,
}

impl OperationConfig {
    /// This config with every field set in `overrides` replaced
    pub fn merged(&self, overrides: &OperationOverride) -> OperationConfig {
        let r = &overrides.retry;
        let c = &overrides.circuit;
        OperationConfig {
            retry: RetryConfig {
                max_attempts: r.max_attempts.unwrap_or(self.retry.max_attempts),
                initial_delay: r.initial_delay.unwrap_or(self.retry.initial_delay),
                max_delay: r.max_delay.unwrap_or(self.retry.max_delay),
                backoff_multiplier: r.backoff_multiplier.unwrap_or(self.retry.backoff_multiplier),
                jitter_factor: r.jitter_factor.unwrap_or(self.retry.jitter_factor),
                timeout: r.timeout.or(self.retry.timeout),
            },
            circuit: CircuitBreakerConfig {
                failure_threshold: c.failure_threshold.unwrap_or(self.circuit.failure_threshold),
                success_threshold: c.success_threshold.unwrap_or(self.circuit.success_threshold),
                reset_timeout: c.reset_timeout.unwrap_or(self.circuit.reset_timeout),
                failure_count_window: c
                    .failure_count_window
                    .unwrap_or(self.circuit.failure_count_window),
            },
        }
    }
}

/// Outcome of one [`RetryableOperation::execute`]
#[derive(Debug)]
pub struct OperationResult<T> {
    pub result: Result<T>,

    /// Attempts made; zero when the circuit rejected the call
    pub attempts: u32,

    pub total_time: Duration,

    /// Circuit state right after the call
    pub circuit_state: CircuitState,
}

impl<T> OperationResult<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

pub struct RetryableOperation {
    name: String,
    config: OperationConfig,
    retry: RetryStrategy,
    breaker: CircuitBreaker,
    monitor: Arc<ErrorMonitor>,
}

impl RetryableOperation {
    /// Operation that logs every scheduled retry
    pub fn new(name: impl Into<String>, config: OperationConfig, monitor: Arc<ErrorMonitor>) -> Self {
        let name = name.into();

        let label = name.clone();
        let retry = RetryStrategy::new(config.retry.clone()).with_on_retry(move |attempt, error, delay| {
            warn!(
                operation = %label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Operation failed, retrying"
            );
        });

        Self {
            breaker: CircuitBreaker::new(name.clone(), config.circuit.clone()),
            name,
            config,
            retry,
            monitor,
        }
    }

    /// Replace the retry strategy, e.g. to install a custom predicate
    pub fn with_retry_strategy(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &OperationConfig {
        &self.config
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `operation` with retries inside the circuit breaker
    ///
    /// A failure is recorded in the error monitor under this operation's
    /// name together with `context`.
    pub async fn execute<T, F, Fut>(&self, operation: F, context: &OperationContext) -> OperationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempts = 0;

        let result = {
            let attempts = &mut attempts;
            let retry = &self.retry;
            let name = self.name.as_str();
            self.breaker
                .execute(|| async move {
                    let outcome = retry.execute(name, operation).await;
                    *attempts = outcome.attempts;
                    outcome.result
                })
                .await
        };

        if let Err(error) = &result {
            self.monitor.record(error, &self.name, context);
        }

        let circuit_state = self.breaker.state();
        debug!(
            operation = %self.name,
            attempts,
            success = result.is_ok(),
            state = %circuit_state,
            "Operation finished"
        );

        OperationResult {
            result,
            attempts,
            total_time: started.elapsed(),
            circuit_state,
        }
    }

    /// Like [`execute`](Self::execute) but returns the value directly
    ///
    /// # Errors
    ///
    /// [`Error::Exhausted`] carrying the operation name, the attempt count,
    /// the circuit state and the last underlying error.
    pub async fn run<T, F, Fut>(&self, operation: F, context: &OperationContext) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcome = self.execute(operation, context).await;
        outcome.result.map_err(|source| Error::Exhausted {
            operation: self.name.clone(),
            attempts: outcome.attempts,
            circuit_state: outcome.circuit_state,
            source: Box::new(source),
        })
    }
}

/// Registry of named operations sharing one error monitor
///
/// Operations are singletons per name: the first `create` fixes the
/// configuration and every later call returns the same instance.
pub struct RetryableOperationFactory {
    defaults: OperationConfig,

    /// Per-name settings applied under any per-call override
    configured: HashMap<String, OperationOverride>,

    monitor: Arc<ErrorMonitor>,
    operations: Mutex<HashMap<String, Arc<RetryableOperation>>>,
}

impl RetryableOperationFactory {
    pub fn new(defaults: OperationConfig, monitor: Arc<ErrorMonitor>) -> Self {
        Self {
            defaults,
            configured: HashMap::new(),
            monitor,
            operations: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_overrides(mut self, configured: HashMap<String, OperationOverride>) -> Self {
        self.configured = configured;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<RetryableOperation>>> {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn monitor(&self) -> &Arc<ErrorMonitor> {
        &self.monitor
    }

    pub fn defaults(&self) -> &OperationConfig {
        &self.defaults
    }

    /// Get the operation called `name`, creating it on first use
    pub fn create(&self, name: &str, overrides: Option<&OperationOverride>) -> Arc<RetryableOperation> {
        let mut operations = self.lock();
        if let Some(existing) = operations.get(name) {
            return Arc::clone(existing);
        }

        let mut config = self.defaults.clone();
        if let Some(configured) = self.configured.get(name) {
            config = config.merged(configured);
        }
        if let Some(overrides) = overrides {
            config = config.merged(overrides);
        }

        debug!(operation = %name, "Creating retryable operation");
        let operation = Arc::new(RetryableOperation::new(name, config, Arc::clone(&self.monitor)));
        operations.insert(name.to_string(), Arc::clone(&operation));
        operation
    }

    pub fn get(&self, name: &str) -> Option<Arc<RetryableOperation>> {
        self.lock().get(name).cloned()
    }

    /// Names of every known operation, sorted
    pub fn operations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn circuit_stats(&self) -> BTreeMap<String, CircuitStats> {
        self.lock()
            .iter()
            .map(|(name, op)| (name.clone(), op.circuit().stats()))
            .collect()
    }

    /// Returns false if no operation has that name
    pub fn reset_circuit(&self, name: &str) -> bool {
        match self.get(name) {
            Some(op) => {
                op.circuit().reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all_circuits(&self) {
        let operations: Vec<Arc<RetryableOperation>> = self.lock().values().cloned().collect();
        for op in &operations {
            op.circuit().reset();
        }
        info!(count = operations.len(), "Reset all circuits");
    }

    /// Forget every operation; instances already handed out keep working
    pub fn clear(&self) {
        self.lock().clear();
    }
}
