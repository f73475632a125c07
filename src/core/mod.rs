use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::pool::{ConnectionManager, ManagerStats, SessionManager};
use crate::resilience::{CircuitStats, ErrorMonitor, ErrorStats, OperationContext, RetryableOperationFactory};

/// Pool, operation registry and error monitor for one cluster context
///
/// Every operation created through [`Core::operations`] shares the same
/// [`ErrorMonitor`], and every call made through [`Core::execute`] runs on a
/// session leased from the same pool.
pub struct Core<M: SessionManager> {
    config: Arc<Config>,
    connections: ConnectionManager<M>,
    operations: RetryableOperationFactory,
    monitor: Arc<ErrorMonitor>,
}

/// Snapshot of everything `Core` tracks
#[derive(Debug, Clone, Serialize)]
pub struct CoreStats {
    pub connections: ManagerStats,
    pub circuits: BTreeMap<String, CircuitStats>,
    pub errors: ErrorStats,
}

impl<M: SessionManager> Core<M> {
    pub async fn new(config: Config, manager: M) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let config = Arc::new(config);

        let monitor = Arc::new(ErrorMonitor::new(config.error_monitor_config()));

        let operations = RetryableOperationFactory::new(config.operation_config(), Arc::clone(&monitor))
            .with_overrides(config.operation_overrides());

        let connections = ConnectionManager::new(config.context.clone(), config.pool_config(), manager).await;

        info!(
            context = %config.context,
            operations = config.operations.len(),
            "Core initialised"
        );

        Ok(Self {
            config,
            connections,
            operations,
            monitor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager<M> {
        &self.connections
    }

    pub fn operations(&self) -> &RetryableOperationFactory {
        &self.operations
    }

    pub fn monitor(&self) -> &Arc<ErrorMonitor> {
        &self.monitor
    }

    /// Lease a session and run `f` on it through the operation called `name`
    ///
    /// The session is released once the operation finishes, whatever the
    /// outcome, or when the returned future is dropped. A failure to lease
    /// is recorded in the error monitor too.
    pub async fn execute<T, F, Fut>(
        &self,
        name: &str,
        context: &OperationContext,
        mut f: F,
    ) -> crate::error::Result<T>
    where
        F: FnMut(Arc<M::Session>) -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        let operation = self.operations.create(name, None);

        let lease = match self.connections.lease().await {
            Ok(lease) => lease,
            Err(e) => {
                self.monitor.record(&e, name, context);
                return Err(e);
            }
        };

        let session = lease.session();
        let result = operation.run(|| f(Arc::clone(&session)), context).await;
        lease.release();
        result
    }

    pub fn stats(&self) -> CoreStats {
        CoreStats {
            connections: self.connections.get_stats(),
            circuits: self.operations.circuit_stats(),
            errors: self.monitor.get_stats(),
        }
    }

    /// Dispose the pool and forget every operation
    pub fn dispose(&self) {
        self.connections.dispose();
        self.operations.clear();
    }
}
