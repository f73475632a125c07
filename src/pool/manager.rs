//! Facade over a single connection pool

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use super::connection::{ConnectionPool, Lease, PoolConfig, PoolStats};
use super::entry::PooledConnection;
use super::events::PoolEvent;
use super::session::SessionManager;
use crate::error::Result;

/// Pool statistics plus a derived health flag
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    /// At least one live entry that is idle or in use
    pub healthy: bool,
    pub pool_stats: PoolStats,
}

/// Owns one [`ConnectionPool`] and exposes the calls application code needs
pub struct ConnectionManager<M: SessionManager> {
    pool: ConnectionPool<M>,
    disposed: AtomicBool,
}

impl<M: SessionManager> ConnectionManager<M> {
    pub async fn new(name: impl Into<String>, config: PoolConfig, manager: M) -> Self {
        Self {
            pool: ConnectionPool::new(name, config, manager).await,
            disposed: AtomicBool::new(false),
        }
    }

    pub async fn acquire(&self) -> Result<PooledConnection<M::Session>> {
        self.pool.acquire().await
    }

    pub fn release(&self, conn: PooledConnection<M::Session>) {
        self.pool.release(conn);
    }

    /// Acquire a session that is released when the [`Lease`] drops
    pub async fn lease(&self) -> Result<Lease<'_, M>> {
        self.pool.lease().await
    }

    /// Acquire a session, run `f` against it and release it again,
    /// whatever `f` returns and even if this future is dropped mid-call
    pub async fn with_session<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<M::Session>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.lease().await?;
        let result = f(lease.session()).await;
        lease.release();
        result
    }

    pub fn get_stats(&self) -> ManagerStats {
        let pool_stats = self.pool.stats();
        ManagerStats {
            healthy: pool_stats.total > 0 && (pool_stats.idle > 0 || pool_stats.in_use > 0),
            pool_stats,
        }
    }

    /// Pool events, delivered unchanged
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.pool.subscribe()
    }

    pub fn pool(&self) -> &ConnectionPool<M> {
        &self.pool
    }

    /// Dispose the pool; listeners observe the final `Disposed` event and
    /// then a closed channel
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.dispose();
        info!(pool = %self.pool.name(), "Connection manager disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}
