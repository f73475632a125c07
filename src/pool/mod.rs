//! Session pooling module
//!
//! This module provides:
//! - A per-target pool of authenticated API sessions
//! - Health probing with automatic replacement of failing sessions
//! - FIFO hand-off to callers waiting on a saturated pool
//! - A manager facade with aggregated statistics and event forwarding

pub mod connection;
pub mod entry;
pub mod events;
pub mod manager;
pub mod session;

pub use connection::{ConnectionPool, Lease, PoolConfig, PoolStats};
pub use entry::{EntryInfo, EntryState, PooledConnection};
pub use events::{PoolEvent, RemovalReason};
pub use manager::{ConnectionManager, ManagerStats};
pub use session::SessionManager;
