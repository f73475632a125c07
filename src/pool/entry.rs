//! Pool entries and the leases handed out to callers

use serde::Serialize;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle state of a pooled session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Idle,
    InUse,
    Unhealthy,
    Disposed,
}

impl EntryState {
    pub fn name(&self) -> &'static str {
        match self {
            EntryState::Idle => "idle",
            EntryState::InUse => "in_use",
            EntryState::Unhealthy => "unhealthy",
            EntryState::Disposed => "disposed",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One pooled session plus its lifecycle metadata
pub(crate) struct ConnectionEntry<S> {
    id: String,
    session: Arc<S>,
    state: EntryState,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
    health_check_failures: u32,
    last_health_check: Option<Instant>,
    /// Bumped on every acquisition; a lease is only honoured while it matches
    lease: u64,
}

impl<S> ConnectionEntry<S> {
    pub(crate) fn new(id: String, session: S) -> Self {
        let now = Instant::now();
        Self {
            id,
            session: Arc::new(session),
            state: EntryState::Idle,
            created_at: now,
            last_used: now,
            use_count: 0,
            health_check_failures: 0,
            // Every entry is probed once before it is admitted
            last_health_check: Some(now),
            lease: 0,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn state(&self) -> EntryState {
        self.state
    }

    pub(crate) fn session(&self) -> Arc<S> {
        Arc::clone(&self.session)
    }

    pub(crate) fn last_used(&self) -> Instant {
        self.last_used
    }

    pub(crate) fn health_check_failures(&self) -> u32 {
        self.health_check_failures
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Mark the entry IN_USE for a new holder and return its lease number
    pub(crate) fn lease(&mut self) -> u64 {
        self.state = EntryState::InUse;
        self.use_count += 1;
        self.last_used = Instant::now();
        self.lease += 1;
        self.lease
    }

    /// Whether `lease` is the live lease on this entry
    pub(crate) fn is_leased_by(&self, lease: u64) -> bool {
        self.state == EntryState::InUse && self.lease == lease
    }

    /// Return a leased entry to IDLE
    pub(crate) fn mark_idle(&mut self) {
        self.state = EntryState::Idle;
        self.last_used = Instant::now();
    }

    /// Record one probe outcome
    ///
    /// A failing entry that is still leased stays IN_USE; only its counter moves.
    pub(crate) fn record_health(&mut self, healthy: bool) {
        self.last_health_check = Some(Instant::now());
        if healthy {
            self.health_check_failures = 0;
            if self.state == EntryState::Unhealthy {
                self.state = EntryState::Idle;
            }
        } else {
            self.health_check_failures += 1;
            if self.state == EntryState::Idle {
                self.state = EntryState::Unhealthy;
            }
        }
    }

    /// Move to the terminal state; returns false if already disposed
    pub(crate) fn dispose(&mut self) -> bool {
        if self.state == EntryState::Disposed {
            return false;
        }
        self.state = EntryState::Disposed;
        true
    }

    pub(crate) fn info(&self) -> EntryInfo {
        EntryInfo {
            id: self.id.clone(),
            state: self.state,
            age: self.created_at.elapsed(),
            idle_for: self.last_used.elapsed(),
            use_count: self.use_count,
            health_check_failures: self.health_check_failures,
            since_last_health_check: self.last_health_check.map(|t| t.elapsed()),
        }
    }
}

/// Point-in-time view of an entry
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub id: String,
    pub state: EntryState,
    pub age: Duration,
    pub idle_for: Duration,
    pub use_count: u64,
    pub health_check_failures: u32,
    pub since_last_health_check: Option<Duration>,
}

/// A session leased from the pool
///
/// Hand it back with `release`. Dropping it without releasing leaves the
/// entry IN_USE until the pool is disposed.
pub struct PooledConnection<S> {
    entry_id: String,
    lease: u64,
    session: Arc<S>,
    acquired_at: Instant,
}

impl<S> PooledConnection<S> {
    pub(crate) fn new(entry_id: String, lease: u64, session: Arc<S>) -> Self {
        Self {
            entry_id,
            lease,
            session,
            acquired_at: Instant::now(),
        }
    }

    /// Id of the pool entry backing this lease
    pub fn id(&self) -> &str {
        &self.entry_id
    }

    pub(crate) fn lease(&self) -> u64 {
        self.lease
    }

    /// Shared handle to the underlying session
    pub fn session(&self) -> Arc<S> {
        Arc::clone(&self.session)
    }

    /// How long this lease has been held
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl<S> Deref for PooledConnection<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

// A copy of a lease is still bound to the same lease number, so releasing
// both only releases the entry once.
impl<S> Clone for PooledConnection<S> {
    fn clone(&self) -> Self {
        Self {
            entry_id: self.entry_id.clone(),
            lease: self.lease,
            session: Arc::clone(&self.session),
            acquired_at: self.acquired_at,
        }
    }
}

impl<S> fmt::Debug for PooledConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("entry_id", &self.entry_id)
            .field("lease", &self.lease)
            .finish()
    }
}
