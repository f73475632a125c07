//! Session pool with health monitoring and a fair wait queue
//!
//! This module provides a per-target pool of authenticated sessions with:
//! - On-demand creation up to `max_connections`, each session probed once
//! - Optional warmup of `min_connections` sessions at construction
//! - FIFO hand-off of released sessions to queued callers
//! - Periodic health sweeps that retire sessions after repeated failures
//! - Periodic eviction of sessions idle for longer than `max_idle_time`
//!
//! All bookkeeping happens under a mutex that is never held across an
//! `.await`, so every decision about an entry is taken and applied atomically.

use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::entry::{ConnectionEntry, EntryInfo, EntryState, PooledConnection};
use super::events::{PoolEvent, RemovalReason};
use super::session::SessionManager;
use crate::error::{Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on live entries
    pub max_connections: usize,

    /// Floor kept by warmup and health-check replenishment
    pub min_connections: usize,

    /// How long an idle entry may live before eviction
    pub max_idle_time: Duration,

    /// How long `acquire` waits for a free entry
    pub acquire_timeout: Duration,

    /// Time between health sweeps
    pub health_check_interval: Duration,

    /// Deadline for a single health probe
    pub health_check_timeout: Duration,

    /// Consecutive probe failures before an entry is disposed
    pub health_check_retries: u32,

    /// Time between idle sweeps
    pub idle_check_interval: Duration,

    /// Pre-create `min_connections` entries at construction
    pub enable_warmup: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            max_idle_time: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(5),
            health_check_retries: 3,
            idle_check_interval: Duration::from_secs(60),
            enable_warmup: true,
        }
    }
}

/// Statistics for a connection pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Live entries
    pub total: usize,

    pub idle: usize,

    pub in_use: usize,

    pub unhealthy: usize,

    /// Callers waiting for a free entry
    pub wait_queue_length: usize,

    /// Entries created over the pool's lifetime
    pub total_created: u64,

    /// Successful acquisitions, hand-offs included
    pub total_acquired: u64,

    /// Entries disposed over the pool's lifetime
    pub total_removed: u64,

    /// Acquisitions that gave up waiting
    pub acquire_timeouts: u64,
}

type Handoff<S> = oneshot::Sender<Result<PooledConnection<S>>>;

struct Waiter<S> {
    id: u64,
    tx: Handoff<S>,
}

#[derive(Default)]
struct Counters {
    created: u64,
    acquired: u64,
    removed: u64,
    acquire_timeouts: u64,
}

struct PoolState<S> {
    entries: HashMap<String, ConnectionEntry<S>>,

    /// Oldest waiter first
    waiters: VecDeque<Waiter<S>>,

    /// Entries being created right now; they count against `max_connections`
    creating: usize,

    /// The part of `creating` started on behalf of queued callers
    creating_for_waiters: usize,

    disposed: bool,

    /// Dropped on disposal, which closes every subscription
    events: Option<broadcast::Sender<PoolEvent>>,

    counters: Counters,
}

impl<S> PoolState<S> {
    fn emit(&self, event: PoolEvent) {
        if let Some(events) = &self.events {
            // No subscribers is fine
            let _ = events.send(event);
        }
    }

    fn count(&self, state: EntryState) -> usize {
        self.entries.values().filter(|e| e.state() == state).count()
    }

    fn live_waiters(&self) -> usize {
        self.waiters.iter().filter(|w| !w.tx.is_closed()).count()
    }

    fn prune_abandoned_waiters(&mut self) {
        self.waiters.retain(|w| !w.tx.is_closed());
    }

    fn reserved(&self) -> usize {
        self.entries.len() + self.creating
    }
}

/// Capacity held for entries that are still being created
///
/// Settled under the state lock once creation finishes; if the creating
/// future is dropped first, the slots are handed back on drop and any
/// queued caller gets a creation of its own.
struct Reservation<'a, M: SessionManager> {
    pool: &'a PoolInner<M>,
    slots: usize,
    for_waiters: bool,
}

impl<'a, M: SessionManager> Reservation<'a, M> {
    fn new(pool: &'a PoolInner<M>, slots: usize) -> Self {
        Self {
            pool,
            slots,
            for_waiters: false,
        }
    }

    fn give_back(&mut self, state: &mut PoolState<M::Session>) {
        state.creating = state.creating.saturating_sub(self.slots);
        if self.for_waiters {
            state.creating_for_waiters = state.creating_for_waiters.saturating_sub(self.slots);
        }
        self.slots = 0;
    }

    fn settle(mut self, state: &mut PoolState<M::Session>) {
        self.give_back(state);
    }
}

impl<M: SessionManager> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if self.slots > 0 {
            let pool = self.pool;
            let mut state = pool.lock();
            self.give_back(&mut state);
            pool.serve_waiters(&mut state);
        }
    }
}

struct PoolInner<M: SessionManager> {
    /// Handle given to creations that outlive the call that started them
    me: Weak<PoolInner<M>>,
    name: String,
    config: PoolConfig,
    manager: M,
    state: Mutex<PoolState<M::Session>>,
    next_entry: AtomicU64,
    next_waiter: AtomicU64,
}

impl<M: SessionManager> PoolInner<M> {
    fn lock(&self) -> MutexGuard<'_, PoolState<M::Session>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn disposed_error(&self) -> Error {
        Error::PoolDisposed {
            pool: self.name.clone(),
        }
    }

    fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    async fn probe(&self, session: &M::Session) -> bool {
        tokio::time::timeout(self.config.health_check_timeout, self.manager.probe_health(session))
            .await
            .unwrap_or(false)
    }

    /// Create a session and probe it once
    async fn open_entry(&self) -> Result<ConnectionEntry<M::Session>> {
        let session = self.manager.create_session().await?;

        if !self.probe(&session).await {
            warn!(pool = %self.name, "New session failed its initial health check");
            return Err(Error::HealthCheckFailed {
                pool: self.name.clone(),
            });
        }

        let seq = self.next_entry.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{}-{}", self.name, seq);
        info!(pool = %self.name, entry = %id, "Created new connection");

        Ok(ConnectionEntry::new(id, session))
    }

    async fn acquire(&self) -> Result<PooledConnection<M::Session>> {
        enum Next<'a, M: SessionManager> {
            Create(Reservation<'a, M>),
            Wait(u64, oneshot::Receiver<Result<PooledConnection<M::Session>>>),
        }

        let next = {
            let mut state = self.lock();
            if state.disposed {
                return Err(self.disposed_error());
            }

            if let Some(conn) = self.lease_idle(&mut state) {
                return Ok(conn);
            }

            if state.reserved() < self.config.max_connections {
                state.creating += 1;
                Next::Create(Reservation::new(self, 1))
            } else {
                state.prune_abandoned_waiters();
                let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter { id, tx });
                debug!(
                    pool = %self.name,
                    queued = state.waiters.len(),
                    "Pool saturated, waiting for a connection"
                );
                Next::Wait(id, rx)
            }
        };

        match next {
            Next::Create(reservation) => self.create_leased(reservation).await,
            Next::Wait(id, rx) => self.wait_for_handoff(id, rx).await,
        }
    }

    fn lease_idle(&self, state: &mut PoolState<M::Session>) -> Option<PooledConnection<M::Session>> {
        let entry = state
            .entries
            .values_mut()
            .find(|e| e.state() == EntryState::Idle)?;

        let lease = entry.lease();
        let conn = PooledConnection::new(entry.id().to_string(), lease, entry.session());

        state.counters.acquired += 1;
        state.emit(PoolEvent::Acquired {
            id: conn.id().to_string(),
        });
        debug!(pool = %self.name, entry = %conn.id(), "Reusing connection");

        Some(conn)
    }

    async fn create_leased(
        &self,
        reservation: Reservation<'_, M>,
    ) -> Result<PooledConnection<M::Session>> {
        let created = self.open_entry().await;

        let mut state = self.lock();
        reservation.settle(&mut state);

        let mut entry = match created {
            Ok(_) if state.disposed => return Err(self.disposed_error()),
            Ok(entry) => entry,
            Err(e) => {
                // Callers queued behind this creation still need a slot
                self.serve_waiters(&mut state);
                return Err(e);
            }
        };

        let lease = entry.lease();
        let id = entry.id().to_string();
        let conn = PooledConnection::new(id.clone(), lease, entry.session());
        state.entries.insert(id.clone(), entry);

        state.counters.created += 1;
        state.counters.acquired += 1;
        state.emit(PoolEvent::Created { id: id.clone() });
        state.emit(PoolEvent::Acquired { id });

        Ok(conn)
    }

    async fn wait_for_handoff(
        &self,
        waiter_id: u64,
        mut rx: oneshot::Receiver<Result<PooledConnection<M::Session>>>,
    ) -> Result<PooledConnection<M::Session>> {
        let timeout = self.config.acquire_timeout;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => return result,
            // The sender only disappears without a message when the pool is torn down
            Ok(Err(_)) => return Err(self.disposed_error()),
            Err(_) => {}
        }

        let dequeued = {
            let mut state = self.lock();
            match state.waiters.iter().position(|w| w.id == waiter_id) {
                Some(pos) => {
                    state.waiters.remove(pos);
                    state.counters.acquire_timeouts += 1;
                    true
                }
                None => false,
            }
        };

        let timeout_error = Error::AcquireTimeout {
            pool: self.name.clone(),
            timeout,
        };

        if dequeued {
            warn!(pool = %self.name, timeout_ms = timeout.as_millis() as u64, "Timed out waiting for a connection");
            return Err(timeout_error);
        }

        // Someone answered between the deadline and our dequeue; keep what they sent
        rx.try_recv().unwrap_or(Err(timeout_error))
    }

    /// Give an IDLE entry straight to the oldest live waiter
    fn hand_off(&self, state: &mut PoolState<M::Session>, id: &str) -> bool {
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.is_closed() {
                continue;
            }

            let Some(entry) = state.entries.get_mut(id) else {
                state.waiters.push_front(waiter);
                return false;
            };

            let lease = entry.lease();
            let conn = PooledConnection::new(id.to_string(), lease, entry.session());

            if waiter.tx.send(Ok(conn)).is_ok() {
                state.counters.acquired += 1;
                state.emit(PoolEvent::Acquired { id: id.to_string() });
                debug!(pool = %self.name, entry = %id, "Handed connection to waiting caller");
                return true;
            }

            // Receiver vanished after the closed check
            if let Some(entry) = state.entries.get_mut(id) {
                entry.mark_idle();
            }
        }
        false
    }

    fn release(&self, conn: PooledConnection<M::Session>) {
        let mut state = self.lock();

        let Some(entry) = state.entries.get_mut(conn.id()) else {
            warn!(pool = %self.name, entry = %conn.id(), "Ignoring release of unknown connection");
            return;
        };

        if !entry.is_leased_by(conn.lease()) {
            warn!(
                pool = %self.name,
                entry = %conn.id(),
                state = %entry.state(),
                "Ignoring release of connection that is not in use"
            );
            return;
        }

        let failures = entry.health_check_failures();
        if failures >= self.config.health_check_retries {
            state.emit(PoolEvent::Released {
                id: conn.id().to_string(),
            });
            warn!(
                pool = %self.name,
                entry = %conn.id(),
                failures,
                "Retiring connection that failed health checks while in use"
            );
            self.remove_entry(&mut state, conn.id(), RemovalReason::HealthCheckFailed);
            self.serve_waiters(&mut state);
            return;
        }

        entry.mark_idle();
        state.emit(PoolEvent::Released {
            id: conn.id().to_string(),
        });
        debug!(pool = %self.name, entry = %conn.id(), "Released connection");

        if self.hand_off(&mut state, conn.id()) {
            return;
        }

        self.shrink_idle(&mut state, conn.id());
    }

    /// Evict the least recently used idle entry while more than
    /// `min_connections` entries sit idle
    fn shrink_idle(&self, state: &mut PoolState<M::Session>, just_released: &str) {
        if state.count(EntryState::Idle) <= self.config.min_connections {
            return;
        }

        let victim = state
            .entries
            .values()
            .filter(|e| e.state() == EntryState::Idle && e.id() != just_released)
            .min_by_key(|e| e.last_used())
            .map(|e| e.id().to_string());

        if let Some(id) = victim {
            self.remove_entry(state, &id, RemovalReason::IdleShrink);
        }
    }

    fn remove_entry(&self, state: &mut PoolState<M::Session>, id: &str, reason: RemovalReason) {
        let Some(mut entry) = state.entries.remove(id) else {
            return;
        };
        if !entry.dispose() {
            return;
        }

        state.counters.removed += 1;
        state.emit(PoolEvent::Removed {
            id: id.to_string(),
            reason,
        });
        debug!(pool = %self.name, entry = %id, reason = %reason, "Removed connection");
    }

    /// Insert a freshly created entry as IDLE, or pass it to a waiter
    fn admit(&self, state: &mut PoolState<M::Session>, entry: ConnectionEntry<M::Session>) {
        let id = entry.id().to_string();
        state.entries.insert(id.clone(), entry);
        state.counters.created += 1;
        state.emit(PoolEvent::Created { id: id.clone() });
        self.hand_off(state, &id);
    }

    /// Create `reservation.slots` entries concurrently and admit the ones that succeed
    async fn fill(&self, reservation: Reservation<'_, M>) -> usize {
        let results = join_all((0..reservation.slots).map(|_| self.open_entry())).await;

        let mut state = self.lock();
        reservation.settle(&mut state);

        let mut admitted = 0;
        for result in results {
            match result {
                Ok(entry) if !state.disposed => {
                    self.admit(&mut state, entry);
                    admitted += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(pool = %self.name, error = %e, "Failed to create replacement connection");
                }
            }
        }
        self.serve_waiters(&mut state);
        admitted
    }

    /// Start one creation for every queued caller that no in-flight
    /// creation is going to serve, as far as capacity allows
    fn serve_waiters(&self, state: &mut PoolState<M::Session>) {
        if state.disposed {
            return;
        }

        let unserved = state.live_waiters().saturating_sub(state.creating_for_waiters);
        let room = self.config.max_connections.saturating_sub(state.reserved());
        let slots = unserved.min(room);
        if slots == 0 {
            return;
        }

        let (Some(pool), Ok(runtime)) = (self.me.upgrade(), Handle::try_current()) else {
            return;
        };

        state.creating += slots;
        state.creating_for_waiters += slots;
        debug!(pool = %self.name, slots, "Creating connections for waiting callers");

        for _ in 0..slots {
            let pool = Arc::clone(&pool);
            runtime.spawn(async move {
                pool.create_for_waiter().await;
            });
        }
    }

    /// One creation started by `serve_waiters`; the slot is already counted
    async fn create_for_waiter(&self) {
        let reservation = Reservation {
            pool: self,
            slots: 1,
            for_waiters: true,
        };
        let created = self.open_entry().await;

        let mut state = self.lock();
        reservation.settle(&mut state);

        match created {
            Ok(entry) if !state.disposed => self.admit(&mut state, entry),
            Ok(_) => {}
            Err(e) => {
                warn!(pool = %self.name, error = %e, "Failed to create connection for waiting caller");
                self.fail_oldest_waiter(&mut state, e);
            }
        }
    }

    /// Hand a creation failure to the caller it was meant to serve
    fn fail_oldest_waiter(&self, state: &mut PoolState<M::Session>, error: Error) {
        let mut error = error;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(Err(error)) {
                Ok(()) => return,
                Err(Err(unsent)) => error = unsent,
                Err(Ok(_)) => return,
            }
        }
    }

    async fn warmup(&self) {
        let reservation = {
            let mut state = self.lock();
            let room = self.config.max_connections.saturating_sub(state.reserved());
            let slots = self.config.min_connections.min(room);
            state.creating += slots;
            Reservation::new(self, slots)
        };

        let wanted = reservation.slots;
        if wanted == 0 {
            return;
        }

        let created = self.fill(reservation).await;
        info!(pool = %self.name, created, wanted, "Warmed up connection pool");
    }

    async fn health_sweep(&self) {
        let targets: Vec<(String, Arc<M::Session>)> = {
            let state = self.lock();
            if state.disposed {
                return;
            }
            state
                .entries
                .values()
                .filter(|e| e.state() != EntryState::InUse)
                .map(|e| (e.id().to_string(), e.session()))
                .collect()
        };

        let results = join_all(targets.iter().map(|(id, session)| async move {
            (id.as_str(), self.probe(session).await)
        }))
        .await;

        let reservation = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }

            for (id, healthy) in results {
                let Some(entry) = state.entries.get_mut(id) else {
                    continue;
                };

                let was_unhealthy = entry.state() == EntryState::Unhealthy;
                entry.record_health(healthy);
                let failures = entry.health_check_failures();
                let current = entry.state();

                if healthy {
                    if was_unhealthy {
                        info!(pool = %self.name, entry = %id, "Connection recovered");
                        self.hand_off(&mut state, id);
                    }
                    continue;
                }

                warn!(
                    pool = %self.name,
                    entry = %id,
                    failures,
                    retries = self.config.health_check_retries,
                    "Connection failed health check"
                );

                if failures >= self.config.health_check_retries && current != EntryState::InUse {
                    self.remove_entry(&mut state, id, RemovalReason::HealthCheckFailed);
                }
            }

            let reserved = state.reserved();
            let below_floor = self.config.min_connections.saturating_sub(reserved);
            let room = self.config.max_connections.saturating_sub(reserved);
            let slots = below_floor.max(state.live_waiters().min(room));
            state.creating += slots;
            Reservation::new(self, slots)
        };

        if reservation.slots > 0 {
            let wanted = reservation.slots;
            let created = self.fill(reservation).await;
            debug!(pool = %self.name, created, wanted, "Replenished connection pool");
        }
    }

    fn evict_idle(&self) -> usize {
        let mut state = self.lock();
        if state.disposed {
            return 0;
        }

        let mut expired: Vec<(Instant, String)> = state
            .entries
            .values()
            .filter(|e| e.state() == EntryState::Idle && e.idle_for() > self.config.max_idle_time)
            .map(|e| (e.last_used(), e.id().to_string()))
            .collect();
        expired.sort();

        let mut removed = 0;
        for (_, id) in expired {
            if state.entries.len() <= self.config.min_connections {
                break;
            }
            self.remove_entry(&mut state, &id, RemovalReason::IdleTimeout);
            removed += 1;
        }

        if removed > 0 {
            debug!(pool = %self.name, removed, remaining = state.entries.len(), "Evicted idle connections");
        }
        removed
    }

    fn dispose(&self) {
        let mut state = self.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;

        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(Err(self.disposed_error()));
        }

        let ids: Vec<String> = state.entries.keys().cloned().collect();
        for id in ids {
            self.remove_entry(&mut state, &id, RemovalReason::PoolDisposed);
        }
        state.entries.clear();

        state.emit(PoolEvent::Disposed {
            pool: self.name.clone(),
        });
        state.events = None;

        info!(pool = %self.name, "Connection pool disposed");
    }

    fn stats(&self) -> PoolStats {
        let mut state = self.lock();
        state.prune_abandoned_waiters();

        PoolStats {
            total: state.entries.len(),
            idle: state.count(EntryState::Idle),
            in_use: state.count(EntryState::InUse),
            unhealthy: state.count(EntryState::Unhealthy),
            wait_queue_length: state.waiters.len(),
            total_created: state.counters.created,
            total_acquired: state.counters.acquired,
            total_removed: state.counters.removed,
            acquire_timeouts: state.counters.acquire_timeouts,
        }
    }
}

/// Pool of sessions for one logical target
pub struct ConnectionPool<M: SessionManager> {
    inner: Arc<PoolInner<M>>,

    /// Health and idle sweep tasks
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<M: SessionManager> ConnectionPool<M> {
    /// Create a pool, warm it up if configured, and start its sweep tasks
    ///
    /// Warmup failures are logged; the pool still starts and creates
    /// sessions on demand.
    pub async fn new(name: impl Into<String>, config: PoolConfig, manager: M) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let name = name.into();

        info!(
            pool = %name,
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Creating connection pool"
        );

        let inner = Arc::new_cyclic(|me| PoolInner {
            me: me.clone(),
            name,
            config,
            manager,
            state: Mutex::new(PoolState {
                entries: HashMap::new(),
                waiters: VecDeque::new(),
                creating: 0,
                creating_for_waiters: 0,
                disposed: false,
                events: Some(events),
                counters: Counters::default(),
            }),
            next_entry: AtomicU64::new(0),
            next_waiter: AtomicU64::new(0),
        });

        if inner.config.enable_warmup {
            inner.warmup().await;
        }

        let tasks = vec![
            Self::start_health_task(&inner),
            Self::start_idle_task(&inner),
        ];

        Self {
            inner,
            tasks: Mutex::new(tasks),
        }
    }

    fn start_health_task(inner: &Arc<PoolInner<M>>) -> JoinHandle<()> {
        let pool = Arc::downgrade(inner);
        let period = inner.config.health_check_interval;
        Self::spawn_sweeper(pool, period, |inner| async move {
            inner.health_sweep().await;
        })
    }

    fn start_idle_task(inner: &Arc<PoolInner<M>>) -> JoinHandle<()> {
        let pool = Arc::downgrade(inner);
        let period = inner.config.idle_check_interval;
        Self::spawn_sweeper(pool, period, |inner| async move {
            inner.evict_idle();
        })
    }

    /// Run `sweep` every `period` until the pool is dropped or disposed
    fn spawn_sweeper<F, Fut>(pool: Weak<PoolInner<M>>, period: Duration, sweep: F) -> JoinHandle<()>
    where
        F: Fn(Arc<PoolInner<M>>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                if inner.is_disposed() {
                    break;
                }
                sweep(inner).await;
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Lease a session
    ///
    /// Reuses an idle entry, creates one while below `max_connections`, or
    /// waits in FIFO order for a release.
    ///
    /// # Errors
    ///
    /// [`Error::PoolDisposed`] after [`dispose`](Self::dispose),
    /// [`Error::AcquireTimeout`] when no entry frees up within
    /// `acquire_timeout`, or the creation/probe failure of a new session.
    pub async fn acquire(&self) -> Result<PooledConnection<M::Session>> {
        self.inner.acquire().await
    }

    /// Return a leased session to the pool
    ///
    /// Releasing a lease that is no longer current is logged and ignored.
    pub fn release(&self, conn: PooledConnection<M::Session>) {
        self.inner.release(conn);
    }

    /// Like [`acquire`](Self::acquire), but the session goes back to the
    /// pool when the returned [`Lease`] is dropped
    pub async fn lease(&self) -> Result<Lease<'_, M>> {
        let conn = self.acquire().await?;
        Ok(Lease { pool: self, conn })
    }

    /// Probe every entry that is not in use, retire failing ones and
    /// replenish up to `min_connections`
    pub async fn run_health_check(&self) {
        self.inner.health_sweep().await;
    }

    /// Dispose idle entries past `max_idle_time`, never going below
    /// `min_connections`; returns how many were removed
    pub fn evict_idle(&self) -> usize {
        self.inner.evict_idle()
    }

    /// Receive pool events until the pool is disposed
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        match &self.inner.lock().events {
            Some(events) => events.subscribe(),
            None => {
                // Already disposed: hand out a receiver that is closed from the start
                let (events, rx) = broadcast::channel(1);
                drop(events);
                rx
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    /// Snapshot of every live entry
    pub fn entries(&self) -> Vec<EntryInfo> {
        let state = self.inner.lock();
        let mut entries: Vec<EntryInfo> = state.entries.values().map(|e| e.info()).collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Stop the sweeps, fail every waiter and drop every entry
    ///
    /// Idempotent: only the first call emits [`PoolEvent::Disposed`].
    pub fn dispose(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }

        self.inner.dispose();
    }
}

impl<M: SessionManager> Drop for ConnectionPool<M> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A session that is released back to its pool on drop
///
/// Futures holding a `Lease` can be cancelled (by `timeout`, `select!`, ...)
/// without leaving the entry IN_USE.
pub struct Lease<'a, M: SessionManager> {
    pool: &'a ConnectionPool<M>,
    conn: PooledConnection<M::Session>,
}

impl<M: SessionManager> Lease<'_, M> {
    pub fn id(&self) -> &str {
        self.conn.id()
    }

    pub fn session(&self) -> Arc<M::Session> {
        self.conn.session()
    }

    /// Release now instead of at the end of scope
    pub fn release(self) {}
}

impl<M: SessionManager> Drop for Lease<'_, M> {
    fn drop(&mut self) {
        // A copy carries the same lease number
        self.pool.release(self.conn.clone());
    }
}
