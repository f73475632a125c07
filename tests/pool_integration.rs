//! Integration tests for the connection pool and its manager
//!
//! These tests drive the pool with the simulated session manager and check
//! capacity, fairness, health and disposal behaviour.

use kubeguard::pool::{
    ConnectionManager, ConnectionPool, EntryState, PoolConfig, PoolEvent, RemovalReason,
};
use kubeguard::simulate::{SimulatedSession, SimulatedSessions};
use kubeguard::{Error, PooledConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

fn config(max: usize, min: usize) -> PoolConfig {
    PoolConfig {
        max_connections: max,
        min_connections: min,
        max_idle_time: Duration::from_secs(300),
        acquire_timeout: Duration::from_secs(5),
        health_check_interval: Duration::from_secs(3600),
        health_check_timeout: Duration::from_millis(200),
        health_check_retries: 2,
        idle_check_interval: Duration::from_secs(3600),
        enable_warmup: true,
    }
}

fn drain(rx: &mut broadcast::Receiver<PoolEvent>) -> Vec<PoolEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn wait_for_waiters(pool: &ConnectionPool<SimulatedSessions>, expected: usize) {
    for _ in 0..1000 {
        if pool.stats().wait_queue_length == expected {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("wait queue never reached {}", expected);
}

#[tokio::test]
async fn test_warmup_creates_min_connections() {
    let pool = ConnectionPool::new("prod", config(5, 2), SimulatedSessions::new()).await;

    let stats = pool.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.total_created, 2);
}

#[tokio::test]
async fn test_no_warmup_starts_empty() {
    let pool = ConnectionPool::new(
        "prod",
        PoolConfig {
            enable_warmup: false,
            ..config(5, 2)
        },
        SimulatedSessions::new(),
    )
    .await;

    assert_eq!(pool.stats().total, 0);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_times_out_when_saturated() {
    let pool = ConnectionPool::new(
        "prod",
        PoolConfig {
            acquire_timeout: Duration::from_millis(50),
            ..config(1, 0)
        },
        SimulatedSessions::new(),
    )
    .await;

    let held = pool.acquire().await.unwrap();

    let started = Instant::now();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, Error::AcquireTimeout { .. }), "{err}");
    assert!(started.elapsed() >= Duration::from_millis(50));

    let stats = pool.stats();
    assert_eq!(stats.wait_queue_length, 0);
    assert_eq!(stats.acquire_timeouts, 1);
    assert_eq!(stats.in_use, 1);

    pool.release(held);
    assert_eq!(pool.stats().idle, 1);
}

#[tokio::test]
async fn test_waiters_are_served_in_fifo_order() {
    let pool = Arc::new(ConnectionPool::new("prod", config(1, 0), SimulatedSessions::new()).await);
    let held = pool.acquire().await.unwrap();

    let first = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.acquire().await }
    });
    wait_for_waiters(&pool, 1).await;

    let second = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.acquire().await }
    });
    wait_for_waiters(&pool, 2).await;

    pool.release(held);
    let first_conn = first.await.unwrap().unwrap();
    assert_eq!(pool.stats().wait_queue_length, 1);
    assert!(!second.is_finished());

    pool.release(first_conn);
    let second_conn = second.await.unwrap().unwrap();
    assert_eq!(second_conn.id(), "prod-1");
    assert_eq!(pool.stats().wait_queue_length, 0);
}

#[tokio::test]
async fn test_handoff_never_exposes_idle_entry() {
    let pool = Arc::new(ConnectionPool::new("prod", config(1, 0), SimulatedSessions::new()).await);
    let held = pool.acquire().await.unwrap();
    let mut events = pool.subscribe();

    let waiter = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.acquire().await }
    });
    wait_for_waiters(&pool, 1).await;

    pool.release(held);
    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.in_use, 1);

    waiter.await.unwrap().unwrap();
    assert_eq!(
        drain(&mut events),
        vec![
            PoolEvent::Released { id: "prod-1".to_string() },
            PoolEvent::Acquired { id: "prod-1".to_string() },
        ]
    );
}

#[tokio::test]
async fn test_stale_release_does_not_touch_new_holder() {
    let pool = ConnectionPool::new("prod", config(1, 0), SimulatedSessions::new()).await;

    let first = pool.acquire().await.unwrap();
    let stale = first.clone();
    pool.release(first);

    let second = pool.acquire().await.unwrap();
    assert_eq!(second.id(), stale.id());
    let before = pool.stats();

    pool.release(stale);
    assert_eq!(pool.stats(), before);
    assert_eq!(pool.entries()[0].state, EntryState::InUse);

    pool.release(second);
    assert_eq!(pool.stats().idle, 1);
}

#[tokio::test]
async fn test_idle_shrink_keeps_min_connections() {
    let pool = ConnectionPool::new(
        "prod",
        PoolConfig {
            enable_warmup: false,
            ..config(3, 1)
        },
        SimulatedSessions::new(),
    )
    .await;
    let mut events = pool.subscribe();

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let c = pool.acquire().await.unwrap();
    drain(&mut events);

    pool.release(a);
    assert_eq!(pool.stats().total, 3);

    pool.release(b);
    let stats = pool.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.idle, 1);

    pool.release(c);
    let stats = pool.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(pool.entries()[0].id, "prod-3");

    let removed: Vec<PoolEvent> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, PoolEvent::Removed { .. }))
        .collect();
    assert_eq!(
        removed,
        vec![
            PoolEvent::Removed { id: "prod-1".to_string(), reason: RemovalReason::IdleShrink },
            PoolEvent::Removed { id: "prod-2".to_string(), reason: RemovalReason::IdleShrink },
        ]
    );
}

#[tokio::test]
async fn test_failing_entry_is_replaced() {
    let sessions = SimulatedSessions::new();
    let pool = ConnectionPool::new("prod", config(2, 1), sessions.clone()).await;
    let mut events = pool.subscribe();

    sessions.mark_unhealthy(1);

    pool.run_health_check().await;
    let stats = pool.stats();
    assert_eq!(stats.unhealthy, 1);
    assert_eq!(stats.total, 1);
    assert_eq!(pool.entries()[0].health_check_failures, 1);

    pool.run_health_check().await;
    let entries = pool.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, "prod-2");
    assert_eq!(entries[0].state, EntryState::Idle);

    assert_eq!(
        drain(&mut events),
        vec![
            PoolEvent::Removed {
                id: "prod-1".to_string(),
                reason: RemovalReason::HealthCheckFailed
            },
            PoolEvent::Created { id: "prod-2".to_string() },
        ]
    );
}

#[tokio::test]
async fn test_unhealthy_entry_recovers() {
    let sessions = SimulatedSessions::new();
    let pool = ConnectionPool::new(
        "prod",
        PoolConfig {
            health_check_retries: 5,
            ..config(2, 1)
        },
        sessions.clone(),
    )
    .await;

    sessions.mark_unhealthy(1);
    pool.run_health_check().await;
    assert_eq!(pool.stats().unhealthy, 1);

    sessions.mark_healthy(1);
    pool.run_health_check().await;
    let entries = pool.entries();
    assert_eq!(entries[0].state, EntryState::Idle);
    assert_eq!(entries[0].health_check_failures, 0);
}

#[tokio::test]
async fn test_leased_entry_is_not_probed() {
    let sessions = SimulatedSessions::new();
    let pool = ConnectionPool::new("prod", config(2, 1), sessions.clone()).await;

    let conn = pool.acquire().await.unwrap();
    sessions.mark_unhealthy(1);
    let probes = sessions.probes();

    pool.run_health_check().await;
    pool.run_health_check().await;

    assert_eq!(sessions.probes(), probes);
    assert_eq!(pool.entries()[0].state, EntryState::InUse);
    pool.release(conn);
}

#[tokio::test(start_paused = true)]
async fn test_health_sweep_runs_on_its_timer() {
    let sessions = SimulatedSessions::new();
    let pool = ConnectionPool::new(
        "prod",
        PoolConfig {
            health_check_interval: Duration::from_secs(1),
            ..config(2, 1)
        },
        sessions.clone(),
    )
    .await;

    sessions.mark_unhealthy(1);
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let stats = pool.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.total_removed, 1);
    assert_eq!(pool.entries()[0].id, "prod-2");
}

#[tokio::test(start_paused = true)]
async fn test_idle_entries_expire_above_floor() {
    let pool = ConnectionPool::new(
        "prod",
        PoolConfig {
            max_idle_time: Duration::from_secs(1),
            ..config(3, 1)
        },
        SimulatedSessions::new(),
    )
    .await;

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    pool.release(a);
    pool.release(b);
    // Shrinking on release already trimmed the idle set down to the floor
    assert_eq!(pool.stats().total, 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(pool.evict_idle(), 0);
    assert_eq!(pool.stats().total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_entries_expire_without_floor() {
    let pool = ConnectionPool::new(
        "prod",
        PoolConfig {
            max_idle_time: Duration::from_secs(1),
            idle_check_interval: Duration::from_millis(500),
            ..config(3, 0)
        },
        SimulatedSessions::new(),
    )
    .await;
    let mut events = pool.subscribe();

    let conn = pool.acquire().await.unwrap();
    pool.release(conn);
    assert_eq!(pool.stats().total, 1);

    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert_eq!(pool.stats().total, 0);
    assert!(drain(&mut events).contains(&PoolEvent::Removed {
        id: "prod-1".to_string(),
        reason: RemovalReason::IdleTimeout,
    }));
}

#[tokio::test(start_paused = true)]
async fn test_inflight_creations_count_against_capacity() {
    let sessions = SimulatedSessions::new();
    sessions.set_create_latency(Duration::from_millis(100));
    let pool = Arc::new(
        ConnectionPool::new(
            "prod",
            PoolConfig {
                acquire_timeout: Duration::from_secs(1),
                ..config(2, 0)
            },
            sessions.clone(),
        )
        .await,
    );

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        })
        .collect();

    let mut acquired = Vec::new();
    let mut timed_out = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(conn) => acquired.push(conn),
            Err(Error::AcquireTimeout { .. }) => timed_out += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(acquired.len(), 2);
    assert_eq!(timed_out, 3);
    assert_eq!(sessions.sessions_created(), 2);
    assert_eq!(pool.stats().total, 2);
}

#[tokio::test]
async fn test_failed_creation_is_not_inserted() {
    let sessions = SimulatedSessions::new();
    sessions.set_creation_fails(true);
    let pool = ConnectionPool::new("prod", config(2, 1), sessions.clone()).await;
    assert_eq!(pool.stats().total, 0);

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, Error::Api { .. }));
    assert_eq!(pool.stats().total, 0);

    sessions.set_creation_fails(false);
    assert!(pool.acquire().await.is_ok());
}

fn spawn_acquire(
    pool: &Arc<ConnectionPool<SimulatedSessions>>,
) -> JoinHandle<kubeguard::Result<PooledConnection<SimulatedSession>>> {
    let pool = Arc::clone(pool);
    tokio::spawn(async move { pool.acquire().await })
}

#[tokio::test(start_paused = true)]
async fn test_failed_creation_hands_capacity_to_waiter() {
    let sessions = SimulatedSessions::new();
    sessions.set_create_latency(Duration::from_millis(50));
    sessions.set_creation_fails(true);
    let pool = Arc::new(
        ConnectionPool::new(
            "prod",
            PoolConfig {
                acquire_timeout: Duration::from_millis(500),
                ..config(1, 0)
            },
            sessions.clone(),
        )
        .await,
    );

    let first = spawn_acquire(&pool);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = spawn_acquire(&pool);
    wait_for_waiters(&pool, 1).await;

    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Api { .. }));
    sessions.set_creation_fails(false);

    let conn = second.await.unwrap().unwrap();
    assert_eq!(conn.id(), "prod-1");

    let stats = pool.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.in_use, 1);
    assert_eq!(stats.wait_queue_length, 0);
    assert_eq!(stats.acquire_timeouts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_waiter_sees_failure_of_its_own_creation() {
    let sessions = SimulatedSessions::new();
    sessions.set_create_latency(Duration::from_millis(50));
    sessions.set_creation_fails(true);
    let pool = Arc::new(
        ConnectionPool::new(
            "prod",
            PoolConfig {
                acquire_timeout: Duration::from_secs(5),
                ..config(1, 0)
            },
            sessions.clone(),
        )
        .await,
    );

    let started = Instant::now();
    let first = spawn_acquire(&pool);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = spawn_acquire(&pool);

    assert!(matches!(first.await.unwrap(), Err(Error::Api { .. })));
    assert!(matches!(second.await.unwrap(), Err(Error::Api { .. })));
    // Failed on its own creation attempt, long before the acquire timeout
    assert!(started.elapsed() < Duration::from_secs(1));

    let stats = pool.stats();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.wait_queue_length, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_creation_frees_capacity_for_waiter() {
    let sessions = SimulatedSessions::new();
    sessions.set_create_latency(Duration::from_millis(100));
    let pool = Arc::new(
        ConnectionPool::new(
            "prod",
            PoolConfig {
                acquire_timeout: Duration::from_millis(500),
                ..config(1, 0)
            },
            sessions.clone(),
        )
        .await,
    );

    let impatient = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let patient = spawn_acquire(&pool);
    wait_for_waiters(&pool, 1).await;

    assert!(impatient.await.unwrap().is_err());

    let conn = patient.await.unwrap().unwrap();
    assert_eq!(conn.id(), "prod-1");
    assert_eq!(sessions.sessions_created(), 1);
    assert_eq!(pool.stats().total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_with_session_returns_session() {
    let manager = ConnectionManager::new(
        "prod",
        PoolConfig {
            acquire_timeout: Duration::from_millis(100),
            ..config(1, 1)
        },
        SimulatedSessions::new(),
    )
    .await;

    let call = manager.with_session(|session| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        session.call("watch-pods").await
    });
    assert!(tokio::time::timeout(Duration::from_millis(20), call).await.is_err());

    let stats = manager.get_stats().pool_stats;
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 1);

    let conn = manager.acquire().await.unwrap();
    assert_eq!(conn.id(), "prod-1");
}

#[tokio::test(start_paused = true)]
async fn test_lease_releases_on_drop() {
    let pool = ConnectionPool::new("prod", config(1, 1), SimulatedSessions::new()).await;

    {
        let lease = pool.lease().await.unwrap();
        assert_eq!(lease.id(), "prod-1");
        assert_eq!(pool.stats().in_use, 1);
    }

    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 1);
}

#[tokio::test(start_paused = true)]
async fn test_entry_failing_health_check_while_leased_is_retired_on_release() {
    let sessions = SimulatedSessions::new();
    let pool = Arc::new(
        ConnectionPool::new(
            "prod",
            PoolConfig {
                health_check_retries: 1,
                ..config(2, 1)
            },
            sessions.clone(),
        )
        .await,
    );
    let mut events = pool.subscribe();

    sessions.set_health_check_latency(Duration::from_millis(50));
    sessions.mark_unhealthy(1);
    let checks = sessions.probes();

    let sweep = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.run_health_check().await })
    };
    while sessions.probes() == checks {
        tokio::task::yield_now().await;
    }

    // Leased while its health check is still in flight
    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.id(), "prod-1");
    sweep.await.unwrap();

    let entries = pool.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].state, EntryState::InUse);
    assert_eq!(entries[0].health_check_failures, 1);

    pool.release(conn);
    assert_eq!(pool.stats().total, 0);
    assert!(drain(&mut events).contains(&PoolEvent::Removed {
        id: "prod-1".to_string(),
        reason: RemovalReason::HealthCheckFailed,
    }));

    let next = pool.acquire().await.unwrap();
    assert_eq!(next.id(), "prod-2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counts_stay_within_bounds_under_load() {
    let pool = Arc::new(ConnectionPool::new("prod", config(3, 1), SimulatedSessions::new()).await);

    let workers: Vec<_> = (0..16)
        .map(|_| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                for _ in 0..20 {
                    let conn = pool.acquire().await.unwrap();
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    pool.release(conn);
                }
            })
        })
        .collect();

    let sampler = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move {
            for _ in 0..200 {
                let s = pool.stats();
                assert!(s.idle + s.in_use + s.unhealthy <= s.total, "{s:?}");
                assert!(s.total <= 3, "{s:?}");
                tokio::task::yield_now().await;
            }
        }
    });

    for worker in workers {
        worker.await.unwrap();
    }
    sampler.await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.wait_queue_length, 0);
    assert_eq!(stats.total_acquired, 16 * 20);
}

#[tokio::test]
async fn test_dispose_is_idempotent() {
    let pool = ConnectionPool::new("prod", config(3, 2), SimulatedSessions::new()).await;
    let mut events = pool.subscribe();

    pool.dispose();
    pool.dispose();
    assert!(pool.is_disposed());

    let events = {
        let mut seen = Vec::new();
        loop {
            match events.recv().await {
                Ok(event) => seen.push(event),
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
        seen
    };

    let disposed = events
        .iter()
        .filter(|e| matches!(e, PoolEvent::Disposed { .. }))
        .count();
    assert_eq!(disposed, 1);
    assert_eq!(events.last(), Some(&PoolEvent::Disposed { pool: "prod".to_string() }));
    assert!(events.contains(&PoolEvent::Removed {
        id: "prod-1".to_string(),
        reason: RemovalReason::PoolDisposed,
    }));

    assert_eq!(pool.stats().total, 0);
    assert!(matches!(pool.acquire().await, Err(Error::PoolDisposed { .. })));
}

#[tokio::test]
async fn test_dispose_rejects_waiters() {
    let pool = Arc::new(ConnectionPool::new("prod", config(1, 0), SimulatedSessions::new()).await);
    let _held = pool.acquire().await.unwrap();

    let waiter = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.acquire().await }
    });
    wait_for_waiters(&pool, 1).await;

    pool.dispose();
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(Error::PoolDisposed { .. })));
}

#[tokio::test]
async fn test_manager_forwards_events_and_detaches() {
    let manager = ConnectionManager::new("prod", config(2, 0), SimulatedSessions::new()).await;
    let mut events = manager.subscribe();

    let conn = manager.acquire().await.unwrap();
    manager.release(conn);
    manager.dispose();
    manager.dispose();

    assert_eq!(
        drain(&mut events),
        vec![
            PoolEvent::Created { id: "prod-1".to_string() },
            PoolEvent::Acquired { id: "prod-1".to_string() },
            PoolEvent::Released { id: "prod-1".to_string() },
            PoolEvent::Removed {
                id: "prod-1".to_string(),
                reason: RemovalReason::PoolDisposed
            },
            PoolEvent::Disposed { pool: "prod".to_string() },
        ]
    );
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Closed)
    ));
    assert!(!manager.get_stats().healthy);
}
