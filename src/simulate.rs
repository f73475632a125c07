//! In-process stand-in for an API server, used by `kubeguard soak` and tests
//!
//! [`SimulatedSessions`] hands out [`SimulatedSession`]s whose calls fail at a
//! configurable rate with the transient errors a real control plane returns
//! under load. Probe outcomes can be forced globally or per session.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};
use crate::pool::SessionManager;

struct Shared {
    next_id: AtomicU64,
    probes: AtomicU64,
    calls: AtomicU64,
    create_latency_ms: AtomicU64,
    health_check_latency_ms: AtomicU64,
    call_latency_ms: AtomicU64,
    /// `f64` bits
    failure_rate: AtomicU64,
    probes_healthy: AtomicBool,
    creation_fails: AtomicBool,
    unhealthy: Mutex<HashSet<u64>>,
}

/// Session manager backed by nothing but counters and a random generator
#[derive(Clone)]
pub struct SimulatedSessions {
    shared: Arc<Shared>,
}

impl Default for SimulatedSessions {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSessions {
    /// Healthy, instant, never failing
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(0),
                probes: AtomicU64::new(0),
                calls: AtomicU64::new(0),
                create_latency_ms: AtomicU64::new(0),
                health_check_latency_ms: AtomicU64::new(0),
                call_latency_ms: AtomicU64::new(0),
                failure_rate: AtomicU64::new(0f64.to_bits()),
                probes_healthy: AtomicBool::new(true),
                creation_fails: AtomicBool::new(false),
                unhealthy: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Fraction of calls (0.0 - 1.0) that fail with a transient error
    pub fn set_failure_rate(&self, rate: f64) {
        let rate = rate.clamp(0.0, 1.0);
        self.shared.failure_rate.store(rate.to_bits(), Ordering::Relaxed);
    }

    pub fn failure_rate(&self) -> f64 {
        f64::from_bits(self.shared.failure_rate.load(Ordering::Relaxed))
    }

    pub fn set_call_latency(&self, latency: Duration) {
        self.shared
            .call_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_create_latency(&self, latency: Duration) {
        self.shared
            .create_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_health_check_latency(&self, latency: Duration) {
        self.shared
            .health_check_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Make every probe succeed or fail
    pub fn set_probe_healthy(&self, healthy: bool) {
        self.shared.probes_healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn set_creation_fails(&self, fails: bool) {
        self.shared.creation_fails.store(fails, Ordering::Relaxed);
    }

    /// Fail every probe of one session from now on
    pub fn mark_unhealthy(&self, session_id: u64) {
        self.shared
            .unhealthy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id);
    }

    pub fn mark_healthy(&self, session_id: u64) {
        self.shared
            .unhealthy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id);
    }

    pub fn sessions_created(&self) -> u64 {
        self.shared.next_id.load(Ordering::Relaxed)
    }

    pub fn probes(&self) -> u64 {
        self.shared.probes.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> u64 {
        self.shared.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SessionManager for SimulatedSessions {
    type Session = SimulatedSession;

    async fn create_session(&self) -> Result<SimulatedSession> {
        let latency = self.shared.create_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.shared.creation_fails.load(Ordering::Relaxed) {
            return Err(Error::api(ErrorKind::Unauthorized, "simulated credentials rejected"));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(SimulatedSession {
            id,
            shared: Arc::clone(&self.shared),
        })
    }

    async fn probe_health(&self, session: &SimulatedSession) -> bool {
        self.shared.probes.fetch_add(1, Ordering::Relaxed);

        let latency = self.shared.health_check_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if !self.shared.probes_healthy.load(Ordering::Relaxed) {
            return false;
        }
        !self
            .shared
            .unhealthy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&session.id)
    }
}

/// One simulated authenticated session
pub struct SimulatedSession {
    id: u64,
    shared: Arc<Shared>,
}

impl SimulatedSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Issue one request; fails at the configured rate
    pub async fn call(&self, request: &str) -> Result<String> {
        self.shared.calls.fetch_add(1, Ordering::Relaxed);

        let rate = f64::from_bits(self.shared.failure_rate.load(Ordering::Relaxed));
        let failure = {
            let mut rng = rand::thread_rng();
            if rate > 0.0 && rng.gen_bool(rate) {
                Some(match rng.gen_range(0..3) {
                    0 => Error::from_status(503, "the server is currently unable to handle the request"),
                    1 => Error::from_status(429, "too many requests"),
                    _ => Error::api(ErrorKind::Network, "connection reset by peer"),
                })
            } else {
                None
            }
        };

        let latency = self.shared.call_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(format!("session {} served {}", self.id, request)),
        }
    }
}
