//! Bounded history of classified errors with rate and trend queries

use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::operation::OperationContext;
use crate::error::{Error, ErrorKind};

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMonitorConfig {
    /// Records kept before the oldest is evicted
    pub max_history: usize,

    /// Window used by `record` to flag a trending kind
    pub trend_window: Duration,

    /// Errors of one kind inside `trend_window` that make it trending
    pub trend_threshold: usize,
}

impl Default for ErrorMonitorConfig {
    fn default() -> Self {
        Self {
            max_history: 1000,
            trend_window: Duration::from_secs(300),
            trend_threshold: 10,
        }
    }
}

/// One recorded failure
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub status_code: Option<u16>,
    pub operation: String,
    pub context: OperationContext,
    pub message: String,
    pub retryable: bool,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorStats {
    pub total: usize,
    pub retryable: usize,
    pub non_retryable: usize,
    pub by_kind: BTreeMap<ErrorKind, usize>,
    pub by_operation: BTreeMap<String, usize>,
}

#[derive(Default)]
struct MonitorState {
    history: VecDeque<ErrorRecord>,

    /// Kinds that were trending at their last record
    trending: HashSet<ErrorKind>,
}

/// Shared error sink for every retryable operation
pub struct ErrorMonitor {
    config: ErrorMonitorConfig,
    state: Mutex<MonitorState>,
}

impl Default for ErrorMonitor {
    fn default() -> Self {
        Self::new(ErrorMonitorConfig::default())
    }
}

impl ErrorMonitor {
    pub fn new(config: ErrorMonitorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn config(&self) -> &ErrorMonitorConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a failure of `operation`
    ///
    /// Errors without a classification are skipped. Returns whether the
    /// error's kind is trending after this record.
    pub fn record(&self, error: &Error, operation: &str, context: &OperationContext) -> bool {
        let Some(kind) = error.kind() else {
            debug!(operation = %operation, error = %error, "Skipping unclassified error");
            return false;
        };

        let mut state = self.lock();
        state.history.push_back(ErrorRecord {
            kind,
            status_code: error.status_code(),
            operation: operation.to_string(),
            context: context.clone(),
            message: error.to_string(),
            retryable: kind.is_retryable(),
            timestamp: Instant::now(),
        });
        while state.history.len() > self.config.max_history {
            state.history.pop_front();
        }

        let count = count_within(&state.history, kind, self.config.trend_window);
        let trending = count >= self.config.trend_threshold;

        if trending {
            if state.trending.insert(kind) {
                warn!(
                    kind = %kind,
                    count,
                    window_ms = self.config.trend_window.as_millis() as u64,
                    "Error kind is trending"
                );
            }
        } else {
            state.trending.remove(&kind);
        }

        trending
    }

    pub fn get_stats(&self) -> ErrorStats {
        let state = self.lock();
        let mut stats = ErrorStats {
            total: state.history.len(),
            ..ErrorStats::default()
        };

        for record in &state.history {
            if record.retryable {
                stats.retryable += 1;
            } else {
                stats.non_retryable += 1;
            }
            *stats.by_kind.entry(record.kind).or_default() += 1;
            *stats.by_operation.entry(record.operation.clone()).or_default() += 1;
        }
        stats
    }

    /// Errors per second over the trailing `window`
    pub fn error_rate(&self, window: Duration) -> f64 {
        if window.is_zero() {
            return 0.0;
        }
        let state = self.lock();
        let count = state
            .history
            .iter()
            .filter(|r| r.timestamp.elapsed() <= window)
            .count();
        count as f64 / window.as_secs_f64()
    }

    /// Whether at least `min_count` errors of `kind` occurred within `window`
    pub fn is_error_trending(&self, kind: ErrorKind, min_count: usize, window: Duration) -> bool {
        count_within(&self.lock().history, kind, window) >= min_count
    }

    /// The `n` most recent records, oldest first
    pub fn recent(&self, n: usize) -> Vec<ErrorRecord> {
        let state = self.lock();
        let skip = state.history.len().saturating_sub(n);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn errors_for_operation(&self, operation: &str) -> Vec<ErrorRecord> {
        self.lock()
            .history
            .iter()
            .filter(|r| r.operation == operation)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.history.clear();
        state.trending.clear();
    }
}

fn count_within(history: &VecDeque<ErrorRecord>, kind: ErrorKind, window: Duration) -> usize {
    history
        .iter()
        .rev()
        .take_while(|r| r.timestamp.elapsed() <= window)
        .filter(|r| r.kind == kind)
        .count()
}
