//! Replay engine: re-executes a persisted event stream against a target
//! database under a configurable timing strategy.
//!
//! Layout:
//! - [`Scheduler`] is the central state machine (`Loading` through
//!   `Finished`) reading events, filtering and pacing them
//! - [`WorkerPool`] routes events to session-affine tokio workers
//! - [`ConnectionManager`] owns one live connection per worker and target
//!   schema
//! - [`OutcomeAnalyzer`] classifies slow statements and diffs result sets

mod connection;
mod outcome;
mod scheduler;
mod worker;

pub use connection::{
    ConnectionManager, DbExecutorFactory, ExecutorFactory, SqlExecutor, TargetConfig, TargetVendor,
};
pub use outcome::{EventOutcome, OutcomeAnalyzer, RowMismatch, SlowRule};
pub use scheduler::Scheduler;
pub use worker::WorkerPool;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Timing strategy for dispatching replayed events.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// One worker, strict recorded order.
    Serial,
    /// Bounded pool; events of one session always land on the same worker.
    SessionParallel { pool_size: usize },
    /// Recorded inter-event gaps divided by `multiplier`. A multiplier
    /// above 1 replays only read-only statements unless
    /// `allow_destructive` is set.
    SpeedMultiplied {
        multiplier: f64,
        allow_destructive: bool,
    },
}

impl Strategy {
    pub fn pool_size(&self) -> usize {
        match self {
            Strategy::Serial | Strategy::SpeedMultiplied { .. } => 1,
            Strategy::SessionParallel { pool_size } => (*pool_size).max(1),
        }
    }
}

/// Scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Loading,
    Dispatching,
    Draining,
    Finished,
}

/// Immutable configuration for one replay run.
#[derive(Debug, Clone)]
pub struct ReplayJob {
    pub target: TargetConfig,
    pub strategy: Strategy,
    /// Sessions never replayed. Wins over the whitelist.
    pub session_blacklist: HashSet<String>,
    /// When non-empty, only these sessions are replayed.
    pub session_whitelist: HashSet<String>,
    /// Source schema to target schema. An event whose schema has no entry
    /// is skipped, never defaulted.
    pub schema_map: HashMap<String, String>,
    pub slow_rule: Option<SlowRule>,
    /// Slow statements exported at job end, largest durations first.
    pub slow_top_n: usize,
    pub compare_results: bool,
    /// Zero means no budget.
    pub time_budget: Duration,
}

impl ReplayJob {
    pub fn new(target: TargetConfig, strategy: Strategy) -> Self {
        Self {
            target,
            strategy,
            session_blacklist: HashSet::new(),
            session_whitelist: HashSet::new(),
            schema_map: HashMap::new(),
            slow_rule: None,
            slow_top_n: 10,
            compare_results: false,
            time_budget: Duration::ZERO,
        }
    }

    /// Whether the session passes the white/black list filters.
    pub fn session_allowed(&self, session_id: &str) -> bool {
        if self.session_blacklist.contains(session_id) {
            return false;
        }
        self.session_whitelist.is_empty() || self.session_whitelist.contains(session_id)
    }
}

/// Counters produced by one replay run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub dispatched: u64,
    pub skipped_filtered: u64,
    pub skipped_unmapped: u64,
    pub skipped_safety: u64,
    pub failed: u64,
    pub slow: u64,
    pub mismatched: u64,
    pub elapsed_us: i64,
}
