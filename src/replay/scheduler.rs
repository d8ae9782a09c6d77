//! Replay scheduler: the state machine driving one replay run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::event::SqlEvent;
use crate::sink::EventSource;

use super::{
    ExecutorFactory, OutcomeAnalyzer, ReplayJob, ReplayReport, ReplayState, Strategy, WorkerPool,
};

/// Drives `Loading → Dispatching → Draining → Finished` over one persisted
/// event stream.
pub struct Scheduler {
    job: ReplayJob,
    factory: Arc<dyn ExecutorFactory>,
    state: ReplayState,
    analyzer: Option<OutcomeAnalyzer>,
}

impl Scheduler {
    pub fn new(job: ReplayJob, factory: Arc<dyn ExecutorFactory>) -> Self {
        Self {
            job,
            factory,
            state: ReplayState::Loading,
            analyzer: None,
        }
    }

    pub fn state(&self) -> ReplayState {
        self.state
    }

    /// The filled analyzer, available once the run has finished. Used to
    /// write the slow-SQL CSV and mismatch report.
    pub fn take_analyzer(&mut self) -> Option<OutcomeAnalyzer> {
        self.analyzer.take()
    }

    /// Decide what to do with one event: `Some(event)` rewritten for the
    /// target, `None` when it is filtered out. Counters go to `report`.
    fn admit(&self, mut event: SqlEvent, report: &mut ReplayReport) -> Option<SqlEvent> {
        if !self.job.session_allowed(&event.session_id) {
            report.skipped_filtered += 1;
            return None;
        }
        let Some(target_schema) = self.job.schema_map.get(&event.schema) else {
            warn!(
                schema = %event.schema,
                sql_id = event.sql_id,
                "no schema mapping, skipping event"
            );
            report.skipped_unmapped += 1;
            return None;
        };
        if let Strategy::SpeedMultiplied {
            multiplier,
            allow_destructive,
        } = self.job.strategy
        {
            if multiplier > 1.0 && !allow_destructive && !event.is_read_only() {
                debug!(sql_id = event.sql_id, "skipping destructive statement");
                report.skipped_safety += 1;
                return None;
            }
        }
        event.schema = target_schema.clone();
        Some(event)
    }

    /// Inter-event delay under the speed-multiplied strategy.
    fn pacing_delay(&self, previous_start_us: Option<i64>, start_us: i64) -> Option<Duration> {
        let Strategy::SpeedMultiplied { multiplier, .. } = self.job.strategy else {
            return None;
        };
        let previous = previous_start_us?;
        let gap_us = (start_us - previous).max(0) as f64;
        if multiplier <= 0.0 {
            return None;
        }
        Some(Duration::from_micros((gap_us / multiplier) as u64))
    }

    /// Run the job to completion and return its counters.
    pub async fn run(&mut self, mut source: Box<dyn EventSource>) -> Result<ReplayReport> {
        let started = Instant::now();
        let mut report = ReplayReport::default();

        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let mut analyzer = OutcomeAnalyzer::new(self.job.slow_rule, self.job.slow_top_n);
        let collector = tokio::spawn(async move {
            let mut count = 0u64;
            let mut outcomes = Vec::new();
            while let Some(outcome) = outcome_rx.recv().await {
                count += 1;
                outcomes.push(outcome);
            }
            (count, outcomes)
        });

        let pool = WorkerPool::spawn(
            self.job.strategy.pool_size(),
            self.job.target.clone(),
            self.factory.clone(),
            self.job.compare_results,
            outcome_tx,
        );

        self.state = ReplayState::Dispatching;
        info!(strategy = ?self.job.strategy, "replay dispatching");

        let mut previous_start_us: Option<i64> = None;
        while let Some(event) = source.next_event()? {
            if !self.job.time_budget.is_zero() && started.elapsed() > self.job.time_budget {
                info!("replay time budget exhausted, draining");
                break;
            }
            let start_us = event.start_time_us;
            let Some(event) = self.admit(event, &mut report) else {
                continue;
            };
            if let Some(delay) = self.pacing_delay(previous_start_us, start_us) {
                tokio::time::sleep(delay).await;
            }
            previous_start_us = Some(start_us);

            if pool.dispatch(event).await.is_err() {
                warn!("worker pool gone, stopping dispatch");
                break;
            }
            report.dispatched += 1;
        }

        self.state = ReplayState::Draining;
        pool.join().await;

        let (count, outcomes) = collector.await.unwrap_or((0, Vec::new()));
        debug!(outcomes = count, "collected replay outcomes");
        for outcome in &outcomes {
            analyzer.record(outcome);
        }
        report.failed = analyzer.failed;
        report.slow = analyzer.slow_count();
        report.mismatched = analyzer.mismatch_count();
        report.elapsed_us = started.elapsed().as_micros() as i64;

        self.state = ReplayState::Finished;
        info!(
            dispatched = report.dispatched,
            skipped = report.skipped_filtered + report.skipped_unmapped + report.skipped_safety,
            failed = report.failed,
            slow = report.slow,
            "replay finished"
        );
        self.analyzer = Some(analyzer);
        Ok(report)
    }
}
