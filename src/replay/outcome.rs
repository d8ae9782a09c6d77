//! Per-event outcome recording: slow classification, top-N export and
//! result-set comparison.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use tracing::warn;

use crate::error::{ConfigError, SinkError};
use crate::event::RowMatrix;

/// Slow-statement classification rule, selected by a numeric code in the
/// configuration. Codes other than 1 and 2 are rejected at load time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlowRule {
    /// Code 1: replay duration exceeds a fixed threshold.
    AbsoluteThreshold { threshold_us: i64 },
    /// Code 2: replay duration exceeds the recorded source duration by more
    /// than the threshold.
    SourceDelta { threshold_us: i64 },
}

impl SlowRule {
    pub fn from_code(code: u32, threshold_us: i64) -> Result<Self, ConfigError> {
        match code {
            1 => Ok(SlowRule::AbsoluteThreshold { threshold_us }),
            2 => Ok(SlowRule::SourceDelta { threshold_us }),
            other => Err(ConfigError::UnknownSlowRule { code: other }),
        }
    }

    pub fn is_slow(&self, replay_us: i64, source_us: Option<i64>) -> bool {
        match self {
            SlowRule::AbsoluteThreshold { threshold_us } => replay_us > *threshold_us,
            SlowRule::SourceDelta { threshold_us } => match source_us {
                Some(source) => replay_us - source > *threshold_us,
                // No recorded timing means the delta rule cannot fire.
                None => false,
            },
        }
    }
}

/// What one worker reports back after executing (or failing) an event.
#[derive(Debug, Clone)]
pub struct EventOutcome {
    pub sql_id: u64,
    pub session_id: String,
    pub schema: String,
    pub statement_text: String,
    pub source_duration_us: Option<i64>,
    pub replay_duration_us: i64,
    pub error: Option<String>,
    /// Rows captured at acquisition time, when available.
    pub captured_rows: Option<RowMatrix>,
    /// Rows produced by the replay execution, when comparison is on.
    pub replayed_rows: Option<RowMatrix>,
}

/// First divergence between a captured and a replayed result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RowMismatch {
    RowCount { captured: usize, replayed: usize },
    Cell {
        row: usize,
        column: usize,
        captured: Option<String>,
        replayed: Option<String>,
    },
}

/// Compare two row matrices; `None` means they agree.
pub fn compare_rows(captured: &RowMatrix, replayed: &RowMatrix) -> Option<RowMismatch> {
    if captured.len() != replayed.len() {
        return Some(RowMismatch::RowCount {
            captured: captured.len(),
            replayed: replayed.len(),
        });
    }
    for (row_index, (left, right)) in captured.iter().zip(replayed).enumerate() {
        let columns = left.len().max(right.len());
        for column in 0..columns {
            let captured_cell = left.get(column).cloned().flatten();
            let replayed_cell = right.get(column).cloned().flatten();
            if captured_cell != replayed_cell {
                return Some(RowMismatch::Cell {
                    row: row_index,
                    column,
                    captured: captured_cell,
                    replayed: replayed_cell,
                });
            }
        }
    }
    None
}

#[derive(Debug, Clone, Serialize)]
struct MismatchRecord {
    sql_id: u64,
    session: String,
    sql: String,
    mismatch: RowMismatch,
}

#[derive(Debug, Clone)]
struct SlowRecord {
    sql_id: u64,
    session: String,
    schema: String,
    sql: String,
    source_us: i64,
    replay_us: i64,
}

/// Accumulates outcomes across the run and writes the end-of-job artifacts.
pub struct OutcomeAnalyzer {
    rule: Option<SlowRule>,
    top_n: usize,
    slow: Vec<SlowRecord>,
    mismatches: Vec<MismatchRecord>,
    pub executed: u64,
    pub failed: u64,
}

impl OutcomeAnalyzer {
    pub fn new(rule: Option<SlowRule>, top_n: usize) -> Self {
        Self {
            rule,
            top_n,
            slow: Vec::new(),
            mismatches: Vec::new(),
            executed: 0,
            failed: 0,
        }
    }

    pub fn slow_count(&self) -> u64 {
        self.slow.len() as u64
    }

    pub fn mismatch_count(&self) -> u64 {
        self.mismatches.len() as u64
    }

    pub fn record(&mut self, outcome: &EventOutcome) {
        if let Some(error) = &outcome.error {
            self.failed += 1;
            warn!(
                sql_id = outcome.sql_id,
                session = %outcome.session_id,
                error = %error,
                "replay execution failed"
            );
            return;
        }
        self.executed += 1;

        if let Some(rule) = self.rule {
            if rule.is_slow(outcome.replay_duration_us, outcome.source_duration_us) {
                self.slow.push(SlowRecord {
                    sql_id: outcome.sql_id,
                    session: outcome.session_id.clone(),
                    schema: outcome.schema.clone(),
                    sql: outcome.statement_text.clone(),
                    source_us: outcome.source_duration_us.unwrap_or(0),
                    replay_us: outcome.replay_duration_us,
                });
            }
        }

        if let (Some(captured), Some(replayed)) = (&outcome.captured_rows, &outcome.replayed_rows) {
            if let Some(mismatch) = compare_rows(captured, replayed) {
                warn!(
                    sql_id = outcome.sql_id,
                    session = %outcome.session_id,
                    ?mismatch,
                    "result set mismatch"
                );
                self.mismatches.push(MismatchRecord {
                    sql_id: outcome.sql_id,
                    session: outcome.session_id.clone(),
                    sql: outcome.statement_text.clone(),
                    mismatch,
                });
            }
        }
    }

    /// Export the top-N slow statements by replay duration as CSV.
    pub fn write_slow_csv(&mut self, path: &Path) -> Result<(), SinkError> {
        self.slow
            .sort_by(|a, b| b.replay_us.cmp(&a.replay_us));
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "sql_id,session,schema,source_us,replay_us,sql")?;
        for record in self.slow.iter().take(self.top_n) {
            let sql = record.sql.replace('"', "\"\"");
            writeln!(
                writer,
                "{},{},{},{},{},\"{}\"",
                record.sql_id, record.session, record.schema, record.source_us,
                record.replay_us, sql
            )?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write the mismatch report, one JSON object per line.
    pub fn write_mismatch_report(&self, path: &Path) -> Result<(), SinkError> {
        let mut writer = BufWriter::new(File::create(path)?);
        for record in &self.mismatches {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn outcome(sql_id: u64, replay_us: i64, source_us: Option<i64>) -> EventOutcome {
        EventOutcome {
            sql_id,
            session_id: "s1".into(),
            schema: "db".into(),
            statement_text: format!("SELECT {sql_id}"),
            source_duration_us: source_us,
            replay_duration_us: replay_us,
            error: None,
            captured_rows: None,
            replayed_rows: None,
        }
    }

    #[test]
    fn test_rule_codes() {
        assert!(matches!(
            SlowRule::from_code(1, 100).unwrap(),
            SlowRule::AbsoluteThreshold { threshold_us: 100 }
        ));
        assert!(matches!(
            SlowRule::from_code(2, 100).unwrap(),
            SlowRule::SourceDelta { threshold_us: 100 }
        ));
        assert!(matches!(
            SlowRule::from_code(3, 100),
            Err(ConfigError::UnknownSlowRule { code: 3 })
        ));
    }

    #[test]
    fn test_absolute_threshold_rule() {
        let rule = SlowRule::AbsoluteThreshold { threshold_us: 1_000 };
        assert!(!rule.is_slow(1_000, None));
        assert!(rule.is_slow(1_001, None));
    }

    #[test]
    fn test_source_delta_rule() {
        let rule = SlowRule::SourceDelta { threshold_us: 500 };
        assert!(rule.is_slow(2_000, Some(1_000)));
        assert!(!rule.is_slow(1_400, Some(1_000)));
        assert!(!rule.is_slow(1_000_000, None));
    }

    #[test]
    fn test_compare_rows_detects_divergence() {
        let captured = vec![vec![Some("1".to_string()), None]];
        assert_eq!(compare_rows(&captured, &captured.clone()), None);

        let fewer: RowMatrix = vec![];
        assert_eq!(
            compare_rows(&captured, &fewer),
            Some(RowMismatch::RowCount { captured: 1, replayed: 0 })
        );

        let changed = vec![vec![Some("1".to_string()), Some("x".to_string())]];
        assert_eq!(
            compare_rows(&captured, &changed),
            Some(RowMismatch::Cell {
                row: 0,
                column: 1,
                captured: None,
                replayed: Some("x".to_string()),
            })
        );
    }

    #[test]
    fn test_slow_csv_is_top_n_by_duration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slow.csv");

        let mut analyzer =
            OutcomeAnalyzer::new(Some(SlowRule::AbsoluteThreshold { threshold_us: 0 }), 2);
        analyzer.record(&outcome(1, 100, None));
        analyzer.record(&outcome(2, 300, None));
        analyzer.record(&outcome(3, 200, None));
        analyzer.write_slow_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3); // header + top 2
        assert!(lines[1].starts_with("2,"));
        assert!(lines[2].starts_with("3,"));
    }

    #[test]
    fn test_failed_outcome_counts_without_classification() {
        let mut analyzer =
            OutcomeAnalyzer::new(Some(SlowRule::AbsoluteThreshold { threshold_us: 0 }), 10);
        let mut failed = outcome(1, 10_000, None);
        failed.error = Some("boom".into());
        analyzer.record(&failed);
        assert_eq!(analyzer.failed, 1);
        assert_eq!(analyzer.executed, 0);
        assert_eq!(analyzer.slow_count(), 0);
    }
}
