//! Wire-protocol dissection framework.
//!
//! This module provides:
//! - [`Dissector`] trait for per-session protocol state machines
//! - [`PgDissector`] for the openGauss/PostgreSQL wire family
//! - [`MySqlDissector`] for the MySQL wire family
//! - [`SessionRegistry`] owning the session id → dissector map
//!
//! One dissector instance processes one session's packets in strict arrival
//! order and turns them into [`SqlEvent`]s. A malformed frame never crashes
//! the session: it is logged at warn level and parsing resumes at the next
//! packet boundary.

mod mysql;
mod pg;
mod session;

pub use mysql::MySqlDissector;
pub use pg::PgDissector;
pub use session::SessionRegistry;

use std::collections::HashMap;

use serde::Deserialize;

use crate::event::{PacketRecord, PreparedTemplate, SqlEvent, DEFAULT_STATEMENT};

/// Wire-protocol family of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    MySql,
    PgCompat,
}

impl Vendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::MySql => "mysql",
            Vendor::PgCompat => "pg",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mysql" => Some(Vendor::MySql),
            "pg" | "postgres" | "opengauss" | "gauss" => Some(Vendor::PgCompat),
            _ => None,
        }
    }
}

/// Per-session state machine converting packets into SQL events.
pub trait Dissector: Send {
    /// Session this dissector belongs to.
    fn session_id(&self) -> &str;

    /// Consume one packet. Framing faults are logged and skipped; this
    /// method never fails and never panics on hostile input.
    fn feed(&mut self, packet: &PacketRecord);

    /// Drain events whose end timestamp is now set.
    fn take_completed(&mut self) -> Vec<SqlEvent>;

    /// Force-close the session (capture ended without a terminate message).
    /// Remaining open events are stamped with `timestamp_us` and returned
    /// together with anything already completed.
    fn close(&mut self, timestamp_us: i64) -> Vec<SqlEvent>;

    /// True once the session's terminating message was observed.
    fn is_closed(&self) -> bool;
}

/// Create the dissector for a vendor.
pub fn new_dissector(
    vendor: Vendor,
    session_id: &str,
    collect_results: bool,
) -> Box<dyn Dissector> {
    match vendor {
        Vendor::MySql => Box::new(MySqlDissector::new(session_id, collect_results)),
        Vendor::PgCompat => Box::new(PgDissector::new(session_id, collect_results)),
    }
}

/// State shared by both vendor dissectors: login identity, the prepared
/// template table, open events awaiting a terminator, and completed events
/// awaiting flush.
#[derive(Debug)]
pub(crate) struct SessionCore {
    pub session_id: String,
    pub username: String,
    pub schema: String,
    pub templates: HashMap<String, PreparedTemplate>,
    pub open: Vec<SqlEvent>,
    pub completed: Vec<SqlEvent>,
    pub next_sql_id: u64,
    pub collect_results: bool,
    pub saw_login: bool,
    pub closed: bool,
    pub last_seen_us: i64,
}

impl SessionCore {
    pub fn new(session_id: &str, collect_results: bool) -> Self {
        Self {
            session_id: session_id.to_string(),
            username: String::new(),
            schema: String::new(),
            templates: HashMap::new(),
            open: Vec::new(),
            completed: Vec::new(),
            next_sql_id: 0,
            collect_results,
            saw_login: false,
            closed: false,
            last_seen_us: 0,
        }
    }

    pub fn next_sql_id(&mut self) -> u64 {
        self.next_sql_id += 1;
        self.next_sql_id
    }

    /// Look up a template by name, falling back to the default statement.
    pub fn template(&self, name: &str) -> Option<&PreparedTemplate> {
        let key = if name.is_empty() { DEFAULT_STATEMENT } else { name };
        self.templates
            .get(key)
            .or_else(|| self.templates.get(DEFAULT_STATEMENT))
    }

    pub fn store_template(&mut self, template: PreparedTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    /// Attach a captured result row to the most recent event.
    pub fn push_result_row(&mut self, row: Vec<Option<String>>) {
        if let Some(event) = self.open.last_mut().or_else(|| self.completed.last_mut()) {
            event.result_rows.get_or_insert_with(Vec::new).push(row);
        }
    }

    /// Stamp every still-open event with the terminator timestamp and move
    /// it to the completed list. The capture does not label individual
    /// response boundaries, so duration is session-quiescence latency.
    pub fn terminate(&mut self, timestamp_us: i64) {
        for mut event in self.open.drain(..) {
            event.end_time_us = Some(timestamp_us);
            self.completed.push(event);
        }
        self.templates.clear();
        self.closed = true;
    }

    pub fn drain_completed(&mut self) -> Vec<SqlEvent> {
        std::mem::take(&mut self.completed)
    }
}
