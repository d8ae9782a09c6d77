//! Table-mode storage backed by an embedded SQLite database.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::error::SinkError;
use crate::event::{PersistedEvent, SqlEvent};

use super::{EventSink, EventSource};

pub const DEFAULT_BATCH_SIZE: usize = 5_000;
const TABLE_NAME: &str = "sql_events";

fn create_table(conn: &Connection) -> Result<(), SinkError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {TABLE_NAME} (
            rowid INTEGER PRIMARY KEY AUTOINCREMENT,
            id INTEGER NOT NULL,
            is_query INTEGER NOT NULL,
            is_prepared INTEGER NOT NULL,
            session TEXT NOT NULL,
            username TEXT NOT NULL,
            schema TEXT NOT NULL,
            sql TEXT NOT NULL,
            parameters TEXT NOT NULL,
            start_time INTEGER NOT NULL,
            duration_us INTEGER NOT NULL
        )"
    ))?;
    Ok(())
}

/// Appends events to a SQLite table, committing in batches so a large
/// capture does not pay per-row transaction cost.
pub struct TableSink {
    conn: Connection,
    batch_size: usize,
    pending: usize,
    in_tx: bool,
}

impl TableSink {
    /// Open (or create) the database at `path`. With `drop_previous` the
    /// event table from an earlier run is dropped first.
    pub fn open(path: &Path, batch_size: usize, drop_previous: bool) -> Result<Self, SinkError> {
        let conn = Connection::open(path)?;
        if drop_previous {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {TABLE_NAME}"))?;
            info!(path = %path.display(), "dropped previous event table");
        }
        create_table(&conn)?;
        Ok(Self {
            conn,
            batch_size: batch_size.max(1),
            pending: 0,
            in_tx: false,
        })
    }

    fn commit_batch(&mut self) -> Result<(), SinkError> {
        if self.in_tx {
            self.conn.execute_batch("COMMIT")?;
            self.in_tx = false;
            debug!(rows = self.pending, "committed event batch");
            self.pending = 0;
        }
        Ok(())
    }
}

impl EventSink for TableSink {
    fn write(&mut self, event: &SqlEvent) -> Result<(), SinkError> {
        if !self.in_tx {
            self.conn.execute_batch("BEGIN")?;
            self.in_tx = true;
        }
        let persisted = PersistedEvent::from(event);
        let parameters = serde_json::to_string(&persisted.parameters)?;
        self.conn.execute(
            &format!(
                "INSERT INTO {TABLE_NAME}
                 (id, is_query, is_prepared, session, username, schema, sql,
                  parameters, start_time, duration_us)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                persisted.id as i64,
                persisted.is_query,
                persisted.is_prepared,
                persisted.session,
                persisted.username,
                persisted.schema,
                persisted.sql,
                parameters,
                persisted.start_time_us,
                persisted.duration_us,
            ],
        )?;
        self.pending += 1;
        if self.pending >= self.batch_size {
            self.commit_batch()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.commit_batch()
    }
}

impl Drop for TableSink {
    fn drop(&mut self) {
        let _ = self.commit_batch();
    }
}

/// Reads the event table back in insertion order, paging by rowid so the
/// whole set is never resident at once.
pub struct TableEventReader {
    path: PathBuf,
    conn: Option<Connection>,
    last_rowid: i64,
    page: Vec<SqlEvent>,
    page_size: usize,
}

impl TableEventReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: None,
            last_rowid: 0,
            page: Vec::new(),
            page_size: 1_000,
        }
    }

    fn load_page(&mut self) -> Result<(), SinkError> {
        if self.conn.is_none() {
            self.conn = Some(Connection::open(&self.path)?);
        }
        let conn = self.conn.as_ref().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT rowid, id, is_query, is_prepared, session, username, schema,
                    sql, parameters, start_time, duration_us
             FROM {TABLE_NAME} WHERE rowid > ?1 ORDER BY rowid LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![self.last_rowid, self.page_size as i64], |row| {
            let rowid: i64 = row.get(0)?;
            let parameters_json: String = row.get(8)?;
            Ok((
                rowid,
                PersistedEvent {
                    id: row.get::<_, i64>(1)? as u64,
                    is_query: row.get(2)?,
                    is_prepared: row.get(3)?,
                    session: row.get(4)?,
                    username: row.get(5)?,
                    schema: row.get(6)?,
                    sql: row.get(7)?,
                    parameters: Vec::new(),
                    start_time_us: row.get(9)?,
                    duration_us: row.get(10)?,
                },
                parameters_json,
            ))
        })?;

        let mut page = Vec::new();
        let mut last = self.last_rowid;
        for row in rows {
            let (rowid, mut persisted, parameters_json) = row?;
            persisted.parameters = serde_json::from_str(&parameters_json)?;
            last = rowid;
            page.push(persisted.into_event());
        }
        self.last_rowid = last;
        // Reverse so next_event can pop from the back in order.
        page.reverse();
        self.page = page;
        Ok(())
    }
}

impl EventSource for TableEventReader {
    fn next_event(&mut self) -> Result<Option<SqlEvent>, SinkError> {
        if self.page.is_empty() {
            self.load_page()?;
        }
        Ok(self.page.pop())
    }
}
