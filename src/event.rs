//! SQL event model shared by dissection and replay.
//!
//! A [`PacketRecord`] is what the capture side hands us; a [`SqlEvent`] is
//! what dissection produces and replay consumes. [`PersistedEvent`] is the
//! JSON line format written by the sinks and read back by the replay
//! schedulers, so both phases agree on one schema.

use serde::{Deserialize, Serialize};

/// A captured unit of wire traffic, as produced by the packet source.
///
/// Immutable once created; ownership moves from the capture reader into the
/// dissector for the session named by `session_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketRecord {
    /// Monotonic sequence id assigned by the capture side.
    pub sequence_id: u64,
    /// Stable identifier of the client connection this packet belongs to.
    pub session_id: String,
    /// Microseconds since the Unix epoch.
    pub timestamp_us: i64,
    /// Raw application-layer bytes. May contain several concatenated
    /// protocol messages when TCP segments coalesced.
    #[serde(with = "hex")]
    pub payload: Vec<u8>,
    /// Provenance: capture file the packet came from.
    #[serde(default)]
    pub source_file: String,
    /// Provenance: position within that file.
    #[serde(default)]
    pub position: u64,
}

/// Closed set of parameter types the replay engine understands.
///
/// Vendor type codes outside the mapping tables collapse to `Object`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeTag {
    Int,
    Long,
    Double,
    String,
    Date,
    Object,
}

impl TypeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeTag::Int => "int",
            TypeTag::Long => "long",
            TypeTag::Double => "double",
            TypeTag::String => "string",
            TypeTag::Date => "date",
            TypeTag::Object => "object",
        }
    }
}

/// One bound parameter value.
///
/// `raw` holds the wire bytes in text form; `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamValue {
    pub tag: TypeTag,
    pub raw: Option<Vec<u8>>,
}

impl ParamValue {
    pub fn null(tag: TypeTag) -> Self {
        Self { tag, raw: None }
    }

    pub fn text(tag: TypeTag, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            raw: Some(bytes.into()),
        }
    }

    pub fn is_null(&self) -> bool {
        self.raw.is_none()
    }

    /// Value as text; "NULL" for the null sentinel.
    pub fn render(&self) -> String {
        match &self.raw {
            Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            None => "NULL".to_string(),
        }
    }
}

/// A prepared-statement template recorded at Parse/Prepare time.
///
/// Deep-cloned into every bound [`SqlEvent`], never shared, since concurrent
/// executions of the same named statement must not share parameter storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTemplate {
    pub name: String,
    pub parameter_types: Vec<TypeTag>,
    pub statement_text: String,
}

/// Name of the unnamed/default prepared statement.
pub const DEFAULT_STATEMENT: &str = "00";

/// Captured result rows: one `Vec` per row, `None` cells are SQL NULL.
pub type RowMatrix = Vec<Vec<Option<String>>>;

/// One statement execution recovered from the capture, the unit of replay.
#[derive(Debug, Clone)]
pub struct SqlEvent {
    /// Monotonic within the session.
    pub sql_id: u64,
    pub is_prepared: bool,
    pub statement_text: String,
    pub parameter_types: Vec<TypeTag>,
    pub parameter_values: Vec<ParamValue>,
    pub username: String,
    pub schema: String,
    pub session_id: String,
    /// Microsecond epoch timestamp of the execution request packet.
    pub start_time_us: i64,
    /// Unset until the session's terminating message arrives.
    pub end_time_us: Option<i64>,
    /// Result rows captured for comparison, when enabled.
    pub result_rows: Option<RowMatrix>,
}

impl SqlEvent {
    /// A simple (unprepared) query event. Parameter lists stay empty.
    pub fn simple(
        sql_id: u64,
        session_id: &str,
        username: &str,
        schema: &str,
        sql: String,
        start_time_us: i64,
    ) -> Self {
        Self {
            sql_id,
            is_prepared: false,
            statement_text: sql,
            parameter_types: Vec::new(),
            parameter_values: Vec::new(),
            username: username.to_string(),
            schema: schema.to_string(),
            session_id: session_id.to_string(),
            start_time_us,
            end_time_us: None,
            result_rows: None,
        }
    }

    /// A prepared execution cloned from a template, values still to be bound.
    pub fn from_template(
        sql_id: u64,
        session_id: &str,
        username: &str,
        schema: &str,
        template: &PreparedTemplate,
        start_time_us: i64,
    ) -> Self {
        Self {
            sql_id,
            is_prepared: true,
            statement_text: template.statement_text.clone(),
            parameter_types: template.parameter_types.clone(),
            parameter_values: Vec::with_capacity(template.parameter_types.len()),
            username: username.to_string(),
            schema: schema.to_string(),
            session_id: session_id.to_string(),
            start_time_us,
            end_time_us: None,
            result_rows: None,
        }
    }

    /// Recorded source duration, once the end timestamp is known.
    pub fn source_duration_us(&self) -> Option<i64> {
        self.end_time_us.map(|end| end - self.start_time_us)
    }

    /// Whether the statement only reads data. Used by the speed-multiplied
    /// safety rule to skip destructive statements under timeline compression.
    pub fn is_read_only(&self) -> bool {
        is_read_only(&self.statement_text)
    }
}

/// Leading-keyword read-only classifier.
pub fn is_read_only(sql: &str) -> bool {
    let first = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    matches!(
        first.as_str(),
        "select" | "show" | "explain" | "describe" | "desc" | "values"
    )
}

/// The JSON-line form of an event, as persisted by the sinks.
///
/// `startTime` and `durationUs` default to zero so lines written without
/// timing information still parse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedEvent {
    pub id: u64,
    #[serde(rename = "isQuery")]
    pub is_query: bool,
    #[serde(rename = "isPrepared")]
    pub is_prepared: bool,
    pub session: String,
    pub username: String,
    pub schema: String,
    pub sql: String,
    pub parameters: Vec<String>,
    #[serde(rename = "startTime", default)]
    pub start_time_us: i64,
    #[serde(rename = "durationUs", default)]
    pub duration_us: i64,
}

impl From<&SqlEvent> for PersistedEvent {
    fn from(event: &SqlEvent) -> Self {
        Self {
            id: event.sql_id,
            is_query: event.is_read_only(),
            is_prepared: event.is_prepared,
            session: event.session_id.clone(),
            username: event.username.clone(),
            schema: event.schema.clone(),
            sql: event.statement_text.clone(),
            parameters: event.parameter_values.iter().map(|p| p.render()).collect(),
            start_time_us: event.start_time_us,
            duration_us: event.source_duration_us().unwrap_or(0),
        }
    }
}

impl PersistedEvent {
    /// Rebuild a replayable event. Parameter type detail does not survive the
    /// JSON format; re-read values carry the `String` tag and are bound as
    /// text, which both target vendors coerce.
    pub fn into_event(self) -> SqlEvent {
        let parameter_values: Vec<ParamValue> = self
            .parameters
            .iter()
            .map(|p| {
                if p == "NULL" {
                    ParamValue::null(TypeTag::String)
                } else {
                    ParamValue::text(TypeTag::String, p.as_bytes())
                }
            })
            .collect();
        let parameter_types = parameter_values.iter().map(|p| p.tag).collect();
        SqlEvent {
            sql_id: self.id,
            is_prepared: self.is_prepared,
            statement_text: self.sql,
            parameter_types,
            parameter_values,
            username: self.username,
            schema: self.schema,
            session_id: self.session,
            start_time_us: self.start_time_us,
            end_time_us: if self.duration_us > 0 {
                Some(self.start_time_us + self.duration_us)
            } else {
                None
            },
            result_rows: None,
        }
    }
}
