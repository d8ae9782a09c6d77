//! openGauss/PostgreSQL-family wire dissector.
//!
//! Framing: a startup message (4-byte big-endian length, then a protocol
//! version and a NUL-separated key/value block), followed by tagged messages
//! of 1-byte type + 4-byte big-endian length (length includes itself, not
//! the tag). One captured packet may carry several concatenated messages;
//! the frame loop keeps reading declared lengths until the buffer is spent.

use tracing::{debug, warn};

use crate::cursor::{text, Cursor};
use crate::error::DissectError;
use crate::event::{ParamValue, PreparedTemplate, SqlEvent, TypeTag, DEFAULT_STATEMENT};

use super::{Dissector, SessionCore};

const VENDOR: &str = "pg";

/// Startup protocol version 3.0.
const PROTOCOL_V3: u32 = 196_608;
/// SSLRequest magic; the session retries with a plain startup afterwards.
const SSL_REQUEST: u32 = 80_877_103;

/// Marker that opens the parameter block of a batch-bind message: one
/// format-code count of 1. The scan can in principle match the same two
/// bytes inside earlier variable-length fields; a known accuracy limit of
/// the capture format rather than a contract.
const BATCH_PARAM_MARKER: [u8; 2] = [0x00, 0x01];

/// Map a parameter type OID onto the closed [`TypeTag`] set.
fn type_for_oid(oid: u32) -> TypeTag {
    match oid {
        21 | 23 => TypeTag::Int,
        20 => TypeTag::Long,
        700 | 701 => TypeTag::Double,
        17 | 18 | 19 | 25 | 1042 | 1043 => TypeTag::String,
        1082 | 1083 | 1114 | 1184 => TypeTag::Date,
        other => {
            warn!(oid = other, "unmapped parameter type oid, using object");
            TypeTag::Object
        }
    }
}

/// Per-session dissector for the openGauss/PostgreSQL wire family.
pub struct PgDissector {
    core: SessionCore,
}

impl PgDissector {
    pub fn new(session_id: &str, collect_results: bool) -> Self {
        Self {
            core: SessionCore::new(session_id, collect_results),
        }
    }

    /// Startup packet: length, protocol version, then `key\0value\0` pairs
    /// terminated by an extra NUL. Establishes username and schema.
    fn handle_startup(&mut self, payload: &[u8]) -> Result<(), DissectError> {
        let mut cur = Cursor::new(VENDOR, payload);
        let declared = cur.read_u32_be()? as usize;
        if declared < 8 || declared > payload.len() {
            return Err(DissectError::Malformed {
                vendor: VENDOR,
                message: "startup",
                reason: format!("declared length {declared} out of range"),
            });
        }
        let proto = cur.read_u32_be()?;
        if proto == SSL_REQUEST {
            // Negotiation probe; the real startup arrives in a later packet.
            return Ok(());
        }
        if proto != PROTOCOL_V3 {
            debug!(proto, "unrecognized startup protocol version");
        }

        let mut database = String::new();
        let mut search_path = String::new();
        while let Some(byte) = cur.peek_u8() {
            if byte == 0 {
                break;
            }
            let key = text(cur.read_cstr()?);
            let value = text(cur.read_cstr()?);
            match key.as_str() {
                "user" => self.core.username = value,
                "database" => database = value,
                "search_path" => search_path = value,
                _ => {}
            }
        }

        if search_path.is_empty() {
            search_path = "public".to_string();
        }
        self.core.schema = format!("{database}.{search_path}");
        self.core.saw_login = true;
        debug!(
            session = %self.core.session_id,
            user = %self.core.username,
            schema = %self.core.schema,
            "pg session login"
        );
        Ok(())
    }

    /// Simple query 'Q': the whole statement text in one message.
    fn handle_query(&mut self, body: &[u8], timestamp_us: i64) -> Result<(), DissectError> {
        let mut cur = Cursor::new(VENDOR, body);
        let sql = text(cur.read_cstr()?);
        let sql_id = self.core.next_sql_id();
        let event = SqlEvent::simple(
            sql_id,
            &self.core.session_id,
            &self.core.username,
            &self.core.schema,
            sql,
            timestamp_us,
        );
        self.core.open.push(event);
        Ok(())
    }

    /// Parse 'P': statement name, SQL text, parameter type OIDs.
    fn handle_parse(&mut self, body: &[u8]) -> Result<(), DissectError> {
        let mut cur = Cursor::new(VENDOR, body);
        let mut name = text(cur.read_cstr()?);
        if name.is_empty() {
            name = DEFAULT_STATEMENT.to_string();
        }
        let sql = text(cur.read_cstr()?);
        let count = cur.read_u16_be()? as usize;
        let mut types = Vec::with_capacity(count);
        for _ in 0..count {
            types.push(type_for_oid(cur.read_u32_be()?));
        }
        self.core.store_template(PreparedTemplate {
            name,
            parameter_types: types,
            statement_text: sql,
        });
        Ok(())
    }

    /// Bind 'B': clone the named template into a new event and decode one
    /// row of parameter values. Every value is length-prefixed; decoding
    /// consumes exactly `4 + length` bytes per parameter.
    fn handle_bind(&mut self, body: &[u8], timestamp_us: i64) -> Result<(), DissectError> {
        let mut cur = Cursor::new(VENDOR, body);
        let _portal = cur.read_cstr()?;
        let name = text(cur.read_cstr()?);
        let template = self
            .core
            .template(&name)
            .cloned()
            .ok_or_else(|| DissectError::UnknownStatement {
                vendor: VENDOR,
                name,
            })?;

        let format_codes = cur.read_u16_be()? as usize;
        cur.skip(format_codes * 2)?;

        let value_count = cur.read_u16_be()? as usize;
        let sql_id = self.core.next_sql_id();
        let mut event = SqlEvent::from_template(
            sql_id,
            &self.core.session_id,
            &self.core.username,
            &self.core.schema,
            &template,
            timestamp_us,
        );
        if value_count != template.parameter_types.len() {
            warn!(
                statement = %template.name,
                bound = value_count,
                declared = template.parameter_types.len(),
                "bind value count differs from prepared type count"
            );
        }
        for index in 0..value_count {
            let tag = template
                .parameter_types
                .get(index)
                .copied()
                .unwrap_or(TypeTag::Object);
            event.parameter_values.push(match cur.read_len_prefixed_be()? {
                Some(bytes) => ParamValue::text(tag, bytes),
                None => ParamValue::null(tag),
            });
        }
        event.parameter_types = event.parameter_values.iter().map(|p| p.tag).collect();
        self.core.open.push(event);
        Ok(())
    }

    /// Batch bind 'U': bulk execution of N parameter rows against one
    /// template. Reads the record count and the statement name, then locates
    /// the parameter block by scanning for the format-code marker, then
    /// decodes `records x params` values cycling the type index.
    fn handle_batch_bind(&mut self, body: &[u8], timestamp_us: i64) -> Result<(), DissectError> {
        let mut cur = Cursor::new(VENDOR, body);
        let records = cur.read_u32_be()? as usize;
        let _portal = cur.read_cstr()?;
        let name = text(cur.read_cstr()?);
        let template = self
            .core
            .template(&name)
            .cloned()
            .ok_or_else(|| DissectError::UnknownStatement {
                vendor: VENDOR,
                name,
            })?;
        let param_count = template.parameter_types.len();
        if param_count == 0 || records == 0 {
            return Ok(());
        }

        if !cur.seek_past(&BATCH_PARAM_MARKER) {
            return Err(DissectError::Malformed {
                vendor: VENDOR,
                message: "batch-bind",
                reason: "parameter block marker not found".into(),
            });
        }

        for _record in 0..records {
            let sql_id = self.core.next_sql_id();
            let mut event = SqlEvent::from_template(
                sql_id,
                &self.core.session_id,
                &self.core.username,
                &self.core.schema,
                &template,
                timestamp_us,
            );
            for index in 0..param_count {
                let tag = template.parameter_types[index % param_count];
                event.parameter_values.push(match cur.read_len_prefixed_be()? {
                    Some(bytes) => ParamValue::text(tag, bytes),
                    None => ParamValue::null(tag),
                });
            }
            self.core.open.push(event);
        }
        Ok(())
    }

    /// Row description 'T': a fresh result set starts on the latest event.
    fn handle_row_description(&mut self, body: &[u8]) -> Result<(), DissectError> {
        let mut cur = Cursor::new(VENDOR, body);
        let _fields = cur.read_u16_be()?;
        if let Some(event) = self
            .core
            .open
            .last_mut()
            .or_else(|| self.core.completed.last_mut())
        {
            event.result_rows = Some(Vec::new());
        }
        Ok(())
    }

    /// Data row 'D': field count, then per-field length-prefixed values with
    /// the all-ones length marking SQL NULL.
    fn handle_data_row(&mut self, body: &[u8]) -> Result<(), DissectError> {
        let mut cur = Cursor::new(VENDOR, body);
        let columns = cur.read_u16_be()? as usize;
        let mut row = Vec::with_capacity(columns);
        for _ in 0..columns {
            row.push(cur.read_len_prefixed_be()?.map(text));
        }
        self.core.push_result_row(row);
        Ok(())
    }

    fn handle_message(
        &mut self,
        tag: u8,
        body: &[u8],
        timestamp_us: i64,
    ) -> Result<(), DissectError> {
        match tag {
            b'Q' => self.handle_query(body, timestamp_us),
            b'P' => self.handle_parse(body),
            b'B' => self.handle_bind(body, timestamp_us),
            b'U' => self.handle_batch_bind(body, timestamp_us),
            b'T' if self.core.collect_results => self.handle_row_description(body),
            b'D' if self.core.collect_results => self.handle_data_row(body),
            b'X' => {
                self.core.terminate(timestamp_us);
                Ok(())
            }
            // Execute, Sync, Describe and response traffic carry no event
            // information of their own.
            _ => Ok(()),
        }
    }
}

impl Dissector for PgDissector {
    fn session_id(&self) -> &str {
        &self.core.session_id
    }

    fn feed(&mut self, packet: &crate::event::PacketRecord) {
        if self.core.closed {
            return;
        }
        self.core.last_seen_us = packet.timestamp_us;

        if !self.core.saw_login {
            if let Err(err) = self.handle_startup(&packet.payload) {
                warn!(
                    session = %self.core.session_id,
                    seq = packet.sequence_id,
                    %err,
                    "discarding malformed startup packet"
                );
            }
            return;
        }

        let mut cur = Cursor::new(VENDOR, &packet.payload);
        // A packet may hold several concatenated messages; keep splitting on
        // the declared lengths rather than assuming one message per packet.
        while cur.remaining() >= 5 {
            let tag = match cur.read_u8() {
                Ok(t) => t,
                Err(_) => break,
            };
            let frame = (|| -> Result<(), DissectError> {
                let declared = cur.read_u32_be()?;
                if declared < 4 {
                    return Err(DissectError::Malformed {
                        vendor: VENDOR,
                        message: "frame",
                        reason: format!("declared length {declared} below header size"),
                    });
                }
                let body = cur.take(declared as usize - 4)?;
                self.handle_message(tag, body, packet.timestamp_us)
            })();
            if let Err(err) = frame {
                warn!(
                    session = %self.core.session_id,
                    seq = packet.sequence_id,
                    tag,
                    %err,
                    "discarding malformed pg frame, resuming at next packet"
                );
                break;
            }
            if self.core.closed {
                break;
            }
        }
    }

    fn take_completed(&mut self) -> Vec<SqlEvent> {
        self.core.drain_completed()
    }

    fn close(&mut self, timestamp_us: i64) -> Vec<SqlEvent> {
        if !self.core.closed {
            let stamp = if self.core.last_seen_us > 0 {
                self.core.last_seen_us
            } else {
                timestamp_us
            };
            self.core.terminate(stamp);
        }
        self.core.drain_completed()
    }

    fn is_closed(&self) -> bool {
        self.core.closed
    }
}
