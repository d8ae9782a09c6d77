//! MySQL-family wire dissector.
//!
//! Framing: every frame is a 3-byte little-endian payload length plus a
//! 1-byte sequence number, then the payload. The first client frame of a
//! session is the handshake response carrying username and optional default
//! database; later frames start with a command byte. One captured packet may
//! contain several concatenated frames.

use tracing::{debug, warn};

use crate::cursor::{text, Cursor};
use crate::error::DissectError;
use crate::event::{ParamValue, PreparedTemplate, SqlEvent, TypeTag, DEFAULT_STATEMENT};

use super::{Dissector, SessionCore};

const VENDOR: &str = "mysql";

// Client capability flags referenced by the handshake response layout.
const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH_LENENC: u32 = 0x0020_0000;

// Command bytes.
const COM_QUIT: u8 = 0x01;
const COM_INIT_DB: u8 = 0x02;
const COM_QUERY: u8 = 0x03;
const COM_STMT_PREPARE: u8 = 0x16;
const COM_STMT_EXECUTE: u8 = 0x17;
const COM_STMT_CLOSE: u8 = 0x19;

/// Map a binary-protocol column type code onto the closed [`TypeTag`] set.
fn tag_for_type(code: u8) -> TypeTag {
    match code {
        0x01 | 0x02 | 0x03 | 0x09 | 0x0d => TypeTag::Int,
        0x08 => TypeTag::Long,
        0x04 | 0x05 => TypeTag::Double,
        0x07 | 0x0a | 0x0b | 0x0c => TypeTag::Date,
        0x0f | 0xf6 | 0xf9..=0xfe => TypeTag::String,
        other => {
            warn!(code = other, "unmapped mysql parameter type, using object");
            TypeTag::Object
        }
    }
}

/// Decode one binary-protocol parameter value into its text form.
fn decode_value(cur: &mut Cursor<'_>, code: u8) -> Result<Vec<u8>, DissectError> {
    let rendered = match code {
        0x01 => (cur.read_u8()? as i8).to_string(),
        0x02 | 0x0d => (cur.read_u16_le()? as i16).to_string(),
        0x03 | 0x09 => (cur.read_u32_le()? as i32).to_string(),
        0x08 => (cur.read_u64_le()? as i64).to_string(),
        0x04 => f32::from_bits(cur.read_u32_le()?).to_string(),
        0x05 => f64::from_bits(cur.read_u64_le()?).to_string(),
        0x07 | 0x0a | 0x0c => {
            // Temporal values: length byte, then y/m/d and optional h:m:s.
            let len = cur.read_u8()? as usize;
            let body = cur.take(len)?;
            let mut inner = Cursor::new(VENDOR, body);
            if len >= 4 {
                let year = inner.read_u16_le()?;
                let month = inner.read_u8()?;
                let day = inner.read_u8()?;
                if len >= 7 {
                    let hour = inner.read_u8()?;
                    let minute = inner.read_u8()?;
                    let second = inner.read_u8()?;
                    format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}")
                } else {
                    format!("{year:04}-{month:02}-{day:02}")
                }
            } else {
                "0000-00-00".to_string()
            }
        }
        0x0b => {
            let len = cur.read_u8()? as usize;
            let body = cur.take(len)?;
            let mut inner = Cursor::new(VENDOR, body);
            if len >= 8 {
                let negative = inner.read_u8()? != 0;
                let days = inner.read_u32_le()?;
                let hour = inner.read_u8()?;
                let minute = inner.read_u8()?;
                let second = inner.read_u8()?;
                let sign = if negative { "-" } else { "" };
                format!("{sign}{:02}:{minute:02}:{second:02}", u64::from(days) * 24 + u64::from(hour))
            } else {
                "00:00:00".to_string()
            }
        }
        // Strings, blobs, decimals and anything else length-encoded.
        _ => {
            let len = cur.read_lenenc_uint()? as usize;
            return Ok(cur.take(len)?.to_vec());
        }
    };
    Ok(rendered.into_bytes())
}

/// Number of `?` placeholders in a statement; the client-side prepare
/// request carries no parameter count of its own. A `?` inside a quoted
/// string or identifier is literal text, not a placeholder.
fn placeholder_count(sql: &str) -> usize {
    let mut count = 0;
    let mut quote: Option<u8> = None;
    let mut bytes = sql.bytes();
    while let Some(byte) = bytes.next() {
        match quote {
            Some(open) => {
                if byte == b'\\' && open != b'`' {
                    // Backslash escape inside a string literal.
                    bytes.next();
                } else if byte == open {
                    quote = None;
                }
            }
            None => match byte {
                b'\'' | b'"' | b'`' => quote = Some(byte),
                b'?' => count += 1,
                _ => {}
            },
        }
    }
    count
}

/// Per-session dissector for the MySQL wire family.
pub struct MySqlDissector {
    core: SessionCore,
}

impl MySqlDissector {
    pub fn new(session_id: &str, collect_results: bool) -> Self {
        Self {
            core: SessionCore::new(session_id, collect_results),
        }
    }

    /// Handshake response: capability flags, username and (when the
    /// CONNECT_WITH_DB capability is set) the default database, which is the
    /// schema for MySQL-family sessions.
    fn handle_login(&mut self, payload: &[u8]) -> Result<(), DissectError> {
        let mut cur = Cursor::new(VENDOR, payload);
        let flags = cur.read_u32_le()?;
        if flags & CLIENT_PROTOCOL_41 == 0 {
            return Err(DissectError::Malformed {
                vendor: VENDOR,
                message: "handshake-response",
                reason: "pre-4.1 protocol not supported".into(),
            });
        }
        let _max_packet = cur.read_u32_le()?;
        let _charset = cur.read_u8()?;
        cur.skip(23)?;
        self.core.username = text(cur.read_cstr()?);

        // Auth response, encoded per capability flags.
        if flags & CLIENT_PLUGIN_AUTH_LENENC != 0 {
            let len = cur.read_lenenc_uint()? as usize;
            cur.skip(len)?;
        } else if flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = cur.read_u8()? as usize;
            cur.skip(len)?;
        } else {
            cur.read_cstr()?;
        }

        if flags & CLIENT_CONNECT_WITH_DB != 0 {
            self.core.schema = text(cur.read_cstr()?);
        }
        self.core.saw_login = true;
        debug!(
            session = %self.core.session_id,
            user = %self.core.username,
            schema = %self.core.schema,
            "mysql session login"
        );
        Ok(())
    }

    fn handle_query(&mut self, body: &[u8], timestamp_us: i64) {
        let sql = text(body);
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
    }

    fn handle_prepare(&mut self, body: &[u8]) {
        let sql = text(body);
        // The request carries no server-assigned statement id, so the
        // template lives under the default name and its types are learned
        // from the first execute's type block.
        self.core.store_template(PreparedTemplate {
            name: DEFAULT_STATEMENT.to_string(),
            parameter_types: Vec::new(),
            statement_text: sql,
        });
    }

    fn handle_execute(&mut self, body: &[u8], timestamp_us: i64) -> Result<(), DissectError> {
        let mut cur = Cursor::new(VENDOR, body);
        let _stmt_id = cur.read_u32_le()?;
        let _flags = cur.read_u8()?;
        let _iterations = cur.read_u32_le()?;

        let mut template = self
            .core
            .template(DEFAULT_STATEMENT)
            .cloned()
            .ok_or_else(|| DissectError::UnknownStatement {
                vendor: VENDOR,
                name: DEFAULT_STATEMENT.to_string(),
            })?;
        let param_count = placeholder_count(&template.statement_text);

        let mut values = Vec::with_capacity(param_count);
        if param_count > 0 {
            let bitmap = cur.take((param_count + 7) / 8)?.to_vec();
            let rebound = cur.read_u8()? == 1;
            let mut codes = Vec::with_capacity(param_count);
            if rebound {
                for _ in 0..param_count {
                    codes.push(cur.read_u8()?);
                    let _flag = cur.read_u8()?;
                }
                template.parameter_types = codes.iter().map(|&c| tag_for_type(c)).collect();
                self.core.store_template(template.clone());
            } else {
                // Types were bound on an earlier execute of this statement;
                // recover representative wire codes from the stored tags.
                for index in 0..param_count {
                    let tag = template
                        .parameter_types
                        .get(index)
                        .copied()
                        .unwrap_or(TypeTag::Object);
                    codes.push(match tag {
                        TypeTag::Int => 0x03,
                        TypeTag::Long => 0x08,
                        TypeTag::Double => 0x05,
                        TypeTag::Date => 0x0c,
                        TypeTag::String | TypeTag::Object => 0xfe,
                    });
                }
            }

            for index in 0..param_count {
                let tag = template
                    .parameter_types
                    .get(index)
                    .copied()
                    .unwrap_or(TypeTag::Object);
                let is_null = bitmap[index / 8] >> (index % 8) & 1 == 1;
                if is_null {
                    values.push(ParamValue::null(tag));
                } else {
                    values.push(ParamValue::text(tag, decode_value(&mut cur, codes[index])?));
                }
            }
        }

        let sql_id = self.core.next_sql_id();
        let mut event = SqlEvent::from_template(
            sql_id,
            &self.core.session_id,
            &self.core.username,
            &self.core.schema,
            &template,
            timestamp_us,
        );
        event.parameter_types = values.iter().map(|p| p.tag).collect();
        event.parameter_values = values;
        self.core.open.push(event);
        Ok(())
    }

    fn handle_frame(&mut self, payload: &[u8], timestamp_us: i64) -> Result<(), DissectError> {
        let Some((&command, body)) = payload.split_first() else {
            return Ok(());
        };
        match command {
            COM_QUERY => {
                self.handle_query(body, timestamp_us);
                Ok(())
            }
            COM_STMT_PREPARE => {
                self.handle_prepare(body);
                Ok(())
            }
            COM_STMT_EXECUTE => self.handle_execute(body, timestamp_us),
            COM_STMT_CLOSE => {
                self.core.templates.remove(DEFAULT_STATEMENT);
                Ok(())
            }
            COM_INIT_DB => {
                self.core.schema = text(body);
                Ok(())
            }
            COM_QUIT => {
                self.core.terminate(timestamp_us);
                Ok(())
            }
            // Server response frames and other commands are not event
            // sources for this capture model.
            _ => Ok(()),
        }
    }
}

impl Dissector for MySqlDissector {
    fn session_id(&self) -> &str {
        &self.core.session_id
    }

    fn feed(&mut self, packet: &crate::event::PacketRecord) {
        if self.core.closed {
            return;
        }
        self.core.last_seen_us = packet.timestamp_us;

        let mut cur = Cursor::new(VENDOR, &packet.payload);
        while cur.remaining() >= 4 {
            let frame = (|| -> Result<(), DissectError> {
                let length = cur.read_u24_le()? as usize;
                let _sequence = cur.read_u8()?;
                let body = cur.take(length)?;
                if !self.core.saw_login {
                    self.handle_login(body)
                } else {
                    self.handle_frame(body, packet.timestamp_us)
                }
            })();
            if let Err(err) = frame {
                warn!(
                    session = %self.core.session_id,
                    seq = packet.sequence_id,
                    %err,
                    "discarding malformed mysql frame, resuming at next packet"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PacketRecord;

    fn packet(seq: u64, ts: i64, payload: Vec<u8>) -> PacketRecord {
        PacketRecord {
            sequence_id: seq,
            session_id: "m1".into(),
            timestamp_us: ts,
            payload,
            source_file: "test".into(),
            position: seq,
        }
    }

    fn frame(seq: u8, body: &[u8]) -> Vec<u8> {
        let len = body.len() as u32;
        let mut out = vec![
            (len & 0xff) as u8,
            (len >> 8 & 0xff) as u8,
            (len >> 16 & 0xff) as u8,
            seq,
        ];
        out.extend_from_slice(body);
        out
    }

    fn login_frame(user: &str, database: Option<&str>) -> Vec<u8> {
        let mut flags = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION;
        if database.is_some() {
            flags |= CLIENT_CONNECT_WITH_DB;
        }
        let mut body = flags.to_le_bytes().to_vec();
        body.extend_from_slice(&0x0100_0000u32.to_le_bytes()); // max packet
        body.push(0x21); // charset
        body.extend_from_slice(&[0u8; 23]);
        body.extend_from_slice(user.as_bytes());
        body.push(0);
        body.push(0); // empty auth response
        if let Some(db) = database {
            body.extend_from_slice(db.as_bytes());
            body.push(0);
        }
        frame(1, &body)
    }

    fn command(code: u8, payload: &[u8]) -> Vec<u8> {
        let mut body = vec![code];
        body.extend_from_slice(payload);
        frame(0, &body)
    }

    fn logged_in() -> MySqlDissector {
        let mut d = MySqlDissector::new("m1", false);
        d.feed(&packet(1, 100, login_frame("app", Some("shop"))));
        d
    }

    #[test]
    fn test_login_sets_identity() {
        let d = logged_in();
        assert_eq!(d.core.username, "app");
        assert_eq!(d.core.schema, "shop");
        assert!(d.core.saw_login);
    }

    #[test]
    fn test_com_query_yields_simple_event() {
        let mut d = logged_in();
        d.feed(&packet(2, 200, command(COM_QUERY, b"SELECT 1")));
        d.feed(&packet(3, 300, command(COM_QUIT, b"")));

        let events = d.take_completed();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].statement_text, "SELECT 1");
        assert!(!events[0].is_prepared);
        assert_eq!(events[0].schema, "shop");
        assert_eq!(events[0].end_time_us, Some(300));
    }

    #[test]
    fn test_prepare_execute_decodes_binary_values() {
        let mut d = logged_in();
        d.feed(&packet(
            2,
            200,
            command(COM_STMT_PREPARE, b"INSERT INTO t VALUES (?, ?)"),
        ));

        // Execute: stmt id, flags, iterations, null bitmap, rebound types
        // (LONG, VAR_STRING), then 42 as i32 LE and "abc" length-encoded.
        let mut body = 1u32.to_le_bytes().to_vec();
        body.push(0);
        body.extend_from_slice(&1u32.to_le_bytes());
        body.push(0x00); // null bitmap
        body.push(0x01); // new params bound
        body.extend_from_slice(&[0x03, 0x00, 0xfd, 0x00]);
        body.extend_from_slice(&42i32.to_le_bytes());
        body.push(3);
        body.extend_from_slice(b"abc");
        d.feed(&packet(3, 210, command(COM_STMT_EXECUTE, &body[..])));

        let events = d.close(300);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(event.is_prepared);
        assert_eq!(event.parameter_types, vec![TypeTag::Int, TypeTag::String]);
        assert_eq!(event.parameter_values[0].render(), "42");
        assert_eq!(event.parameter_values[1].render(), "abc");
    }

    #[test]
    fn test_placeholder_count_ignores_quoted_text() {
        assert_eq!(placeholder_count("SELECT ?"), 1);
        assert_eq!(placeholder_count("INSERT INTO t VALUES ('a?b', ?)"), 1);
        assert_eq!(placeholder_count("SELECT \"?\" , `col?` FROM t WHERE a = ?"), 1);
        assert_eq!(placeholder_count("SELECT 'it\\'s ?'"), 0);
        assert_eq!(placeholder_count("SELECT 1"), 0);
    }

    #[test]
    fn test_execute_with_placeholder_inside_literal() {
        let mut d = logged_in();
        d.feed(&packet(
            2,
            200,
            command(COM_STMT_PREPARE, b"INSERT INTO t VALUES ('a?b', ?)"),
        ));

        // One real placeholder: 1-byte null bitmap, rebound type LONG, 42.
        let mut body = 1u32.to_le_bytes().to_vec();
        body.push(0);
        body.extend_from_slice(&1u32.to_le_bytes());
        body.push(0x00);
        body.push(0x01);
        body.extend_from_slice(&[0x03, 0x00]);
        body.extend_from_slice(&42i32.to_le_bytes());
        d.feed(&packet(3, 210, command(COM_STMT_EXECUTE, &body[..])));

        let events = d.close(300);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].parameter_values.len(), 1);
        assert_eq!(events[0].parameter_values[0].render(), "42");
    }

    #[test]
    fn test_execute_null_bitmap() {
        let mut d = logged_in();
        d.feed(&packet(2, 200, command(COM_STMT_PREPARE, b"SELECT ?")));

        let mut body = 1u32.to_le_bytes().to_vec();
        body.push(0);
        body.extend_from_slice(&1u32.to_le_bytes());
        body.push(0x01); // first param NULL
        body.push(0x01);
        body.extend_from_slice(&[0x03, 0x00]);
        d.feed(&packet(3, 210, command(COM_STMT_EXECUTE, &body[..])));

        let events = d.close(300);
        assert!(events[0].parameter_values[0].is_null());
        assert_eq!(events[0].parameter_values.len(), events[0].parameter_types.len());
    }

    #[test]
    fn test_init_db_switches_schema() {
        let mut d = logged_in();
        d.feed(&packet(2, 200, command(COM_INIT_DB, b"analytics")));
        d.feed(&packet(3, 210, command(COM_QUERY, b"SELECT 1")));
        let events = d.close(300);
        assert_eq!(events[0].schema, "analytics");
    }

    #[test]
    fn test_concatenated_frames_in_one_packet() {
        let mut d = logged_in();
        let mut coalesced = command(COM_QUERY, b"SELECT 1");
        coalesced.extend(command(COM_QUERY, b"SELECT 2"));
        coalesced.extend(command(COM_QUIT, b""));
        d.feed(&packet(2, 200, coalesced));

        let events = d.take_completed();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].statement_text, "SELECT 1");
        assert_eq!(events[1].statement_text, "SELECT 2");
        assert!(d.is_closed());
    }

    #[test]
    fn test_truncated_frame_skipped() {
        let mut d = logged_in();
        // Frame declares 100 bytes but carries 4.
        let mut bogus = vec![100, 0, 0, 0];
        bogus.extend_from_slice(b"junk");
        d.feed(&packet(2, 200, bogus));
        d.feed(&packet(3, 210, command(COM_QUERY, b"SELECT 1")));
        let events = d.close(300);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_close_without_quit_uses_last_seen_timestamp() {
        let mut d = logged_in();
        d.feed(&packet(2, 250, command(COM_QUERY, b"SELECT 1")));
        let events = d.close(9_999);
        assert_eq!(events[0].end_time_us, Some(250));
    }
}
