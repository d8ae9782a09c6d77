//! Session registry: routes packets to per-session dissectors.

use dashmap::DashMap;
use tracing::{debug, info};

use crate::event::{PacketRecord, SqlEvent};

use super::{new_dissector, Dissector, Vendor};

/// Owns one dissector per live session and fans captured packets out to
/// them. Sessions are created lazily on first packet and torn down when
/// their terminating message arrives or the capture ends.
pub struct SessionRegistry {
    vendor: Vendor,
    collect_results: bool,
    sessions: DashMap<String, Box<dyn Dissector>>,
}

impl SessionRegistry {
    pub fn new(vendor: Vendor, collect_results: bool) -> Self {
        Self {
            vendor,
            collect_results,
            sessions: DashMap::new(),
        }
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Feed one packet to its session's dissector, creating the session on
    /// first sight, and return any events the packet completed. A session
    /// whose terminator was seen is removed from the map.
    pub fn feed(&self, packet: &PacketRecord) -> Vec<SqlEvent> {
        let mut entry = self
            .sessions
            .entry(packet.session_id.clone())
            .or_insert_with(|| {
                debug!(session = %packet.session_id, "new capture session");
                new_dissector(self.vendor, &packet.session_id, self.collect_results)
            });
        entry.feed(packet);
        let mut events = entry.take_completed();
        let closed = entry.is_closed();
        drop(entry);

        if closed {
            if let Some((_, mut dissector)) = self.sessions.remove(&packet.session_id) {
                events.extend(dissector.close(packet.timestamp_us));
            }
            debug!(session = %packet.session_id, "capture session closed");
        }
        events
    }

    /// Force-close every remaining session at end of capture. Open events
    /// are stamped with `timestamp_us` unless the session saw later traffic.
    pub fn close_all(&self, timestamp_us: i64) -> Vec<SqlEvent> {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut events = Vec::new();
        for id in ids {
            if let Some((_, mut dissector)) = self.sessions.remove(&id) {
                events.extend(dissector.close(timestamp_us));
            }
        }
        if !events.is_empty() {
            info!(count = events.len(), "flushed open events at end of capture");
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_packet(session: &str, seq: u64, ts: i64, sql: &str) -> PacketRecord {
        // Minimal pg 'Q' frame.
        let mut payload = vec![b'Q'];
        let body_len = (sql.len() + 1 + 4) as u32;
        payload.extend_from_slice(&body_len.to_be_bytes());
        payload.extend_from_slice(sql.as_bytes());
        payload.push(0);
        PacketRecord {
            sequence_id: seq,
            session_id: session.to_string(),
            timestamp_us: ts,
            payload,
            source_file: "test".into(),
            position: seq,
        }
    }

    fn startup_packet(session: &str, seq: u64, ts: i64) -> PacketRecord {
        let mut body = Vec::new();
        body.extend_from_slice(&196_608u32.to_be_bytes());
        body.extend_from_slice(b"user\0alice\0\0");
        let mut payload = ((body.len() + 4) as u32).to_be_bytes().to_vec();
        payload.extend_from_slice(&body);
        PacketRecord {
            sequence_id: seq,
            session_id: session.to_string(),
            timestamp_us: ts,
            payload,
            source_file: "test".into(),
            position: seq,
        }
    }

    fn terminate_packet(session: &str, seq: u64, ts: i64) -> PacketRecord {
        PacketRecord {
            sequence_id: seq,
            session_id: session.to_string(),
            timestamp_us: ts,
            payload: vec![b'X', 0, 0, 0, 4],
            source_file: "test".into(),
            position: seq,
        }
    }

    #[test]
    fn test_sessions_are_isolated() {
        let registry = SessionRegistry::new(Vendor::PgCompat, false);
        registry.feed(&startup_packet("a", 1, 100));
        registry.feed(&startup_packet("b", 2, 100));
        registry.feed(&query_packet("a", 3, 200, "SELECT 1"));
        registry.feed(&query_packet("b", 4, 200, "SELECT 2"));
        assert_eq!(registry.session_count(), 2);

        let from_a = registry.feed(&terminate_packet("a", 5, 300));
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a[0].statement_text, "SELECT 1");
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn test_close_all_flushes_open_events() {
        let registry = SessionRegistry::new(Vendor::PgCompat, false);
        registry.feed(&startup_packet("a", 1, 100));
        registry.feed(&query_packet("a", 2, 200, "SELECT 1"));

        let events = registry.close_all(900);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].end_time_us, Some(200));
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_terminated_session_events_carry_same_stamp() {
        let registry = SessionRegistry::new(Vendor::PgCompat, false);
        registry.feed(&startup_packet("a", 1, 100));
        registry.feed(&query_packet("a", 2, 200, "SELECT 1"));
        registry.feed(&query_packet("a", 3, 250, "SELECT 2"));
        let events = registry.feed(&terminate_packet("a", 4, 400));
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.end_time_us == Some(400)));
    }
}
