//! Event persistence: sinks write dissected events, sources read them back
//! for replay.
//!
//! Two storage modes exist:
//! - [`RotatingJsonSink`] / [`JsonEventReader`] for size-rotated JSON-line
//!   file sets
//! - [`TableSink`] / [`TableEventReader`] for an embedded SQLite table

mod json;
mod table;

pub use json::{remove_previous, JsonEventReader, RotatingJsonSink, DEFAULT_ROTATE_BYTES};
pub use table::{TableEventReader, TableSink, DEFAULT_BATCH_SIZE};

use std::time::Duration;

use tracing::{debug, info};

use crate::error::SinkError;
use crate::event::SqlEvent;
use crate::queue::EventConsumer;

/// Destination for dissected events.
pub trait EventSink: Send {
    /// Write one event. Ordering of calls is the persisted ordering.
    fn write(&mut self, event: &SqlEvent) -> Result<(), SinkError>;

    /// Flush buffered state to durable storage.
    fn flush(&mut self) -> Result<(), SinkError>;
}

/// Ordered reader over a persisted event set.
pub trait EventSource: Send {
    /// Next event in persisted order; `None` at end of set.
    fn next_event(&mut self) -> Result<Option<SqlEvent>, SinkError>;
}

const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Persistence loop body: drain the queue into the sink until every
/// producer is gone, flushing on a timer. Runs on its own thread.
pub fn run_persist(consumer: EventConsumer, sink: &mut dyn EventSink) -> Result<u64, SinkError> {
    let mut written = 0u64;
    loop {
        match consumer.pop(FLUSH_INTERVAL) {
            Ok(Some(event)) => {
                sink.write(&event)?;
                written += 1;
                if written % 10_000 == 0 {
                    debug!(written, "persisted events");
                }
            }
            Ok(None) => sink.flush()?,
            Err(SinkError::QueueClosed) => break,
            Err(err) => return Err(err),
        }
    }
    sink.flush()?;
    info!(written, "persistence finished");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::event_queue;

    struct VecSink {
        events: Vec<SqlEvent>,
        flushes: usize,
    }

    impl EventSink for VecSink {
        fn write(&mut self, event: &SqlEvent) -> Result<(), SinkError> {
            self.events.push(event.clone());
            Ok(())
        }

        fn flush(&mut self) -> Result<(), SinkError> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn test_run_persist_drains_queue() {
        let (tx, rx) = event_queue(16);
        for id in 1..=5 {
            tx.push(SqlEvent::simple(id, "s", "u", "d", format!("SELECT {id}"), 0))
                .unwrap();
        }
        drop(tx);

        let mut sink = VecSink { events: Vec::new(), flushes: 0 };
        let written = run_persist(rx, &mut sink).unwrap();
        assert_eq!(written, 5);
        assert_eq!(sink.events.len(), 5);
        assert!(sink.flushes >= 1);
        let ids: Vec<u64> = sink.events.iter().map(|e| e.sql_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }
}
