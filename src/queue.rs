//! Bounded hand-off queue between dissection and persistence.
//!
//! Dissection runs on the capture-reading thread; persistence runs on its
//! own thread. The queue is bounded so a slow sink applies backpressure to
//! the reader instead of growing memory without limit.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::error::SinkError;
use crate::event::SqlEvent;

pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Producing half held by the dissection side.
#[derive(Clone)]
pub struct EventProducer {
    tx: Sender<SqlEvent>,
}

/// Consuming half held by the persistence thread.
pub struct EventConsumer {
    rx: Receiver<SqlEvent>,
}

pub fn event_queue(capacity: usize) -> (EventProducer, EventConsumer) {
    let (tx, rx) = bounded(capacity);
    (EventProducer { tx }, EventConsumer { rx })
}

impl EventProducer {
    /// Blocking push; waits while the queue is full. Fails only when the
    /// consumer side is gone.
    pub fn push(&self, event: SqlEvent) -> Result<(), SinkError> {
        self.tx.send(event).map_err(|_| SinkError::QueueClosed)
    }
}

impl EventConsumer {
    /// Blocking pop with a timeout so the persistence loop can flush
    /// periodically. `Ok(None)` means the timeout elapsed; `Err` means all
    /// producers are gone and the queue is drained.
    pub fn pop(&self, timeout: Duration) -> Result<Option<SqlEvent>, SinkError> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SinkError::QueueClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SqlEvent;

    fn event(id: u64) -> SqlEvent {
        SqlEvent::simple(id, "s", "u", "db", format!("SELECT {id}"), 100)
    }

    #[test]
    fn test_fifo_order() {
        let (tx, rx) = event_queue(8);
        tx.push(event(1)).unwrap();
        tx.push(event(2)).unwrap();
        let first = rx.pop(Duration::from_millis(10)).unwrap().unwrap();
        let second = rx.pop(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(first.sql_id, 1);
        assert_eq!(second.sql_id, 2);
    }

    #[test]
    fn test_pop_times_out_when_empty() {
        let (_tx, rx) = event_queue(8);
        assert!(rx.pop(Duration::from_millis(5)).unwrap().is_none());
    }

    #[test]
    fn test_disconnect_after_drain() {
        let (tx, rx) = event_queue(8);
        tx.push(event(1)).unwrap();
        drop(tx);
        assert!(rx.pop(Duration::from_millis(5)).unwrap().is_some());
        assert!(matches!(
            rx.pop(Duration::from_millis(5)),
            Err(SinkError::QueueClosed)
        ));
    }

    #[test]
    fn test_push_fails_without_consumer() {
        let (tx, rx) = event_queue(1);
        drop(rx);
        assert!(matches!(tx.push(event(1)), Err(SinkError::QueueClosed)));
    }
}
