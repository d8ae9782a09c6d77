//! Session-affine replay workers.
//!
//! Each worker is a tokio task with a bounded inbox and its own
//! [`ConnectionManager`]. The pool routes every event of a session to the
//! same worker, so per-session order is preserved while sessions run in
//! parallel. A full inbox blocks the dispatcher, which is the intended
//! backpressure against an overloaded target.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::event::SqlEvent;

use super::{ConnectionManager, EventOutcome, ExecutorFactory, TargetConfig};

const WORKER_INBOX: usize = 64;

fn worker_for(session_id: &str, pool_size: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    session_id.hash(&mut hasher);
    (hasher.finish() % pool_size as u64) as usize
}

/// Bounded pool of replay workers reporting outcomes on a shared channel.
pub struct WorkerPool {
    senders: Vec<mpsc::Sender<SqlEvent>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        pool_size: usize,
        target: TargetConfig,
        factory: Arc<dyn ExecutorFactory>,
        collect_rows: bool,
        outcome_tx: mpsc::UnboundedSender<EventOutcome>,
    ) -> Self {
        let pool_size = pool_size.max(1);
        let mut senders = Vec::with_capacity(pool_size);
        let mut handles = Vec::with_capacity(pool_size);
        for index in 0..pool_size {
            let (tx, rx) = mpsc::channel(WORKER_INBOX);
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(
                index,
                rx,
                ConnectionManager::new(target.clone(), factory.clone()),
                collect_rows,
                outcome_tx.clone(),
            )));
        }
        Self { senders, handles }
    }

    /// Route an event to its session's worker, waiting while that worker's
    /// inbox is full. Fails only when the pool has shut down.
    pub async fn dispatch(&self, event: SqlEvent) -> Result<(), SqlEvent> {
        let index = worker_for(&event.session_id, self.senders.len());
        self.senders[index]
            .send(event)
            .await
            .map_err(|send_error| send_error.0)
    }

    /// Close the inboxes and wait for in-flight executions to finish.
    pub async fn join(self) {
        drop(self.senders);
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(%err, "replay worker panicked");
            }
        }
    }
}

async fn run_worker(
    index: usize,
    mut inbox: mpsc::Receiver<SqlEvent>,
    mut connections: ConnectionManager,
    collect_rows: bool,
    outcome_tx: mpsc::UnboundedSender<EventOutcome>,
) {
    debug!(worker = index, "replay worker started");
    while let Some(event) = inbox.recv().await {
        let started = Instant::now();
        let result = match connections.executor(&event.schema).await {
            Ok(executor) => executor.execute(&event, collect_rows).await,
            Err(err) => Err(err),
        };
        let replay_duration_us = started.elapsed().as_micros() as i64;

        let (replayed_rows, error) = match result {
            Ok(rows) => (rows, None),
            Err(err) => (None, Some(err.to_string())),
        };
        let outcome = EventOutcome {
            sql_id: event.sql_id,
            session_id: event.session_id.clone(),
            schema: event.schema.clone(),
            statement_text: event.statement_text.clone(),
            source_duration_us: event.source_duration_us(),
            replay_duration_us,
            error,
            captured_rows: event.result_rows.clone(),
            replayed_rows,
        };
        if outcome_tx.send(outcome).is_err() {
            break;
        }
    }
    debug!(worker = index, "replay worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplayError;
    use crate::event::RowMatrix;
    use crate::replay::SqlExecutor;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingExecutor {
        log: Arc<Mutex<Vec<(usize, u64)>>>,
        worker_tag: usize,
    }

    #[async_trait]
    impl SqlExecutor for RecordingExecutor {
        async fn execute(
            &mut self,
            event: &SqlEvent,
            _collect_rows: bool,
        ) -> Result<Option<RowMatrix>, ReplayError> {
            self.log.lock().unwrap().push((self.worker_tag, event.sql_id));
            Ok(None)
        }
    }

    struct RecordingFactory {
        log: Arc<Mutex<Vec<(usize, u64)>>>,
        next_tag: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl super::super::ExecutorFactory for RecordingFactory {
        async fn connect(
            &self,
            _target: &TargetConfig,
            _schema: &str,
        ) -> Result<Box<dyn SqlExecutor>, ReplayError> {
            let tag = self
                .next_tag
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Box::new(RecordingExecutor {
                log: self.log.clone(),
                worker_tag: tag,
            }))
        }
    }

    fn event(session: &str, sql_id: u64) -> SqlEvent {
        SqlEvent::simple(sql_id, session, "u", "db", format!("SELECT {sql_id}"), 0)
    }

    #[tokio::test]
    async fn test_session_routing_is_deterministic() {
        assert_eq!(worker_for("abc", 4), worker_for("abc", 4));
        let spread: std::collections::HashSet<usize> = (0..100)
            .map(|i| worker_for(&format!("session-{i}"), 4))
            .collect();
        assert!(spread.len() > 1);
    }

    #[tokio::test]
    async fn test_per_session_order_preserved() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let factory = Arc::new(RecordingFactory {
            log: log.clone(),
            next_tag: std::sync::atomic::AtomicUsize::new(0),
        });
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(4, TargetConfig::default(), factory, false, outcome_tx);

        for sql_id in 1..=20 {
            pool.dispatch(event("one-session", sql_id)).await.unwrap();
        }
        pool.join().await;

        let mut outcomes = 0;
        while outcome_rx.recv().await.is_some() {
            outcomes += 1;
        }
        assert_eq!(outcomes, 20);

        let log = log.lock().unwrap();
        let ids: Vec<u64> = log.iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, (1..=20).collect::<Vec<u64>>());
        // One session means one executor.
        assert!(log.iter().all(|(tag, _)| *tag == log[0].0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_runs_on_multi_thread_runtime() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let factory = Arc::new(RecordingFactory {
            log: log.clone(),
            next_tag: std::sync::atomic::AtomicUsize::new(0),
        });
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(4, TargetConfig::default(), factory, false, outcome_tx);

        for sql_id in 1..=16 {
            pool.dispatch(event(&format!("session-{}", sql_id % 5), sql_id))
                .await
                .unwrap();
        }
        pool.join().await;

        let mut outcomes = 0;
        while outcome_rx.recv().await.is_some() {
            outcomes += 1;
        }
        assert_eq!(outcomes, 16);
        assert_eq!(log.lock().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_outcomes_carry_errors() {
        struct FailingExecutor;

        #[async_trait]
        impl SqlExecutor for FailingExecutor {
            async fn execute(
                &mut self,
                _event: &SqlEvent,
                _collect_rows: bool,
            ) -> Result<Option<RowMatrix>, ReplayError> {
                Err(ReplayError::BadParameter {
                    index: 0,
                    wanted: "int",
                    reason: "not a number".into(),
                })
            }
        }

        struct FailingFactory;

        #[async_trait]
        impl super::super::ExecutorFactory for FailingFactory {
            async fn connect(
                &self,
                _target: &TargetConfig,
                _schema: &str,
            ) -> Result<Box<dyn SqlExecutor>, ReplayError> {
                Ok(Box::new(FailingExecutor))
            }
        }

        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(1, TargetConfig::default(), Arc::new(FailingFactory), false, outcome_tx);
        pool.dispatch(event("s", 1)).await.unwrap();
        pool.join().await;

        let outcome = outcome_rx.recv().await.unwrap();
        assert!(outcome.error.is_some());
    }
}
