//! End-to-end pipeline tests: dissect captured packets, persist the events,
//! read them back and replay them against a mock target.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use sqlreplay::dissect::{SessionRegistry, Vendor};
use sqlreplay::error::ReplayError;
use sqlreplay::event::{PacketRecord, RowMatrix, SqlEvent};
use sqlreplay::queue::event_queue;
use sqlreplay::replay::{
    ExecutorFactory, ReplayJob, Scheduler, SqlExecutor, Strategy, TargetConfig,
};
use sqlreplay::sink::{run_persist, EventSink, EventSource, JsonEventReader, RotatingJsonSink};

fn packet(session: &str, seq: u64, ts: i64, payload: Vec<u8>) -> PacketRecord {
    PacketRecord {
        sequence_id: seq,
        session_id: session.to_string(),
        timestamp_us: ts,
        payload,
        source_file: "pipeline".into(),
        position: seq,
    }
}

fn pg_startup(session: &str, seq: u64, ts: i64, user: &str, database: &str) -> PacketRecord {
    let mut body = Vec::new();
    body.extend_from_slice(&196_608u32.to_be_bytes());
    body.extend_from_slice(b"user\0");
    body.extend_from_slice(user.as_bytes());
    body.push(0);
    body.extend_from_slice(b"database\0");
    body.extend_from_slice(database.as_bytes());
    body.push(0);
    body.push(0);
    let mut payload = ((body.len() + 4) as u32).to_be_bytes().to_vec();
    payload.extend_from_slice(&body);
    packet(session, seq, ts, payload)
}

fn pg_query(session: &str, seq: u64, ts: i64, sql: &str) -> PacketRecord {
    let mut payload = vec![b'Q'];
    payload.extend_from_slice(&((sql.len() + 1 + 4) as u32).to_be_bytes());
    payload.extend_from_slice(sql.as_bytes());
    payload.push(0);
    packet(session, seq, ts, payload)
}

fn pg_terminate(session: &str, seq: u64, ts: i64) -> PacketRecord {
    packet(session, seq, ts, vec![b'X', 0, 0, 0, 4])
}

#[derive(Default)]
struct MockLog {
    executed: Mutex<Vec<(String, String)>>,
}

struct MockExecutor {
    schema: String,
    log: Arc<MockLog>,
}

#[async_trait]
impl SqlExecutor for MockExecutor {
    async fn execute(
        &mut self,
        event: &SqlEvent,
        _collect_rows: bool,
    ) -> Result<Option<RowMatrix>, ReplayError> {
        self.log
            .executed
            .lock()
            .unwrap()
            .push((self.schema.clone(), event.statement_text.clone()));
        Ok(None)
    }
}

struct MockFactory {
    log: Arc<MockLog>,
}

#[async_trait]
impl ExecutorFactory for MockFactory {
    async fn connect(
        &self,
        _target: &TargetConfig,
        schema: &str,
    ) -> Result<Box<dyn SqlExecutor>, ReplayError> {
        Ok(Box::new(MockExecutor {
            schema: schema.to_string(),
            log: self.log.clone(),
        }))
    }
}

/// Dissect a two-session pg capture into a rotated JSON set, then replay it
/// from disk through the scheduler.
#[tokio::test]
async fn test_dissect_persist_replay_round_trip() {
    let dir = TempDir::new().unwrap();
    let prefix = dir.path().join("events");

    // Dissection feeds a bounded queue drained by a persistence thread.
    let registry = SessionRegistry::new(Vendor::PgCompat, false);
    let (producer, consumer) = event_queue(64);
    let sink_prefix = prefix.clone();
    let persister = thread::spawn(move || {
        let mut sink = RotatingJsonSink::new(sink_prefix, 1024 * 1024);
        run_persist(consumer, &mut sink)
    });

    let packets = vec![
        pg_startup("alpha", 1, 1_000, "alice", "shop"),
        pg_startup("beta", 2, 1_000, "bob", "shop"),
        pg_query("alpha", 3, 2_000, "SELECT * FROM orders"),
        pg_query("beta", 4, 2_500, "DELETE FROM carts"),
        pg_query("alpha", 5, 3_000, "SELECT count(*) FROM orders"),
        pg_terminate("alpha", 6, 9_000),
        pg_terminate("beta", 7, 9_500),
    ];
    for p in &packets {
        for event in registry.feed(p) {
            producer.push(event).unwrap();
        }
    }
    for event in registry.close_all(10_000) {
        producer.push(event).unwrap();
    }
    drop(producer);
    let written = persister.join().unwrap().unwrap();
    assert_eq!(written, 3);

    // Replay the persisted stream against a mock target.
    let mut job = ReplayJob::new(
        TargetConfig::default(),
        Strategy::SessionParallel { pool_size: 2 },
    );
    job.schema_map
        .insert("shop.public".to_string(), "shop_replica".to_string());
    let log = Arc::new(MockLog::default());
    let mut scheduler = Scheduler::new(job, Arc::new(MockFactory { log: log.clone() }));

    let source: Box<dyn EventSource> = Box::new(JsonEventReader::new(&prefix));
    let report = scheduler.run(source).await.unwrap();

    assert_eq!(report.dispatched, 3);
    assert_eq!(report.failed, 0);
    let executed = log.executed.lock().unwrap();
    assert_eq!(executed.len(), 3);
    // Every statement ran against the remapped schema.
    assert!(executed.iter().all(|(schema, _)| schema == "shop_replica"));
    assert!(executed
        .iter()
        .any(|(_, sql)| sql == "SELECT * FROM orders"));
}

/// Replaying the same persisted stream twice dispatches the same count.
#[tokio::test]
async fn test_replay_dispatch_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let prefix = dir.path().join("events");

    let mut sink = RotatingJsonSink::new(&prefix, 1024 * 1024);
    for id in 1..=4 {
        let session = if id % 2 == 0 { "even" } else { "odd" };
        sink.write(&SqlEvent::simple(
            id,
            session,
            "u",
            "src",
            format!("SELECT {id}"),
            id as i64 * 1_000,
        ))
        .unwrap();
    }
    sink.flush().unwrap();
    drop(sink);

    let mut counts = Vec::new();
    for _ in 0..2 {
        let mut job = ReplayJob::new(TargetConfig::default(), Strategy::Serial);
        job.schema_map.insert("src".to_string(), "dst".to_string());
        job.session_blacklist.insert("even".to_string());
        let mut scheduler = Scheduler::new(
            job,
            Arc::new(MockFactory { log: Arc::new(MockLog::default()) }),
        );
        let source: Box<dyn EventSource> = Box::new(JsonEventReader::new(&prefix));
        let report = scheduler.run(source).await.unwrap();
        counts.push((report.dispatched, report.skipped_filtered));
    }
    assert_eq!(counts[0], (2, 2));
    assert_eq!(counts[0], counts[1]);
}

/// The queue applies backpressure but never reorders a session's events.
#[test]
fn test_queue_preserves_event_order_under_load() {
    let (producer, consumer) = event_queue(2);
    let feeder = thread::spawn(move || {
        for id in 1..=50u64 {
            producer
                .push(SqlEvent::simple(id, "s", "u", "d", format!("SELECT {id}"), 0))
                .unwrap();
        }
    });

    let mut seen = Vec::new();
    loop {
        match consumer.pop(Duration::from_millis(100)) {
            Ok(Some(event)) => seen.push(event.sql_id),
            Ok(None) => continue,
            Err(_) => break,
        }
    }
    feeder.join().unwrap();
    assert_eq!(seen, (1..=50).collect::<Vec<u64>>());
}
