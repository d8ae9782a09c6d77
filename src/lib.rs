//! # sqlreplay
//!
//! SQL wire-traffic dissection and replay engine.
//!
//! This crate reconstructs SQL statements (including out-of-band bound
//! parameters) from captured MySQL-family or openGauss/PostgreSQL-family
//! wire traffic, persists them as an ordered event stream, and replays that
//! stream against a target database under configurable timing strategies.
//!
//! ## Features
//!
//! - **Protocol Dissection**: per-session state machines for the MySQL and
//!   Postgres-compatible wire formats, including the prepared/extended flow
//!   and batch binds
//! - **Event Persistence**: size-rotated JSON-line files or an embedded
//!   SQLite table, readable back as one ordered stream
//! - **Replay Strategies**: serial, session-parallel and speed-multiplied
//!   dispatch with session filtering and schema remapping
//! - **Outcome Analysis**: slow-statement classification, top-N CSV export
//!   and optional result-set comparison
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sqlreplay::dissect::{SessionRegistry, Vendor};
//! use sqlreplay::io::{JsonPacketSource, PacketSource};
//!
//! let mut source = JsonPacketSource::open("packets.json").unwrap();
//! let registry = SessionRegistry::new(Vendor::PgCompat, false);
//!
//! while let Some(packet) = source.next_packet().unwrap() {
//!     for event in registry.feed(&packet) {
//!         println!("{}: {}", event.session_id, event.statement_text);
//!     }
//! }
//! for event in registry.close_all(0) {
//!     println!("{}: {}", event.session_id, event.statement_text);
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                          sqlreplay                                  |
//! +---------------------------------------------------------------------+
//! |  cursor   - bounds-checked binary reader, NULL length sentinel      |
//! |  event    - PacketRecord, SqlEvent, persisted JSON schema           |
//! |  io       - packet-file source                                      |
//! |  dissect/ - Dissector trait, MySQL + PG state machines, registry    |
//! |  queue    - bounded capture-to-persistence hand-off                 |
//! |  sink/    - rotating JSON and SQLite table sinks and readers        |
//! |  replay/  - scheduler, worker pool, connections, outcome analysis   |
//! |  config   - TOML configuration, fail-fast validation                |
//! |  error    - error types                                             |
//! +---------------------------------------------------------------------+
//! ```

pub mod config;
pub mod cursor;
pub mod dissect;
pub mod error;
pub mod event;
pub mod io;
pub mod queue;
pub mod replay;
pub mod sink;

pub use error::{ConfigError, DissectError, Error, ReplayError, Result, SinkError};
pub use event::{PacketRecord, ParamValue, PreparedTemplate, SqlEvent, TypeTag};

/// Library version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
