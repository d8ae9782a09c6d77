//! Error types for sqlreplay.
//!
//! This module provides structured error types for all sqlreplay operations:
//!
//! - [`enum@Error`] - Main error enum that wraps all error types
//! - [`DissectError`] - Errors from wire-protocol dissection
//! - [`SinkError`] - Errors from event persistence and reading
//! - [`ReplayError`] - Errors from replay execution against a target
//! - [`ConfigError`] - Errors from configuration loading and validation
//!
//! All errors implement `std::error::Error` and can be converted to `anyhow::Error`.
//!
//! Dissection errors stay local: a malformed frame is logged and the
//! session keeps parsing at the next frame boundary, so [`DissectError`] never
//! crosses the `Dissector::feed` boundary. Persistence and connectivity faults
//! are job-level and do propagate.

use thiserror::Error;

/// Main error type for sqlreplay operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Error during wire-protocol dissection
    #[error("dissect error: {0}")]
    Dissect(#[from] DissectError),

    /// Error writing or reading persisted events
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Error during replay execution
    #[error("replay error: {0}")]
    Replay(#[from] ReplayError),

    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to wire-protocol dissection.
#[derive(Error, Debug)]
pub enum DissectError {
    /// Frame shorter than its declared or minimum length
    #[error("{vendor}: truncated frame (need {needed} bytes, have {have})")]
    Truncated {
        vendor: &'static str,
        needed: usize,
        have: usize,
    },

    /// Frame contents violate the wire format
    #[error("{vendor}: malformed {message} message: {reason}")]
    Malformed {
        vendor: &'static str,
        message: &'static str,
        reason: String,
    },

    /// Bind/Execute referenced a statement name with no prepared template
    #[error("{vendor}: no prepared template named {name:?}")]
    UnknownStatement { vendor: &'static str, name: String },
}

/// Errors related to event persistence.
#[derive(Error, Debug)]
pub enum SinkError {
    /// I/O failure on the sink file set
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Event (de)serialization failure
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Table-mode storage failure
    #[error("table storage error: {0}")]
    Table(#[from] rusqlite::Error),

    /// The consuming side of the event queue is gone
    #[error("event queue closed")]
    QueueClosed,
}

/// Errors related to replay execution.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// PostgreSQL-family target error
    #[error("postgres target error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// MySQL-family target error
    #[error("mysql target error: {0}")]
    MySql(#[from] mysql_async::Error),

    /// Connection attempts exhausted the configured retry budget
    #[error("cannot reach target for schema {schema:?} after {attempts} attempts: {last}")]
    RetriesExhausted {
        schema: String,
        attempts: u32,
        last: String,
    },

    /// A parameter value could not be converted for the target
    #[error("parameter {index} not convertible to {wanted}: {reason}")]
    BadParameter {
        index: usize,
        wanted: &'static str,
        reason: String,
    },

    /// Reading the persisted event stream failed mid-replay
    #[error("event source error: {0}")]
    Source(#[from] SinkError),
}

/// Errors related to configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required key absent
    #[error("missing required config key: {key}")]
    MissingKey { key: &'static str },

    /// Slow-SQL rule code outside the two defined codes
    #[error("unknown slow-sql rule code {code} (expected 1 or 2)")]
    UnknownSlowRule { code: u32 },

    /// Replay strategy name not recognized
    #[error("unknown replay strategy {name:?}")]
    UnknownStrategy { name: String },

    /// Vendor name not recognized
    #[error("unknown vendor {name:?} (expected \"mysql\" or \"pg\")")]
    UnknownVendor { name: String },

    /// Storage mode not recognized
    #[error("unknown storage mode {mode:?} (expected \"json\" or \"db\")")]
    UnknownStorageMode { mode: String },

    /// Schema map entry not of the form `src:dst`
    #[error("bad schema map entry {entry:?} (expected \"src:dst\")")]
    BadSchemaMap { entry: String },

    /// Config file unreadable
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Config file not valid TOML
    #[error("cannot parse config file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
