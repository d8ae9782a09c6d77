//! Target connections: one live connection per (worker, target schema),
//! lazily created, session settings applied exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

use crate::error::ReplayError;
use crate::event::{RowMatrix, SqlEvent};

/// Wire family of the replay target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetVendor {
    MySql,
    #[default]
    Pg,
}

/// Connection parameters for the replay target.
#[derive(Debug, Clone, Default)]
pub struct TargetConfig {
    pub vendor: TargetVendor,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Session-level settings run once per fresh connection.
    pub init_statements: Vec<String>,
    /// Connection attempts before the job fails.
    pub connect_retries: u32,
}

/// One live target connection executing events.
///
/// `Sync` is required because a worker's connection map is borrowed across
/// await points inside a spawned task.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Execute an event; returns the result rows when `collect_rows` is set
    /// and the statement produced any.
    async fn execute(
        &mut self,
        event: &SqlEvent,
        collect_rows: bool,
    ) -> Result<Option<RowMatrix>, ReplayError>;
}

/// Creates executors for a resolved target schema. Implemented for real
/// databases by [`DbExecutorFactory`] and by mocks in tests.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn connect(
        &self,
        target: &TargetConfig,
        schema: &str,
    ) -> Result<Box<dyn SqlExecutor>, ReplayError>;
}

/// Per-worker map of target schema to live executor. Connections are never
/// closed mid-run; the map drops with the worker at job end.
pub struct ConnectionManager {
    target: TargetConfig,
    factory: Arc<dyn ExecutorFactory>,
    connections: HashMap<String, Box<dyn SqlExecutor>>,
}

impl ConnectionManager {
    pub fn new(target: TargetConfig, factory: Arc<dyn ExecutorFactory>) -> Self {
        Self {
            target,
            factory,
            connections: HashMap::new(),
        }
    }

    /// Executor for a resolved target schema, connecting on first use with
    /// the configured retry budget.
    pub async fn executor(
        &mut self,
        schema: &str,
    ) -> Result<&mut Box<dyn SqlExecutor>, ReplayError> {
        if !self.connections.contains_key(schema) {
            let executor = self.connect_with_retries(schema).await?;
            self.connections.insert(schema.to_string(), executor);
        }
        Ok(self.connections.get_mut(schema).unwrap())
    }

    async fn connect_with_retries(
        &self,
        schema: &str,
    ) -> Result<Box<dyn SqlExecutor>, ReplayError> {
        let attempts = self.target.connect_retries.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            match self.factory.connect(&self.target, schema).await {
                Ok(executor) => {
                    debug!(schema, attempt, "target connection established");
                    return Ok(executor);
                }
                Err(err) => {
                    warn!(schema, attempt, %err, "target connection failed");
                    last = err.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                    }
                }
            }
        }
        Err(ReplayError::RetriesExhausted {
            schema: schema.to_string(),
            attempts,
            last,
        })
    }
}

/// Production factory dispatching on the target vendor.
pub struct DbExecutorFactory;

#[async_trait]
impl ExecutorFactory for DbExecutorFactory {
    async fn connect(
        &self,
        target: &TargetConfig,
        schema: &str,
    ) -> Result<Box<dyn SqlExecutor>, ReplayError> {
        match target.vendor {
            TargetVendor::Pg => Ok(Box::new(PgExecutor::connect(target, schema).await?)),
            TargetVendor::MySql => Ok(Box::new(MySqlExecutor::connect(target, schema).await?)),
        }
    }
}

/// Postgres-family executor over tokio_postgres.
///
/// The resolved schema is `database` or `database.search_path`; the suffix
/// becomes a `SET search_path` applied with the other init statements.
struct PgExecutor {
    client: tokio_postgres::Client,
}

impl PgExecutor {
    async fn connect(target: &TargetConfig, schema: &str) -> Result<Self, ReplayError> {
        let (dbname, search_path) = match schema.split_once('.') {
            Some((db, path)) => (db, Some(path)),
            None => (schema, None),
        };
        let conn_string = format!(
            "host={} port={} user={} password={} dbname={}",
            target.host, target.port, target.username, target.password, dbname
        );
        let (client, connection) = tokio_postgres::connect(&conn_string, NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(%err, "postgres connection task ended");
            }
        });

        if let Some(path) = search_path {
            client
                .batch_execute(&format!("SET search_path TO {path}"))
                .await?;
        }
        for statement in &target.init_statements {
            client.batch_execute(statement).await?;
        }
        info!(schema, "postgres target session ready");
        Ok(Self { client })
    }
}

/// Convert one text-form parameter into the Rust type matching the
/// parameter type the server inferred at prepare time. Persisted events
/// carry every value as text, and a `String` only binds against
/// text-family columns, so numeric, float and bool parameters must be
/// parsed before binding.
fn pg_param(
    raw: Option<&str>,
    ty: &Type,
    index: usize,
) -> Result<Box<dyn ToSql + Send + Sync>, ReplayError> {
    fn parsed<T>(
        raw: Option<&str>,
        wanted: &'static str,
        index: usize,
    ) -> Result<Option<T>, ReplayError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        raw.map(|text| {
            text.parse::<T>().map_err(|err| ReplayError::BadParameter {
                index,
                wanted,
                reason: err.to_string(),
            })
        })
        .transpose()
    }

    let boxed: Box<dyn ToSql + Send + Sync> = if *ty == Type::INT2 {
        Box::new(parsed::<i16>(raw, "int2", index)?)
    } else if *ty == Type::INT4 {
        Box::new(parsed::<i32>(raw, "int4", index)?)
    } else if *ty == Type::INT8 {
        Box::new(parsed::<i64>(raw, "int8", index)?)
    } else if *ty == Type::FLOAT4 {
        Box::new(parsed::<f32>(raw, "float4", index)?)
    } else if *ty == Type::FLOAT8 {
        Box::new(parsed::<f64>(raw, "float8", index)?)
    } else if *ty == Type::BOOL {
        Box::new(parsed::<bool>(raw, "bool", index)?)
    } else {
        Box::new(raw.map(str::to_string))
    };
    Ok(boxed)
}

/// Read one result cell as text, trying the common column types.
fn pg_cell(row: &tokio_postgres::Row, index: usize) -> Option<String> {
    if let Ok(value) = row.try_get::<_, Option<String>>(index) {
        return value;
    }
    if let Ok(value) = row.try_get::<_, Option<i64>>(index) {
        return value.map(|v| v.to_string());
    }
    if let Ok(value) = row.try_get::<_, Option<i32>>(index) {
        return value.map(|v| v.to_string());
    }
    if let Ok(value) = row.try_get::<_, Option<f64>>(index) {
        return value.map(|v| v.to_string());
    }
    row.try_get::<_, Option<bool>>(index)
        .ok()
        .flatten()
        .map(|v| v.to_string())
}

#[async_trait]
impl SqlExecutor for PgExecutor {
    async fn execute(
        &mut self,
        event: &SqlEvent,
        collect_rows: bool,
    ) -> Result<Option<RowMatrix>, ReplayError> {
        if event.is_prepared {
            // Parameter values travel as text; UNKNOWN lets the server
            // infer each parameter's type from statement context.
            let types = vec![Type::UNKNOWN; event.parameter_values.len()];
            let statement = self
                .client
                .prepare_typed(&event.statement_text, &types)
                .await?;
            let texts: Vec<Option<String>> = event
                .parameter_values
                .iter()
                .map(|p| p.raw.as_ref().map(|b| String::from_utf8_lossy(b).into_owned()))
                .collect();
            let inferred = statement.params();
            let mut converted: Vec<Box<dyn ToSql + Send + Sync>> =
                Vec::with_capacity(texts.len());
            for (index, raw) in texts.iter().enumerate() {
                let ty = inferred.get(index).unwrap_or(&Type::TEXT);
                converted.push(pg_param(raw.as_deref(), ty, index)?);
            }
            let params: Vec<&(dyn ToSql + Sync)> = converted
                .iter()
                .map(|value| value.as_ref() as &(dyn ToSql + Sync))
                .collect();
            let rows = self.client.query(&statement, &params).await?;
            if !collect_rows {
                return Ok(None);
            }
            let matrix = rows
                .iter()
                .map(|row| (0..row.len()).map(|i| pg_cell(row, i)).collect())
                .collect();
            Ok(Some(matrix))
        } else {
            let messages = self.client.simple_query(&event.statement_text).await?;
            if !collect_rows {
                return Ok(None);
            }
            let matrix: RowMatrix = messages
                .iter()
                .filter_map(|message| match message {
                    tokio_postgres::SimpleQueryMessage::Row(row) => Some(
                        (0..row.len())
                            .map(|i| row.get(i).map(str::to_string))
                            .collect(),
                    ),
                    _ => None,
                })
                .collect();
            Ok(Some(matrix))
        }
    }
}

/// MySQL-family executor over mysql_async.
struct MySqlExecutor {
    conn: mysql_async::Conn,
}

impl MySqlExecutor {
    async fn connect(target: &TargetConfig, schema: &str) -> Result<Self, ReplayError> {
        let opts = mysql_async::OptsBuilder::default()
            .ip_or_hostname(target.host.clone())
            .tcp_port(target.port)
            .user(Some(target.username.clone()))
            .pass(Some(target.password.clone()))
            .db_name(Some(schema.to_string()));
        let mut conn = mysql_async::Conn::new(mysql_async::Opts::from(opts)).await?;
        for statement in &target.init_statements {
            conn.query_drop(statement.as_str()).await?;
        }
        info!(schema, "mysql target session ready");
        Ok(Self { conn })
    }
}

fn mysql_cell(value: &mysql_async::Value) -> Option<String> {
    use mysql_async::Value;
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Int(v) => Some(v.to_string()),
        Value::UInt(v) => Some(v.to_string()),
        Value::Float(v) => Some(v.to_string()),
        Value::Double(v) => Some(v.to_string()),
        other => Some(other.as_sql(true)),
    }
}

#[async_trait]
impl SqlExecutor for MySqlExecutor {
    async fn execute(
        &mut self,
        event: &SqlEvent,
        collect_rows: bool,
    ) -> Result<Option<RowMatrix>, ReplayError> {
        let rows: Vec<mysql_async::Row> = if event.is_prepared {
            let values: Vec<mysql_async::Value> = event
                .parameter_values
                .iter()
                .map(|p| match &p.raw {
                    Some(bytes) => mysql_async::Value::Bytes(bytes.clone()),
                    None => mysql_async::Value::NULL,
                })
                .collect();
            self.conn
                .exec(event.statement_text.as_str(), values)
                .await?
        } else {
            self.conn.query(event.statement_text.as_str()).await?
        };

        if !collect_rows {
            return Ok(None);
        }
        let matrix = rows
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.as_ref(i).and_then(mysql_cell))
                    .collect()
            })
            .collect();
        Ok(Some(matrix))
    }
}
