//! TOML configuration for transcribe and replay runs.
//!
//! Loaded once at startup, validated fail-fast, then passed by reference to
//! the components that need it. No global state.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::dissect::Vendor;
use crate::error::ConfigError;
use crate::replay::{ReplayJob, SlowRule, Strategy, TargetConfig, TargetVendor};

/// Where dissected events are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Json,
    Db,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Wire family of the captured traffic: "mysql" or "pg".
    pub vendor: String,
    /// JSON-lines packet file produced by the capture collaborator.
    pub packet_file: String,
    #[serde(default)]
    pub collect_results: bool,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// "json" or "db".
    pub mode: String,
    /// File prefix (json mode) or database path (db mode).
    pub path: String,
    #[serde(default = "default_rotate_bytes")]
    pub rotate_bytes: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub drop_previous: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReplayConfig {
    /// "serial", "parallel" or "speed".
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_multiplier")]
    pub speed_multiplier: f64,
    #[serde(default)]
    pub allow_destructive: bool,
    #[serde(default)]
    pub session_whitelist: Vec<String>,
    #[serde(default)]
    pub session_blacklist: Vec<String>,
    /// `srcSchema:dstSchema;...`
    #[serde(default)]
    pub schema_map: String,
    /// 1 = absolute duration threshold, 2 = difference from source.
    #[serde(default)]
    pub slow_rule: Option<u32>,
    #[serde(default)]
    pub slow_threshold_us: i64,
    #[serde(default = "default_top_n")]
    pub slow_top_n: usize,
    #[serde(default)]
    pub slow_csv: Option<String>,
    #[serde(default)]
    pub compare_results: bool,
    #[serde(default)]
    pub mismatch_report: Option<String>,
    #[serde(default)]
    pub time_budget_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TargetDbConfig {
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub init_statements: Vec<String>,
    #[serde(default = "default_retries")]
    pub connect_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub capture: Option<CaptureConfig>,
    pub storage: StorageConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub target: TargetDbConfig,
}

fn default_queue_capacity() -> usize {
    crate::queue::DEFAULT_QUEUE_CAPACITY
}
fn default_rotate_bytes() -> u64 {
    crate::sink::DEFAULT_ROTATE_BYTES
}
fn default_batch_size() -> usize {
    5_000
}
fn default_strategy() -> String {
    "serial".to_string()
}
fn default_pool_size() -> usize {
    8
}
fn default_multiplier() -> f64 {
    1.0
}
fn default_top_n() -> usize {
    10
}
fn default_retries() -> u32 {
    3
}

/// Parse a `src:dst;src:dst` mapping string.
pub fn parse_schema_map(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut map = HashMap::new();
    for entry in raw.split(';').filter(|e| !e.trim().is_empty()) {
        let Some((src, dst)) = entry.split_once(':') else {
            return Err(ConfigError::BadSchemaMap { entry: entry.to_string() });
        };
        let (src, dst) = (src.trim(), dst.trim());
        if src.is_empty() || dst.is_empty() {
            return Err(ConfigError::BadSchemaMap { entry: entry.to_string() });
        }
        map.insert(src.to_string(), dst.to_string());
    }
    Ok(map)
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        Ok(config)
    }

    pub fn storage_mode(&self) -> Result<StorageMode, ConfigError> {
        match self.storage.mode.as_str() {
            "json" => Ok(StorageMode::Json),
            "db" => Ok(StorageMode::Db),
            other => Err(ConfigError::UnknownStorageMode { mode: other.to_string() }),
        }
    }

    pub fn capture_vendor(&self) -> Result<Vendor, ConfigError> {
        let capture = self
            .capture
            .as_ref()
            .ok_or(ConfigError::MissingKey { key: "capture" })?;
        Vendor::from_name(&capture.vendor).ok_or_else(|| ConfigError::UnknownVendor {
            name: capture.vendor.clone(),
        })
    }

    fn strategy(&self) -> Result<Strategy, ConfigError> {
        match self.replay.strategy.as_str() {
            "serial" => Ok(Strategy::Serial),
            "parallel" => Ok(Strategy::SessionParallel {
                pool_size: self.replay.pool_size,
            }),
            "speed" => Ok(Strategy::SpeedMultiplied {
                multiplier: self.replay.speed_multiplier,
                allow_destructive: self.replay.allow_destructive,
            }),
            other => Err(ConfigError::UnknownStrategy { name: other.to_string() }),
        }
    }

    fn target(&self) -> Result<TargetConfig, ConfigError> {
        if self.target.host.is_empty() {
            return Err(ConfigError::MissingKey { key: "target.host" });
        }
        if self.target.username.is_empty() {
            return Err(ConfigError::MissingKey { key: "target.username" });
        }
        let vendor = match self.target.vendor.as_str() {
            "mysql" => TargetVendor::MySql,
            "pg" | "postgres" | "opengauss" | "gauss" => TargetVendor::Pg,
            other => {
                return Err(ConfigError::UnknownVendor { name: other.to_string() });
            }
        };
        Ok(TargetConfig {
            vendor,
            host: self.target.host.clone(),
            port: self.target.port,
            username: self.target.username.clone(),
            password: self.target.password.clone(),
            init_statements: self.target.init_statements.clone(),
            connect_retries: self.target.connect_retries,
        })
    }

    /// Build the immutable replay job, validating every replay-side key.
    pub fn replay_job(&self) -> Result<ReplayJob, ConfigError> {
        let mut job = ReplayJob::new(self.target()?, self.strategy()?);
        job.session_whitelist = self.replay.session_whitelist.iter().cloned().collect();
        job.session_blacklist = self.replay.session_blacklist.iter().cloned().collect();
        job.schema_map = parse_schema_map(&self.replay.schema_map)?;
        job.slow_rule = self
            .replay
            .slow_rule
            .map(|code| SlowRule::from_code(code, self.replay.slow_threshold_us))
            .transpose()?;
        job.slow_top_n = self.replay.slow_top_n;
        job.compare_results = self.replay.compare_results;
        job.time_budget = Duration::from_secs(self.replay.time_budget_secs);
        Ok(job)
    }

    /// Fail fast on anything a run would later trip over.
    pub fn validate_transcribe(&self) -> Result<(), ConfigError> {
        self.capture_vendor()?;
        let capture = self
            .capture
            .as_ref()
            .ok_or(ConfigError::MissingKey { key: "capture" })?;
        if capture.packet_file.is_empty() {
            return Err(ConfigError::MissingKey { key: "capture.packet_file" });
        }
        if self.storage.path.is_empty() {
            return Err(ConfigError::MissingKey { key: "storage.path" });
        }
        self.storage_mode()?;
        Ok(())
    }

    pub fn validate_replay(&self) -> Result<(), ConfigError> {
        if self.storage.path.is_empty() {
            return Err(ConfigError::MissingKey { key: "storage.path" });
        }
        self.storage_mode()?;
        self.replay_job()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [capture]
        vendor = "pg"
        packet_file = "packets.json"

        [storage]
        mode = "json"
        path = "events"

        [replay]
        strategy = "speed"
        speed_multiplier = 10.0
        schema_map = "src1:dst1;src2:dst2"
        slow_rule = 2
        slow_threshold_us = 500000

        [target]
        vendor = "pg"
        host = "localhost"
        port = 5432
        username = "replay"
        password = "secret"
    "#;

    #[test]
    fn test_full_config_parses_and_validates() {
        let config: Config = toml::from_str(FULL).unwrap();
        config.validate_transcribe().unwrap();
        config.validate_replay().unwrap();

        let job = config.replay_job().unwrap();
        assert_eq!(job.schema_map.get("src1"), Some(&"dst1".to_string()));
        assert!(matches!(
            job.strategy,
            Strategy::SpeedMultiplied { multiplier, .. } if multiplier == 10.0
        ));
        assert_eq!(
            job.slow_rule,
            Some(SlowRule::SourceDelta { threshold_us: 500_000 })
        );
    }

    #[test]
    fn test_missing_target_host_fails_fast() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            mode = "json"
            path = "events"

            [target]
            vendor = "pg"
            username = "replay"
        "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate_replay(),
            Err(ConfigError::MissingKey { key: "target.host" })
        ));
    }

    #[test]
    fn test_unknown_slow_rule_rejected() {
        let mut config: Config = toml::from_str(FULL).unwrap();
        config.replay.slow_rule = Some(7);
        assert!(matches!(
            config.replay_job(),
            Err(ConfigError::UnknownSlowRule { code: 7 })
        ));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let mut config: Config = toml::from_str(FULL).unwrap();
        config.replay.strategy = "chaotic".to_string();
        assert!(matches!(
            config.replay_job(),
            Err(ConfigError::UnknownStrategy { .. })
        ));
    }

    #[test]
    fn test_schema_map_parsing() {
        let map = parse_schema_map("a:b; c:d ;").unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("c"), Some(&"d".to_string()));

        assert!(parse_schema_map("broken").is_err());
        assert!(parse_schema_map("a:").is_err());
        assert!(parse_schema_map("").unwrap().is_empty());
    }

    #[test]
    fn test_storage_mode_names() {
        let mut config: Config = toml::from_str(FULL).unwrap();
        assert_eq!(config.storage_mode().unwrap(), StorageMode::Json);
        config.storage.mode = "db".to_string();
        assert_eq!(config.storage_mode().unwrap(), StorageMode::Db);
        config.storage.mode = "parquet".to_string();
        assert!(config.storage_mode().is_err());
    }
}
