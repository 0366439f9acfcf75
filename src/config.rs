use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;
use tracing::warn;

use crate::engine::{EngineConfig, StoreOptions};
use crate::publisher::RetryPolicy;

/// Process configuration, read from `ADVISORD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub utc_offset_minutes: i32,
    pub commit_timeout: Duration,
    pub sync_max_attempts: u32,
    /// Where the JSON-lines booking journal is mirrored; off when unset.
    pub journal_path: Option<PathBuf>,
    pub reaper_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7878,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            max_connections: 256,
            compact_threshold: 1000,
            utc_offset_minutes: EngineConfig::DEFAULT_UTC_OFFSET_MINUTES,
            commit_timeout: StoreOptions::default().commit_timeout,
            sync_max_attempts: RetryPolicy::default().max_attempts,
            journal_path: None,
            reaper_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Config::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            port: parsed(&get, "ADVISORD_PORT").unwrap_or(d.port),
            bind: get("ADVISORD_BIND").unwrap_or(d.bind),
            data_dir: get("ADVISORD_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            metrics_port: parsed(&get, "ADVISORD_METRICS_PORT"),
            max_connections: parsed(&get, "ADVISORD_MAX_CONNECTIONS").unwrap_or(d.max_connections),
            compact_threshold: parsed(&get, "ADVISORD_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            utc_offset_minutes: parsed(&get, "ADVISORD_UTC_OFFSET_MINUTES").unwrap_or(d.utc_offset_minutes),
            commit_timeout: parsed(&get, "ADVISORD_COMMIT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.commit_timeout),
            sync_max_attempts: parsed(&get, "ADVISORD_SYNC_MAX_ATTEMPTS")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(d.sync_max_attempts),
            journal_path: get("ADVISORD_JOURNAL_PATH").map(PathBuf::from),
            reaper_interval: parsed(&get, "ADVISORD_REAPER_INTERVAL_SECS")
                .filter(|n: &u64| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.reaper_interval),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("advisord.wal")
    }

    pub fn engine_config(&self) -> EngineConfig {
        let utc_offset = FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| {
            warn!(minutes = self.utc_offset_minutes, "UTC offset out of range, using default");
            EngineConfig::default().utc_offset
        });
        EngineConfig {
            utc_offset,
            store: StoreOptions {
                commit_timeout: self.commit_timeout,
            },
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.sync_max_attempts,
            ..RetryPolicy::default()
        }
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = get(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {name}={raw:?}: not a valid value");
            None
        }
    }
}
