use crate::pipeline;
use crate::store;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

fn empty_path_none<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<PathBuf>::deserialize(deserializer)?;
    Ok(opt.filter(|path| !path.as_os_str().is_empty()))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub run: RunConfig,
    pub flow: FlowConfig,
    pub ingest: IngestConfig,
    pub store: StoreConfig,
    pub output: OutputConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "ingest.queue_capacity must be at least 1".into(),
            ));
        }
        if self.ingest.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "ingest.batch_size must be at least 1".into(),
            ));
        }
        if self.ingest.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "ingest.flush_interval_ms must be at least 1".into(),
            ));
        }
        if !store::is_plain_identifier(&self.store.table) {
            return Err(ConfigError::Invalid(format!(
                "store.table {:?} is not a plain SQL identifier",
                self.store.table
            )));
        }
        if self.capture.read_file.is_some() && !self.capture.interfaces.is_empty() {
            return Err(ConfigError::Invalid(
                "capture.read_file and capture.interfaces are mutually exclusive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Live interfaces, one capture thread each. Empty = system default.
    pub interfaces: Vec<String>,
    /// Replay a savefile instead of capturing live.
    #[serde(deserialize_with = "empty_path_none")]
    pub read_file: Option<PathBuf>,
    pub promiscuous: bool,
    pub snaplen: i32,
    pub timeout_ms: i32,
    pub filter: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            interfaces: Vec::new(),
            read_file: None,
            promiscuous: true,
            snaplen: 65535,
            timeout_ms: 100,
            filter: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Frames to read per source (0 = unlimited).
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Flow table shards (0 = four per CPU).
    pub shards: usize,
    /// Evict flows idle this long (0 = keep until exit).
    pub idle_timeout_secs: f64,
}

impl FlowConfig {
    pub fn idle_ttl_us(&self) -> i64 {
        if self.idle_timeout_secs > 0.0 {
            (self.idle_timeout_secs * 1_000_000.0) as i64
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Batch workers (0 = one per CPU).
    pub workers: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            queue_capacity: 1000,
            batch_size: 10,
            flush_interval_ms: 500,
            workers: 0,
        }
    }
}

impl IngestConfig {
    pub fn to_pipeline(&self) -> pipeline::IngestConfig {
        pipeline::IngestConfig {
            queue_capacity: self.queue_capacity,
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            workers: self.workers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub table: String,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            path: PathBuf::from("flows.db"),
            table: store::sqlite::DEFAULT_TABLE.to_string(),
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    #[serde(deserialize_with = "empty_path_none")]
    pub export_json: Option<PathBuf>,
    #[serde(deserialize_with = "empty_path_none")]
    pub export_csv: Option<PathBuf>,
}
