use std::{fs, path::Path, time::Duration};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use shardcast_stream::{
    MemoryLogOptions, ServerOptions, StreamingOptions, types::OptionsError,
};

pub const MANIFEST_FILE_NAME: &str = "shardcast.yaml";

/// Shardcast manifest file (shardcast.yaml)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub server: ServerConfig,

    /// Defaults for every streaming connection
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Behaviour of the bundled in-memory log
    #[serde(default)]
    pub log: LogConfig,

    /// Streams created at startup, in declaration order
    /// Key is the stream name (e.g., "orders")
    #[serde(default)]
    pub streams: IndexMap<String, StreamConfig>,

    /// Default tracing filter, used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadManifestError {
    #[error("{} not found at {}. Please create a {} file in your project root.",
        MANIFEST_FILE_NAME,
        .0.display(),
        MANIFEST_FILE_NAME)]
    FileNotFound(std::path::PathBuf),
    #[error("Failed to read {}: {}", .0.display(), .1)]
    ReadError(std::path::PathBuf, std::io::Error),
    #[error("Failed to parse {}: {}", .0.display(), .1)]
    ParseError(std::path::PathBuf, serde_yml::Error),
}

/// A manifest that parsed but describes an unusable configuration.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ManifestError {
    #[error("Invalid streaming settings: {0}")]
    Streaming(#[from] OptionsError),
    #[error("server.output_buffer must be at least 1")]
    ZeroOutputBuffer,
    #[error("Stream names must not be empty")]
    EmptyStreamName,
    #[error("Stream {0} must have at least one shard")]
    NoShards(String),
    #[error("Invalid log_level '{0}'")]
    InvalidLogLevel(String),
}

impl Manifest {
    /// Load manifest from the specified file path
    pub fn load(manifest_file_path: &Path) -> Result<Self, LoadManifestError> {
        if !manifest_file_path.exists() {
            return Err(LoadManifestError::FileNotFound(
                manifest_file_path.to_path_buf(),
            ));
        }

        let content = fs::read_to_string(manifest_file_path)
            .map_err(|e| LoadManifestError::ReadError(manifest_file_path.to_path_buf(), e))?;

        let manifest: Manifest = serde_yml::from_str(&content)
            .map_err(|e| LoadManifestError::ParseError(manifest_file_path.to_path_buf(), e))?;

        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        self.streaming.to_options().validate()?;
        if self.server.output_buffer == 0 {
            return Err(ManifestError::ZeroOutputBuffer);
        }
        for (name, stream) in &self.streams {
            if name.trim().is_empty() {
                return Err(ManifestError::EmptyStreamName);
            }
            if stream.shards == 0 {
                return Err(ManifestError::NoShards(name.clone()));
            }
        }
        if tracing_subscriber::EnvFilter::try_new(&self.log_level).is_err() {
            return Err(ManifestError::InvalidLogLevel(self.log_level.clone()));
        }
        Ok(())
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            port: self.server.port,
            host: self.server.host.clone(),
            output_buffer: self.server.output_buffer,
            streaming: self.streaming.to_options(),
        }
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Manifest {
            server: ServerConfig::default(),
            streaming: StreamingConfig::default(),
            log: LogConfig::default(),
            streams: IndexMap::new(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// HTTP listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Batches buffered per connection before the writer waits on the socket
    pub output_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults = ServerOptions::default();
        Self {
            host: defaults.host,
            port: defaults.port,
            output_buffer: defaults.output_buffer,
        }
    }
}

/// Streaming tunables, durations in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub batch_limit: usize,
    pub flush_timeout_ms: u64,
    pub fetch_limit: usize,
    pub idle_backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub throttle_backoff_ms: u64,
}

impl StreamingConfig {
    pub fn to_options(&self) -> StreamingOptions {
        StreamingOptions {
            batch_limit: self.batch_limit,
            flush_timeout: Duration::from_millis(self.flush_timeout_ms),
            fetch_limit: self.fetch_limit,
            idle_backoff: Duration::from_millis(self.idle_backoff_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            throttle_backoff: Duration::from_millis(self.throttle_backoff_ms),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        let defaults = StreamingOptions::default();
        Self {
            batch_limit: defaults.batch_limit,
            flush_timeout_ms: defaults.flush_timeout.as_millis() as u64,
            fetch_limit: defaults.fetch_limit,
            idle_backoff_ms: defaults.idle_backoff.as_millis() as u64,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            throttle_backoff_ms: defaults.throttle_backoff.as_millis() as u64,
        }
    }
}

/// In-memory log configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Records kept per shard, unbounded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_records: Option<usize>,
    /// Fetches allowed per shard per second, unlimited when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_rate_limit: Option<u32>,
    pub iterator_ttl_secs: u64,
}

impl LogConfig {
    pub fn to_options(&self) -> MemoryLogOptions {
        MemoryLogOptions {
            retention_records: self.retention_records,
            fetch_rate_limit: self.fetch_rate_limit,
            iterator_ttl: Duration::from_secs(self.iterator_ttl_secs),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        let defaults = MemoryLogOptions::default();
        Self {
            retention_records: defaults.retention_records,
            fetch_rate_limit: defaults.fetch_rate_limit,
            iterator_ttl_secs: defaults.iterator_ttl.as_secs(),
        }
    }
}

/// A stream declared in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_shards")]
    pub shards: usize,
}

fn default_shards() -> usize {
    1
}
