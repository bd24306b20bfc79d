//! Core types shared by the log, the shard pollers and the HTTP surface.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::BEGIN;

/// A record stored in one shard of the upstream log.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Sequence marker assigned by the log, increasing within a shard
    pub sequence: String,
    /// Raw payload bytes, never inspected
    pub data: Bytes,
    /// When the log accepted the record
    pub arrived_at: DateTime<Utc>,
}

/// Shard metadata as reported by the log's shard listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub shard_id: String,
    /// Marker of the oldest record still retained (or of the next record for an empty shard)
    pub oldest_available: String,
    /// Marker of the newest record, if the shard holds any
    pub newest_available: Option<String>,
}

/// Partition metadata as served by `GET /event-types/{name}/partitions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionView {
    pub partition: String,
    pub oldest_available_offset: String,
    pub newest_available_offset: String,
}

impl From<ShardDescriptor> for PartitionView {
    fn from(shard: ShardDescriptor) -> Self {
        Self {
            partition: shard.shard_id,
            oldest_available_offset: shard.oldest_available,
            newest_available_offset: shard
                .newest_available
                .unwrap_or_else(|| BEGIN.to_string()),
        }
    }
}

/// Invalid streaming tunables.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionsError {
    #[error("batch_limit must be at least 1")]
    ZeroBatchLimit,

    #[error("fetch_limit must be at least 1")]
    ZeroFetchLimit,

    #[error("flush timeout must be greater than zero")]
    ZeroFlushTimeout,

    #[error(
        "poll interval ({poll_interval:?}) must be shorter than the idle backoff ({idle_backoff:?})"
    )]
    PollIntervalTooLong {
        poll_interval: Duration,
        idle_backoff: Duration,
    },
}

/// Tunables of one streaming connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingOptions {
    /// Number of events that makes a batch full
    pub batch_limit: usize,
    /// Maximum time a shard may go without a flush
    pub flush_timeout: Duration,
    /// Upper bound on records requested per upstream fetch
    pub fetch_limit: usize,
    /// How long a shard waits before fetching again after an empty fetch
    pub idle_backoff: Duration,
    /// Sleep between loop iterations that flushed nothing
    pub poll_interval: Duration,
    /// Connection-wide pause after the upstream throttled a fetch
    pub throttle_backoff: Duration,
}

impl Default for StreamingOptions {
    fn default() -> Self {
        Self {
            batch_limit: 10,
            flush_timeout: Duration::from_secs(1),
            fetch_limit: 100,
            idle_backoff: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
            throttle_backoff: Duration::from_secs(1),
        }
    }
}

impl StreamingOptions {
    /// Check the invariants the orchestrator relies on.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.batch_limit == 0 {
            return Err(OptionsError::ZeroBatchLimit);
        }
        if self.fetch_limit == 0 {
            return Err(OptionsError::ZeroFetchLimit);
        }
        if self.flush_timeout.is_zero() {
            return Err(OptionsError::ZeroFlushTimeout);
        }
        if self.poll_interval >= self.idle_backoff {
            return Err(OptionsError::PollIntervalTooLong {
                poll_interval: self.poll_interval,
                idle_backoff: self.idle_backoff,
            });
        }
        Ok(())
    }
}

/// Server configuration options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Port to listen on (0 for auto-assign)
    pub port: u16,
    /// Host to bind to
    pub host: String,
    /// Batches buffered between a connection's orchestrator and its socket
    pub output_buffer: usize,
    /// Defaults for every streaming connection
    pub streaming: StreamingOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "127.0.0.1".to_string(),
            output_buffer: 16,
            streaming: StreamingOptions::default(),
        }
    }
}
