//! Interface to the upstream sharded event log.
//!
//! The log is modeled after a managed stream service: a stream is split into
//! shards, each shard is read through single-use iterators that the service
//! rotates on every fetch, and fetches may be rejected when a shard's read
//! throughput is exceeded.

use std::{fmt, future::Future};

use bytes::Bytes;

use crate::{
    cursor::Cursor,
    types::{Record, ShardDescriptor},
};

/// Opaque, service-issued handle authorizing the next fetch from a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IteratorHandle(String);

impl IteratorHandle {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IteratorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a new iterator starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorPosition {
    /// Oldest retained record
    TrimHorizon,
    /// Only records written after the iterator was issued
    Latest,
    /// The record with this marker, inclusive
    AtSequence(String),
    /// The record right after this marker
    AfterSequence(String),
}

/// Outcome of one bounded fetch.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Records in shard order
    pub records: Vec<Record>,
    /// Replacement iterator; `None` once the shard has been closed
    pub next_iterator: Option<IteratorHandle>,
    /// How far behind the shard's tail this fetch ended
    pub millis_behind_latest: u64,
}

/// Failures reported by the event log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("Stream not found: {0}")]
    NotFound(String),

    #[error("Shard {shard} not found in stream {stream}")]
    ShardNotFound { stream: String, shard: String },

    #[error("Read throughput exceeded on shard {0}")]
    Throttled(String),

    #[error("Iterator is unknown or was already used")]
    InvalidIterator,

    #[error("Iterator expired")]
    ExpiredIterator,

    #[error("Invalid sequence number: {0}")]
    InvalidSequence(String),

    #[error("Stream {0} already exists with a different shard count")]
    StreamConfigMismatch(String),

    #[error("Upstream protocol error: {0}")]
    Protocol(String),
}

impl LogError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, LogError::Throttled(_))
    }
}

/// A sharded, pull-based event log.
pub trait EventLog: Send + Sync + 'static {
    /// Describe the shards of `stream`, in the service's listing order.
    fn list_shards(
        &self,
        stream: &str,
    ) -> impl Future<Output = Result<Vec<ShardDescriptor>, LogError>> + Send;

    /// Issue a fresh iterator for one shard.
    fn get_iterator(
        &self,
        stream: &str,
        shard_id: &str,
        position: IteratorPosition,
    ) -> impl Future<Output = Result<IteratorHandle, LogError>> + Send;

    /// Fetch up to `max_records` records. Consumes `iterator` unless the
    /// fetch fails before reading.
    fn fetch(
        &self,
        iterator: &IteratorHandle,
        max_records: usize,
    ) -> impl Future<Output = Result<FetchResult, LogError>> + Send;

    /// Write one record and return the cursor it was stored at.
    fn put(
        &self,
        stream: &str,
        data: Bytes,
    ) -> impl Future<Output = Result<Cursor, LogError>> + Send;
}
