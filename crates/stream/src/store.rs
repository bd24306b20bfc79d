//! In-memory sharded event log.
//!
//! Provides a thread-safe in-memory implementation of [`EventLog`] with the
//! read semantics of a managed stream service: single-use iterators that
//! rotate on every fetch and expire when left unused, optional per-shard read
//! rate limits, and optional retention trimming.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    cursor::{Cursor, Offset},
    log::{EventLog, FetchResult, IteratorHandle, IteratorPosition, LogError},
    types::{Record, ShardDescriptor},
};

/// Lifetime of an iterator that is never used.
pub const DEFAULT_ITERATOR_TTL: Duration = Duration::from_secs(300);

/// Window over which `fetch_rate_limit` is counted.
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Behaviour knobs for [`MemoryLog`].
#[derive(Debug, Clone)]
pub struct MemoryLogOptions {
    /// Records kept per shard; the oldest are trimmed first
    pub retention_records: Option<usize>,
    /// Fetches allowed per shard within any one-second window
    pub fetch_rate_limit: Option<u32>,
    /// Lifetime of an unused iterator
    pub iterator_ttl: Duration,
}

impl Default for MemoryLogOptions {
    fn default() -> Self {
        Self {
            retention_records: None,
            fetch_rate_limit: None,
            iterator_ttl: DEFAULT_ITERATOR_TTL,
        }
    }
}

/// Format a sequence number as a marker.
/// Format: 20-digit zero-padded decimal, so markers sort like the numbers.
pub fn format_sequence(sequence: u64) -> String {
    format!("{:020}", sequence)
}

/// Parse a marker produced by [`format_sequence`].
pub fn parse_sequence(marker: &str) -> Option<u64> {
    if marker.is_empty() || !marker.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    marker.parse().ok()
}

/// Identifier of the shard at `index`.
pub fn shard_id(index: usize) -> String {
    format!("shardId-{:012}", index)
}

struct StoredRecord {
    sequence: u64,
    record: Record,
}

struct Shard {
    id: String,
    records: VecDeque<StoredRecord>,
    next_sequence: u64,
    recent_fetches: VecDeque<Instant>,
}

impl Shard {
    fn new(id: String) -> Self {
        Self {
            id,
            records: VecDeque::new(),
            next_sequence: 0,
            recent_fetches: VecDeque::new(),
        }
    }

    fn oldest_sequence(&self) -> u64 {
        self.records
            .front()
            .map(|r| r.sequence)
            .unwrap_or(self.next_sequence)
    }

    fn descriptor(&self) -> ShardDescriptor {
        ShardDescriptor {
            shard_id: self.id.clone(),
            oldest_available: format_sequence(self.oldest_sequence()),
            newest_available: self.records.back().map(|r| r.record.sequence.clone()),
        }
    }

    fn append(&mut self, data: Bytes, retention: Option<usize>) -> String {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let marker = format_sequence(sequence);
        self.records.push_back(StoredRecord {
            sequence,
            record: Record {
                sequence: marker.clone(),
                data,
                arrived_at: Utc::now(),
            },
        });

        if let Some(limit) = retention {
            while self.records.len() > limit.max(1) {
                self.records.pop_front();
            }
        }
        marker
    }

    /// Translate an iterator position into the next sequence to read.
    fn resolve(&self, position: &IteratorPosition) -> Result<u64, LogError> {
        let parse = |marker: &str| {
            parse_sequence(marker).ok_or_else(|| LogError::InvalidSequence(marker.to_string()))
        };

        match position {
            IteratorPosition::TrimHorizon => Ok(self.oldest_sequence()),
            IteratorPosition::Latest => Ok(self.next_sequence),
            IteratorPosition::AtSequence(marker) => {
                let sequence = parse(marker)?;
                if sequence > self.next_sequence {
                    return Err(LogError::InvalidSequence(marker.clone()));
                }
                Ok(sequence)
            }
            IteratorPosition::AfterSequence(marker) => {
                let sequence = parse(marker)?;
                if sequence >= self.next_sequence {
                    return Err(LogError::InvalidSequence(marker.clone()));
                }
                Ok(sequence + 1)
            }
        }
    }

    fn admit_fetch(&mut self, now: Instant, limit: u32) -> Result<(), LogError> {
        while let Some(&at) = self.recent_fetches.front() {
            if now.duration_since(at) >= RATE_WINDOW {
                self.recent_fetches.pop_front();
            } else {
                break;
            }
        }
        if self.recent_fetches.len() >= limit as usize {
            return Err(LogError::Throttled(self.id.clone()));
        }
        self.recent_fetches.push_back(now);
        Ok(())
    }

    /// Read from `position`, clamped to the trim horizon.
    /// Returns the records, the next position and the lag behind the tail.
    fn read(&self, position: u64, max_records: usize) -> (Vec<Record>, u64, u64) {
        let oldest = self.oldest_sequence();
        let start = position.max(oldest);
        let skip = (start - oldest) as usize;

        let records: Vec<Record> = self
            .records
            .iter()
            .skip(skip)
            .take(max_records)
            .map(|r| r.record.clone())
            .collect();

        let next_position = start + records.len() as u64;
        let millis_behind_latest = self
            .records
            .get(skip + records.len())
            .map(|r| (Utc::now() - r.record.arrived_at).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        (records, next_position, millis_behind_latest)
    }
}

#[derive(Debug, Clone)]
struct IteratorLease {
    stream: String,
    shard: usize,
    position: u64,
    expires_at: Instant,
}

/// In-memory sharded log.
pub struct MemoryLog {
    /// Shards indexed by stream name
    streams: RwLock<HashMap<String, Vec<Shard>>>,
    /// Outstanding iterator leases
    iterators: Mutex<HashMap<IteratorHandle, IteratorLease>>,
    options: MemoryLogOptions,
}

impl MemoryLog {
    /// Create a new empty log.
    pub fn new(options: MemoryLogOptions) -> Arc<Self> {
        Arc::new(Self {
            streams: RwLock::new(HashMap::new()),
            iterators: Mutex::new(HashMap::new()),
            options,
        })
    }

    /// Create a stream with `shard_count` shards.
    ///
    /// Returns Ok(true) if created, Ok(false) if it already exists with the
    /// same shard count.
    pub fn create_stream(&self, name: &str, shard_count: usize) -> Result<bool, LogError> {
        if shard_count == 0 {
            return Err(LogError::Protocol(format!(
                "stream {} needs at least one shard",
                name
            )));
        }

        let mut streams = self.streams.write();
        if let Some(existing) = streams.get(name) {
            if existing.len() != shard_count {
                return Err(LogError::StreamConfigMismatch(name.to_string()));
            }
            return Ok(false);
        }

        let shards = (0..shard_count).map(|i| Shard::new(shard_id(i))).collect();
        streams.insert(name.to_string(), shards);
        info!(stream = %name, shards = shard_count, "Created stream");
        Ok(true)
    }

    /// Check if a stream exists.
    pub fn has(&self, name: &str) -> bool {
        self.streams.read().contains_key(name)
    }

    /// Append a record to a specific shard.
    pub fn append(
        &self,
        stream: &str,
        shard_id: &str,
        data: impl Into<Bytes>,
    ) -> Result<Cursor, LogError> {
        let mut streams = self.streams.write();
        let shards = streams
            .get_mut(stream)
            .ok_or_else(|| LogError::NotFound(stream.to_string()))?;
        let shard = shards
            .iter_mut()
            .find(|s| s.id == shard_id)
            .ok_or_else(|| LogError::ShardNotFound {
                stream: stream.to_string(),
                shard: shard_id.to_string(),
            })?;

        let sequence = shard.append(data.into(), self.options.retention_records);
        debug!(stream = %stream, shard = %shard_id, sequence = %sequence, "Appended record");
        Ok(Cursor::new(shard_id, Offset::Sequence(sequence)))
    }

    /// Number of iterators that have been issued and not yet used or expired.
    pub fn outstanding_iterators(&self) -> usize {
        let now = Instant::now();
        self.iterators
            .lock()
            .values()
            .filter(|lease| lease.expires_at > now)
            .count()
    }

    fn issue_iterator(&self, stream: &str, shard: usize, position: u64) -> IteratorHandle {
        let now = Instant::now();
        let handle = IteratorHandle::new(Uuid::new_v4().to_string());

        let mut iterators = self.iterators.lock();
        iterators.retain(|_, lease| lease.expires_at > now);
        iterators.insert(
            handle.clone(),
            IteratorLease {
                stream: stream.to_string(),
                shard,
                position,
                expires_at: now + self.options.iterator_ttl,
            },
        );
        handle
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            iterators: Mutex::new(HashMap::new()),
            options: MemoryLogOptions::default(),
        }
    }
}

impl EventLog for MemoryLog {
    async fn list_shards(&self, stream: &str) -> Result<Vec<ShardDescriptor>, LogError> {
        let streams = self.streams.read();
        let shards = streams
            .get(stream)
            .ok_or_else(|| LogError::NotFound(stream.to_string()))?;
        Ok(shards.iter().map(Shard::descriptor).collect())
    }

    async fn get_iterator(
        &self,
        stream: &str,
        shard_id: &str,
        position: IteratorPosition,
    ) -> Result<IteratorHandle, LogError> {
        let (index, start) = {
            let streams = self.streams.read();
            let shards = streams
                .get(stream)
                .ok_or_else(|| LogError::NotFound(stream.to_string()))?;
            let index = shards
                .iter()
                .position(|s| s.id == shard_id)
                .ok_or_else(|| LogError::ShardNotFound {
                    stream: stream.to_string(),
                    shard: shard_id.to_string(),
                })?;
            (index, shards[index].resolve(&position)?)
        };

        debug!(stream = %stream, shard = %shard_id, ?position, "Issued iterator");
        Ok(self.issue_iterator(stream, index, start))
    }

    async fn fetch(
        &self,
        iterator: &IteratorHandle,
        max_records: usize,
    ) -> Result<FetchResult, LogError> {
        let now = Instant::now();
        let lease = self
            .iterators
            .lock()
            .get(iterator)
            .cloned()
            .ok_or(LogError::InvalidIterator)?;

        if now >= lease.expires_at {
            self.iterators.lock().remove(iterator);
            return Err(LogError::ExpiredIterator);
        }

        let (records, next_position, millis_behind_latest) = {
            let mut streams = self.streams.write();
            let shard = streams
                .get_mut(&lease.stream)
                .and_then(|shards| shards.get_mut(lease.shard))
                .ok_or_else(|| LogError::NotFound(lease.stream.clone()))?;

            // A throttled fetch leaves the iterator usable
            if let Some(limit) = self.options.fetch_rate_limit {
                shard.admit_fetch(now, limit)?;
            }
            if self.iterators.lock().remove(iterator).is_none() {
                return Err(LogError::InvalidIterator);
            }
            shard.read(lease.position, max_records)
        };

        Ok(FetchResult {
            records,
            next_iterator: Some(self.issue_iterator(&lease.stream, lease.shard, next_position)),
            millis_behind_latest,
        })
    }

    async fn put(&self, stream: &str, data: Bytes) -> Result<Cursor, LogError> {
        let mut streams = self.streams.write();
        let shards = streams
            .get_mut(stream)
            .ok_or_else(|| LogError::NotFound(stream.to_string()))?;

        let index = rand::thread_rng().gen_range(0..shards.len());
        let shard = &mut shards[index];
        let sequence = shard.append(data, self.options.retention_records);

        debug!(stream = %stream, shard = %shard.id, sequence = %sequence, "Put record");
        Ok(Cursor::new(shard.id.clone(), Offset::Sequence(sequence)))
    }
}
