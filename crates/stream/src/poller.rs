//! Pull-and-buffer state for a single shard.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    batch::{Batch, assemble},
    cursor::Offset,
    log::{EventLog, IteratorHandle, LogError},
    types::{Record, StreamingOptions},
};

/// Owns one shard's iterator, its buffer of fetched-but-unsent records and
/// the cursor of the last record handed out.
pub struct ShardPoller<L> {
    log: Arc<L>,
    partition: String,
    /// `None` once the log reported the shard closed
    iterator: Option<IteratorHandle>,
    cursor: Offset,
    buffer: VecDeque<Record>,
    fetch_limit: usize,
    idle_backoff: Duration,
    last_flush: Instant,
    next_fetch: Instant,
    millis_behind_latest: u64,
}

impl<L: EventLog> ShardPoller<L> {
    pub fn new(
        log: Arc<L>,
        partition: impl Into<String>,
        iterator: IteratorHandle,
        cursor: Offset,
        options: &StreamingOptions,
    ) -> Self {
        let now = Instant::now();
        Self {
            log,
            partition: partition.into(),
            iterator: Some(iterator),
            cursor,
            buffer: VecDeque::new(),
            fetch_limit: options.fetch_limit,
            idle_backoff: options.idle_backoff,
            last_flush: now,
            next_fetch: now,
            millis_behind_latest: 0,
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Offset of the last record handed out in a batch.
    pub fn cursor(&self) -> &Offset {
        &self.cursor
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_closed(&self) -> bool {
        self.iterator.is_none()
    }

    pub fn millis_behind_latest(&self) -> u64 {
        self.millis_behind_latest
    }

    pub fn last_flush(&self) -> Instant {
        self.last_flush
    }

    pub fn mark_flushed(&mut self, at: Instant) {
        self.last_flush = at;
    }

    /// Fetch once from the log unless an idle backoff is still running.
    ///
    /// A failed fetch leaves the iterator and buffer untouched so the caller
    /// can retry after backing off.
    pub async fn pull(&mut self) -> Result<(), LogError> {
        let now = Instant::now();
        if now < self.next_fetch {
            return Ok(());
        }
        let Some(iterator) = self.iterator.as_ref() else {
            return Ok(());
        };

        let result = self.log.fetch(iterator, self.fetch_limit).await?;
        self.iterator = result.next_iterator;
        self.millis_behind_latest = result.millis_behind_latest;

        if self.iterator.is_none() {
            debug!(shard = %self.partition, "Shard closed, no further fetches");
        }

        if result.records.is_empty() {
            self.next_fetch = Instant::now() + self.idle_backoff;
        } else {
            trace!(
                shard = %self.partition,
                fetched = result.records.len(),
                millis_behind_latest = result.millis_behind_latest,
                "Fetched records"
            );
            self.next_fetch = Instant::now();
            self.buffer.extend(result.records);
        }
        Ok(())
    }

    /// Hand out exactly `size` records if that many are available.
    pub async fn take_full_batch(&mut self, size: usize) -> Result<Option<Batch>, LogError> {
        if self.buffer.len() < size {
            self.pull().await?;
        }
        if self.buffer.len() < size {
            return Ok(None);
        }

        let records: Vec<Record> = self.buffer.drain(..size).collect();
        if let Some(last) = records.last() {
            self.cursor = Offset::Sequence(last.sequence.clone());
        }
        Ok(Some(assemble(&self.partition, records, self.cursor.clone())))
    }

    /// Hand out everything buffered, possibly nothing.
    pub fn take_remainder(&mut self) -> Batch {
        let records: Vec<Record> = self.buffer.drain(..).collect();
        if let Some(last) = records.last() {
            self.cursor = Offset::Sequence(last.sequence.clone());
        }
        assemble(&self.partition, records, self.cursor.clone())
    }
}
