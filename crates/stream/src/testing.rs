//! Scriptable [`EventLog`] double shared by the unit tests.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    cursor::Cursor,
    log::{EventLog, FetchResult, IteratorHandle, IteratorPosition, LogError},
    store::{MemoryLog, MemoryLogOptions, shard_id},
    types::ShardDescriptor,
};

/// Wraps a [`MemoryLog`] holding a single stream, counting calls and
/// returning queued failures before delegating.
pub struct ScriptedLog {
    inner: Arc<MemoryLog>,
    stream: String,
    /// Failures keyed by the 1-based fetch call they apply to
    fetch_failures: Mutex<BTreeMap<usize, LogError>>,
    fetch_calls: AtomicUsize,
    get_iterator_calls: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptedLog {
    pub fn with_stream(stream: &str, shards: usize) -> Arc<Self> {
        Self::with_options(stream, shards, MemoryLogOptions::default())
    }

    pub fn with_options(stream: &str, shards: usize, options: MemoryLogOptions) -> Arc<Self> {
        let inner = MemoryLog::new(options);
        inner.create_stream(stream, shards).unwrap();
        Arc::new(Self {
            inner,
            stream: stream.to_string(),
            fetch_failures: Mutex::new(BTreeMap::new()),
            fetch_calls: AtomicUsize::new(0),
            get_iterator_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Append to the shard at `index` of the scripted stream.
    pub fn append(&self, index: usize, payload: impl Into<Bytes>) -> Cursor {
        self.inner
            .append(&self.stream, &shard_id(index), payload)
            .unwrap()
    }

    /// Make the next fetch fail with `error` without touching the iterator.
    pub fn fail_next_fetch(&self, error: LogError) {
        self.fail_fetch_at(self.fetch_calls() + 1, error);
    }

    /// Make the `call`-th fetch (counting from 1) fail with `error`.
    pub fn fail_fetch_at(&self, call: usize, error: LogError) {
        self.fetch_failures.lock().insert(call, error);
    }

    /// From now on every fetch reports the shard as closed.
    pub fn close_shards(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn get_iterator_calls(&self) -> usize {
        self.get_iterator_calls.load(Ordering::SeqCst)
    }
}

impl EventLog for ScriptedLog {
    async fn list_shards(&self, stream: &str) -> Result<Vec<ShardDescriptor>, LogError> {
        self.inner.list_shards(stream).await
    }

    async fn get_iterator(
        &self,
        stream: &str,
        shard_id: &str,
        position: IteratorPosition,
    ) -> Result<IteratorHandle, LogError> {
        self.get_iterator_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_iterator(stream, shard_id, position).await
    }

    async fn fetch(
        &self,
        iterator: &IteratorHandle,
        max_records: usize,
    ) -> Result<FetchResult, LogError> {
        let call = self.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failure = self.fetch_failures.lock().remove(&call);
        if let Some(error) = failure {
            return Err(error);
        }

        let mut result = self.inner.fetch(iterator, max_records).await?;
        if self.closed.load(Ordering::SeqCst) {
            result.next_iterator = None;
        }
        Ok(result)
    }

    async fn put(&self, stream: &str, data: Bytes) -> Result<Cursor, LogError> {
        self.inner.put(stream, data).await
    }
}
