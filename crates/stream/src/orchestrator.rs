//! Per-connection streaming loop.
//!
//! An [`Orchestrator`] owns the pollers of one client connection and visits
//! them round-robin in a fixed order. Each visit flushes a full batch when
//! one is available, or whatever is buffered (possibly nothing) once the
//! shard has gone `flush_timeout` without a flush. Throttling pauses every
//! shard of the connection; any other upstream failure ends the connection.

use std::{convert::Infallible, future::Future, time::Duration};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    batch::{Batch, encode_line},
    log::{EventLog, LogError},
    poller::ShardPoller,
    types::StreamingOptions,
};

/// The receiving side of a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerDisconnected;

/// Destination for encoded batch lines.
pub trait BatchSink: Send {
    fn write(&mut self, line: Bytes) -> impl Future<Output = Result<(), PeerDisconnected>> + Send;

    /// Whether the peer is known to be gone without attempting a write.
    fn is_closed(&self) -> bool {
        false
    }
}

impl BatchSink for mpsc::Sender<Result<Bytes, Infallible>> {
    async fn write(&mut self, line: Bytes) -> Result<(), PeerDisconnected> {
        self.send(Ok(line)).await.map_err(|_| PeerDisconnected)
    }

    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Streaming,
    Throttled,
    Terminated,
}

/// Why a stream ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    PeerDisconnected,
    Shutdown,
}

/// Failures that end a single connection.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Upstream failure on partition {partition}: {source}")]
    Upstream {
        partition: String,
        #[source]
        source: LogError,
    },

    #[error("Failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What interrupted a pass over the pollers.
enum Interrupt {
    Throttled(LogError),
    Disconnected,
    Failed(StreamError),
}

pub struct Orchestrator<L> {
    stream: String,
    pollers: Vec<ShardPoller<L>>,
    options: StreamingOptions,
    shutdown: watch::Receiver<bool>,
    state: StreamState,
}

impl<L: EventLog> Orchestrator<L> {
    pub fn new(
        stream: impl Into<String>,
        pollers: Vec<ShardPoller<L>>,
        options: StreamingOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream: stream.into(),
            pollers,
            options,
            shutdown,
            state: StreamState::Streaming,
        }
    }

    /// Drive the connection until the peer leaves, shutdown is signalled or
    /// the upstream fails.
    pub async fn run<S: BatchSink>(mut self, mut sink: S) -> Result<Termination, StreamError> {
        info!(stream = %self.stream, shards = self.pollers.len(), "Stream opened");

        let outcome = loop {
            if *self.shutdown.borrow() {
                break Ok(Termination::Shutdown);
            }
            if sink.is_closed() {
                break Ok(Termination::PeerDisconnected);
            }

            match self.step(&mut sink).await {
                Ok(true) => tokio::task::yield_now().await,
                Ok(false) => {
                    if self.pause(self.options.poll_interval).await {
                        break Ok(Termination::Shutdown);
                    }
                }
                Err(Interrupt::Throttled(err)) => {
                    warn!(
                        stream = %self.stream,
                        backoff_ms = self.options.throttle_backoff.as_millis() as u64,
                        "{}", err
                    );
                    self.transition(StreamState::Throttled);
                    if self.pause(self.options.throttle_backoff).await {
                        break Ok(Termination::Shutdown);
                    }
                    self.transition(StreamState::Streaming);
                }
                Err(Interrupt::Disconnected) => break Ok(Termination::PeerDisconnected),
                Err(Interrupt::Failed(err)) => break Err(err),
            }
        };

        self.transition(StreamState::Terminated);
        match &outcome {
            Ok(Termination::PeerDisconnected) => {
                debug!(stream = %self.stream, "Peer disconnected");
            }
            Ok(Termination::Shutdown) => {
                info!(stream = %self.stream, "Stream closed for shutdown");
            }
            Err(err) => {
                error!(stream = %self.stream, "Stream failed: {}", err);
            }
        }
        outcome
    }

    /// One pass over every poller. Returns whether anything was written.
    async fn step<S: BatchSink>(&mut self, sink: &mut S) -> Result<bool, Interrupt> {
        let mut flushed = false;

        for poller in &mut self.pollers {
            let batch = match poller.take_full_batch(self.options.batch_limit).await {
                Ok(Some(batch)) => Some(batch),
                Ok(None) if poller.last_flush().elapsed() >= self.options.flush_timeout => {
                    Some(poller.take_remainder())
                }
                Ok(None) => None,
                Err(err) if err.is_throttled() => return Err(Interrupt::Throttled(err)),
                Err(source) => {
                    return Err(Interrupt::Failed(StreamError::Upstream {
                        partition: poller.partition().to_string(),
                        source,
                    }));
                }
            };

            if let Some(batch) = batch {
                write_batch(sink, &batch, poller.millis_behind_latest()).await?;
                poller.mark_flushed(Instant::now());
                flushed = true;
            }
        }
        Ok(flushed)
    }

    /// Sleep for `duration`. Returns true if shutdown was signalled meanwhile.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = shutdown_signalled(&mut self.shutdown) => true,
        }
    }

    fn transition(&mut self, next: StreamState) {
        if self.state != next {
            debug!(stream = %self.stream, from = ?self.state, to = ?next, "Stream state changed");
            self.state = next;
        }
    }
}

async fn write_batch<S: BatchSink>(
    sink: &mut S,
    batch: &Batch,
    millis_behind_latest: u64,
) -> Result<(), Interrupt> {
    let line = encode_line(batch).map_err(|err| Interrupt::Failed(err.into()))?;
    trace!(
        partition = %batch.cursor.partition,
        offset = %batch.cursor.offset,
        events = batch.events.len(),
        millis_behind_latest,
        "Flushing batch"
    );
    sink.write(line).await.map_err(|_| Interrupt::Disconnected)
}

/// Resolves once shutdown is signalled; never if the signal can no longer
/// be sent.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let signalled = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !signalled {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        cursor::{Cursor, Offset},
        resolver::resolve_pollers,
        store::{format_sequence, shard_id},
        testing::ScriptedLog,
    };

    /// Collects decoded batches with the virtual time they were written at.
    #[derive(Clone)]
    struct RecordingSink {
        batches: Arc<Mutex<Vec<(Duration, Batch)>>>,
        started: Instant,
        accept: Option<usize>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                batches: Arc::new(Mutex::new(Vec::new())),
                started: Instant::now(),
                accept: None,
            }
        }

        /// Reports the peer gone after `count` writes.
        fn accepting(count: usize) -> Self {
            Self {
                accept: Some(count),
                ..Self::new()
            }
        }

        fn batches(&self) -> Vec<(Duration, Batch)> {
            self.batches.lock().clone()
        }

        fn for_partition(&self, partition: &str) -> Vec<(Duration, Batch)> {
            self.batches()
                .into_iter()
                .filter(|(_, batch)| batch.cursor.partition == partition)
                .collect()
        }

        fn events(&self) -> Vec<String> {
            self.batches()
                .into_iter()
                .flat_map(|(_, batch)| batch.events)
                .collect()
        }
    }

    impl BatchSink for RecordingSink {
        async fn write(&mut self, line: Bytes) -> Result<(), PeerDisconnected> {
            let mut batches = self.batches.lock();
            if self.accept.is_some_and(|limit| batches.len() >= limit) {
                return Err(PeerDisconnected);
            }
            assert_eq!(line.last(), Some(&b'\n'));
            let batch: Batch = serde_json::from_slice(&line).unwrap();
            batches.push((self.started.elapsed(), batch));
            Ok(())
        }
    }

    fn options(batch_limit: usize) -> StreamingOptions {
        StreamingOptions {
            batch_limit,
            ..Default::default()
        }
    }

    async fn orchestrator(
        log: &Arc<ScriptedLog>,
        cursors: &[Cursor],
        options: StreamingOptions,
    ) -> (Orchestrator<ScriptedLog>, watch::Sender<bool>) {
        let shards = log.list_shards("orders").await.unwrap();
        let pollers = resolve_pollers(log, "orders", &shards, cursors, &options)
            .await
            .unwrap();
        let (tx, rx) = watch::channel(false);
        (Orchestrator::new("orders", pollers, options, rx), tx)
    }

    fn begin_all(shards: usize) -> Vec<Cursor> {
        (0..shards)
            .map(|i| Cursor::new(shard_id(i), Offset::Begin))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_shard_scenario() {
        let log = ScriptedLog::with_stream("orders", 2);
        for payload in ["e0", "e1", "e2", "e3", "e4"] {
            log.append(0, payload);
        }
        let (orchestrator, shutdown) = orchestrator(&log, &begin_all(2), options(2)).await;
        let sink = RecordingSink::new();
        let handle = tokio::spawn(orchestrator.run(sink.clone()));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        shutdown.send(true).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), Termination::Shutdown);

        let a = sink.for_partition(&shard_id(0));
        let sizes: Vec<usize> = a.iter().map(|(_, b)| b.events.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(a[0].0 < Duration::from_millis(100));
        assert!(a[1].0 < Duration::from_millis(100));
        assert!(a[2].0 >= Duration::from_secs(1));
        assert_eq!(
            a[2].1.cursor.offset,
            Offset::Sequence(format_sequence(4))
        );

        let b = sink.for_partition(&shard_id(1));
        assert_eq!(b.len(), 1);
        assert!(b[0].1.is_heartbeat());
        assert_eq!(b[0].1.cursor.offset, Offset::Begin);
        assert!(b[0].0 >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_never_exceed_limit() {
        let log = ScriptedLog::with_stream("orders", 1);
        let expected: Vec<String> = (0..10).map(|i| format!("e{}", i)).collect();
        for payload in &expected {
            log.append(0, payload.clone());
        }
        let (orchestrator, shutdown) = orchestrator(&log, &begin_all(1), options(3)).await;
        let sink = RecordingSink::new();
        let handle = tokio::spawn(orchestrator.run(sink.clone()));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        shutdown.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let sizes: Vec<usize> = sink.batches().iter().map(|(_, b)| b.events.len()).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
        assert_eq!(sink.events(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_shard_heartbeats_on_timeout() {
        let log = ScriptedLog::with_stream("orders", 1);
        let (orchestrator, shutdown) = orchestrator(&log, &[], options(10)).await;
        let sink = RecordingSink::new();
        let handle = tokio::spawn(orchestrator.run(sink.clone()));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        shutdown.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let batches = sink.batches();
        assert_eq!(batches.len(), 3);
        for (i, (at, batch)) in batches.iter().enumerate() {
            assert!(batch.is_heartbeat());
            assert_eq!(batch.cursor.offset, Offset::Latest);
            assert!(*at >= Duration::from_secs(i as u64 + 1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_pauses_without_loss() {
        let log = ScriptedLog::with_stream("orders", 1);
        for payload in ["a", "b", "c", "d"] {
            log.append(0, payload);
        }
        log.fail_next_fetch(LogError::Throttled(shard_id(0)));
        let (orchestrator, shutdown) = orchestrator(&log, &begin_all(1), options(2)).await;
        let sink = RecordingSink::new();
        let handle = tokio::spawn(orchestrator.run(sink.clone()));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        shutdown.send(true).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), Termination::Shutdown);

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert!(batches[0].0 >= StreamingOptions::default().throttle_backoff);
        assert_eq!(sink.events(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_throttle_backoff() {
        let log = ScriptedLog::with_stream("orders", 1);
        log.fail_next_fetch(LogError::Throttled(shard_id(0)));
        let (orchestrator, shutdown) = orchestrator(&log, &[], options(2)).await;
        let handle = tokio::spawn(orchestrator.run(RecordingSink::new()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.send(true).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), Termination::Shutdown);
        assert_eq!(log.fetch_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_disconnect_ends_stream() {
        let log = ScriptedLog::with_stream("orders", 1);
        for payload in ["a", "b", "c", "d"] {
            log.append(0, payload);
        }
        let (orchestrator, _shutdown) = orchestrator(&log, &begin_all(1), options(1)).await;
        let sink = RecordingSink::accepting(2);

        let end = orchestrator.run(sink.clone()).await.unwrap();
        assert_eq!(end, Termination::PeerDisconnected);
        assert_eq!(sink.events(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_ends_stream() {
        let log = ScriptedLog::with_stream("orders", 1);
        let (orchestrator, _shutdown) = orchestrator(&log, &[], options(1)).await;
        let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(1);
        drop(rx);

        let end = orchestrator.run(tx).await.unwrap();
        assert_eq!(end, Termination::PeerDisconnected);
        assert_eq!(log.fetch_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_failure_keeps_flushed_output() {
        let log = ScriptedLog::with_stream("orders", 2);
        for payload in ["a", "b", "c"] {
            log.append(0, payload);
        }
        // Fetches 1 and 2 read both shards, fetch 3 is shard 0 topping up
        log.fail_fetch_at(3, LogError::Protocol("connection reset".to_string()));
        let (orchestrator, _shutdown) = orchestrator(&log, &begin_all(2), options(2)).await;
        let sink = RecordingSink::new();

        let err = orchestrator.run(sink.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            StreamError::Upstream { ref partition, source: LogError::Protocol(_) }
                if *partition == shard_id(0)
        ));
        assert_eq!(sink.batches().len(), 1);
        assert_eq!(sink.events(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_from_cursor_is_idempotent() {
        let log = ScriptedLog::with_stream("orders", 1);
        for i in 0..6 {
            log.append(0, format!("e{}", i));
        }

        let (first, _shutdown) = orchestrator(&log, &begin_all(1), options(2)).await;
        let sink = RecordingSink::accepting(3);
        first.run(sink.clone()).await.unwrap();
        let seen = sink.batches();
        assert_eq!(seen.len(), 3);
        let resume = seen[0].1.cursor.clone();
        assert_eq!(resume.offset, Offset::Sequence(format_sequence(1)));

        for _ in 0..2 {
            let (again, _shutdown) = orchestrator(&log, &[resume.clone()], options(2)).await;
            let sink = RecordingSink::accepting(2);
            again.run(sink.clone()).await.unwrap();
            assert_eq!(sink.events(), vec!["e2", "e3", "e4", "e5"]);
            let cursors: Vec<Cursor> = sink.batches().into_iter().map(|(_, b)| b.cursor).collect();
            let expected: Vec<Cursor> = seen[1..].iter().map(|(_, b)| b.cursor.clone()).collect();
            assert_eq!(cursors, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_shard_keeps_heartbeating() {
        let log = ScriptedLog::with_stream("orders", 1);
        log.append(0, "a");
        log.close_shards();
        let (orchestrator, shutdown) = orchestrator(&log, &begin_all(1), options(5)).await;
        let sink = RecordingSink::new();
        let handle = tokio::spawn(orchestrator.run(sink.clone()));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].1.events, vec!["a"]);
        assert!(batches[1].1.is_heartbeat());
        assert_eq!(batches[1].1.cursor.offset, Offset::Sequence(format_sequence(0)));
        assert_eq!(log.fetch_calls(), 1);
    }
}
