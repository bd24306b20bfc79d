//! Shardcast Stream
//!
//! Streams a sharded, pull-based event log to HTTP clients as long-lived
//! newline-delimited JSON, with per-shard cursors clients can resume from.
//!
//! # Features
//!
//! - **Per-shard pollers**: each shard is read through rotating single-use iterators
//! - **Size-or-timeout flushing**: a shard flushes on a full batch or after its flush timeout
//! - **Heartbeats**: idle shards emit empty batches carrying their cursor
//! - **Resumable cursors**: `BEGIN`, `LATEST` or the exact marker last seen
//! - **Throttle tolerance**: read throughput errors pause the connection instead of closing it
//! - **In-memory log**: a bundled backend with retention, rate limits and iterator expiry
//!
//! # Example
//!
//! ```rust,no_run
//! use shardcast_stream::{server, store::MemoryLog, types::ServerOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let log = MemoryLog::new(Default::default());
//!     log.create_stream("orders", 4).unwrap();
//!
//!     let options = ServerOptions {
//!         port: 8080,
//!         ..Default::default()
//!     };
//!     let shutdown = async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     };
//!
//!     server::start_server(log, options, shutdown).await.unwrap();
//! }
//! ```
//!
//! # Protocol
//!
//! ## Streaming events
//!
//! ```text
//! GET /event-types/orders/events?batch_limit=2 HTTP/1.1
//! X-Nakadi-Cursors: [{"partition": "shardId-000000000000", "offset": "BEGIN"}]
//!
//! Response: 200 OK
//! Content-Type: application/x-json-stream
//!
//! {"cursor":{"partition":"shardId-000000000000","offset":"00000000000000000001"},"events":["{\"id\":1}","{\"id\":2}"]}
//! {"cursor":{"partition":"shardId-000000000000","offset":"00000000000000000001"},"events":[]}
//! ```
//!
//! ## Listing partitions
//!
//! ```text
//! GET /event-types/orders/partitions HTTP/1.1
//!
//! Response: 200 OK
//! [{"partition":"shardId-000000000000","oldest_available_offset":"00000000000000000000","newest_available_offset":"00000000000000000001"}]
//! ```
//!
//! ## Publishing
//!
//! ```text
//! POST /event-types/orders/events HTTP/1.1
//!
//! {"id": 3}
//!
//! Response: 201 Created
//! {"partition":"shardId-000000000000","offset":"00000000000000000002"}
//! ```

pub mod batch;
pub mod cursor;
pub mod log;
pub mod orchestrator;
pub mod poller;
pub mod resolver;
pub mod server;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export commonly used items
pub use cursor::{Cursor, Offset};
pub use log::{EventLog, LogError};
pub use orchestrator::{Orchestrator, StreamError, Termination};
pub use server::{AppState, create_router, start_server};
pub use store::{MemoryLog, MemoryLogOptions};
pub use types::{ServerOptions, StreamingOptions};
