//! HTTP surface: streaming reads, partition listing and publishing.

use std::{convert::Infallible, future::Future, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::{
    cursor::{Cursor, CursorError, parse_cursors},
    log::{EventLog, LogError},
    orchestrator::Orchestrator,
    resolver::{ResolveError, resolve_pollers},
    types::{OptionsError, PartitionView, ServerOptions, StreamingOptions},
};

/// Request header carrying the client's resume cursors.
pub const CURSORS_HEADER: &str = "X-Nakadi-Cursors";

/// Content type of the batch stream.
pub const BATCH_STREAM_CONTENT_TYPE: &str = "application/x-json-stream";

/// Application state shared across handlers.
pub struct AppState<L> {
    pub log: Arc<L>,
    pub options: ServerOptions,
    /// Flips to `true` when the server starts shutting down
    pub shutdown: watch::Receiver<bool>,
}

impl<L> Clone for AppState<L> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            options: self.options.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Per-request overrides for GET requests.
#[derive(Debug, Default, Deserialize)]
pub struct ReadQuery {
    pub batch_limit: Option<usize>,
    /// Seconds
    pub batch_flush_timeout: Option<u64>,
}

impl ReadQuery {
    fn apply(&self, defaults: &StreamingOptions) -> Result<StreamingOptions, OptionsError> {
        let mut options = defaults.clone();
        if let Some(limit) = self.batch_limit {
            options.batch_limit = limit;
        }
        if let Some(seconds) = self.batch_flush_timeout {
            options.flush_timeout = Duration::from_secs(seconds);
        }
        options.validate()?;
        Ok(options)
    }
}

/// Errors returned to HTTP clients.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error("{0}")]
    BadRequest(String),
}

fn log_error_status(err: &LogError) -> StatusCode {
    match err {
        LogError::NotFound(_) | LogError::ShardNotFound { .. } => StatusCode::NOT_FOUND,
        LogError::InvalidSequence(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Cursor(_) | ApiError::Options(_) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Resolve(ResolveError::UnknownPartition(_)) => StatusCode::NOT_FOUND,
            ApiError::Resolve(ResolveError::DuplicatePartition(_)) => StatusCode::BAD_REQUEST,
            ApiError::Resolve(ResolveError::Upstream(err)) | ApiError::Log(err) => {
                log_error_status(err)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        (status, self.to_string()).into_response()
    }
}

/// Create the router with all endpoints.
pub fn create_router<L: EventLog>(state: AppState<L>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/event-types/{name}/events",
            get(handle_read::<L>).post(handle_publish::<L>),
        )
        .route("/event-types/{name}/partitions", get(handle_partitions::<L>))
        .layer(cors)
        .with_state(state)
}

async fn handle_health() -> &'static str {
    "OK"
}

/// GET - Open a batch stream over every shard (or the shards named by the
/// cursors header).
async fn handle_read<L: EventLog>(
    State(state): State<AppState<L>>,
    Path(name): Path<String>,
    Query(query): Query<ReadQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let streaming = query.apply(&state.options.streaming)?;

    let cursors = match headers.get(CURSORS_HEADER) {
        Some(value) => {
            let raw = value.to_str().map_err(|_| {
                ApiError::BadRequest(format!("{} is not valid text", CURSORS_HEADER))
            })?;
            parse_cursors(raw)?
        }
        None => Vec::new(),
    };

    let shards = state.log.list_shards(&name).await?;
    let pollers = resolve_pollers(&state.log, &name, &shards, &cursors, &streaming).await?;
    debug!(stream = %name, shards = pollers.len(), resumed = !cursors.is_empty(), "Opening stream");

    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(state.options.output_buffer.max(1));
    let orchestrator = Orchestrator::new(name, pollers, streaming, state.shutdown.clone());
    tokio::spawn(async move {
        // Termination is logged by the orchestrator itself
        let _ = orchestrator.run(tx).await;
    });

    Ok((
        [(header::CONTENT_TYPE, BATCH_STREAM_CONTENT_TYPE)],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response())
}

/// GET - Describe the partitions of a stream
async fn handle_partitions<L: EventLog>(
    State(state): State<AppState<L>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<PartitionView>>, ApiError> {
    let shards = state.log.list_shards(&name).await?;
    Ok(Json(shards.into_iter().map(PartitionView::from).collect()))
}

/// POST - Publish one event to a random shard
async fn handle_publish<L: EventLog>(
    State(state): State<AppState<L>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Cursor>), ApiError> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("Empty body not allowed".to_string()));
    }

    let cursor = state.log.put(&name, body).await?;
    debug!(stream = %name, partition = %cursor.partition, offset = %cursor.offset, "Published event");
    Ok((StatusCode::CREATED, Json(cursor)))
}

/// Start the server and run until `shutdown` resolves.
///
/// Open streams are told to finish once `shutdown` resolves, and the server
/// returns after they have.
pub async fn start_server<L: EventLog>(
    log: Arc<L>,
    options: ServerOptions,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let state = AppState {
        log,
        options: options.clone(),
        shutdown: stop_rx,
    };

    let router = create_router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting event stream server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutting down, closing open streams");
            stop_tx.send_replace(true);
        })
        .await?;

    Ok(())
}
