use std::sync::Arc;

use console::style;
use shardcast_stream::{LogError, MemoryLog, ServerOptions, start_server};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{Context, manifest::ManifestError};

#[derive(Debug, Clone, PartialEq, clap::Args)]
pub struct ServeCommand {
    /// Host to bind to (overrides the manifest)
    #[arg(long, env = "SHARDCAST_HOST")]
    pub host: Option<String>,

    /// Port to run the server on (overrides the manifest)
    #[arg(long, short = 'p', env = "SHARDCAST_PORT")]
    pub port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("Failed to create stream {name}: {source}")]
    CreateStream { name: String, source: LogError },
    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServeCommand {
    pub async fn execute(&self, ctx: &Context) -> Result<(), ServeError> {
        ctx.manifest.validate()?;
        let options = self.server_options(ctx);
        let log = build_log(ctx)?;

        println!();
        println!("{}", style("Shardcast").green());
        println!("{}", style("Starting event stream server").dim());
        println!();

        if ctx.manifest.streams.is_empty() {
            eprintln!(
                "{} No streams declared in the manifest, every read will return 404",
                style("Warning:").yellow()
            );
        }
        for (name, stream) in &ctx.manifest.streams {
            println!(
                "{} {} {}",
                style("Stream").dim(),
                name,
                style(format!("({} shards)", stream.shards)).dim()
            );
        }
        println!();

        let base = format!("http://{}:{}", options.host, options.port);
        println!("{}", style("Endpoints").dim());
        println!("  GET  {}/event-types/{{name}}/events", base);
        println!("  POST {}/event-types/{{name}}/events", base);
        println!("  GET  {}/event-types/{{name}}/partitions", base);
        println!("  GET  {}/health", base);
        println!();
        println!("{}", style("Press Ctrl+C to stop").dim());
        println!();

        init_tracing(&ctx.manifest.log_level);

        start_server(log, options, shutdown_signal()).await?;
        info!("Server stopped");
        Ok(())
    }

    fn server_options(&self, ctx: &Context) -> ServerOptions {
        let mut options = ctx.manifest.server_options();
        if let Some(host) = &self.host {
            options.host = host.clone();
        }
        if let Some(port) = self.port {
            options.port = port;
        }
        options
    }
}

/// Create the in-memory log with every stream the manifest declares.
fn build_log(ctx: &Context) -> Result<Arc<MemoryLog>, ServeError> {
    let log = MemoryLog::new(ctx.manifest.log.to_options());
    for (name, stream) in &ctx.manifest.streams {
        log.create_stream(name, stream.shards)
            .map_err(|source| ServeError::CreateStream {
                name: name.clone(),
                source,
            })?;
    }
    Ok(log)
}

/// RUST_LOG wins over the manifest's log_level.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
