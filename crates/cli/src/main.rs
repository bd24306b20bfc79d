use std::{
    path::{Path, PathBuf},
    process,
};

use clap::{Parser, Subcommand};

mod check;
mod manifest;
mod serve;

use manifest::Manifest;

#[derive(Clone, Debug)]
pub struct Context {
    pub manifest_path: PathBuf,
    pub manifest: Manifest,
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "Shardcast - stream sharded event logs over HTTP", long_about = None)]
struct Opts {
    /// Path to the shardcast.yaml manifest file (default: ./shardcast.yaml)
    #[arg(
        long = "manifest-path",
        short = 'm',
        global = true,
        default_value = "./shardcast.yaml"
    )]
    manifest_path: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Start the event stream server
    Serve(serve::ServeCommand),
    /// Validate the manifest and print the effective configuration
    Check(check::CheckCommand),
}

#[tokio::main]
async fn main() {
    let opts: Opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            let _ = e.print();
            process::exit(e.exit_code());
        }
    };

    // Get the directory containing the manifest file
    let manifest_dir = opts
        .manifest_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    load_env_file(&manifest_dir);

    let manifest = match Manifest::load(&opts.manifest_path) {
        Ok(manifest) => {
            eprintln!("✓ Loaded manifest from {}", opts.manifest_path.display());
            manifest
        }
        Err(e) => {
            eprintln!("Warning: {}", e);
            eprintln!("Using default configuration...");
            Manifest::default()
        }
    };

    let ctx = Context {
        manifest_path: opts.manifest_path.clone(),
        manifest,
    };

    if let Err(e) = handle_command(opts, &ctx).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Load environment variables from .env file in the manifest directory
fn load_env_file(manifest_dir: &Path) {
    let env_file_path = manifest_dir.join(".env");

    match dotenvy::from_path(&env_file_path) {
        Ok(_) => {
            eprintln!("✓ Loaded environment from {}", env_file_path.display());
        }
        Err(e) if e.not_found() => {
            // .env file not found is fine, just continue silently
        }
        Err(e) => {
            eprintln!(
                "Warning: Failed to load .env file at {}: {}",
                env_file_path.display(),
                e
            );
        }
    }
}

async fn handle_command(opts: Opts, ctx: &Context) -> Result<(), String> {
    match opts.command {
        Command::Serve(cmd) => cmd.execute(ctx).await.map_err(|e| e.to_string()),
        Command::Check(cmd) => cmd.execute(ctx),
    }
}
