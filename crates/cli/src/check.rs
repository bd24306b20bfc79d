use std::fmt::Write;

use console::style;

use crate::{
    Context,
    manifest::{LoadManifestError, Manifest},
};

#[derive(Debug, Clone, PartialEq, clap::Args)]
pub struct CheckCommand {}

impl CheckCommand {
    pub fn execute(&self, ctx: &Context) -> Result<(), String> {
        // Load again so a manifest that failed to parse fails the check
        let manifest = match Manifest::load(&ctx.manifest_path) {
            Ok(manifest) => manifest,
            Err(LoadManifestError::FileNotFound(path)) => {
                println!(
                    "{} {} not found, checking the default configuration",
                    style("Note:").yellow(),
                    path.display()
                );
                Manifest::default()
            }
            Err(e) => return Err(e.to_string()),
        };

        manifest.validate().map_err(|e| e.to_string())?;

        print!("{}", describe(&manifest));
        println!("{}", style("✓ Configuration is valid").green());
        Ok(())
    }
}

/// Human-readable summary of the effective configuration.
fn describe(manifest: &Manifest) -> String {
    let options = manifest.server_options();
    let streaming = &options.streaming;
    let mut out = String::new();

    let _ = writeln!(out, "{}", style("Server").dim());
    let _ = writeln!(out, "  listen         {}:{}", options.host, options.port);
    let _ = writeln!(out, "  output buffer  {}", options.output_buffer);

    let _ = writeln!(out, "{}", style("Streaming").dim());
    let _ = writeln!(out, "  batch limit    {}", streaming.batch_limit);
    let _ = writeln!(out, "  flush timeout  {:?}", streaming.flush_timeout);
    let _ = writeln!(out, "  fetch limit    {}", streaming.fetch_limit);
    let _ = writeln!(out, "  idle backoff   {:?}", streaming.idle_backoff);
    let _ = writeln!(out, "  poll interval  {:?}", streaming.poll_interval);
    let _ = writeln!(out, "  throttle pause {:?}", streaming.throttle_backoff);

    let log = &manifest.log;
    let _ = writeln!(out, "{}", style("Log").dim());
    let _ = writeln!(
        out,
        "  retention      {}",
        log.retention_records
            .map(|n| format!("{} records per shard", n))
            .unwrap_or_else(|| "unbounded".to_string())
    );
    let _ = writeln!(
        out,
        "  fetch limit    {}",
        log.fetch_rate_limit
            .map(|n| format!("{} per shard per second", n))
            .unwrap_or_else(|| "unlimited".to_string())
    );
    let _ = writeln!(out, "  iterator ttl   {}s", log.iterator_ttl_secs);

    let _ = writeln!(out, "{}", style("Streams").dim());
    if manifest.streams.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for (name, stream) in &manifest.streams {
        let _ = writeln!(out, "  {:<14} {} shards", name, stream.shards);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use tempfile::TempDir;

    use super::*;
    use crate::manifest::{MANIFEST_FILE_NAME, StreamConfig};

    fn context(path: &Path) -> Context {
        Context {
            manifest_path: path.to_path_buf(),
            manifest: Manifest::default(),
        }
    }

    #[test]
    fn test_check_manifest_files() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(MANIFEST_FILE_NAME);
        let cmd = CheckCommand {};

        // Missing manifest checks the defaults
        assert!(cmd.execute(&context(&path)).is_ok());

        fs::write(&path, "streams:\n  orders:\n    shards: 2\n").unwrap();
        assert!(cmd.execute(&context(&path)).is_ok());

        fs::write(&path, "streams:\n  orders:\n    shards: 0\n").unwrap();
        let err = cmd.execute(&context(&path)).unwrap_err();
        assert!(err.contains("orders"));

        fs::write(&path, "streams: [").unwrap();
        assert!(cmd.execute(&context(&path)).unwrap_err().contains("Failed to parse"));
    }

    #[test]
    fn test_describe_lists_streams_in_order() {
        let mut manifest = Manifest::default();
        manifest
            .streams
            .insert("orders".to_string(), StreamConfig { shards: 4 });
        manifest
            .streams
            .insert("audit".to_string(), StreamConfig { shards: 1 });

        let summary = describe(&manifest);
        assert!(summary.contains("127.0.0.1:8080"));
        assert!(summary.contains("unbounded"));

        let orders = summary.find("orders").unwrap();
        let audit = summary.find("audit").unwrap();
        assert!(orders < audit);
        assert!(summary.contains("4 shards"));
    }

    #[test]
    fn test_describe_without_streams() {
        let summary = describe(&Manifest::default());
        assert!(summary.contains("(none)"));
    }
}
