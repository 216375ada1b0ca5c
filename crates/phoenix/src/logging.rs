//! Logging initialization: console plus append-only file log

use anyhow::Result;
use std::path::Path;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LOG_FILE: &str = "/var/log/phoenix/phoenix.log";

/// Initialize tracing once: env-filtered console output and, when the log
/// path is writable, an append-only plain-text file log with ISO-8601
/// timestamps. `PHOENIX_DEBUG=1` raises the default level to debug;
/// `RUST_LOG` still wins when set.
pub fn init() -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let default_level = if crate::cli::env_truthy("PHOENIX_DEBUG") {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;

    let fmt_layer = fmt::layer().with_target(false);
    let error_layer = tracing_error::ErrorLayer::default();
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(error_layer)
        .with(fmt_layer);

    match open_log_file() {
        Ok(file) => {
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(std::sync::Arc::new(file));
            registry.with(file_layer).init();
        }
        Err(e) => {
            // A fresh host may not have the log directory yet; console-only
            // is still a working orchestrator.
            registry.init();
            tracing::warn!(error = %e, "file log unavailable, logging to console only");
        }
    }
    Ok(())
}

fn open_log_file() -> std::io::Result<std::fs::File> {
    let path =
        std::env::var("PHOENIX_LOG_FILE").unwrap_or_else(|_| DEFAULT_LOG_FILE.to_string());
    if let Some(parent) = Path::new(&path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
}
