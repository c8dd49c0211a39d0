//! Structured logging for sift.
//!
//! Log levels:
//! - ERROR: Fatal run conditions (integrity violations, storage failures)
//! - WARN: Recoverable problems (retries, repaired output, cancelled tasks)
//! - INFO: Run and task lifecycle (dispatch, completion, verdicts)
//! - DEBUG: Detailed traces (chronolog appends, checkpoint writes)
//! - TRACE: Raw payloads
//!
//! Debug mode can be enabled with `--debug` flag or `SIFT_DEBUG=1` env var.
//! `RUST_LOG` always takes precedence when set.
//!
//! Logs are diagnostics only. What actually happened during a run is recorded
//! in the chronolog.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging to stderr at INFO level.
pub fn init() {
    init_with_debug(false, None);
}

/// Initialize logging with explicit debug mode and an optional log file.
///
/// Calling this more than once is harmless; only the first subscriber wins.
pub fn init_with_debug(debug: bool, log_file: Option<&Path>) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let file = log_file.and_then(|path| {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        OpenOptions::new().create(true).append(true).open(path).ok()
    });

    let _ = match file {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn env_debug() -> bool {
    std::env::var("SIFT_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "sift=debug"
    } else {
        "sift=info"
    }
}
