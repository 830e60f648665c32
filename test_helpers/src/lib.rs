//! Utilities shared by tests across the workspace.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

/// Create a temporary directory that is removed on drop.
pub fn tmp_dir() -> std::io::Result<tempfile::TempDir> {
    let _ = std::fs::create_dir(".tmp");
    tempfile::Builder::new()
        .prefix("tracedb")
        .tempdir_in(".tmp")
}

static LOG_SETUP: Lazy<()> = Lazy::new(|| {
    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    }
});

/// Install a tracing subscriber for the current test binary if `RUST_LOG` is
/// set. Safe to call from every test; only the first call has any effect.
pub fn maybe_start_logging() {
    Lazy::force(&LOG_SETUP);
}
