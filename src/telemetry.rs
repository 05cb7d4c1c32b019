//! Test/example tracing bootstrap (§10).
//!
//! The engine itself only ever calls into `tracing`'s macros; it never
//! installs a subscriber, since that is an application-level decision
//! (`pgdog`'s own `main.rs` does the same). This module is the one the
//! crate's own `tests/` binaries and downstream examples can reach for when
//! they want to see `shard_execution` spans on stderr.

use tracing_subscriber::EnvFilter;

/// Installs an `EnvFilter`-driven `fmt` subscriber for the current test
/// binary, honoring `RUST_LOG` and defaulting to `info` otherwise.
///
/// Safe to call more than once (e.g. from several integration test
/// functions in the same binary): subsequent calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}
