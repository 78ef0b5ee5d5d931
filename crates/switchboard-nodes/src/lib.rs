//! Runtime and example nodes for the switchboard router.
//!
//! Nodes speak newline-delimited JSON envelopes on stdin/stdout. stdout is
//! reserved for envelopes, so everything here logs to stderr, which the
//! router captures into the run's `node_logs/<name>.log`.

pub mod service;

use std::time::Duration;

pub use service::{NodeContext, NodeError, Service, run_node, serve};

/// Initialize tracing for a node binary. Logs go to stderr.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// Read a millisecond duration from `var`, falling back to `default_ms`
/// when unset or unparsable.
pub fn duration_from_env(var: &str, default_ms: u64) -> Duration {
    Duration::from_millis(parse_millis(std::env::var(var).ok().as_deref(), default_ms))
}

fn parse_millis(value: Option<&str>, default_ms: u64) -> u64 {
    match value.map(str::trim) {
        Some(raw) => match raw.parse() {
            Ok(ms) => ms,
            Err(_) => {
                tracing::warn!(value = %raw, default_ms, "ignoring unparsable duration");
                default_ms
            }
        },
        None => default_ms,
    }
}
