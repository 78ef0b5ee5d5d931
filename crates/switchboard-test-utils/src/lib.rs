//! Shared test utilities for switchboard integration tests.
//!
//! Nodes under test are small `/bin/sh` scripts written into a temp
//! directory. Their stderr lands in the run's `node_logs/<name>.log`, so
//! tests observe what a node read by having it echo stdin lines to stderr
//! and then polling that log file.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long the polling helpers wait before giving up.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A node that logs every stdin line to stderr and never writes to stdout.
pub const SINK_NODE: &str = "while IFS= read -r line; do printf '%s\\n' \"$line\" >&2; done\n";

/// Write an executable `/bin/sh` script named `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}"))
        .unwrap_or_else(|e| panic!("failed to write script {}: {e}", path.display()));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .unwrap_or_else(|e| panic!("failed to chmod script {}: {e}", path.display()));
    }

    path
}

/// Poll `check` until it returns `Some`, panicking after `timeout`.
pub async fn wait_for<T, F, Fut>(what: &str, timeout: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out after {timeout:?} waiting for {what}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Non-empty lines currently in the file at `path` (empty if missing).
pub fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_owned)
        .collect()
}

/// Wait until the file at `path` holds at least `count` non-empty lines and
/// return them.
pub async fn wait_for_lines(path: &Path, count: usize) -> Vec<String> {
    let what = format!("{count} lines in {}", path.display());
    wait_for(&what, DEFAULT_WAIT, move || async move {
        let lines = read_lines(path);
        (lines.len() >= count).then_some(lines)
    })
    .await
}

/// Wait until some line of the file at `path` contains `needle`.
pub async fn wait_for_line_containing(path: &Path, needle: &str) -> String {
    let what = format!("{needle:?} in {}", path.display());
    wait_for(&what, DEFAULT_WAIT, move || async move {
        read_lines(path).into_iter().find(|l| l.contains(needle))
    })
    .await
}
