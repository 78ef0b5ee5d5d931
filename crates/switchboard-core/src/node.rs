//! Node processes and the two pump tasks that connect them to the router.
//!
//! ```text
//!            inbound pump                      outbound pump
//! node stdout ---------> Router::route_line --> inbox --------> node stdin
//! ```
//!
//! Each node has exactly one inbound pump (its stdout, any destination) and
//! one outbound pump (its own inbox, its stdin). The inbound pump owns the
//! child process and performs the `Exited` transition once stdout closes.

use std::fmt;
use std::path::Path;
use std::process::Stdio;

use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::router::Router;

/// Lifecycle of a node.
///
/// ```text
/// starting -> running -> exited
/// starting -> exited          (spawn failed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Registered with an inbox; the process is being spawned.
    Starting,
    /// The process is running and both pumps are active.
    Running,
    /// The process has exited (or never started); its inbox is released.
    Exited,
}

impl NodeState {
    pub fn is_valid_transition(from: NodeState, to: NodeState) -> bool {
        matches!(
            (from, to),
            (NodeState::Starting, NodeState::Running)
                | (NodeState::Starting, NodeState::Exited)
                | (NodeState::Running, NodeState::Exited)
        )
    }

    /// Whether the node can still receive envelopes.
    pub fn is_live(self) -> bool {
        !matches!(self, NodeState::Exited)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// A freshly spawned node process with its pipes taken out.
pub(crate) struct NodeProcess {
    pub child: Child,
    pub pid: Option<u32>,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Spawn `executable` with stdin/stdout piped and stderr going to `stderr`.
pub(crate) fn spawn_process(
    executable: &Path,
    stderr: std::fs::File,
) -> std::io::Result<NodeProcess> {
    let mut cmd = Command::new(executable);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let pid = child.id();
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(std::io::Error::other("child process pipes were not attached"));
    };

    Ok(NodeProcess {
        child,
        pid,
        stdin,
        stdout,
    })
}

/// Stream the raw lines of `reader`, without their trailing newline.
///
/// Lines are yielded as bytes so a node that writes invalid UTF-8 produces a
/// decode failure for that line instead of ending the stream.
pub(crate) fn raw_lines<R>(reader: R) -> impl Stream<Item = std::io::Result<Vec<u8>>> + Send
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async_stream::stream! {
        let mut reader = BufReader::new(reader);
        loop {
            let mut buf = Vec::new();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                    }
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                    yield Ok(buf);
                }
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    }
}

/// Read `stdout` until it closes, routing every line, then reap the child
/// and mark the node exited.
pub(crate) async fn run_inbound(
    router: Router,
    name: String,
    stdout: ChildStdout,
    mut child: Child,
    cancel: CancellationToken,
) {
    pump_lines(&router, &name, stdout).await;
    debug!(node = %name, "stdout closed");

    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(node = %name, error = %e, "failed to wait for node process");
            None
        }
    };

    cancel.cancel();
    router.node_exited(&name, code).await;
}

/// Route every line of `reader` as output of node `name`.
pub(crate) async fn pump_lines<R>(router: &Router, name: &str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = Box::pin(raw_lines(reader));
    while let Some(line) = lines.next().await {
        match line {
            Ok(bytes) => {
                if bytes.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match String::from_utf8(bytes) {
                    Ok(line) => {
                        let _ = router.route_line(name, line).await;
                    }
                    Err(e) => router.record_decode_failure(name, &e.to_string()),
                }
            }
            Err(e) => {
                warn!(node = %name, error = %e, "error reading node stdout");
                break;
            }
        }
    }
}

/// Write `init`, then every line arriving on `inbox`, to `stdin` until the
/// node exits or the inbox closes.
pub(crate) async fn run_outbound<W>(
    router: Router,
    name: String,
    stdin: W,
    init: String,
    mut inbox: mpsc::Receiver<String>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(stdin);
    if let Err(e) = write_line(&mut writer, &init).await {
        router.record_write_failure(&name, &e);
    }
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = inbox.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        if let Err(e) = write_line(&mut writer, &line).await {
            router.record_write_failure(&name, &e);
        }
    }
    debug!(node = %name, "outbound pump finished");
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Log a node's exit at the appropriate level.
pub(crate) fn log_exit(name: &str, code: Option<i32>) {
    match code {
        Some(0) => info!(node = %name, "node exited"),
        Some(code) => warn!(node = %name, code, "node exited with non-zero status"),
        None => warn!(node = %name, "node terminated by signal"),
    }
}
