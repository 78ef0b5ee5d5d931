//! The router: starts nodes, routes their output, and supervises their exit.
//!
//! A [`Router`] is a cheap handle (`Clone`) around shared state: the node
//! [`Registry`], the [`Run`] that node logs are written into, an event
//! channel, and delivery counters. Every pump task holds its own clone.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::envelope::{self, DecodeError, Envelope};
use crate::error::StartError;
use crate::node::{self, NodeState};
use crate::registry::{LocalRegistry, NodeInfo, Registry, RegistryError};
use crate::store::Run;

/// Default capacity of every node inbox.
pub const DEFAULT_INBOX_CAPACITY: usize = 100;

/// Source name used for envelopes injected by the harness itself.
pub const NETWORK_SOURCE: &str = "network";

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum number of unread envelopes per node before senders block.
    pub inbox_capacity: usize,
    /// `Source` of harness-injected envelopes; reserved as a node name.
    pub network_source: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            network_source: NETWORK_SOURCE.to_string(),
        }
    }
}

/// Why an envelope was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No live node has the envelope's destination name.
    UnknownDestination,
    /// The destination exited while the envelope was waiting for room.
    InboxClosed,
}

/// Outcome of routing one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Dropped(DropReason),
}

/// Observable router activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    NodeStarted {
        node: String,
        pid: Option<u32>,
    },
    NodeExited {
        node: String,
        code: Option<i32>,
    },
    Dropped {
        from: String,
        destination: String,
        reason: DropReason,
    },
    DecodeFailed {
        node: String,
        error: String,
    },
    WriteFailed {
        node: String,
        error: String,
    },
}

/// Snapshot of the router's delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub delivered: u64,
    pub dropped: u64,
    pub decode_failures: u64,
    pub write_failures: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    decode_failures: AtomicU64,
    write_failures: AtomicU64,
}

struct Inner {
    config: RouterConfig,
    run: Run,
    registry: Arc<dyn Registry>,
    events: broadcast::Sender<RouterEvent>,
    counters: Counters,
}

/// Routes envelopes between node processes.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("config", &self.inner.config)
            .field("run", &self.inner.run.dir())
            .finish()
    }
}

impl Router {
    /// Create a router whose node logs go into `run`.
    pub fn new(config: RouterConfig, run: Run) -> Self {
        Self::with_registry(config, run, Arc::new(LocalRegistry::new()))
    }

    /// Create a router backed by a custom registry.
    pub fn with_registry(mut config: RouterConfig, run: Run, registry: Arc<dyn Registry>) -> Self {
        // tokio channels cannot have zero capacity.
        config.inbox_capacity = config.inbox_capacity.max(1);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                run,
                registry,
                events,
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    pub fn run(&self) -> &Run {
        &self.inner.run
    }

    /// Start `executable` as node `name`.
    ///
    /// Steps:
    /// 1. Validate the name.
    /// 2. Register a fresh inbox (state `Starting`). This atomically rejects
    ///    a name held by a live node, so a duplicate start never touches the
    ///    running node's log.
    /// 3. Create `node_logs/<name>.log` for the node's stderr.
    /// 4. Spawn the process and mark it `Running`.
    /// 5. Launch the pumps. The outbound pump writes the `init` envelope
    ///    before anything queued in the inbox.
    ///
    /// Any failure after registration marks the node `Exited` so the name is
    /// released. Returns once the process is started; does not wait for the
    /// node to read its init envelope.
    pub async fn start_node(
        &self,
        name: &str,
        executable: impl AsRef<Path>,
    ) -> Result<(), StartError> {
        let executable = executable.as_ref();
        validate_name(name, &self.inner.config.network_source)?;

        let init = envelope::encode(&Envelope::init(&self.inner.config.network_source, name))
            .map_err(|source| StartError::Encode {
                name: name.to_string(),
                source,
            })?;

        let (inbox, inbox_rx) = mpsc::channel(self.inner.config.inbox_capacity);
        self.inner
            .registry
            .register(name, inbox)
            .await
            .map_err(|e| match e {
                RegistryError::Duplicate(n) => StartError::DuplicateNode(n),
                other => StartError::Registry(other),
            })?;

        let log = match self.inner.run.create_file(Run::node_log_path(name)) {
            Ok(log) => log,
            Err(source) => {
                self.release(name).await;
                return Err(StartError::Store {
                    name: name.to_string(),
                    source,
                });
            }
        };

        let process = match node::spawn_process(executable, log) {
            Ok(process) => process,
            Err(source) => {
                self.release(name).await;
                return Err(StartError::Spawn {
                    name: name.to_string(),
                    path: executable.to_path_buf(),
                    source,
                });
            }
        };

        if let Err(e) = self.inner.registry.mark_running(name, process.pid).await {
            warn!(node = %name, error = %e, "unexpected node state after spawn");
        }

        let cancel = CancellationToken::new();
        tokio::spawn(node::run_outbound(
            self.clone(),
            name.to_string(),
            process.stdin,
            init,
            inbox_rx,
            cancel.clone(),
        ));
        tokio::spawn(node::run_inbound(
            self.clone(),
            name.to_string(),
            process.stdout,
            process.child,
            cancel,
        ));

        info!(
            node = %name,
            pid = ?process.pid,
            executable = %executable.display(),
            "node started"
        );
        self.emit(RouterEvent::NodeStarted {
            node: name.to_string(),
            pid: process.pid,
        });
        Ok(())
    }

    /// Undo a registration whose node never started.
    async fn release(&self, name: &str) {
        if let Err(e) = self.inner.registry.mark_exited(name).await {
            warn!(node = %name, error = %e, "failed to release node after failed start");
        }
    }

    /// Route a harness-injected envelope through the same path as node
    /// output.
    pub async fn send(&self, envelope: &Envelope) -> serde_json::Result<Delivery> {
        let line = envelope::encode(envelope)?;
        Ok(self
            .deliver(&envelope.source, &envelope.destination, line)
            .await)
    }

    /// Decode `line` (output of node `from`) and deliver it verbatim to its
    /// destination's inbox.
    pub async fn route_line(&self, from: &str, line: String) -> Result<Delivery, DecodeError> {
        let envelope = match envelope::decode(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.record_decode_failure(from, &e.to_string());
                return Err(e);
            }
        };
        Ok(self.deliver(from, &envelope.destination, line).await)
    }

    /// Push `line` onto `destination`'s inbox, waiting for room if it is
    /// full.
    async fn deliver(&self, from: &str, destination: &str, line: String) -> Delivery {
        let Some(inbox) = self.inner.registry.lookup_inbox(destination).await else {
            return self.record_drop(from, destination, DropReason::UnknownDestination);
        };

        if inbox.send(line).await.is_err() {
            return self.record_drop(from, destination, DropReason::InboxClosed);
        }

        self.inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
        debug!(from = %from, destination = %destination, "delivered envelope");
        Delivery::Delivered
    }

    fn record_drop(&self, from: &str, destination: &str, reason: DropReason) -> Delivery {
        self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(from = %from, destination = %destination, ?reason, "dropped envelope");
        self.emit(RouterEvent::Dropped {
            from: from.to_string(),
            destination: destination.to_string(),
            reason,
        });
        Delivery::Dropped(reason)
    }

    pub(crate) fn record_decode_failure(&self, node: &str, error: &str) {
        self.inner
            .counters
            .decode_failures
            .fetch_add(1, Ordering::Relaxed);
        warn!(node = %node, error = %error, "skipping malformed line from node");
        self.emit(RouterEvent::DecodeFailed {
            node: node.to_string(),
            error: error.to_string(),
        });
    }

    pub(crate) fn record_write_failure(&self, node: &str, error: &std::io::Error) {
        self.inner
            .counters
            .write_failures
            .fetch_add(1, Ordering::Relaxed);
        warn!(node = %node, error = %error, "failed to write to node stdin");
        self.emit(RouterEvent::WriteFailed {
            node: node.to_string(),
            error: error.to_string(),
        });
    }

    pub(crate) async fn node_exited(&self, name: &str, code: Option<i32>) {
        if let Err(e) = self.inner.registry.mark_exited(name).await {
            warn!(node = %name, error = %e, "failed to mark node exited");
        }
        node::log_exit(name, code);
        self.emit(RouterEvent::NodeExited {
            node: name.to_string(),
            code,
        });
    }

    fn emit(&self, event: RouterEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Stream of router events emitted after this call.
    ///
    /// A subscriber that falls more than the channel capacity behind skips
    /// the events it missed.
    pub fn events(&self) -> impl Stream<Item = RouterEvent> + Send + 'static {
        BroadcastStream::new(self.inner.events.subscribe()).filter_map(|event| event.ok())
    }

    pub fn stats(&self) -> RouterStats {
        let c = &self.inner.counters;
        RouterStats {
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            write_failures: c.write_failures.load(Ordering::Relaxed),
        }
    }

    pub async fn node_state(&self, name: &str) -> Option<NodeState> {
        self.inner.registry.state(name).await
    }

    /// All nodes the router has started, including exited ones.
    pub async fn nodes(&self) -> Vec<NodeInfo> {
        self.inner.registry.entries().await
    }

    /// Path of the stderr log for `name` inside the current run.
    pub fn node_log(&self, name: &str) -> PathBuf {
        self.inner.run.dir().join(Run::node_log_path(name))
    }

    /// Terminate every live node: SIGTERM first, then SIGKILL for whatever
    /// is still running after `grace`.
    ///
    /// Returns the number of nodes that had to be force-killed.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let live = self.live_nodes().await;
        if live.is_empty() {
            return 0;
        }
        info!(nodes = live.len(), "shutting down nodes");
        for node in &live {
            signal_node(node, Signal::Term);
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = self.live_nodes().await;
            if remaining.is_empty() {
                return 0;
            }
            if tokio::time::Instant::now() >= deadline {
                for node in &remaining {
                    warn!(node = %node.name, "node did not exit after SIGTERM, sending SIGKILL");
                    signal_node(node, Signal::Kill);
                }
                return remaining.len();
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }

    async fn live_nodes(&self) -> Vec<NodeInfo> {
        self.nodes()
            .await
            .into_iter()
            .filter(|n| n.state.is_live())
            .collect()
    }
}

/// Names end up in file paths and must not collide with the network source.
fn validate_name(name: &str, network_source: &str) -> Result<(), StartError> {
    let reason = if name.is_empty() {
        Some("name is empty")
    } else if name == network_source {
        Some("name is reserved for harness-injected messages")
    } else if name == "." || name == ".." || name.contains(['/', '\\']) {
        Some("name must not contain path separators")
    } else if name.chars().any(char::is_control) {
        Some("name must not contain control characters")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StartError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_node(node: &NodeInfo, signal: Signal) {
    let Some(pid) = node.pid else {
        return;
    };
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: pid belongs to a child we spawned and have not yet reaped.
    let ret = unsafe { libc::kill(pid as i32, signo) };
    if ret != 0 {
        debug!(node = %node.name, pid, ?signal, "signal delivery failed");
    }
}

#[cfg(not(unix))]
fn signal_node(node: &NodeInfo, signal: Signal) {
    warn!(node = %node.name, ?signal, "signals are not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_router(capacity: usize) -> (Router, Arc<LocalRegistry>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(LocalRegistry::new());
        let config = RouterConfig {
            inbox_capacity: capacity,
            ..RouterConfig::default()
        };
        let router = Router::with_registry(config, Run::at(tmp.path()), registry.clone());
        (router, registry, tmp)
    }

    /// Register a bare inbox with no process behind it.
    async fn attach(registry: &LocalRegistry, name: &str, capacity: usize) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(capacity);
        registry.register(name, tx).await.unwrap();
        rx
    }

    fn line(from: &str, to: &str, id: u32) -> String {
        format!(r#"{{"Source":"{from}","Destination":"{to}","Type":"msg","Id":"{id}"}}"#)
    }

    #[test]
    fn default_config_values() {
        let config = RouterConfig::default();
        assert_eq!(config.inbox_capacity, 100);
        assert_eq!(config.network_source, "network");
    }

    #[test]
    fn validate_name_rejects_bad_names() {
        for bad in ["", "network", "a/b", "..", ".", "a\\b", "tab\there"] {
            assert!(
                matches!(validate_name(bad, NETWORK_SOURCE), Err(StartError::InvalidName { .. })),
                "{bad:?} should be rejected"
            );
        }
        for good in ["n1", "c1", "node-7", "server_a.b"] {
            assert!(validate_name(good, NETWORK_SOURCE).is_ok(), "{good:?} should be accepted");
        }
    }

    #[tokio::test]
    async fn route_line_forwards_raw_line_verbatim() {
        let (router, registry, _tmp) = test_router(10);
        let mut rx = attach(&registry, "n1", 10).await;

        // Odd spacing and key order must survive untouched.
        let raw = r#"{ "Type":"echo",  "Destination":"n1", "Source":"c1", "Body":{"b":1,"a":2} }"#;
        let delivery = router.route_line("c1", raw.to_string()).await.unwrap();
        assert_eq!(delivery, Delivery::Delivered);
        assert_eq!(rx.recv().await.as_deref(), Some(raw));
        assert_eq!(router.stats().delivered, 1);
    }

    #[tokio::test]
    async fn unknown_destination_is_dropped_and_counted() {
        let (router, registry, _tmp) = test_router(10);
        let mut rx = attach(&registry, "n1", 10).await;
        let mut events = Box::pin(router.events());

        let dropped = router.route_line("c1", line("c1", "ghost", 1)).await.unwrap();
        assert_eq!(dropped, Delivery::Dropped(DropReason::UnknownDestination));

        let delivered = router.route_line("c1", line("c1", "n1", 2)).await.unwrap();
        assert_eq!(delivered, Delivery::Delivered);
        assert_eq!(rx.recv().await, Some(line("c1", "n1", 2)));

        assert_eq!(
            events.next().await,
            Some(RouterEvent::Dropped {
                from: "c1".to_string(),
                destination: "ghost".to_string(),
                reason: DropReason::UnknownDestination,
            })
        );
        let stats = router.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn malformed_line_is_reported() {
        let (router, _registry, _tmp) = test_router(10);
        let mut events = Box::pin(router.events());

        assert!(router.route_line("c1", "not json".to_string()).await.is_err());
        assert!(router.route_line("c1", r#"{"Destination":"n1"}"#.to_string()).await.is_err());

        assert_eq!(router.stats().decode_failures, 2);
        assert!(matches!(
            events.next().await,
            Some(RouterEvent::DecodeFailed { node, .. }) if node == "c1"
        ));
    }

    #[tokio::test]
    async fn delivery_to_exited_node_is_dropped() {
        let (router, registry, _tmp) = test_router(10);
        let _rx = attach(&registry, "n1", 10).await;
        registry.mark_exited("n1").await.unwrap();

        let delivery = router.route_line("c1", line("c1", "n1", 1)).await.unwrap();
        assert_eq!(delivery, Delivery::Dropped(DropReason::UnknownDestination));
    }

    #[tokio::test]
    async fn send_injects_through_the_same_path() {
        let (router, registry, _tmp) = test_router(10);
        let mut rx = attach(&registry, "n1", 10).await;

        let env = Envelope::new(NETWORK_SOURCE, "n1", "poke").with_body(json!({"x": 1}));
        assert_eq!(router.send(&env).await.unwrap(), Delivery::Delivered);

        let received = envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(received, env);
    }

    #[tokio::test]
    async fn per_destination_order_is_fifo_across_sources() {
        let (router, registry, _tmp) = test_router(100);
        let mut rx = attach(&registry, "d", 100).await;

        let mut expected = Vec::new();
        for i in 0..30 {
            let from = ["a", "b", "network"][i % 3];
            let l = line(from, "d", i as u32);
            if from == "network" {
                let env = envelope::decode(&l).unwrap();
                router.send(&env).await.unwrap();
                expected.push(envelope::encode(&env).unwrap());
            } else {
                router.route_line(from, l.clone()).await.unwrap();
                expected.push(l);
            }
        }

        for want in expected {
            assert_eq!(rx.recv().await, Some(want));
        }
    }

    #[tokio::test]
    async fn full_inbox_blocks_until_drained() {
        let capacity = DEFAULT_INBOX_CAPACITY;
        let (router, registry, _tmp) = test_router(capacity);
        let mut rx = attach(&registry, "slow", capacity).await;

        for i in 0..capacity {
            router.route_line("fast", line("fast", "slow", i as u32)).await.unwrap();
        }

        let blocked = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .route_line("fast", line("fast", "slow", 999))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!blocked.is_finished(), "send to a full inbox must block");

        assert_eq!(rx.recv().await, Some(line("fast", "slow", 0)));
        let delivery = tokio::time::timeout(Duration::from_secs(2), blocked)
            .await
            .expect("send should complete once the inbox drains")
            .unwrap();
        assert_eq!(delivery, Delivery::Delivered);
        assert_eq!(router.stats().delivered, capacity as u64 + 1);
    }

    #[tokio::test]
    async fn blocked_send_to_exiting_node_is_dropped() {
        let (router, registry, _tmp) = test_router(1);
        let rx = attach(&registry, "n1", 1).await;
        router.route_line("c1", line("c1", "n1", 1)).await.unwrap();

        let blocked = {
            let router = router.clone();
            tokio::spawn(async move { router.route_line("c1", line("c1", "n1", 2)).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The outbound pump going away closes the inbox.
        drop(rx);
        let delivery = tokio::time::timeout(Duration::from_secs(2), blocked)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery, Delivery::Dropped(DropReason::InboxClosed));
    }

    #[tokio::test]
    async fn start_node_rejects_invalid_name() {
        let (router, _registry, _tmp) = test_router(10);
        let err = router.start_node("network", "/bin/cat").await.unwrap_err();
        assert!(matches!(err, StartError::InvalidName { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn start_node_rejects_live_duplicate_without_touching_it() {
        let (router, registry, _tmp) = test_router(10);
        let mut rx = attach(&registry, "n1", 10).await;

        let err = router.start_node("n1", "/bin/cat").await.unwrap_err();
        assert!(matches!(err, StartError::DuplicateNode(ref n) if n == "n1"), "got {err:?}");

        router.route_line("c1", line("c1", "n1", 1)).await.unwrap();
        assert_eq!(rx.recv().await, Some(line("c1", "n1", 1)));
    }

    /// A registry that refuses every registration as if the node vanished.
    struct RefusingRegistry;

    #[async_trait::async_trait]
    impl Registry for RefusingRegistry {
        async fn register(&self, name: &str, _inbox: mpsc::Sender<String>) -> Result<(), RegistryError> {
            Err(RegistryError::Unknown(name.to_string()))
        }
        async fn lookup_inbox(&self, _name: &str) -> Option<mpsc::Sender<String>> {
            None
        }
        async fn mark_running(&self, name: &str, _pid: Option<u32>) -> Result<(), RegistryError> {
            Err(RegistryError::Unknown(name.to_string()))
        }
        async fn mark_exited(&self, name: &str) -> Result<(), RegistryError> {
            Err(RegistryError::Unknown(name.to_string()))
        }
        async fn state(&self, _name: &str) -> Option<NodeState> {
            None
        }
        async fn entries(&self) -> Vec<NodeInfo> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn registry_failure_is_reported_as_registry_error() {
        let tmp = tempfile::tempdir().unwrap();
        let router = Router::with_registry(
            RouterConfig::default(),
            Run::at(tmp.path()),
            Arc::new(RefusingRegistry),
        );
        let err = router.start_node("n1", "/bin/cat").await.unwrap_err();
        assert!(
            matches!(err, StartError::Registry(RegistryError::Unknown(ref n)) if n == "n1"),
            "got {err:?}"
        );
        assert!(!tmp.path().join(Run::node_log_path("n1")).exists());
    }

    #[tokio::test]
    async fn log_failure_releases_the_name() {
        let (router, _registry, tmp) = test_router(10);
        // A directory where the log file should go makes File::create fail.
        std::fs::create_dir_all(tmp.path().join(Run::node_log_path("n1"))).unwrap();

        let err = router.start_node("n1", "/bin/cat").await.unwrap_err();
        assert!(matches!(err, StartError::Store { .. }), "got {err:?}");
        assert_eq!(router.node_state("n1").await, Some(NodeState::Exited));
        assert_eq!(
            router.route_line("c1", line("c1", "n1", 1)).await.unwrap(),
            Delivery::Dropped(DropReason::UnknownDestination)
        );
    }

    #[tokio::test]
    async fn shutdown_with_no_nodes_is_immediate() {
        let (router, _registry, _tmp) = test_router(10);
        assert_eq!(router.shutdown(Duration::from_secs(5)).await, 0);
    }
}
