mod config;

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use switchboard_core::{NodeState, Router, RouterConfig, RouterEvent, RunStore};

use config::{CliOverrides, ConfigFile, NodeEntry, RunSettings};

#[derive(Parser)]
#[command(name = "switchboard", about = "Local message router for protocol test nodes")]
struct Cli {
    /// Config file (overrides SWITCHBOARD_CONFIG env var)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the configured nodes and route messages until interrupted
    Run {
        /// Store directory (overrides SWITCHBOARD_STORE_DIR env var)
        #[arg(long)]
        store: Option<PathBuf>,
        /// Node to start as NAME=PATH; repeatable, replaces the configured nodes
        #[arg(long = "node", value_parser = config::parse_node_spec)]
        nodes: Vec<NodeEntry>,
        /// Maximum unread messages per node
        #[arg(long)]
        inbox_capacity: Option<usize>,
        /// Seconds to wait after SIGTERM before killing nodes
        #[arg(long)]
        grace_secs: Option<u64>,
    },
    /// Write a switchboard config file with the echo topology
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Print the most recent run directory
    Latest {
        /// Store directory (overrides SWITCHBOARD_STORE_DIR env var)
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

/// Execute the `switchboard init` command: write config file.
fn cmd_init(path: PathBuf, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = ConfigFile::starter();
    config::save_config(&path, &cfg)?;

    println!("Config written to {}", path.display());
    for node in &cfg.nodes {
        println!("  {} = {}", node.name, node.path.display());
    }
    println!();
    println!("Next: run `switchboard run` from the directory holding the node binaries.");

    Ok(())
}

/// Execute the `switchboard latest` command.
fn cmd_latest(store: Option<PathBuf>) -> anyhow::Result<()> {
    let store = RunStore::new(config::resolve_store_dir(store));
    let dir = store.latest().context("no run recorded yet")?;
    println!("{}", dir.display());
    Ok(())
}

/// Execute the `switchboard run` command.
async fn cmd_run(overrides: CliOverrides) -> anyhow::Result<()> {
    let settings = RunSettings::resolve(overrides)?;
    if settings.nodes.is_empty() {
        bail!("no nodes configured; pass --node NAME=PATH or run `switchboard init`");
    }

    let store = RunStore::new(&settings.store_dir);
    let run = store
        .create_run(&chrono::Local::now())
        .context("failed to create run directory")?;
    info!(dir = %run.dir().display(), "created run");

    let router = Router::new(
        RouterConfig {
            inbox_capacity: settings.inbox_capacity,
            ..RouterConfig::default()
        },
        run,
    );

    // `done` fires once every node has exited, but never before
    // `started_all` fires at the end of the start loop.
    let started_all = CancellationToken::new();
    let done = CancellationToken::new();
    let watcher = tokio::spawn(watch_events(
        router.clone(),
        router.events(),
        started_all.clone(),
        done.clone(),
    ));

    let mut started = 0;
    for node in &settings.nodes {
        match router.start_node(&node.name, &node.path).await {
            Ok(()) => started += 1,
            Err(e) => error!(node = %node.name, path = %node.path.display(), error = %e, "failed to start node"),
        }
    }
    if started == 0 {
        done.cancel();
        let _ = watcher.await;
        bail!("none of the {} configured nodes started", settings.nodes.len());
    }
    started_all.cancel();
    println!("Run directory: {}", router.run().dir().display());

    tokio::select! {
        result = shutdown_signal() => {
            result?;
            info!("received shutdown signal");
        }
        _ = done.cancelled() => info!("all nodes exited"),
    }

    let killed = router.shutdown(settings.grace).await;
    done.cancel();
    let _ = watcher.await;

    let stats = router.stats();
    info!(
        delivered = stats.delivered,
        dropped = stats.dropped,
        decode_failures = stats.decode_failures,
        write_failures = stats.write_failures,
        killed,
        "run finished"
    );
    Ok(())
}

/// Log router events and cancel `done` once no node is left running.
///
/// Exits are only checked after `started` fires, so a node that exits early
/// does not end the run while later nodes are still being started.
async fn watch_events<S>(
    router: Router,
    events: S,
    started: CancellationToken,
    done: CancellationToken,
) where
    S: Stream<Item = RouterEvent> + Send,
{
    let mut events = std::pin::pin!(events);
    let mut checked_start = false;
    loop {
        let event = tokio::select! {
            _ = done.cancelled() => break,
            _ = started.cancelled(), if !checked_start => {
                checked_start = true;
                if all_exited(&router).await {
                    done.cancel();
                }
                continue;
            }
            event = events.next() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            RouterEvent::Dropped {
                from,
                destination,
                reason,
            } => info!(from = %from, destination = %destination, ?reason, "message dropped"),
            RouterEvent::NodeExited { .. } if started.is_cancelled() => {
                if all_exited(&router).await {
                    done.cancel();
                }
            }
            _ => {}
        }
    }
}

async fn all_exited(router: &Router) -> bool {
    let nodes = router.nodes().await;
    !nodes.is_empty() && nodes.iter().all(|n| n.state == NodeState::Exited)
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for Ctrl-C")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            store,
            nodes,
            inbox_capacity,
            grace_secs,
        } => {
            cmd_run(CliOverrides {
                config: cli.config,
                store_dir: store,
                nodes,
                inbox_capacity,
                grace_secs,
            })
            .await?;
        }
        Commands::Init { force } => {
            cmd_init(cli.config.unwrap_or_else(config::config_path), force)?;
        }
        Commands::Latest { store } => {
            cmd_latest(store)?;
        }
    }

    Ok(())
}
