//! Configuration file management for switchboard.
//!
//! A TOML file describes the default topology and router settings. The file
//! is `./switchboard.toml` when present, otherwise
//! `~/.config/switchboard/config.toml`. Every setting resolves through the
//! chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use switchboard_core::{DEFAULT_INBOX_CAPACITY, RunStore};

/// Project-local config file, preferred over the user config when present.
pub const LOCAL_CONFIG: &str = "switchboard.toml";

pub const ENV_CONFIG: &str = "SWITCHBOARD_CONFIG";
pub const ENV_STORE_DIR: &str = "SWITCHBOARD_STORE_DIR";

/// Grace period between SIGTERM and SIGKILL at shutdown.
pub const DEFAULT_GRACE_SECS: u64 = 5;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbox_capacity: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_secs: Option<u64>,
    /// Nodes to start, in order.
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub name: String,
    pub path: PathBuf,
}

impl ConfigFile {
    /// The topology written by `switchboard init`.
    pub fn starter() -> Self {
        Self {
            store_dir: None,
            inbox_capacity: Some(DEFAULT_INBOX_CAPACITY),
            grace_secs: Some(DEFAULT_GRACE_SECS),
            nodes: vec![
                NodeEntry {
                    name: "n1".to_string(),
                    path: PathBuf::from("./echo-server"),
                },
                NodeEntry {
                    name: "c1".to_string(),
                    path: PathBuf::from("./echo-client"),
                },
            ],
        }
    }
}

/// Parse a `NAME=PATH` node specification.
pub fn parse_node_spec(spec: &str) -> Result<NodeEntry> {
    let Some((name, path)) = spec.split_once('=') else {
        bail!("invalid node spec {spec:?}, expected NAME=PATH");
    };
    let name = name.trim();
    let path = path.trim();
    if name.is_empty() || path.is_empty() {
        bail!("invalid node spec {spec:?}, expected NAME=PATH");
    }
    Ok(NodeEntry {
        name: name.to_string(),
        path: PathBuf::from(path),
    })
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the switchboard config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/switchboard` or
/// `~/.config/switchboard`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("switchboard");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("switchboard")
}

/// Return the path to the user config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// The config file used when none is named explicitly.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from(LOCAL_CONFIG);
    if local.is_file() { local } else { config_path() }
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file at `path`.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Settings given on the command line. `None` / empty means "not given".
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub config: Option<PathBuf>,
    pub store_dir: Option<PathBuf>,
    pub nodes: Vec<NodeEntry>,
    pub inbox_capacity: Option<usize>,
    pub grace_secs: Option<u64>,
}

/// Fully resolved settings for `switchboard run`.
#[derive(Debug)]
pub struct RunSettings {
    pub store_dir: PathBuf,
    pub inbox_capacity: usize,
    pub grace: Duration,
    pub nodes: Vec<NodeEntry>,
}

impl RunSettings {
    /// Resolve from the process environment.
    pub fn resolve(cli: CliOverrides) -> Result<Self> {
        Self::resolve_with(cli, |key| std::env::var(key).ok())
    }

    /// Resolve using `env` to look up environment variables.
    ///
    /// - Config file: `--config` > `SWITCHBOARD_CONFIG` > `./switchboard.toml`
    ///   > user config. An explicitly named file must exist; the defaults
    ///   may be missing.
    /// - Store: `--store` > `SWITCHBOARD_STORE_DIR` > `store_dir` > `store`
    /// - Nodes: `--node` (all of them) > `[[nodes]]`
    /// - Inbox capacity and grace: flag > file > default
    pub fn resolve_with(
        mut cli: CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let file = match cli.config.take().or_else(|| env(ENV_CONFIG).map(PathBuf::from)) {
            Some(path) => load_config(&path)?,
            None => {
                let path = default_config_path();
                if path.is_file() {
                    load_config(&path)?
                } else {
                    ConfigFile::default()
                }
            }
        };
        Ok(Self::merge(cli, file, env))
    }

    fn merge(cli: CliOverrides, file: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let store_dir = cli
            .store_dir
            .or_else(|| env(ENV_STORE_DIR).map(PathBuf::from))
            .or(file.store_dir)
            .unwrap_or_else(|| PathBuf::from(RunStore::DEFAULT_BASE));
        let nodes = if cli.nodes.is_empty() { file.nodes } else { cli.nodes };
        Self {
            store_dir,
            inbox_capacity: cli
                .inbox_capacity
                .or(file.inbox_capacity)
                .unwrap_or(DEFAULT_INBOX_CAPACITY),
            grace: Duration::from_secs(
                cli.grace_secs.or(file.grace_secs).unwrap_or(DEFAULT_GRACE_SECS),
            ),
            nodes,
        }
    }
}

/// Resolve the store directory for commands that only need the store.
pub fn resolve_store_dir(cli: Option<PathBuf>) -> PathBuf {
    cli.or_else(|| std::env::var(ENV_STORE_DIR).ok().map(PathBuf::from))
        .or_else(|| {
            let path = default_config_path();
            path.is_file()
                .then(|| load_config(&path).ok())
                .flatten()
                .and_then(|c| c.store_dir)
        })
        .unwrap_or_else(|| PathBuf::from(RunStore::DEFAULT_BASE))
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
