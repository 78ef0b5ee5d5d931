//! On-disk storage for harness runs.
//!
//! Each run gets its own timestamped directory under the store base, and a
//! `latest` symlink is republished on every run so external tooling can find
//! the most recent one without knowing its timestamp:
//!
//! ```text
//! store/
//!   20240815161718.900/
//!     node_logs/n1.log
//!     node_logs/c1.log
//!   latest -> 20240815161718.900
//! ```

use std::fs::{self, DirBuilder, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, TimeZone};
use thiserror::Error;

/// Name of the symlink that always points at the most recent run.
pub const LATEST_LINK: &str = "latest";

/// Timestamp layout for run directories: sortable, millisecond precision.
const RUN_DIR_FORMAT: &str = "%Y%m%d%H%M%S%.3f";

/// Errors from run storage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to publish {path}")]
    Symlink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create file {path}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The requested path would land outside the run directory.
    #[error("path {0} escapes the run directory")]
    OutsideRun(PathBuf),

    #[error("failed to resolve {path}")]
    ReadLatest {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The base directory under which runs are allocated.
#[derive(Debug, Clone)]
pub struct RunStore {
    base: PathBuf,
}

impl RunStore {
    /// The base directory used when nothing else is configured.
    pub const DEFAULT_BASE: &str = "store";

    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Allocate the directory for a run started at `now` and point `latest`
    /// at it.
    ///
    /// Fails with [`StoreError::CreateDir`] if a run with the same timestamp
    /// already exists; runs are never shared.
    pub fn create_run<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<Run, StoreError>
    where
        Tz::Offset: std::fmt::Display,
    {
        let name = run_dir_name(now);
        let dir = self.base.join(&name);
        create_dir_all(&self.base)?;
        create_dir(&dir, false)?;
        self.publish_latest(&name)?;
        tracing::debug!(run = %dir.display(), "allocated run directory");
        Ok(Run { dir })
    }

    /// Resolve the `latest` link to the run directory it points at.
    pub fn latest(&self) -> Result<PathBuf, StoreError> {
        let link = self.base.join(LATEST_LINK);
        let target = fs::read_link(&link).map_err(|source| StoreError::ReadLatest {
            path: link.clone(),
            source,
        })?;
        if target.is_absolute() {
            Ok(target)
        } else {
            Ok(self.base.join(target))
        }
    }

    /// Replace `latest` by renaming a freshly made link over it, so readers
    /// never observe a missing link.
    fn publish_latest(&self, run_name: &str) -> Result<(), StoreError> {
        let link = self.base.join(LATEST_LINK);
        let staging = self
            .base
            .join(format!(".{LATEST_LINK}.{}", std::process::id()));

        // A stale staging link from a crashed run with the same pid.
        let _ = fs::remove_file(&staging);

        symlink(Path::new(run_name), &staging).map_err(|source| StoreError::Symlink {
            path: staging.clone(),
            source,
        })?;
        fs::rename(&staging, &link).map_err(|source| {
            let _ = fs::remove_file(&staging);
            StoreError::Symlink {
                path: link.clone(),
                source,
            }
        })
    }
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE)
    }
}

/// One allocated run directory.
#[derive(Debug, Clone)]
pub struct Run {
    dir: PathBuf,
}

impl Run {
    /// Wrap an existing directory as a run (used by tests and tooling).
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create (or truncate) `relative` inside the run, creating any missing
    /// parent directories.
    pub fn create_file(&self, relative: impl AsRef<Path>) -> Result<File, StoreError> {
        let relative = relative.as_ref();
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes || relative.as_os_str().is_empty() {
            return Err(StoreError::OutsideRun(relative.to_path_buf()));
        }

        let path = self.dir.join(relative);
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        File::create(&path).map_err(|source| StoreError::CreateFile { path, source })
    }

    /// Relative path of the stderr log for `node`.
    pub fn node_log_path(node: &str) -> PathBuf {
        Path::new("node_logs").join(format!("{node}.log"))
    }
}

/// Directory name for a run started at `now`, e.g. `20240815161718.900`.
pub fn run_dir_name<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format(RUN_DIR_FORMAT).to_string()
}

fn create_dir_all(path: &Path) -> Result<(), StoreError> {
    create_dir(path, true)
}

fn create_dir(path: &Path, recursive: bool) -> Result<(), StoreError> {
    let mut builder = DirBuilder::new();
    builder.recursive(recursive);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(path).map_err(|source| StoreError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}
