//! Errors returned by [`crate::Router::start_node`].

use std::path::PathBuf;

use thiserror::Error;

use crate::registry::RegistryError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum StartError {
    /// A live node already has this name.
    #[error("node already exists with name {0:?}")]
    DuplicateNode(String),

    #[error("invalid node name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// The node's log file could not be created.
    #[error("failed to create log file for node {name:?}")]
    Store {
        name: String,
        #[source]
        source: StoreError,
    },

    /// The executable could not be started or its pipes attached.
    #[error("failed to spawn {path} for node {name:?}")]
    Spawn {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The registry refused the node for a reason other than a duplicate.
    #[error("registry rejected node")]
    Registry(#[from] RegistryError),

    #[error("failed to encode init envelope for node {name:?}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}
