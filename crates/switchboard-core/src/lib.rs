//! Message router and process supervisor for local protocol test runs.
//!
//! A [`Router`] launches each node as a subprocess, gives it a unique name,
//! and relays newline-delimited JSON [`Envelope`]s from every node's stdout
//! to the stdin of the node named in the envelope's `Destination`.
//!
//! ```text
//!  RunStore --create_run--> Run (store/<timestamp>/, store/latest)
//!                              |
//!  Router::start_node(name, path)
//!     |  registry: name -> inbox (bounded, FIFO)
//!     |
//!     +-- inbound pump:  node stdout --decode--> destination inbox
//!     +-- outbound pump: own inbox --> node stdin
//! ```

pub mod envelope;
pub mod error;
pub mod node;
pub mod registry;
pub mod router;
pub mod store;

pub use envelope::{DecodeError, Envelope, InitBody};
pub use error::StartError;
pub use node::NodeState;
pub use registry::{LocalRegistry, NodeInfo, Registry, RegistryError};
pub use router::{
    DEFAULT_INBOX_CAPACITY, Delivery, DropReason, NETWORK_SOURCE, Router, RouterConfig,
    RouterEvent, RouterStats,
};
pub use store::{Run, RunStore, StoreError};
