//! Fleetsync library
//!
//! Keeps a cached view of which files live on which display node, reconciles
//! it against the nodes' real filesystems and moves files between nodes
//! through a single-worker transfer queue.

pub mod cli;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod fleet;
pub mod flight;
pub mod liveness;
pub mod log;
pub mod logger;
pub mod model;
pub mod names;
pub mod progress;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod store;
pub mod url;

pub use error::{FleetError, RemoteError, Result};
pub use fleet::Fleet;
pub use model::{FileKey, FileRecord, LivenessState, Node, Placement};
