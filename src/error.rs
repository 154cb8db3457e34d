//! Error taxonomy for remote calls and fleet operations

use crate::model::{FileKey, NodeId};
use thiserror::Error;

/// Failures reported by a [`crate::remote::RemoteClient`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Node is offline or the transport could not reach it
    #[error("node {address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    /// The requested path does not exist on the node
    #[error("path {path} missing on {address}")]
    PathMissing { address: String, path: String },

    /// Shell command or file API returned an unexpected failure
    #[error("remote command failed on {address} (exit {code}): {stderr}")]
    CommandFailed {
        address: String,
        code: i32,
        stderr: String,
    },

    /// Response could not be understood
    #[error("bad response from {address}: {detail}")]
    Protocol { address: String, detail: String },
}

impl RemoteError {
    pub fn unreachable(address: &str, reason: impl ToString) -> Self {
        Self::Unreachable {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn missing(address: &str, path: impl Into<String>) -> Self {
        Self::PathMissing {
            address: address.to_string(),
            path: path.into(),
        }
    }

    pub fn protocol(address: &str, detail: impl ToString) -> Self {
        Self::Protocol {
            address: address.to_string(),
            detail: detail.to_string(),
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::PathMissing { .. })
    }
}

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("transport unreachable: {0}")]
    TransportUnreachable(RemoteError),

    #[error("remote path missing: {0}")]
    RemotePathMissing(RemoteError),

    #[error("remote command failure: {0}")]
    RemoteCommandFailure(RemoteError),

    /// A task for the same file identity is already queued or running
    #[error("a transfer for {0} is already queued")]
    DuplicateTaskConflict(FileKey),

    /// Same name but different size/type exists on some destinations
    #[error("{key} collides with different content on {} node(s)", .nodes.len())]
    CollidingContent { key: FileKey, nodes: Vec<NodeId> },

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("unknown file {0}")]
    UnknownFile(FileKey),

    #[error("no ready node holds {0}")]
    NoSource(FileKey),

    #[error("no usable destination for {0}")]
    NoDestination(String),

    #[error("display name '{0}' is already taken")]
    NameTaken(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl From<RemoteError> for FleetError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unreachable { .. } => FleetError::TransportUnreachable(err),
            RemoteError::PathMissing { .. } => FleetError::RemotePathMissing(err),
            RemoteError::CommandFailed { .. } | RemoteError::Protocol { .. } => {
                FleetError::RemoteCommandFailure(err)
            }
        }
    }
}

impl FleetError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::TransportUnreachable(_))
    }
}

pub type Result<T, E = FleetError> = std::result::Result<T, E>;
