//! Error types for spacemap.
//!
//! Every failure in the scanning core is scoped to a node or a scan attempt.
//! Scanner threads never return these across the thread boundary; they log
//! them and encode the outcome as update records instead.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::node::NodeId;

#[derive(Error, Debug)]
pub enum ScanError {
    /// A directory could not be listed. The node ends up in `Error`.
    #[error("failed to enumerate '{path}': {source}")]
    Enumeration {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Cooperative stop. Not a failure.
    #[error("scan cancelled")]
    Cancelled,

    /// The stop token fired before the volume scheduler granted a slot.
    #[error("no admission slot granted for volume '{volume}' before cancellation")]
    AdmissionDenied { volume: String },

    #[error("unknown node id {0}")]
    UnknownNode(NodeId),

    #[error("node {0} is not a directory")]
    NotADirectory(NodeId),

    #[error("failed to spawn scan thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl ScanError {
    /// Cancellation and admission denial surface identically to callers.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ScanError::Cancelled | ScanError::AdmissionDenied { .. })
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
