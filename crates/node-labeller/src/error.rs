//! Error types shared by every part of the labeller.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while loading label definitions or converging nodes
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to scan label directory {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("no label definitions found under {}", .0.display())]
    EmptyDefinitionSet(PathBuf),

    #[error("invalid label directory {}: directory does not exist", .0.display())]
    InvalidRoot(PathBuf),

    #[error("filesystem notification error: {0}")]
    Notification(#[from] notify::Error),

    #[error("failed to fetch node {name}: {source}")]
    NodeFetch {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to update node {name}: {source}")]
    NodeUpdate {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to list nodes: {0}")]
    NodeList(#[source] kube::Error),

    #[error("{name} task failed: {source}")]
    Task {
        name: String,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias used across the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;
