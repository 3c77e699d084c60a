//! # Reconciler
//!
//! Converges one Node object's labels with its entry in [`NodeLabelState`].

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, PostParams};
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::state::NodeLabelState;

/// Value written to every label the labeller sets
pub const LABEL_MARKER_VALUE: &str = "true";

/// Access to Node objects
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Fetch a node by name. `Ok(None)` when the node does not exist.
    async fn get(&self, name: &str) -> Result<Option<Node>, kube::Error>;

    /// Replace the whole Node object
    async fn replace(&self, node: &Node) -> Result<Node, kube::Error>;

    /// All nodes currently in the cluster
    async fn list(&self) -> Result<Vec<Node>, kube::Error>;
}

#[async_trait]
impl NodeStore for Api<Node> {
    async fn get(&self, name: &str) -> Result<Option<Node>, kube::Error> {
        self.get_opt(name).await
    }

    async fn replace(&self, node: &Node) -> Result<Node, kube::Error> {
        Api::replace(self, &node.name_any(), &PostParams::default(), node).await
    }

    async fn list(&self) -> Result<Vec<Node>, kube::Error> {
        Ok(Api::list(self, &ListParams::default()).await?.items)
    }
}

/// Result of a single node reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Labels changed and the node was written back
    Updated { set: usize, cleared: usize },
    /// The node already carried the desired labels
    Unchanged,
    /// The node no longer exists; its delete event cleans up state
    NodeMissing,
}

/// Applies desired label state to Node objects
#[derive(Clone)]
pub struct Reconciler {
    nodes: Arc<dyn NodeStore>,
    state: Arc<NodeLabelState>,
}

impl Reconciler {
    #[must_use]
    pub fn new(nodes: Arc<dyn NodeStore>, state: Arc<NodeLabelState>) -> Self {
        Self { nodes, state }
    }

    /// Node store the reconciler reads from and writes to
    #[must_use]
    pub fn nodes(&self) -> &Arc<dyn NodeStore> {
        &self.nodes
    }

    /// Fetch the node, apply its desired labels and persist the result.
    ///
    /// Tombstoned labels are consumed from the state while the state lock is held, before the
    /// write. A failed write is returned to the caller and not retried here.
    #[instrument(skip(self), fields(node = %name))]
    pub async fn reconcile(&self, name: &str) -> Result<ReconcileOutcome> {
        info!("Reconciling node");

        let Some(mut node) = self.nodes.get(name).await.map_err(|source| Error::NodeFetch {
            name: name.to_string(),
            source,
        })?
        else {
            warn!("Could not find Node");
            return Ok(ReconcileOutcome::NodeMissing);
        };

        let original = node.labels().clone();
        let applied = {
            let mut state = self.state.lock().await;
            state.apply_to(name, node.labels_mut(), LABEL_MARKER_VALUE)
        };

        for label in &applied.set {
            debug!(label = %label, "Setting label");
        }
        for label in &applied.cleared {
            info!(label = %label, "Clearing label");
        }

        if *node.labels() == original {
            debug!("Node labels already up to date");
            return Ok(ReconcileOutcome::Unchanged);
        }

        self.nodes
            .replace(&node)
            .await
            .map_err(|source| Error::NodeUpdate {
                name: name.to_string(),
                source,
            })?;

        info!(
            set = applied.set.len(),
            cleared = applied.cleared.len(),
            "Updated node labels"
        );
        Ok(ReconcileOutcome::Updated {
            set: applied.set.len(),
            cleared: applied.cleared.len(),
        })
    }
}
