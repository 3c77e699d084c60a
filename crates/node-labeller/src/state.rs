//! # Node Label State
//!
//! Tracks, per node, which derived labels should be present (`true`) and which were set before
//! but must now be cleared (`false`). A `false` entry is a one-shot tombstone: the next
//! reconcile of that node removes the label from the Node object and deletes the entry.
//!
//! ## Lock ordering
//!
//! This state and the [`DefinitionStore`] each have their own lock. Whenever both are needed the
//! node state lock is taken first and the definition lock second; [`NodeLabels::set_desired`] is
//! the only place that nests them. Nothing may take the definition lock and then wait on the node
//! state lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::definitions::{DefinitionStore, LabelDefinitions};

/// Label key to desired state: `true` = should be set, `false` = must be cleared once
pub type LabelStatus = BTreeMap<String, bool>;

/// Desired derived labels for every known node
#[derive(Debug)]
pub struct NodeLabelState {
    nodes: RwLock<HashMap<String, LabelStatus>>,
    definitions: Arc<DefinitionStore>,
}

impl NodeLabelState {
    #[must_use]
    pub fn new(definitions: Arc<DefinitionStore>) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            definitions,
        }
    }

    /// Take exclusive access to the node state.
    ///
    /// Several operations that must be observed together (add, recompute, validity check) are
    /// done through one guard.
    pub async fn lock(&self) -> NodeLabels<'_> {
        NodeLabels {
            nodes: self.nodes.write().await,
            definitions: &self.definitions,
        }
    }

    /// Whether the node is known and has at least one label entry
    pub async fn valid(&self, name: &str) -> bool {
        self.nodes
            .read()
            .await
            .get(name)
            .is_some_and(|status| !status.is_empty())
    }

    /// Copy of a node's label status
    pub async fn snapshot(&self, name: &str) -> Option<LabelStatus> {
        self.nodes.read().await.get(name).cloned()
    }

    /// Number of nodes currently tracked
    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}

/// Exclusive view of the node state, see [`NodeLabelState::lock`]
pub struct NodeLabels<'a> {
    nodes: RwLockWriteGuard<'a, HashMap<String, LabelStatus>>,
    definitions: &'a DefinitionStore,
}

/// Label changes made to a Node object by [`NodeLabels::apply_to`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AppliedLabels {
    pub set: Vec<String>,
    pub cleared: Vec<String>,
}

impl NodeLabels<'_> {
    /// Start tracking a node. Existing entries are left untouched.
    pub fn add(&mut self, name: &str) {
        self.nodes.entry(name.to_string()).or_default();
    }

    /// Stop tracking a node
    pub fn remove(&mut self, name: &str) {
        if self.nodes.remove(name).is_some() {
            debug!(node = %name, "Removed node from label state");
        }
    }

    /// Turn every label currently set on the node into a tombstone
    pub fn reset_labels(&mut self, name: &str) {
        if let Some(status) = self.nodes.get_mut(name) {
            for desired in status.values_mut() {
                *desired = false;
            }
        }
    }

    /// Mark every label key whose trigger tokens match one of the node's label values.
    ///
    /// Takes the definition store's read lock while this guard holds the node state lock. The
    /// node must have been added first.
    pub async fn set_desired(&mut self, name: &str, node_labels: &BTreeMap<String, String>) {
        let Some(status) = self.nodes.get_mut(name) else {
            warn!(node = %name, "Cannot compute labels for untracked node");
            return;
        };

        let definitions = self.definitions.read().await;
        for key in matching_keys(&definitions, node_labels) {
            status.insert(key.to_string(), true);
        }
    }

    /// Whether the node is known and has at least one label entry
    #[must_use]
    pub fn valid(&self, name: &str) -> bool {
        self.nodes
            .get(name)
            .is_some_and(|status| !status.is_empty())
    }

    /// Current label status of a node
    #[must_use]
    pub fn labels(&self, name: &str) -> Option<&LabelStatus> {
        self.nodes.get(name)
    }

    /// Apply the node's desired state to a Node object's label map.
    ///
    /// Set labels get `marker` as their value. Tombstoned labels are removed from `labels` and
    /// their entries deleted from the state, so each clear happens exactly once.
    pub fn apply_to(
        &mut self,
        name: &str,
        labels: &mut BTreeMap<String, String>,
        marker: &str,
    ) -> AppliedLabels {
        let mut applied = AppliedLabels::default();
        let Some(status) = self.nodes.get_mut(name) else {
            return applied;
        };

        status.retain(|key, desired| {
            if *desired {
                labels.insert(key.clone(), marker.to_string());
                applied.set.push(key.clone());
                true
            } else {
                labels.remove(key);
                applied.cleared.push(key.clone());
                false
            }
        });

        applied
    }
}

/// Label keys triggered by a node's labels.
///
/// Matching compares label *values* with trigger tokens; the node label's own key plays no part.
/// Empty tokens (a definition file's trailing newline, or an unreadable file) never match.
#[must_use]
pub fn matching_keys<'a>(
    definitions: &'a LabelDefinitions,
    node_labels: &BTreeMap<String, String>,
) -> BTreeSet<&'a str> {
    definitions
        .iter()
        .filter(|(_, tokens)| {
            tokens
                .iter()
                .filter(|token| !token.is_empty())
                .any(|token| node_labels.values().any(|value| value == token))
        })
        .map(|(key, _)| key.as_str())
        .collect()
}
