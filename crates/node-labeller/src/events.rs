//! # Event Ingestion
//!
//! Turns Node watch notifications into [`NodeLabelState`] mutations and decides which ones are
//! worth a reconcile.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::{pin_mut, TryStreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::reconciler::Reconciler;
use crate::state::NodeLabelState;

/// Node labels as carried by the Node object
pub type NodeLabelSet = BTreeMap<String, String>;

/// A change to a Node, in the shape Event Ingestion consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Created {
        name: String,
        labels: NodeLabelSet,
    },
    Updated {
        old_name: String,
        new_name: String,
        old_labels: NodeLabelSet,
        new_labels: NodeLabelSet,
    },
    Deleted {
        name: String,
    },
    Generic,
}

impl NodeEvent {
    /// Node the event is about, if any
    #[must_use]
    pub fn node_name(&self) -> Option<&str> {
        match self {
            NodeEvent::Created { name, .. } | NodeEvent::Deleted { name } => Some(name),
            NodeEvent::Updated { new_name, .. } => Some(new_name),
            NodeEvent::Generic => None,
        }
    }
}

/// Apply an event to the node state. Returns whether the node should be reconciled.
pub async fn ingest(state: &NodeLabelState, event: &NodeEvent) -> bool {
    match event {
        NodeEvent::Created { name, labels } => {
            let mut nodes = state.lock().await;
            nodes.add(name);
            nodes.set_desired(name, labels).await;
            nodes.valid(name)
        }
        NodeEvent::Deleted { name } => {
            state.lock().await.remove(name);
            false
        }
        NodeEvent::Updated {
            old_name,
            new_name,
            old_labels,
            new_labels,
        } => {
            if old_labels == new_labels {
                return false;
            }

            let mut nodes = state.lock().await;
            nodes.reset_labels(old_name);
            nodes.add(new_name);
            nodes.set_desired(new_name, new_labels).await;
            true
        }
        NodeEvent::Generic => false,
    }
}

/// Converts kube watch events into create/update/delete events.
///
/// The watch stream only reports the current object, so the translator remembers the last
/// label set seen per node to supply the "old" half of an update.
#[derive(Debug, Default)]
pub struct NodeEventTranslator {
    known: HashMap<String, NodeLabelSet>,
    relisted: Option<HashSet<String>>,
}

impl NodeEventTranslator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, event: Event<Node>) -> Vec<NodeEvent> {
        match event {
            Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(node) => {
                let name = node.name_any();
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(name.clone());
                }
                vec![self.observe(name, node.labels().clone())]
            }
            Event::InitDone => {
                // Nodes missing from the relist were deleted while the watch was down.
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let gone: Vec<String> = self
                    .known
                    .keys()
                    .filter(|name| !relisted.contains(*name))
                    .cloned()
                    .collect();
                gone.into_iter()
                    .map(|name| {
                        self.known.remove(&name);
                        NodeEvent::Deleted { name }
                    })
                    .collect()
            }
            Event::Apply(node) => {
                let name = node.name_any();
                vec![self.observe(name, node.labels().clone())]
            }
            Event::Delete(node) => {
                let name = node.name_any();
                self.known.remove(&name);
                vec![NodeEvent::Deleted { name }]
            }
        }
    }

    fn observe(&mut self, name: String, labels: NodeLabelSet) -> NodeEvent {
        match self.known.insert(name.clone(), labels.clone()) {
            None => NodeEvent::Created { name, labels },
            Some(old_labels) => NodeEvent::Updated {
                old_name: name.clone(),
                new_name: name,
                old_labels,
                new_labels: labels,
            },
        }
    }
}

/// Ingest one event and reconcile its node when the event is interesting
#[instrument(skip_all, fields(node = event.node_name().unwrap_or_default()))]
pub async fn handle_event(state: &NodeLabelState, reconciler: &Reconciler, event: &NodeEvent) {
    if !ingest(state, event).await {
        debug!("Ignoring node event");
        return;
    }

    let Some(name) = event.node_name() else {
        return;
    };

    if let Err(e) = reconciler.reconcile(name).await {
        error!(error = %e, "Node reconciliation failed");
    }
}

/// Watch all Nodes and feed their changes through Event Ingestion until shutdown
pub async fn run_node_events(
    api: Api<Node>,
    state: Arc<NodeLabelState>,
    reconciler: Reconciler,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Starting node event watch");

    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    pin_mut!(stream);
    let mut translator = NodeEventTranslator::new();

    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break,
            next = stream.try_next() => next,
        };

        match next {
            Ok(Some(event)) => {
                for node_event in translator.translate(event) {
                    handle_event(&state, &reconciler, &node_event).await;
                }
            }
            Ok(None) => {
                warn!("Node watch stream ended");
                break;
            }
            Err(e) => warn!(error = %e, "Node watch error, resuming"),
        }
    }

    info!("Node event watch shutting down");
    Ok(())
}
