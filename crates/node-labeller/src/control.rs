//! # Control Loop
//!
//! Owns the refresh channel. Every refresh re-derives desired labels for all nodes from the
//! current definitions and reconciles each one. [`Labeller`] wires the label watcher, the node
//! event watch and the control loop together for the binary.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client, ResourceExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::definitions::DefinitionStore;
use crate::error::{Error, Result};
use crate::events::run_node_events;
use crate::reconciler::Reconciler;
use crate::state::NodeLabelState;
use crate::watcher::LabelWatcher;

/// Only one refresh is ever pending; later requests fold into it.
const REFRESH_BUFFER: usize = 1;

/// Reacts to refresh requests until shutdown
pub struct ControlLoop {
    state: Arc<NodeLabelState>,
    reconciler: Reconciler,
}

/// Nodes processed by one refresh
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub nodes: usize,
    pub failed: usize,
}

impl ControlLoop {
    #[must_use]
    pub fn new(state: Arc<NodeLabelState>, reconciler: Reconciler) -> Self {
        Self { state, reconciler }
    }

    /// Block on refresh requests until `shutdown` fires or the refresh channel closes
    pub async fn run(
        &self,
        mut refresh: mpsc::Receiver<()>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Exiting..");
                    return Ok(());
                }
                request = refresh.recv() => {
                    if request.is_none() {
                        info!("Refresh channel closed, exiting..");
                        return Ok(());
                    }

                    if let Err(e) = self.refresh().await {
                        error!(error = %e, "Node label refresh failed");
                        shutdown.cancel();
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Recompute desired labels for every node in the cluster and reconcile each.
    ///
    /// Listing failures abort the refresh. A failed reconcile is logged and the refresh moves
    /// on to the next node; that node is retried on the next event or refresh.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<RefreshSummary> {
        info!("Refreshing node labels");

        let nodes = self.reconciler.nodes().list().await.map_err(Error::NodeList)?;
        let mut summary = RefreshSummary::default();

        for node in nodes {
            let name = node.name_any();
            {
                let mut state = self.state.lock().await;
                state.reset_labels(&name);
                state.add(&name);
                state.set_desired(&name, node.labels()).await;
            }

            summary.nodes += 1;
            if let Err(e) = self.reconciler.reconcile(&name).await {
                warn!(node = %name, error = %e, "Could not reconcile node during refresh");
                summary.failed += 1;
            }
        }

        info!(
            nodes = summary.nodes,
            failed = summary.failed,
            "Node label refresh complete"
        );
        Ok(summary)
    }
}

/// Startup-validated labeller, ready to run against a cluster
pub struct Labeller {
    label_watcher: LabelWatcher,
    state: Arc<NodeLabelState>,
}

impl Labeller {
    /// Build the initial definitions and register the label directory watches.
    ///
    /// Nothing here touches the cluster, so a broken label directory fails before connecting.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;

        let definitions = Arc::new(DefinitionStore::load(&config.label_dir)?);
        let label_watcher = LabelWatcher::new(&config.label_dir, definitions.clone())?;
        let state = Arc::new(NodeLabelState::new(definitions));

        Ok(Self {
            label_watcher,
            state,
        })
    }

    /// Start every loop and wait for them to finish
    pub async fn run(self, client: Client, shutdown: CancellationToken) -> Result<()> {
        let Self {
            label_watcher,
            state,
        } = self;

        let api: Api<Node> = Api::all(client);
        let reconciler = Reconciler::new(Arc::new(api.clone()), state.clone());
        let control = ControlLoop::new(state.clone(), reconciler.clone());

        let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_BUFFER);

        let watcher_handle = tokio::spawn(label_watcher.run(refresh_tx, shutdown.clone()));
        let events_handle = tokio::spawn(run_node_events(
            api,
            state,
            reconciler,
            shutdown.clone(),
        ));

        let control_result = control.run(refresh_rx, shutdown.clone()).await;

        // Whatever stopped the control loop stops the other loops too.
        shutdown.cancel();
        let watcher_result = join(watcher_handle, "label watcher").await;
        let events_result = join(events_handle, "node events").await;

        control_result.and(watcher_result).and(events_result)
    }
}

async fn join(handle: tokio::task::JoinHandle<Result<()>>, name: &str) -> Result<()> {
    match handle.await {
        Ok(result) => result,
        Err(e) => {
            error!(task = name, error = %e, "Task join error");
            Err(Error::Task {
                name: name.to_string(),
                source: e,
            })
        }
    }
}
