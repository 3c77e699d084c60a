//! End-to-end label flow against an in-memory node store

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::core::ObjectMeta;
use kube::ResourceExt;
use node_labeller::{
    ingest, ControlLoop, DefinitionStore, NodeEvent, NodeLabelState, NodeStore, ReconcileOutcome,
    Reconciler,
};
use tempfile::TempDir;

/// Node objects kept in memory, with a count of writes
#[derive(Default)]
struct InMemoryNodes {
    nodes: Mutex<HashMap<String, Node>>,
    writes: Mutex<usize>,
}

impl InMemoryNodes {
    fn insert(&self, name: &str, labels: &[(&str, &str)]) {
        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(label_set(labels)),
                ..ObjectMeta::default()
            },
            ..Node::default()
        };
        self.nodes.lock().unwrap().insert(name.to_string(), node);
    }

    fn labels(&self, name: &str) -> BTreeMap<String, String> {
        self.nodes.lock().unwrap()[name].labels().clone()
    }

    fn writes(&self) -> usize {
        *self.writes.lock().unwrap()
    }
}

#[async_trait]
impl NodeStore for InMemoryNodes {
    async fn get(&self, name: &str) -> Result<Option<Node>, kube::Error> {
        Ok(self.nodes.lock().unwrap().get(name).cloned())
    }

    async fn replace(&self, node: &Node) -> Result<Node, kube::Error> {
        *self.writes.lock().unwrap() += 1;
        self.nodes
            .lock()
            .unwrap()
            .insert(node.name_any(), node.clone());
        Ok(node.clone())
    }

    async fn list(&self) -> Result<Vec<Node>, kube::Error> {
        Ok(self.nodes.lock().unwrap().values().cloned().collect())
    }
}

fn label_set(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

struct Harness {
    dir: TempDir,
    definitions: Arc<DefinitionStore>,
    state: Arc<NodeLabelState>,
    nodes: Arc<InMemoryNodes>,
    reconciler: Reconciler,
}

fn harness(files: &[(&str, &str)]) -> Harness {
    let dir = TempDir::new().unwrap();
    for (path, content) in files {
        fs::write(dir.path().join(path), content).unwrap();
    }
    let definitions = Arc::new(DefinitionStore::load(dir.path()).unwrap());
    let state = Arc::new(NodeLabelState::new(definitions.clone()));
    let nodes = Arc::new(InMemoryNodes::default());
    let reconciler = Reconciler::new(nodes.clone(), state.clone());

    Harness {
        dir,
        definitions,
        state,
        nodes,
        reconciler,
    }
}

#[tokio::test]
async fn test_created_gpu_node_gets_label() {
    let h = harness(&[("gpu", "has-gpu\n")]);
    h.nodes.insert("node-1", &[("accelerator", "has-gpu")]);

    let interesting = ingest(
        &h.state,
        &NodeEvent::Created {
            name: "node-1".to_string(),
            labels: label_set(&[("accelerator", "has-gpu")]),
        },
    )
    .await;
    assert!(interesting);
    assert_eq!(h.state.snapshot("node-1").await.unwrap().get("gpu"), Some(&true));

    let outcome = h.reconciler.reconcile("node-1").await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::Updated { set: 1, cleared: 0 });
    assert_eq!(
        h.nodes.labels("node-1"),
        label_set(&[("accelerator", "has-gpu"), ("gpu", "true")])
    );
}

#[tokio::test]
async fn test_tombstone_is_consumed_by_reconcile() {
    let h = harness(&[("gpu", "has-gpu\n")]);
    h.nodes
        .insert("node-1", &[("accelerator", "has-gpu"), ("gpu", "true")]);

    {
        let mut state = h.state.lock().await;
        state.add("node-1");
        state
            .set_desired("node-1", &label_set(&[("accelerator", "has-gpu")]))
            .await;
        state.reset_labels("node-1");
        assert_eq!(state.labels("node-1").unwrap().get("gpu"), Some(&false));
    }

    let outcome = h.reconciler.reconcile("node-1").await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::Updated { set: 0, cleared: 1 });
    assert!(h.state.snapshot("node-1").await.unwrap().is_empty());
    assert_eq!(h.nodes.labels("node-1"), label_set(&[("accelerator", "has-gpu")]));
}

#[tokio::test]
async fn test_reconcile_twice_is_idempotent() {
    let h = harness(&[("gpu", "has-gpu\n"), ("ssd", "nvme\n")]);
    h.nodes.insert("node-1", &[("accelerator", "has-gpu")]);
    ingest(
        &h.state,
        &NodeEvent::Created {
            name: "node-1".to_string(),
            labels: label_set(&[("accelerator", "has-gpu")]),
        },
    )
    .await;

    h.reconciler.reconcile("node-1").await.unwrap();
    let first = h.nodes.labels("node-1");
    let second_outcome = h.reconciler.reconcile("node-1").await.unwrap();
    let second = h.nodes.labels("node-1");

    assert_eq!(first, second);
    assert_eq!(second_outcome, ReconcileOutcome::Unchanged);
    assert_eq!(h.nodes.writes(), 1);
}

#[tokio::test]
async fn test_label_removed_when_node_value_changes() {
    let h = harness(&[("gpu", "has-gpu\n")]);
    h.nodes.insert("node-1", &[("accelerator", "has-gpu")]);
    let created = NodeEvent::Created {
        name: "node-1".to_string(),
        labels: label_set(&[("accelerator", "has-gpu")]),
    };
    ingest(&h.state, &created).await;
    h.reconciler.reconcile("node-1").await.unwrap();

    h.nodes
        .insert("node-1", &[("accelerator", "none"), ("gpu", "true")]);
    let interesting = ingest(
        &h.state,
        &NodeEvent::Updated {
            old_name: "node-1".to_string(),
            new_name: "node-1".to_string(),
            old_labels: label_set(&[("accelerator", "has-gpu"), ("gpu", "true")]),
            new_labels: label_set(&[("accelerator", "none"), ("gpu", "true")]),
        },
    )
    .await;
    assert!(interesting);

    h.reconciler.reconcile("node-1").await.unwrap();

    assert_eq!(h.nodes.labels("node-1"), label_set(&[("accelerator", "none")]));
    assert!(!h.state.valid("node-1").await);
}

#[tokio::test]
async fn test_definition_change_refreshes_all_nodes() {
    let h = harness(&[("gpu", "has-gpu\n")]);
    h.nodes.insert("node-1", &[("accelerator", "has-gpu")]);
    h.nodes.insert("node-2", &[("disk", "nvme")]);
    let control = ControlLoop::new(h.state.clone(), h.reconciler.clone());

    control.refresh().await.unwrap();
    assert_eq!(h.nodes.labels("node-1").get("gpu").map(String::as_str), Some("true"));
    assert!(!h.nodes.labels("node-2").contains_key("ssd"));

    // The gpu definition goes away and an ssd definition appears.
    fs::remove_file(h.dir.path().join("gpu")).unwrap();
    fs::write(h.dir.path().join("ssd"), "nvme\n").unwrap();
    h.definitions.rebuild().await.unwrap();
    control.refresh().await.unwrap();

    assert_eq!(h.nodes.labels("node-1"), label_set(&[("accelerator", "has-gpu")]));
    assert_eq!(
        h.nodes.labels("node-2"),
        label_set(&[("disk", "nvme"), ("ssd", "true")])
    );
}

#[tokio::test]
async fn test_deleted_node_is_forgotten() {
    let h = harness(&[("gpu", "has-gpu\n")]);
    ingest(
        &h.state,
        &NodeEvent::Created {
            name: "node-1".to_string(),
            labels: label_set(&[("accelerator", "has-gpu")]),
        },
    )
    .await;

    let interesting = ingest(
        &h.state,
        &NodeEvent::Deleted {
            name: "node-1".to_string(),
        },
    )
    .await;

    assert!(!interesting);
    assert!(h.state.snapshot("node-1").await.is_none());
    assert_eq!(
        h.reconciler.reconcile("node-1").await.unwrap(),
        ReconcileOutcome::NodeMissing
    );
}
