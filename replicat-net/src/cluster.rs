//! Current view of cluster membership.
//!
//! The manager pushes the authoritative node map over HTTP; the view
//! keeps the latest copy for address lookups and forwards each push to
//! a single consumer through a bounded channel. One consumer keeps the
//! membership diffing sequential, so a burst of pushes cannot race
//! catalog exchanges against each other.

use std::sync::{Arc, RwLock};

use replicat_proto::{NodeDescriptor, NodeMap};
use tokio::sync::mpsc;
use tracing::warn;

/// Bound on queued membership pushes before backpressure drops them.
pub const MEMBERSHIP_QUEUE: usize = 100;

pub struct ClusterView {
    self_name: String,
    nodes: RwLock<NodeMap>,
    tx: mpsc::Sender<NodeMap>,
}

impl ClusterView {
    /// Returns the view and the receiver its consumer loop drains.
    pub fn new(self_name: impl Into<String>) -> (Arc<Self>, mpsc::Receiver<NodeMap>) {
        let (tx, rx) = mpsc::channel(MEMBERSHIP_QUEUE);
        let view = Arc::new(Self {
            self_name: self_name.into(),
            nodes: RwLock::new(NodeMap::new()),
            tx,
        });
        (view, rx)
    }

    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    /// Replace the current map and hand it to the consumer.
    pub fn submit(&self, map: NodeMap) {
        *self.nodes.write().unwrap() = map.clone();
        if self.tx.try_send(map).is_err() {
            // The consumer reconciles against the latest stored map on
            // its next wakeup, so a dropped push self-heals.
            warn!("membership queue full, dropping node map push");
        }
    }

    pub fn get(&self, name: &str) -> Option<NodeDescriptor> {
        self.nodes.read().unwrap().get(name).cloned()
    }

    /// Every known node except this one.
    pub fn peers(&self) -> Vec<NodeDescriptor> {
        self.nodes
            .read()
            .unwrap()
            .values()
            .filter(|node| node.name != self.self_name)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> NodeMap {
        self.nodes.read().unwrap().clone()
    }
}
