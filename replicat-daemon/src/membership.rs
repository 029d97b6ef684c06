//! Cluster membership reactions.
//!
//! A single worker drains node map pushes and compares each against
//! the previous map. Draining on one task keeps reactions sequential:
//! two rapid pushes can never interleave their catalog exchanges.
//!
//! Reactions:
//!   * this node appears in the map: it was admitted, broadcast the
//!     catalog so peers can reconcile against it;
//!   * another node appears, or transitions into Joining Cluster: push
//!     the folder tree and a targeted catalog so it can catch up;
//!   * a node disappears: nothing to transfer, just note it.

use std::sync::Arc;
use std::time::Duration;

use replicat_net::{ClusterView, PeerClient};
use replicat_proto::{
    dir_tree_of, encode_catalog, Event, EventKind, NodeDescriptor, NodeMap, NodeStatus,
};
use replicat_tracker::{Statistic, StorageTracker};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How often the daemon re-registers with the manager.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct MembershipWorker {
    cluster: Arc<ClusterView>,
    tracker: Arc<dyn StorageTracker>,
    client: Arc<PeerClient>,
    previous: NodeMap,
}

impl MembershipWorker {
    pub fn new(
        cluster: Arc<ClusterView>,
        tracker: Arc<dyn StorageTracker>,
        client: Arc<PeerClient>,
    ) -> Self {
        Self {
            cluster,
            tracker,
            client,
            previous: NodeMap::new(),
        }
    }

    /// Drain node map pushes until the sender side closes.
    pub async fn run(mut self, mut rx: mpsc::Receiver<NodeMap>) {
        while let Some(map) = rx.recv().await {
            self.apply(map).await;
        }
        debug!("membership channel closed");
    }

    async fn apply(&mut self, map: NodeMap) {
        let mut joiners: Vec<NodeDescriptor> = Vec::new();
        let mut admitted: Option<NodeDescriptor> = None;

        for (name, node) in &map {
            match self.previous.get(name) {
                None if name == self.cluster.self_name() => {
                    info!("admitted to cluster as {}", name);
                    admitted = Some(node.clone());
                }
                None => {
                    info!("node {} joined at {}", name, node.address);
                    joiners.push(node.clone());
                }
                Some(old) if old.status != node.status => {
                    debug!("node {} now {:?}", name, node.status);
                    if node.status == NodeStatus::JoiningCluster
                        && name != self.cluster.self_name()
                    {
                        joiners.push(node.clone());
                    }
                }
                Some(_) => {}
            }
        }
        for name in self.previous.keys() {
            if !map.contains_key(name) {
                info!("node {} left the cluster", name);
            }
        }
        self.previous = map;

        if let Some(descriptor) = admitted {
            // Admission may arrive long after startup; rescan so the
            // catalog the cluster sees is current, then broadcast the
            // folder skeleton and the catalog itself.
            if let Err(e) = self.tracker.initialize(&descriptor).await {
                warn!("rescan on admission failed: {}", e);
            }
            let tree = dir_tree_of(&self.tracker.snapshot().await);
            for peer in self.cluster.peers() {
                if let Err(e) = self.client.post_tree(&peer.address, &tree).await {
                    warn!("tree push to {} failed: {}", peer.name, e);
                }
            }
            self.tracker.send_catalog().await;
        }
        for node in joiners {
            self.share_with(&node).await;
        }
    }

    /// Give one node everything it needs to reconcile: the folder
    /// skeleton first, then the catalog it diffs against.
    async fn share_with(&self, node: &NodeDescriptor) {
        let snapshot = self.tracker.snapshot().await;
        if let Err(e) = self
            .client
            .post_tree(&node.address, &dir_tree_of(&snapshot))
            .await
        {
            warn!("tree push to {} failed: {}", node.name, e);
        }
        let payload = match encode_catalog(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("catalog encode failed: {}", e);
                return;
            }
        };
        // Counted like a broadcast catalog even though this one goes
        // to a single joiner.
        self.tracker
            .statistics()
            .increment(Statistic::CatalogsSent, 1);
        let event = Event::new(
            EventKind::Catalog,
            self.tracker.node_name().to_string(),
            "",
        )
        .payload(payload);
        if let Err(e) = self.client.post_event(&node.address, &event).await {
            warn!("catalog send to {} failed: {}", node.name, e);
        }
    }
}

/// Periodically re-register with the manager so it knows this node is
/// alive and what state it is in.
pub async fn heartbeat(
    client: Arc<PeerClient>,
    tracker: Arc<dyn StorageTracker>,
    manager_address: String,
    mut descriptor: NodeDescriptor,
) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        descriptor.status = tracker.status();
        descriptor.previous_state = std::mem::take(&mut descriptor.current_state);
        descriptor.current_state = tracker.snapshot().await;
        if let Err(e) = client.register(&manager_address, &descriptor).await {
            warn!("heartbeat to manager failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replicat_net::Credentials;
    use replicat_tracker::InMemoryTracker;

    fn worker(self_name: &str) -> MembershipWorker {
        let (cluster, _rx) = ClusterView::new(self_name);
        let tracker = Arc::new(InMemoryTracker::new(self_name));
        let creds: Credentials = "u:p".parse().unwrap();
        MembershipWorker::new(cluster, tracker, Arc::new(PeerClient::new(creds).unwrap()))
    }

    fn map_of(names: &[(&str, NodeStatus)]) -> NodeMap {
        names
            .iter()
            .map(|(name, status)| {
                let mut node = NodeDescriptor::new("key", *name, "127.0.0.1:1");
                node.status = *status;
                (name.to_string(), node)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_previous_map_tracks_pushes() {
        let mut w = worker("node-a");
        // Peer sends fail against the dead address; the diff state
        // must still advance.
        w.apply(map_of(&[("node-a", NodeStatus::JoiningCluster)]))
            .await;
        assert_eq!(w.previous.len(), 1);

        w.apply(map_of(&[
            ("node-a", NodeStatus::Online),
            ("node-b", NodeStatus::JoiningCluster),
        ]))
        .await;
        assert_eq!(w.previous.len(), 2);
        assert_eq!(w.previous["node-a"].status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_catalogs_sent_counts_joiner_shares() {
        let mut w = worker("node-a");
        // Own admission broadcasts one catalog.
        w.apply(map_of(&[("node-a", NodeStatus::JoiningCluster)]))
            .await;
        assert_eq!(
            w.tracker.statistics().get(Statistic::CatalogsSent),
            1
        );

        // A joining peer gets a targeted catalog, counted the same way.
        w.apply(map_of(&[
            ("node-a", NodeStatus::Online),
            ("node-b", NodeStatus::JoiningCluster),
        ]))
        .await;
        assert_eq!(
            w.tracker.statistics().get(Statistic::CatalogsSent),
            2
        );
    }
}
