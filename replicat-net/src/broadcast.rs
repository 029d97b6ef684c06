//! Event fan-out to the manager and every peer.
//!
//! The broadcaster is the relay a tracker hands its outbound events
//! to. Locally observed changes pass through the ownership ledger
//! first, so changes this node only applied on behalf of a peer die
//! here instead of echoing around the cluster. Each delivery runs as
//! its own detached task; a slow or dead peer never blocks the
//! tracker's event loop.

use std::sync::Arc;

use replicat_proto::{Entry, Event, EventKind};
use replicat_tracker::{EventRelay, UploadBody};
use tracing::{debug, warn};

use crate::client::PeerClient;
use crate::cluster::ClusterView;
use crate::ownership::OwnershipLedger;

pub struct Broadcaster {
    client: Arc<PeerClient>,
    cluster: Arc<ClusterView>,
    ledger: Arc<OwnershipLedger>,
    /// A node without a manager still fans out to its peers.
    manager_address: Option<String>,
}

impl Broadcaster {
    pub fn new(
        client: Arc<PeerClient>,
        cluster: Arc<ClusterView>,
        ledger: Arc<OwnershipLedger>,
        manager_address: Option<String>,
    ) -> Self {
        Self {
            client,
            cluster,
            ledger,
            manager_address,
        }
    }

    /// Backend-change kinds answer to the ledger; protocol kinds
    /// (catalogs, file requests, test markers) are always authored
    /// deliberately and bypass it.
    fn suppressible(kind: EventKind) -> bool {
        matches!(
            kind,
            EventKind::Create | EventKind::Write | EventKind::Remove | EventKind::Rename
        )
    }

    fn deliver(&self, address: String, event: Event, upload: Option<(Entry, UploadBody)>) {
        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            if let Err(e) = client.post_event(&address, &event).await {
                warn!("event delivery to {} failed: {}", address, e);
                return;
            }
            // A body follows only when the event names a destination
            // file; move-outs and directories have nothing to send.
            let wants_body =
                event.kind.carries_body() && !event.path.is_empty() && !event.is_directory;
            if let (true, Some((entry, body))) = (wants_body, upload) {
                if let Err(e) = client.upload(&address, &entry, body).await {
                    warn!("upload of {} to {} failed: {}", event.path, address, e);
                }
            }
        });
    }

    fn targets(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .cluster
            .peers()
            .into_iter()
            .map(|peer| peer.address)
            .collect();
        addresses.extend(self.manager_address.clone());
        addresses
    }
}

impl EventRelay for Broadcaster {
    fn broadcast(&self, event: Event, upload: Option<(Entry, UploadBody)>) {
        if Self::suppressible(event.kind)
            && !self
                .ledger
                .try_claim(event.ledger_path(), self.cluster.self_name())
        {
            debug!("suppressing echo of peer change to {}", event.ledger_path());
            return;
        }
        for address in self.targets() {
            self.deliver(address, event.clone(), upload.clone());
        }
    }

    fn send_to(&self, target_node: &str, event: Event) {
        let Some(node) = self.cluster.get(target_node) else {
            warn!("no address for node {}, dropping {:?}", target_node, event.kind);
            return;
        };
        self.deliver(node.address, event, None);
    }

    fn upload(&self, target_node: &str, entry: Entry, body: UploadBody) {
        let Some(node) = self.cluster.get(target_node) else {
            warn!("no address for node {}, dropping upload", target_node);
            return;
        };
        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            if let Err(e) = client.upload(&node.address, &entry, body).await {
                warn!(
                    "upload of {} to {} failed: {}",
                    entry.relative_path, node.address, e
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_kinds_bypass_ledger() {
        assert!(Broadcaster::suppressible(EventKind::Create));
        assert!(Broadcaster::suppressible(EventKind::Rename));
        assert!(!Broadcaster::suppressible(EventKind::Catalog));
        assert!(!Broadcaster::suppressible(EventKind::FileRequest));
        assert!(!Broadcaster::suppressible(EventKind::StartTest));
    }
}
