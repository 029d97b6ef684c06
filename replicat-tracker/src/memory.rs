//! Backend-free tracker used in tests and protocol plumbing.
//!
//! Implements the full tracker contract against nothing but the tree
//! model and a map of file bodies, so transport and reconciliation
//! code can be exercised without a filesystem or a bucket.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use replicat_proto::{
    content_hash, decode_catalog, encode_catalog, encode_requested_paths, Entry, Event, EventKind,
    NodeDescriptor, NodeStatus, RequestedPaths,
};
use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::errors::{Result, TrackerError};
use crate::reconcile::{group_by_source, reconcile, NeededFile};
use crate::stats::{Statistic, Statistics};
use crate::tracker::{EventRelay, NullRelay, StorageTracker};
use crate::tree::TreeModel;

#[derive(Default)]
struct MemoryState {
    tree: TreeModel,
    bodies: HashMap<String, Vec<u8>>,
    needed: HashMap<String, NeededFile>,
}

pub struct InMemoryTracker {
    node_name: String,
    state: RwLock<MemoryState>,
    stats: Statistics,
    relay: Arc<dyn EventRelay>,
    status_tx: watch::Sender<NodeStatus>,
}

impl InMemoryTracker {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self::with_relay(node_name, Arc::new(NullRelay))
    }

    pub fn with_relay(node_name: impl Into<String>, relay: Arc<dyn EventRelay>) -> Self {
        let (status_tx, _) = watch::channel(NodeStatus::InitialScan);
        Self {
            node_name: node_name.into(),
            state: RwLock::new(MemoryState::default()),
            stats: Statistics::new(),
            relay,
            status_tx,
        }
    }

    pub async fn outstanding_files(&self) -> usize {
        self.state.read().await.needed.len()
    }
}

#[async_trait]
impl StorageTracker for InMemoryTracker {
    async fn initialize(&self, _descriptor: &NodeDescriptor) -> Result<()> {
        let _ = self.status_tx.send_replace(NodeStatus::JoiningCluster);
        Ok(())
    }

    async fn create_path(
        &self,
        relative_path: &str,
        is_directory: bool,
        mod_time: DateTime<Utc>,
    ) -> Result<()> {
        let mut st = self.state.write().await;
        if st.tree.contains(relative_path) {
            return Ok(());
        }
        let entry = if is_directory {
            Entry::directory(relative_path, mod_time)
        } else {
            Entry::file(relative_path, 0, mod_time)
        }
        .with_origin(self.node_name.clone());
        st.tree.insert(entry);
        drop(st);
        self.stats.increment(
            if is_directory {
                Statistic::TotalFolders
            } else {
                Statistic::TotalFiles
            },
            1,
        );
        Ok(())
    }

    async fn rename(&self, source: &str, destination: &str, is_directory: bool) -> Result<()> {
        if source.is_empty() {
            return self.create_path(destination, is_directory, Utc::now()).await;
        }
        if destination.is_empty() {
            return self.delete(source).await;
        }
        let mut st = self.state.write().await;
        st.tree.rename(source, destination);
        if let Some(body) = st.bodies.remove(source) {
            st.bodies.insert(destination.to_string(), body);
        }
        Ok(())
    }

    async fn delete(&self, relative_path: &str) -> Result<()> {
        let mut st = self.state.write().await;
        let removed = st.tree.remove_subtree(relative_path);
        for entry in &removed {
            st.bodies.remove(&entry.relative_path);
            if !entry.is_directory {
                self.stats.increment(Statistic::FilesDeleted, 1);
            }
        }
        Ok(())
    }

    async fn get_entry(&self, relative_path: &str) -> Result<Entry> {
        self.state
            .read()
            .await
            .tree
            .get(relative_path)
            .cloned()
            .ok_or_else(|| TrackerError::NotFound(relative_path.to_string()))
    }

    async fn snapshot(&self) -> Vec<Entry> {
        self.state.read().await.tree.snapshot()
    }

    async fn send_catalog(&self) {
        let snapshot = self.snapshot().await;
        if let Ok(payload) = encode_catalog(&snapshot) {
            self.stats.increment(Statistic::CatalogsSent, 1);
            let event =
                Event::new(EventKind::Catalog, self.node_name.clone(), "").payload(payload);
            self.relay.broadcast(event, None);
        }
    }

    async fn process_catalog(&self, event: &Event) -> Result<()> {
        self.stats.increment(Statistic::CatalogsReceived, 1);
        let remote = decode_catalog(&event.raw_payload)?;
        let plan = {
            let mut st = self.state.write().await;
            let plan = reconcile(&st.tree, &remote, &st.needed, &mut rand::thread_rng());
            st.needed = plan.needed.clone();
            plan
        };
        for dir in &plan.create_dirs {
            self.create_path(&dir.relative_path, true, dir.mod_time).await?;
        }
        if plan.needed.is_empty() {
            let _ = self.status_tx.send_replace(NodeStatus::Online);
            return Ok(());
        }
        let _ = self.status_tx.send_replace(NodeStatus::JoiningCluster);
        for (source, requests) in group_by_source(&plan.needed) {
            let payload = encode_requested_paths(&requests)?;
            let request =
                Event::new(EventKind::FileRequest, self.node_name.clone(), "").payload(payload);
            self.relay.send_to(&source, request);
        }
        Ok(())
    }

    async fn send_requested_paths(
        &self,
        requests: RequestedPaths,
        target_node: &str,
    ) -> Result<()> {
        for path in requests.keys() {
            debug!("would send {} to {}", path, target_node);
            self.stats.increment(Statistic::FilesSent, 1);
        }
        Ok(())
    }

    async fn store_file(&self, entry: &Entry, body: &[u8]) -> Result<()> {
        let mut stored = Entry::file(&entry.relative_path, body.len() as i64, entry.mod_time)
            .with_origin(entry.origin_server.clone());
        stored.content_hash = content_hash(body);
        let drained = {
            let mut st = self.state.write().await;
            st.tree.insert(stored);
            st.bodies.insert(entry.relative_path.clone(), body.to_vec());
            st.needed.remove(&entry.relative_path);
            st.needed.is_empty()
        };
        self.stats.increment(Statistic::FilesReceived, 1);
        if drained && self.status() == NodeStatus::JoiningCluster {
            let _ = self.status_tx.send_replace(NodeStatus::Online);
        }
        Ok(())
    }

    async fn read_file(&self, relative_path: &str) -> Result<Vec<u8>> {
        self.state
            .read()
            .await
            .bodies
            .get(relative_path)
            .cloned()
            .ok_or_else(|| TrackerError::NotFound(relative_path.to_string()))
    }

    fn statistics(&self) -> &Statistics {
        &self.stats
    }

    fn status(&self) -> NodeStatus {
        *self.status_tx.borrow()
    }

    fn node_name(&self) -> &str {
        &self.node_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_contract_basics() {
        let tracker = InMemoryTracker::new("mem");
        tracker
            .initialize(&NodeDescriptor::new("k", "mem", "addr"))
            .await
            .unwrap();

        tracker.create_path("a", true, Utc::now()).await.unwrap();
        tracker
            .create_path("a/b.txt", false, Utc::now())
            .await
            .unwrap();
        tracker.rename("a/b.txt", "a/c.txt", false).await.unwrap();

        assert!(tracker.get_entry("a/b.txt").await.is_err());
        assert!(tracker.get_entry("a/c.txt").await.is_ok());

        tracker.delete("a").await.unwrap();
        assert!(tracker.get_entry("a/c.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_store_and_read_body() {
        let tracker = InMemoryTracker::new("mem");
        let entry = Entry::file("x", 4, Utc::now()).with_origin("peer");
        tracker.store_file(&entry, b"body").await.unwrap();
        assert_eq!(tracker.read_file("x").await.unwrap(), b"body");
        assert_eq!(
            tracker.get_entry("x").await.unwrap().content_hash,
            content_hash(b"body")
        );
    }
}
