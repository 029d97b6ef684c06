//! Object-store storage tracker.
//!
//! A bucket acts as the tracked directory: objects are files keyed by
//! their relative path and directories are implicit. Bucket
//! notifications map straight onto Create/Write/Remove; a rename
//! appears as a remove and a create that share an etag, paired by the
//! same in-progress table the filesystem variant uses, with the much
//! shorter object-store reap window. A half whose partner never
//! arrives falls back to the plain Create or Remove it really was.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use replicat_proto::{
    content_hash, decode_catalog, encode_catalog, encode_requested_paths, upload_digest_bytes,
    Entry, Event, EventKind, NodeDescriptor, NodeStatus, RequestedPaths,
};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::errors::{Result, TrackerError};
use crate::reconcile::{group_by_source, reconcile, NeededFile};
use crate::rename::{fallback_id, RenameInProgress, OBJECT_RENAME_TIMEOUT};
use crate::stats::{Statistic, Statistics};
use crate::tracker::{is_ignored_leaf, EventRelay, StorageTracker, UploadBody};
use crate::tree::TreeModel;

/// Metadata the backend reports for one object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub key: String,
    pub size: i64,
    pub mod_time: DateTime<Utc>,
    pub etag: String,
}

/// Bucket notification, already filtered to create/access/remove.
#[derive(Debug, Clone)]
pub enum ObjectNotification {
    Created(ObjectMeta),
    Written(ObjectMeta),
    Removed(String),
}

/// The slice of an object-store SDK the tracker consumes.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn put(&self, key: &str, body: &[u8]) -> std::io::Result<ObjectMeta>;
    async fn get(&self, key: &str) -> std::io::Result<Vec<u8>>;
    async fn copy(&self, from: &str, to: &str) -> std::io::Result<ObjectMeta>;
    async fn delete(&self, key: &str) -> std::io::Result<()>;
    async fn list(&self) -> std::io::Result<Vec<ObjectMeta>>;
    fn subscribe(&self) -> mpsc::Receiver<ObjectNotification>;
}

#[derive(Default)]
struct ObjectState {
    tree: TreeModel,
    /// etag per key, for pairing rename halves.
    etags: HashMap<String, String>,
    renames: HashMap<u64, RenameInProgress>,
    needed: HashMap<String, NeededFile>,
}

pub struct ObjectStoreTracker {
    node_name: String,
    backend: Arc<dyn ObjectBackend>,
    state: RwLock<ObjectState>,
    stats: Statistics,
    relay: Arc<dyn EventRelay>,
    status_tx: watch::Sender<NodeStatus>,
}

impl ObjectStoreTracker {
    pub fn new(
        node_name: impl Into<String>,
        backend: Arc<dyn ObjectBackend>,
        relay: Arc<dyn EventRelay>,
    ) -> Self {
        let (status_tx, _) = watch::channel(NodeStatus::InitialScan);
        Self {
            node_name: node_name.into(),
            backend,
            state: RwLock::new(ObjectState::default()),
            stats: Statistics::new(),
            relay,
            status_tx,
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<NodeStatus> {
        self.status_tx.subscribe()
    }

    fn set_status(&self, status: NodeStatus) {
        let _ = self.status_tx.send_replace(status);
    }

    pub async fn outstanding_files(&self) -> usize {
        self.state.read().await.needed.len()
    }

    /// Begin draining bucket notifications.
    pub fn start(self: &Arc<Self>) {
        let mut rx = self.backend.subscribe();
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                tracker.handle_notification(notification).await;
            }
            debug!("bucket notification stream closed");
        });
    }

    fn entry_for(&self, meta: &ObjectMeta, body: Option<&[u8]>) -> Entry {
        let mut entry = Entry::file(meta.key.clone(), meta.size, meta.mod_time)
            .with_origin(self.node_name.clone());
        if let Some(body) = body {
            entry.content_hash = content_hash(body);
        }
        entry
    }

    fn tracked(key: &str) -> bool {
        let leaf = key.rsplit('/').next().unwrap_or(key);
        !key.is_empty() && !is_ignored_leaf(leaf)
    }

    async fn handle_notification(self: &Arc<Self>, notification: ObjectNotification) {
        match notification {
            ObjectNotification::Created(meta) if Self::tracked(&meta.key) => {
                self.observe_created(meta).await;
            }
            ObjectNotification::Written(meta) if Self::tracked(&meta.key) => {
                self.observe_written(meta).await;
            }
            ObjectNotification::Removed(key) if Self::tracked(&key) => {
                self.observe_removed(key).await;
            }
            _ => {}
        }
    }

    /// A created object pairs with a removed key that carried the same
    /// etag, which is how a copy+delete rename looks from the outside.
    /// With no such source candidate in the bucket the create is a
    /// plain create and broadcasts right away.
    async fn observe_created(self: &Arc<Self>, meta: ObjectMeta) {
        let body = self.backend.get(&meta.key).await.ok();
        let entry = self.entry_for(&meta, body.as_deref());

        let (completed, new_record, plain) = {
            let mut st = self.state.write().await;
            if st.tree.contains(&meta.key) {
                return;
            }
            let source_candidate = st
                .etags
                .iter()
                .any(|(key, etag)| etag == &meta.etag && key != &meta.key);
            st.tree.insert(entry.clone());
            st.etags.insert(meta.key.clone(), meta.etag.clone());

            let id = fallback_id(&meta.etag);
            let pending = st.renames.contains_key(&id);
            if pending || source_candidate {
                let record = st.renames.entry(id).or_insert_with(RenameInProgress::new);
                record.record_destination(meta.key.clone(), entry.clone());
                if let Some((from, to)) = record.complete() {
                    let pair = (from.to_string(), to.to_string());
                    st.renames.remove(&id);
                    (Some(pair), None, false)
                } else {
                    (None, (!pending).then_some(id), false)
                }
            } else {
                (None, None, true)
            }
        };
        self.stats.increment(Statistic::TotalFiles, 1);

        if let Some((from, to)) = completed {
            self.emit_rename(&from, &to).await;
        } else if let Some(id) = new_record {
            self.spawn_reaper(id);
        } else if plain {
            let event = Event::new(EventKind::Create, self.node_name.clone(), meta.key.clone())
                .mod_time(meta.mod_time);
            let upload = body.map(|bytes| (entry, UploadBody::Bytes(bytes)));
            self.relay.broadcast(event, upload);
        }
    }

    async fn observe_written(&self, meta: ObjectMeta) {
        let body = self.backend.get(&meta.key).await.ok();
        let entry = self.entry_for(&meta, body.as_deref());
        {
            let mut st = self.state.write().await;
            st.etags.insert(meta.key.clone(), meta.etag.clone());
            st.tree.insert(entry.clone());
        }
        let event = Event::new(EventKind::Write, self.node_name.clone(), &meta.key)
            .mod_time(meta.mod_time);
        let upload = body.map(|bytes| (entry, UploadBody::Bytes(bytes)));
        self.relay.broadcast(event, upload);
    }

    /// A removed key whose etag matches a pending created object is
    /// the source half of a rename.
    async fn observe_removed(self: &Arc<Self>, key: String) {
        let (completed, new_record) = {
            let mut st = self.state.write().await;
            if !st.tree.contains(&key) {
                return;
            }
            let Some(etag) = st.etags.remove(&key) else {
                let removed = st.tree.remove(&key).is_some();
                drop(st);
                if removed {
                    self.stats.increment(Statistic::TotalFiles, -1);
                    self.stats.increment(Statistic::FilesDeleted, 1);
                    let event = Event::new(EventKind::Remove, self.node_name.clone(), &key);
                    self.relay.broadcast(event, None);
                }
                return;
            };
            let id = fallback_id(&etag);
            let existed = st.renames.contains_key(&id);
            let record = st.renames.entry(id).or_insert_with(RenameInProgress::new);
            record.record_source(key.clone());
            if let Some((from, to)) = record.complete() {
                let pair = (from.to_string(), to.to_string());
                st.renames.remove(&id);
                (Some(pair), None)
            } else {
                (None, (!existed).then_some(id))
            }
        };

        if let Some((from, to)) = completed {
            self.emit_rename(&from, &to).await;
        } else if let Some(id) = new_record {
            self.spawn_reaper(id);
        }
    }

    fn spawn_reaper(self: &Arc<Self>, id: u64) {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(OBJECT_RENAME_TIMEOUT).await;
            tracker.reap_rename(id).await;
        });
    }

    /// Finalize a half whose partner never arrived: it was the plain
    /// create or remove it looked like all along.
    async fn reap_rename(&self, id: u64) {
        let record = {
            let mut st = self.state.write().await;
            st.renames.remove(&id)
        };
        let Some(record) = record else { return };
        match (record.source_path, record.destination_path) {
            (Some(from), None) => {
                let existed = {
                    let mut st = self.state.write().await;
                    st.tree.remove(&from).is_some()
                };
                if existed {
                    self.stats.increment(Statistic::TotalFiles, -1);
                    self.stats.increment(Statistic::FilesDeleted, 1);
                    let event = Event::new(EventKind::Remove, self.node_name.clone(), from);
                    self.relay.broadcast(event, None);
                }
            }
            (None, Some(to)) => {
                let body = self.backend.get(&to).await.ok();
                let mut event = Event::new(EventKind::Create, self.node_name.clone(), to);
                if let Some(meta) = &record.destination_meta {
                    event = event.mod_time(meta.mod_time);
                }
                let upload = match (record.destination_meta, body) {
                    (Some(meta), Some(bytes)) => Some((meta, UploadBody::Bytes(bytes))),
                    _ => None,
                };
                self.relay.broadcast(event, upload);
            }
            _ => {}
        }
    }

    async fn emit_rename(&self, from: &str, to: &str) {
        // Destination entry was inserted when its half arrived; drop
        // the stale source entry.
        let removed = {
            let mut st = self.state.write().await;
            st.tree.remove(from).is_some()
        };
        if removed {
            self.stats.increment(Statistic::TotalFiles, -1);
        }
        debug!("object rename {} -> {}", from, to);
        let event = Event::new(EventKind::Rename, self.node_name.clone(), to).source_path(from);
        self.relay.broadcast(event, None);
    }
}

#[async_trait]
impl StorageTracker for ObjectStoreTracker {
    async fn initialize(&self, _descriptor: &NodeDescriptor) -> Result<()> {
        self.set_status(NodeStatus::InitialScan);
        let objects = self.backend.list().await?;
        {
            let mut st = self.state.write().await;
            st.tree = TreeModel::new();
            st.etags.clear();
            for meta in &objects {
                if !Self::tracked(&meta.key) {
                    continue;
                }
                let body = self.backend.get(&meta.key).await.ok();
                st.tree.insert(self.entry_for(meta, body.as_deref()));
                st.etags.insert(meta.key.clone(), meta.etag.clone());
            }
            self.stats.set(Statistic::TotalFiles, st.tree.len() as i64);
        }
        info!("bucket scan found {} objects", objects.len());
        self.set_status(NodeStatus::JoiningCluster);
        Ok(())
    }

    async fn create_path(
        &self,
        relative_path: &str,
        is_directory: bool,
        mod_time: DateTime<Utc>,
    ) -> Result<()> {
        if is_directory {
            // Directories are implicit in a bucket.
            return Ok(());
        }
        {
            let st = self.state.read().await;
            if st.tree.contains(relative_path) {
                return Ok(());
            }
        }
        let meta = self.backend.put(relative_path, &[]).await?;
        let mut st = self.state.write().await;
        st.etags.insert(relative_path.to_string(), meta.etag.clone());
        let mut entry = self.entry_for(&meta, Some(&[]));
        entry.mod_time = mod_time;
        st.tree.insert(entry);
        Ok(())
    }

    async fn rename(&self, source: &str, destination: &str, is_directory: bool) -> Result<()> {
        if source.is_empty() {
            return self.create_path(destination, is_directory, Utc::now()).await;
        }
        if destination.is_empty() {
            return self.delete(source).await;
        }
        let meta = self.backend.copy(source, destination).await?;
        self.backend.delete(source).await?;
        let mut st = self.state.write().await;
        st.tree.rename(source, destination);
        let etag = meta.etag.clone();
        st.etags.remove(source);
        st.etags.insert(destination.to_string(), etag);
        Ok(())
    }

    async fn delete(&self, relative_path: &str) -> Result<()> {
        match self.backend.delete(relative_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut st = self.state.write().await;
        if st.tree.remove(relative_path).is_some() {
            self.stats.increment(Statistic::FilesDeleted, 1);
        }
        st.etags.remove(relative_path);
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
        let payload = match encode_catalog(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                error!("catalog encode failed: {}", e);
                return;
            }
        };
        self.stats.increment(Statistic::CatalogsSent, 1);
        let event = Event::new(EventKind::Catalog, self.node_name.clone(), "").payload(payload);
        self.relay.broadcast(event, None);
    }

    async fn process_catalog(&self, event: &Event) -> Result<()> {
        self.stats.increment(Statistic::CatalogsReceived, 1);
        let remote = decode_catalog(&event.raw_payload)?;
        let plan = {
            let mut st = self.state.write().await;
            // Remote directories need no backend op here; drop them
            // from the plan and request only file bodies.
            let plan = reconcile(&st.tree, &remote, &st.needed, &mut rand::thread_rng());
            st.needed = plan.needed.clone();
            plan
        };
        if plan.needed.is_empty() {
            self.set_status(NodeStatus::Online);
            return Ok(());
        }
        self.set_status(NodeStatus::JoiningCluster);
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
            let entry = match self.get_entry(path).await {
                Ok(entry) => entry,
                Err(_) => {
                    warn!("requested key {} no longer tracked", path);
                    continue;
                }
            };
            let body = self.backend.get(path).await?;
            self.stats.increment(Statistic::FilesSent, 1);
            self.relay.upload(target_node, entry, UploadBody::Bytes(body));
        }
        Ok(())
    }

    async fn store_file(&self, entry: &Entry, body: &[u8]) -> Result<()> {
        let meta = self.backend.put(&entry.relative_path, body).await?;
        let mut stored = self.entry_for(&meta, Some(body));
        stored.mod_time = entry.mod_time;
        stored.origin_server = entry.origin_server.clone();
        let drained = {
            let mut st = self.state.write().await;
            st.etags.insert(entry.relative_path.clone(), meta.etag.clone());
            st.tree.insert(stored);
            st.needed.remove(&entry.relative_path);
            st.needed.is_empty()
        };
        self.stats.increment(Statistic::FilesReceived, 1);
        if drained && self.status() == NodeStatus::JoiningCluster {
            self.set_status(NodeStatus::Online);
        }
        Ok(())
    }

    async fn read_file(&self, relative_path: &str) -> Result<Vec<u8>> {
        Ok(self.backend.get(relative_path).await?)
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

/// In-memory bucket with notification fan-out, used by tests and as
/// the reference backend implementation.
#[derive(Default)]
pub struct MemoryBucket {
    objects: StdMutex<HashMap<String, (Vec<u8>, ObjectMeta)>>,
    subscribers: StdMutex<Vec<mpsc::Sender<ObjectNotification>>>,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, notification: ObjectNotification) {
        let subscribers = self.subscribers.lock().unwrap();
        for tx in subscribers.iter() {
            let _ = tx.try_send(notification.clone());
        }
    }

    fn meta_for(key: &str, body: &[u8]) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size: body.len() as i64,
            mod_time: Utc::now(),
            etag: upload_digest_bytes(body),
        }
    }
}

#[async_trait]
impl ObjectBackend for MemoryBucket {
    async fn put(&self, key: &str, body: &[u8]) -> std::io::Result<ObjectMeta> {
        let meta = Self::meta_for(key, body);
        let existed = {
            let mut objects = self.objects.lock().unwrap();
            objects
                .insert(key.to_string(), (body.to_vec(), meta.clone()))
                .is_some()
        };
        if existed {
            self.notify(ObjectNotification::Written(meta.clone()));
        } else {
            self.notify(ObjectNotification::Created(meta.clone()));
        }
        Ok(meta)
    }

    async fn get(&self, key: &str) -> std::io::Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(body, _)| body.clone())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, key.to_string()))
    }

    async fn copy(&self, from: &str, to: &str) -> std::io::Result<ObjectMeta> {
        let (body, source_meta) = self
            .objects
            .lock()
            .unwrap()
            .get(from)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, from.to_string()))?;
        // Copies keep the source etag, which is what lets the rename
        // resolver pair the two notifications.
        let meta = ObjectMeta {
            key: to.to_string(),
            ..source_meta
        };
        self.objects
            .lock()
            .unwrap()
            .insert(to.to_string(), (body, meta.clone()));
        self.notify(ObjectNotification::Created(meta.clone()));
        Ok(meta)
    }

    async fn delete(&self, key: &str) -> std::io::Result<()> {
        let existed = self.objects.lock().unwrap().remove(key).is_some();
        if !existed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                key.to_string(),
            ));
        }
        self.notify(ObjectNotification::Removed(key.to_string()));
        Ok(())
    }

    async fn list(&self) -> std::io::Result<Vec<ObjectMeta>> {
        let mut metas: Vec<ObjectMeta> = self
            .objects
            .lock()
            .unwrap()
            .values()
            .map(|(_, meta)| meta.clone())
            .collect();
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metas)
    }

    fn subscribe(&self) -> mpsc::Receiver<ObjectNotification> {
        let (tx, rx) = mpsc::channel(1024);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}
