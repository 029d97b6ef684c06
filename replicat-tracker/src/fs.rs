//! Filesystem-backed storage tracker.
//!
//! A single monitor task drains a bounded notification channel fed by
//! the platform watcher, resolves raw events into semantic operations
//! (pairing rename halves by inode), keeps the tree model canonical,
//! and hands outbound events to the relay. Directives arriving from
//! peers are executed against the local filesystem with bounded
//! retries; the resulting watcher echoes are suppressed upstream by
//! the ownership ledger.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::event::{EventKind as RawKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use replicat_proto::{
    content_hash, content_hash_file, decode_catalog, encode_catalog, encode_requested_paths,
    Entry, Event, EventKind, NodeDescriptor, NodeStatus, RequestedPaths,
};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::errors::{Result, TrackerError};
use crate::reconcile::{group_by_source, reconcile, NeededFile};
use crate::rename::{fallback_id, RenameInProgress, RENAME_TIMEOUT};
use crate::stats::{Statistic, Statistics};
use crate::tracker::{
    is_ignored_leaf, retry_io, ChangeListener, EventRelay, StorageTracker, UploadBody,
};
use crate::tree::TreeModel;

/// Capacity of the raw notification channel. Saturation drops events;
/// catalog reconciliation is the safety net.
pub const MONITOR_QUEUE: usize = 10_240;

/// Everything guarded by the tracker's single readers-writer lock.
#[derive(Default)]
struct TrackerState {
    tree: TreeModel,
    renames: HashMap<u64, RenameInProgress>,
    needed: HashMap<String, NeededFile>,
}

pub struct FilesystemTracker {
    root: PathBuf,
    node_name: String,
    state: RwLock<TrackerState>,
    stats: Statistics,
    relay: Arc<dyn EventRelay>,
    listener: Arc<dyn ChangeListener>,
    status_tx: watch::Sender<NodeStatus>,
    watcher: StdMutex<Option<RecommendedWatcher>>,
}

impl FilesystemTracker {
    pub fn new(
        root: impl Into<PathBuf>,
        node_name: impl Into<String>,
        relay: Arc<dyn EventRelay>,
        listener: Arc<dyn ChangeListener>,
    ) -> Self {
        let (status_tx, _) = watch::channel(NodeStatus::InitialScan);
        Self {
            root: root.into(),
            node_name: node_name.into(),
            state: RwLock::new(TrackerState::default()),
            stats: Statistics::new(),
            relay,
            listener,
            status_tx,
            watcher: StdMutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Watch for status transitions (InitialScan -> JoiningCluster -> Online).
    pub fn subscribe_status(&self) -> watch::Receiver<NodeStatus> {
        self.status_tx.subscribe()
    }

    fn set_status(&self, status: NodeStatus) {
        let previous = *self.status_tx.borrow();
        if previous != status {
            info!("tracker status {:?} -> {:?}", previous, status);
            let _ = self.status_tx.send_replace(status);
        }
    }

    /// Number of files still awaited after reconciliation.
    pub async fn outstanding_files(&self) -> usize {
        self.state.read().await.needed.len()
    }

    /// Begin draining backend notifications. Must run inside a tokio
    /// runtime; the watcher stays alive for the tracker's lifetime.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<notify::Event>(MONITOR_QUEUE);
        let mut watcher = notify::recommended_watcher(move |res| match res {
            Ok(event) => {
                if tx.try_send(event).is_err() {
                    // Dropped on overflow; the next catalog cycle repairs.
                    warn!("notification queue full, dropping raw event");
                }
            }
            Err(e) => error!("watcher error: {}", e),
        })?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        *self.watcher.lock().unwrap() = Some(watcher);

        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                tracker.handle_backend_event(event).await;
            }
            debug!("monitor channel closed for {:?}", tracker.root);
        });
        info!("watching {:?}", self.root);
        Ok(())
    }

    fn absolute(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Relative path with forward separators, or None for the root
    /// itself and anything outside it.
    fn relative(&self, absolute: &Path) -> Option<String> {
        let stripped = absolute.strip_prefix(&self.root).ok()?;
        let mut out = String::new();
        for part in stripped.components() {
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(&part.as_os_str().to_string_lossy());
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    fn entry_from_meta(&self, relative: &str, meta: &std::fs::Metadata) -> Entry {
        let mod_time: DateTime<Utc> = meta
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());
        let mut entry = if meta.is_dir() {
            Entry::directory(relative, mod_time)
        } else {
            Entry::file(relative, meta.len() as i64, mod_time)
        };
        entry.origin_server = self.node_name.clone();
        entry.file_id = object_id(meta);
        entry
    }

    fn hash_file(&self, relative: &str, entry: &mut Entry) {
        if entry.is_directory {
            return;
        }
        match content_hash_file(&self.absolute(relative)) {
            Ok(hash) => entry.content_hash = hash,
            Err(e) => debug!("hash of {} deferred: {}", relative, e),
        }
    }

    fn count_entry(&self, entry: &Entry, delta: i64) {
        if entry.is_directory {
            self.stats.increment(Statistic::TotalFolders, delta);
        } else {
            self.stats.increment(Statistic::TotalFiles, delta);
        }
    }

    fn notify_created(&self, entry: &Entry) {
        if entry.is_directory {
            self.listener.folder_created(&entry.relative_path);
        } else {
            self.listener.file_created(&entry.relative_path);
        }
    }

    fn notify_deleted(&self, entry: &Entry) {
        if entry.is_directory {
            self.listener.folder_deleted(&entry.relative_path);
        } else {
            self.listener.file_deleted(&entry.relative_path);
        }
    }

    fn change_event(&self, kind: EventKind, entry: &Entry) -> Event {
        Event::new(kind, self.node_name.clone(), entry.relative_path.clone())
            .directory(entry.is_directory)
            .mod_time(entry.mod_time)
    }

    async fn handle_backend_event(self: &Arc<Self>, event: notify::Event) {
        match event.kind {
            RawKind::Create(_) => {
                for path in &event.paths {
                    if let Some(rel) = self.trackable(path) {
                        self.observe_create(&rel).await;
                    }
                }
            }
            RawKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                let from = self.trackable(&event.paths[0]);
                let to = self.trackable(&event.paths[1]);
                self.observe_rename_pair(from, to).await;
            }
            RawKind::Modify(ModifyKind::Name(_)) => {
                for path in &event.paths {
                    if let Some(rel) = self.trackable(path) {
                        self.observe_rename_half(&rel).await;
                    }
                }
            }
            RawKind::Modify(_) => {
                for path in &event.paths {
                    if let Some(rel) = self.trackable(path) {
                        self.observe_write(&rel).await;
                    }
                }
            }
            RawKind::Remove(_) => {
                for path in &event.paths {
                    if let Some(rel) = self.trackable(path) {
                        self.observe_remove(&rel).await;
                    }
                }
            }
            _ => {}
        }
    }

    fn trackable(&self, absolute: &Path) -> Option<String> {
        let rel = self.relative(absolute)?;
        let leaf = rel.rsplit('/').next().unwrap_or(&rel);
        if is_ignored_leaf(leaf) {
            None
        } else {
            Some(rel)
        }
    }

    /// Absorb a path that newly exists on disk: insert it (and, for a
    /// directory, any untracked children) into the tree, firing
    /// listener callbacks. Returns the inserted root entry.
    async fn absorb_path(&self, relative: &str) -> Option<Entry> {
        let meta = std::fs::symlink_metadata(self.absolute(relative)).ok()?;
        let mut batch = Vec::new();
        {
            let mut st = self.state.write().await;
            if !st.tree.contains(relative) {
                let mut entry = self.entry_from_meta(relative, &meta);
                self.hash_file(relative, &mut entry);
                st.tree.insert(entry.clone());
                batch.push(entry);
            }
            if meta.is_dir() {
                let mut discovered = Vec::new();
                if let Err(e) =
                    scan_into(&self.root, &self.absolute(relative), &self.node_name, &mut discovered)
                {
                    debug!("subtree scan of {} failed: {}", relative, e);
                }
                for entry in discovered {
                    if !st.tree.contains(&entry.relative_path) {
                        st.tree.insert(entry.clone());
                        batch.push(entry);
                    }
                }
            }
        }
        let root_entry = batch.first().cloned();
        for entry in &batch {
            self.count_entry(entry, 1);
            self.notify_created(entry);
        }
        root_entry
    }

    async fn observe_create(&self, relative: &str) {
        let Some(entry) = self.absorb_path(relative).await else {
            return;
        };
        if entry.relative_path != relative {
            // Already tracked; directive echo or duplicate notification.
            return;
        }
        let upload =
            (!entry.is_directory).then(|| (entry.clone(), UploadBody::File(self.absolute(relative))));
        self.relay
            .broadcast(self.change_event(EventKind::Create, &entry), upload);
    }

    async fn observe_write(&self, relative: &str) {
        let abs = self.absolute(relative);
        let Ok(meta) = std::fs::symlink_metadata(&abs) else {
            return;
        };
        if meta.is_dir() {
            // Directory mtime churn carries no content.
            return;
        }
        let known = {
            let st = self.state.read().await;
            st.tree.contains(relative)
        };
        if !known {
            self.observe_create(relative).await;
            return;
        }
        let mut entry = self.entry_from_meta(relative, &meta);
        self.hash_file(relative, &mut entry);
        {
            let mut st = self.state.write().await;
            st.tree.update_metadata(
                relative,
                entry.size,
                entry.mod_time,
                entry.content_hash.clone(),
            );
        }
        self.listener.file_updated(relative);
        self.relay.broadcast(
            self.change_event(EventKind::Write, &entry),
            Some((entry, UploadBody::File(abs))),
        );
    }

    async fn observe_remove(&self, relative: &str) {
        let removed = {
            let mut st = self.state.write().await;
            st.tree.remove_subtree(relative)
        };
        if removed.is_empty() {
            return;
        }
        for entry in &removed {
            self.count_entry(entry, -1);
            if !entry.is_directory {
                self.stats.increment(Statistic::FilesDeleted, 1);
            }
            self.notify_deleted(entry);
        }
        self.relay
            .broadcast(self.change_event(EventKind::Remove, &removed[0]), None);
    }

    async fn observe_rename_pair(&self, from: Option<String>, to: Option<String>) {
        match (from, to) {
            (Some(from), Some(to)) => self.complete_rename(&from, &to).await,
            (Some(from), None) => self.finish_move_out(&from).await,
            (None, Some(to)) => self.finish_move_in(&to).await,
            (None, None) => {}
        }
    }

    /// One half of a rename. The side is decided by what exists now:
    /// a path present on disk but absent from the tree is the
    /// destination; a path in the tree but gone from disk is the source.
    async fn observe_rename_half(self: &Arc<Self>, relative: &str) {
        let abs = self.absolute(relative);
        let meta = std::fs::symlink_metadata(&abs).ok();

        let mut completed = None;
        let mut new_record = None;
        {
            let mut st = self.state.write().await;
            let id = match &meta {
                Some(m) => {
                    let id = object_id(m);
                    if id == 0 {
                        fallback_id(relative)
                    } else {
                        id
                    }
                }
                None => match st.tree.get(relative) {
                    Some(existing) if existing.file_id != 0 => existing.file_id,
                    Some(_) => fallback_id(relative),
                    None => return, // neither on disk nor tracked; stale
                },
            };

            let existed = st.renames.contains_key(&id);
            let record = st.renames.entry(id).or_insert_with(RenameInProgress::new);
            match &meta {
                Some(m) => {
                    let entry = self.entry_from_meta(relative, m);
                    record.record_destination(relative.to_string(), entry);
                }
                None => record.record_source(relative.to_string()),
            }

            if let Some((from, to)) = record.complete() {
                completed = Some((from.to_string(), to.to_string()));
                st.renames.remove(&id);
            } else if !existed {
                new_record = Some(id);
            }
        }

        if let Some((from, to)) = completed {
            self.complete_rename(&from, &to).await;
        } else if let Some(id) = new_record {
            self.spawn_reaper(id);
        }
    }

    fn spawn_reaper(self: &Arc<Self>, id: u64) {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(RENAME_TIMEOUT).await;
            tracker.reap_rename(id).await;
        });
    }

    /// Finalize a record whose partner half never arrived.
    async fn reap_rename(&self, id: u64) {
        let record = {
            let mut st = self.state.write().await;
            st.renames.remove(&id)
        };
        let Some(record) = record else {
            return; // completed in time
        };
        match (record.source_path, record.destination_path) {
            (Some(from), None) => self.finish_move_out(&from).await,
            (None, Some(to)) => self.finish_move_in(&to).await,
            _ => {}
        }
    }

    async fn complete_rename(&self, from: &str, to: &str) {
        let meta = std::fs::symlink_metadata(self.absolute(to)).ok();
        let moved = {
            let mut st = self.state.write().await;
            let moved = st.tree.rename(from, to);
            if moved.is_some() {
                if let Some(meta) = &meta {
                    let mut entry = self.entry_from_meta(to, meta);
                    self.hash_file(to, &mut entry);
                    st.tree.insert(entry);
                }
            }
            moved
        };
        if moved.is_none() {
            // Source was never tracked; treat as an appearance.
            self.finish_move_in(to).await;
            return;
        }
        let is_directory = meta.map(|m| m.is_dir()).unwrap_or(false);
        debug!("rename {} -> {}", from, to);
        let event = Event::new(EventKind::Rename, self.node_name.clone(), to)
            .source_path(from)
            .directory(is_directory);
        self.relay.broadcast(event, None);
    }

    /// One-sided reap, source only: the item left the monitored tree.
    async fn finish_move_out(&self, from: &str) {
        let removed = {
            let mut st = self.state.write().await;
            st.tree.remove_subtree(from)
        };
        if removed.is_empty() {
            return;
        }
        for entry in &removed {
            self.count_entry(entry, -1);
            self.notify_deleted(entry);
        }
        debug!("move-out {}", from);
        let event = Event::new(EventKind::Rename, self.node_name.clone(), "")
            .source_path(from)
            .directory(removed[0].is_directory);
        self.relay.broadcast(event, None);
    }

    /// One-sided reap, destination only: the item arrived from outside.
    async fn finish_move_in(&self, to: &str) {
        let Some(entry) = self.absorb_path(to).await else {
            return;
        };
        debug!("move-in {}", to);
        let event = Event::new(EventKind::Rename, self.node_name.clone(), to)
            .directory(entry.is_directory)
            .mod_time(entry.mod_time);
        let upload =
            (!entry.is_directory).then(|| (entry, UploadBody::File(self.absolute(to))));
        self.relay.broadcast(event, upload);
    }
}

#[async_trait]
impl StorageTracker for FilesystemTracker {
    async fn initialize(&self, _descriptor: &NodeDescriptor) -> Result<()> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root)?;
        } else if !self.root.is_dir() {
            return Err(TrackerError::BadRoot(format!(
                "{:?} is not a directory",
                self.root
            )));
        }
        self.set_status(NodeStatus::InitialScan);

        let mut discovered = Vec::new();
        scan_into(&self.root, &self.root, &self.node_name, &mut discovered)
            .map_err(|e| TrackerError::BadRoot(format!("cannot enumerate {:?}: {}", self.root, e)))?;

        {
            let mut st = self.state.write().await;
            st.tree = TreeModel::new();
            for entry in &discovered {
                st.tree.insert(entry.clone());
            }
        }
        // Totals are set, not incremented, so a rescan stays idempotent.
        let folders = discovered.iter().filter(|e| e.is_directory).count() as i64;
        self.stats.set(Statistic::TotalFolders, folders);
        self.stats
            .set(Statistic::TotalFiles, discovered.len() as i64 - folders);
        for entry in &discovered {
            self.notify_created(entry);
        }
        info!(
            "initial scan of {:?} found {} entries",
            self.root,
            discovered.len()
        );
        self.set_status(NodeStatus::JoiningCluster);
        Ok(())
    }

    async fn create_path(
        &self,
        relative_path: &str,
        is_directory: bool,
        mod_time: DateTime<Utc>,
    ) -> Result<()> {
        let abs = self.absolute(relative_path);
        if is_directory {
            let target = abs.clone();
            retry_io("create_dir", relative_path, move || {
                std::fs::create_dir_all(&target)
            })
            .await?;
        } else {
            let existed = abs.exists();
            if let Some(parent) = abs.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let target = abs.clone();
            retry_io("create_file", relative_path, move || {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&target)
                    .map(|_| ())
            })
            .await?;
            // A fresh stub carries the originator's mtime, not ours,
            // so the body upload that follows is not judged older than
            // the stub it fills. An existing file keeps its own mtime.
            if !existed {
                let mtime = filetime::FileTime::from_system_time(mod_time.into());
                if let Err(e) = filetime::set_file_mtime(&abs, mtime) {
                    warn!("could not set mtime of {}: {}", relative_path, e);
                }
            }
        }

        let meta = std::fs::symlink_metadata(&abs)?;
        let mut entry = self.entry_from_meta(relative_path, &meta);
        self.hash_file(relative_path, &mut entry);
        let inserted = {
            let mut st = self.state.write().await;
            if st.tree.contains(relative_path) {
                false
            } else {
                st.tree.insert(entry.clone());
                true
            }
        };
        if inserted {
            self.count_entry(&entry, 1);
            self.notify_created(&entry);
        }
        Ok(())
    }

    async fn rename(&self, source: &str, destination: &str, is_directory: bool) -> Result<()> {
        if source.is_empty() {
            return self.create_path(destination, is_directory, Utc::now()).await;
        }
        if destination.is_empty() {
            return self.delete(source).await;
        }
        let from = self.absolute(source);
        let to = self.absolute(destination);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        retry_io("rename", source, move || std::fs::rename(&from, &to)).await?;
        let mut st = self.state.write().await;
        st.tree.rename(source, destination);
        Ok(())
    }

    async fn delete(&self, relative_path: &str) -> Result<()> {
        let abs = self.absolute(relative_path);
        match std::fs::symlink_metadata(&abs) {
            Ok(meta) if meta.is_dir() => {
                retry_io("remove_dir", relative_path, move || {
                    std::fs::remove_dir_all(&abs)
                })
                .await?;
            }
            Ok(_) => {
                retry_io("remove_file", relative_path, move || {
                    std::fs::remove_file(&abs)
                })
                .await?;
            }
            // Already gone is benign for removes.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let removed = {
            let mut st = self.state.write().await;
            st.tree.remove_subtree(relative_path)
        };
        for entry in &removed {
            self.count_entry(entry, -1);
            if !entry.is_directory {
                self.stats.increment(Statistic::FilesDeleted, 1);
            }
            self.notify_deleted(entry);
        }
        Ok(())
    }

    async fn get_entry(&self, relative_path: &str) -> Result<Entry> {
        let st = self.state.read().await;
        st.tree
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
        let event =
            Event::new(EventKind::Catalog, self.node_name.clone(), "").payload(payload);
        self.relay.broadcast(event, None);
    }

    async fn process_catalog(&self, event: &Event) -> Result<()> {
        self.stats.increment(Statistic::CatalogsReceived, 1);
        let remote = decode_catalog(&event.raw_payload)?;
        debug!(
            "catalog from {} with {} entries",
            event.source,
            remote.len()
        );

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
            self.set_status(NodeStatus::Online);
            return Ok(());
        }

        self.set_status(NodeStatus::JoiningCluster);
        for (source, requests) in group_by_source(&plan.needed) {
            let payload = encode_requested_paths(&requests)?;
            let request =
                Event::new(EventKind::FileRequest, self.node_name.clone(), "").payload(payload);
            info!(
                "requesting {} files from {}",
                requests.len(),
                source
            );
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
                    // Requested path vanished since the catalog was cut.
                    warn!("requested path {} no longer tracked", path);
                    continue;
                }
            };
            if entry.is_directory {
                continue;
            }
            self.stats.increment(Statistic::FilesSent, 1);
            self.relay
                .upload(target_node, entry, UploadBody::File(self.absolute(path)));
        }
        Ok(())
    }

    async fn store_file(&self, entry: &Entry, body: &[u8]) -> Result<()> {
        let relative = entry.relative_path.clone();
        let abs = self.absolute(&relative);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        {
            let target = abs.clone();
            let bytes = body.to_vec();
            retry_io("store_file", &relative, move || {
                std::fs::write(&target, &bytes)
            })
            .await?;
        }
        // Pin the destination mtime so later catalog comparisons are stable.
        let mtime = filetime::FileTime::from_system_time(entry.mod_time.into());
        if let Err(e) = filetime::set_file_mtime(&abs, mtime) {
            warn!("could not set mtime of {}: {}", relative, e);
        }

        let mut stored = Entry::file(&relative, body.len() as i64, entry.mod_time)
            .with_origin(entry.origin_server.clone());
        stored.content_hash = content_hash(body);
        if let Ok(meta) = std::fs::symlink_metadata(&abs) {
            stored.file_id = object_id(&meta);
        }

        let (was_new, drained) = {
            let mut st = self.state.write().await;
            let was_new = !st.tree.contains(&relative);
            st.tree.insert(stored.clone());
            st.needed.remove(&relative);
            (was_new, st.needed.is_empty())
        };

        self.stats.increment(Statistic::FilesReceived, 1);
        if was_new {
            self.stats.increment(Statistic::TotalFiles, 1);
            self.listener.file_created(&relative);
        } else {
            self.listener.file_updated(&relative);
        }
        if drained && self.status() == NodeStatus::JoiningCluster {
            self.set_status(NodeStatus::Online);
        }
        Ok(())
    }

    async fn read_file(&self, relative_path: &str) -> Result<Vec<u8>> {
        let entry = self.get_entry(relative_path).await?;
        if entry.is_directory {
            return Err(TrackerError::InvalidPath(format!(
                "{} is a directory",
                relative_path
            )));
        }
        let abs = self.absolute(relative_path);
        retry_io("read_file", relative_path, move || std::fs::read(&abs)).await
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

/// Recursive enumeration of everything under `dir`, hashing files.
fn scan_into(
    root: &Path,
    dir: &Path,
    node_name: &str,
    out: &mut Vec<Entry>,
) -> std::io::Result<()> {
    for child in std::fs::read_dir(dir)? {
        let child = child?;
        let name = child.file_name().to_string_lossy().to_string();
        if is_ignored_leaf(&name) {
            continue;
        }
        let path = child.path();
        let meta = child.metadata()?;
        let rel = match path.strip_prefix(root) {
            Ok(stripped) => stripped
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            Err(_) => continue,
        };
        let mod_time: DateTime<Utc> = meta
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());
        let mut entry = if meta.is_dir() {
            Entry::directory(rel, mod_time)
        } else {
            Entry::file(rel, meta.len() as i64, mod_time)
        };
        entry.origin_server = node_name.to_string();
        entry.file_id = object_id(&meta);
        if !entry.is_directory {
            if let Ok(hash) = content_hash_file(&path) {
                entry.content_hash = hash;
            }
        }
        let descend = meta.is_dir();
        out.push(entry);
        if descend {
            scan_into(root, &path, node_name, out)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn object_id(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn object_id(_meta: &std::fs::Metadata) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{NullListener, NullRelay};

    fn tracker_in(dir: &Path) -> Arc<FilesystemTracker> {
        Arc::new(FilesystemTracker::new(
            dir,
            "test-node",
            Arc::new(NullRelay),
            Arc::new(NullListener),
        ))
    }

    #[tokio::test]
    async fn test_initialize_scans_existing_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join(".DS_Store"), b"junk").unwrap();

        let tracker = tracker_in(dir.path());
        let descriptor = NodeDescriptor::new("key", "test-node", "127.0.0.1:0");
        tracker.initialize(&descriptor).await.unwrap();

        assert_eq!(tracker.status(), NodeStatus::JoiningCluster);
        let entry = tracker.get_entry("sub/a.txt").await.unwrap();
        assert_eq!(entry.size, 5);
        assert!(entry.is_hashed());
        assert!(tracker.get_entry(".DS_Store").await.is_err());
        assert_eq!(tracker.statistics().get(Statistic::TotalFiles), 1);
        assert_eq!(tracker.statistics().get(Statistic::TotalFolders), 1);
    }

    #[tokio::test]
    async fn test_create_path_is_visible_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(dir.path());

        tracker.create_path("a/b", true, Utc::now()).await.unwrap();
        tracker
            .create_path("a/b/c.txt", false, Utc::now())
            .await
            .unwrap();

        assert!(tracker.get_entry("a/b").await.unwrap().is_directory);
        assert!(!tracker.get_entry("a/b/c.txt").await.unwrap().is_directory);
        assert!(dir.path().join("a/b/c.txt").exists());
    }

    #[tokio::test]
    async fn test_directive_rename_moves_entry() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(dir.path());
        std::fs::write(dir.path().join("happy.txt"), b"x").unwrap();
        tracker
            .create_path("happy.txt", false, Utc::now())
            .await
            .unwrap();

        tracker.rename("happy.txt", "behappy.txt", false).await.unwrap();

        assert!(tracker.get_entry("happy.txt").await.is_err());
        assert!(tracker.get_entry("behappy.txt").await.is_ok());
        assert!(dir.path().join("behappy.txt").exists());
        assert!(!dir.path().join("happy.txt").exists());
    }

    #[tokio::test]
    async fn test_create_directive_stub_accepts_follow_up_body() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(dir.path());

        // A peer's Create directive materializes an empty stub stamped
        // with the sender's mtime; the body upload that follows carries
        // the same mtime and must land.
        let sender_time = Utc::now() - chrono::Duration::minutes(5);
        tracker
            .create_path("x.txt", false, sender_time)
            .await
            .unwrap();

        let stub = tracker.get_entry("x.txt").await.unwrap();
        assert!((stub.mod_time - sender_time).num_seconds().abs() <= 1);

        let incoming = Entry::file("x.txt", 5, sender_time).with_origin("node-b");
        tracker.store_file(&incoming, b"hello").await.unwrap();
        assert_eq!(tracker.read_file("x.txt").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_create_path_keeps_existing_file_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(dir.path());
        std::fs::write(dir.path().join("kept.txt"), b"local content").unwrap();
        let before: DateTime<Utc> = std::fs::metadata(dir.path().join("kept.txt"))
            .unwrap()
            .modified()
            .unwrap()
            .into();

        let stale = Utc::now() - chrono::Duration::hours(2);
        tracker.create_path("kept.txt", false, stale).await.unwrap();

        let after: DateTime<Utc> = std::fs::metadata(dir.path().join("kept.txt"))
            .unwrap()
            .modified()
            .unwrap()
            .into();
        assert_eq!(before, after);
        assert_eq!(
            std::fs::read(dir.path().join("kept.txt")).unwrap(),
            b"local content"
        );
    }

    #[tokio::test]
    async fn test_delete_missing_path_is_benign() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(dir.path());
        tracker.delete("never-existed.txt").await.unwrap();
    }

    #[tokio::test]
    async fn test_store_file_sets_mtime_and_drains_needed() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(dir.path());

        let mod_time = Utc::now() - chrono::Duration::hours(1);
        let incoming = Entry::file("from-peer.txt", 4, mod_time).with_origin("node-b");
        tracker.store_file(&incoming, b"body").await.unwrap();

        let stored = tracker.get_entry("from-peer.txt").await.unwrap();
        assert_eq!(stored.content_hash, content_hash(b"body"));
        assert_eq!(stored.origin_server, "node-b");

        let meta = std::fs::metadata(dir.path().join("from-peer.txt")).unwrap();
        let on_disk: DateTime<Utc> = meta.modified().unwrap().into();
        assert!((on_disk - mod_time).num_seconds().abs() <= 1);
        assert_eq!(tracker.statistics().get(Statistic::FilesReceived), 1);
    }

    #[tokio::test]
    async fn test_catalog_roundtrip_between_trackers() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        std::fs::write(dir_a.path().join("x.txt"), b"payload").unwrap();

        let a = tracker_in(dir_a.path());
        let b = tracker_in(dir_b.path());
        let descriptor = NodeDescriptor::new("key", "test-node", "127.0.0.1:0");
        a.initialize(&descriptor).await.unwrap();
        b.initialize(&descriptor).await.unwrap();

        let payload = encode_catalog(&a.snapshot().await).unwrap();
        let event = Event::new(EventKind::Catalog, "a", "").payload(payload);
        b.process_catalog(&event).await.unwrap();

        assert_eq!(b.outstanding_files().await, 1);
        assert_eq!(b.status(), NodeStatus::JoiningCluster);

        // Deliver the body the request would fetch; the drain flips online.
        let entry = a.get_entry("x.txt").await.unwrap();
        b.store_file(&entry, b"payload").await.unwrap();
        assert_eq!(b.outstanding_files().await, 0);
        assert_eq!(b.status(), NodeStatus::Online);
        assert_eq!(
            b.get_entry("x.txt").await.unwrap().content_hash,
            content_hash(b"payload")
        );
    }
}
