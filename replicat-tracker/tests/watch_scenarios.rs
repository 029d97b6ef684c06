//! End-to-end watcher scenarios against a real filesystem.
//!
//! Each test drives a [`FilesystemTracker`] through the platform
//! watcher and asserts on the semantic events handed to the relay and
//! the callbacks fired at the change listener.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use replicat_proto::{EventKind, NodeDescriptor};
use replicat_tracker::{
    ChangeListener, EventRelay, FilesystemTracker, StorageTracker, UploadBody,
};
use tempfile::TempDir;

#[derive(Default)]
struct RecordingRelay {
    events: Mutex<Vec<replicat_proto::Event>>,
}

impl RecordingRelay {
    fn of_kind(&self, kind: EventKind) -> Vec<replicat_proto::Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

impl EventRelay for RecordingRelay {
    fn broadcast(
        &self,
        event: replicat_proto::Event,
        _upload: Option<(replicat_proto::Entry, UploadBody)>,
    ) {
        self.events.lock().unwrap().push(event);
    }

    fn send_to(&self, _target_node: &str, event: replicat_proto::Event) {
        self.events.lock().unwrap().push(event);
    }

    fn upload(&self, _target_node: &str, _entry: replicat_proto::Entry, _body: UploadBody) {}
}

#[derive(Default)]
struct CountingListener {
    folders_created: AtomicUsize,
    folders_deleted: AtomicUsize,
    files_created: AtomicUsize,
    files_deleted: AtomicUsize,
}

impl ChangeListener for CountingListener {
    fn folder_created(&self, _path: &str) {
        self.folders_created.fetch_add(1, Ordering::SeqCst);
    }
    fn folder_deleted(&self, _path: &str) {
        self.folders_deleted.fetch_add(1, Ordering::SeqCst);
    }
    fn file_created(&self, _path: &str) {
        self.files_created.fetch_add(1, Ordering::SeqCst);
    }
    fn file_deleted(&self, _path: &str) {
        self.files_deleted.fetch_add(1, Ordering::SeqCst);
    }
}

struct Rig {
    _workspace: TempDir,
    root: std::path::PathBuf,
    staging: std::path::PathBuf,
    tracker: Arc<FilesystemTracker>,
    relay: Arc<RecordingRelay>,
    listener: Arc<CountingListener>,
}

async fn rig(name: &str) -> Rig {
    let workspace = TempDir::new().unwrap();
    let root = workspace.path().join("tracked");
    let staging = workspace.path().join("staging");
    std::fs::create_dir_all(&staging).unwrap();

    let relay = Arc::new(RecordingRelay::default());
    let listener = Arc::new(CountingListener::default());
    let tracker = Arc::new(FilesystemTracker::new(
        &root,
        name,
        relay.clone(),
        listener.clone(),
    ));
    tracker
        .initialize(&NodeDescriptor::new("key", name, "addr"))
        .await
        .unwrap();
    tracker.start().unwrap();

    Rig {
        _workspace: workspace,
        root,
        staging,
        tracker,
        relay,
        listener,
    }
}

/// Poll until the condition holds or five seconds pass.
async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for: {}", what);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_directory_moved_in_then_out() {
    let rig = rig("node-a").await;

    let outside = rig.staging.join("parked");
    std::fs::create_dir(&outside).unwrap();
    std::fs::rename(&outside, rig.root.join("parked")).unwrap();

    eventually("move-in rename event", || {
        rig.relay
            .of_kind(EventKind::Rename)
            .iter()
            .any(|e| e.path == "parked" && e.source_path.is_empty() && e.is_directory)
    })
    .await;
    assert!(rig.tracker.get_entry("parked").await.is_ok());

    std::fs::rename(rig.root.join("parked"), rig.staging.join("parked")).unwrap();

    eventually("move-out rename event", || {
        rig.relay
            .of_kind(EventKind::Rename)
            .iter()
            .any(|e| e.path.is_empty() && e.source_path == "parked")
    })
    .await;
    assert!(rig.tracker.get_entry("parked").await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_create_then_rename_resolves_to_one_rename() {
    let rig = rig("node-a").await;

    std::fs::write(rig.root.join("happy.txt"), b"content").unwrap();
    eventually("create event for happy.txt", || {
        rig.relay
            .of_kind(EventKind::Create)
            .iter()
            .any(|e| e.path == "happy.txt")
    })
    .await;

    std::fs::rename(rig.root.join("happy.txt"), rig.root.join("behappy.txt")).unwrap();

    eventually("resolved rename event", || {
        rig.relay
            .of_kind(EventKind::Rename)
            .iter()
            .any(|e| e.source_path == "happy.txt" && e.path == "behappy.txt")
    })
    .await;

    // The rename must not surface as a delete of the old path.
    assert!(rig.relay.of_kind(EventKind::Remove).is_empty());
    assert!(rig.tracker.get_entry("happy.txt").await.is_err());

    let entry = rig.tracker.get_entry("behappy.txt").await.unwrap();
    assert_eq!(entry.size, 7);
    assert!(entry.is_hashed());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_nested_directories_fire_one_callback_each() {
    let rig = rig("node-a").await;

    std::fs::create_dir_all(rig.root.join("a/b/c/d/e/f")).unwrap();

    eventually("six folder callbacks", || {
        rig.listener.folders_created.load(Ordering::SeqCst) == 6
    })
    .await;

    for path in ["a", "a/b", "a/b/c", "a/b/c/d", "a/b/c/d/e", "a/b/c/d/e/f"] {
        let entry = rig.tracker.get_entry(path).await.unwrap();
        assert!(entry.is_directory, "{} should be a directory", path);
    }
    // Fast nested creation must not double-count.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rig.listener.folders_created.load(Ordering::SeqCst), 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bulk_add_then_delete_counts() {
    let rig = rig("node-a").await;

    for n in 0..10 {
        std::fs::write(rig.root.join(format!("file-{}.txt", n)), b"data").unwrap();
    }
    eventually("ten file callbacks", || {
        rig.listener.files_created.load(Ordering::SeqCst) == 10
    })
    .await;

    std::fs::remove_file(rig.root.join("file-0.txt")).unwrap();
    std::fs::remove_file(rig.root.join("file-1.txt")).unwrap();

    eventually("two delete callbacks", || {
        rig.listener.files_deleted.load(Ordering::SeqCst) == 2
    })
    .await;

    assert_eq!(rig.tracker.snapshot().await.len(), 8);
    assert!(rig.tracker.get_entry("file-0.txt").await.is_err());
    assert!(rig.tracker.get_entry("file-9.txt").await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ignored_leaves_never_tracked() {
    let rig = rig("node-a").await;

    std::fs::write(rig.root.join(".DS_Store"), b"junk").unwrap();
    std::fs::write(rig.root.join("kept.txt"), b"data").unwrap();

    eventually("create event for kept.txt", || {
        rig.relay
            .of_kind(EventKind::Create)
            .iter()
            .any(|e| e.path == "kept.txt")
    })
    .await;

    assert!(rig.tracker.get_entry(".DS_Store").await.is_err());
    assert!(rig
        .relay
        .of_kind(EventKind::Create)
        .iter()
        .all(|e| e.path != ".DS_Store"));
}
