//! The variant-neutral tracker contract.
//!
//! A tracker owns one tree and mediates every change to it: it turns
//! backend notifications into semantic events, executes directives that
//! arrive from peers, and packages catalogs for reconciliation.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use replicat_proto::{Entry, Event, NodeDescriptor, NodeStatus, RequestedPaths};
use tracing::debug;

use crate::errors::{Result, TrackerError};
use crate::stats::Statistics;

/// Retry policy for transient local backend failures.
pub const MAX_ATTEMPTS: usize = 5;
pub const RETRY_DELAY: Duration = Duration::from_millis(20);

/// Leaf names that are never tracked.
pub const IGNORED_LEAVES: [&str; 2] = [".DS_Store", "Thumbs.db"];

pub fn is_ignored_leaf(name: &str) -> bool {
    IGNORED_LEAVES.contains(&name)
}

/// Run a fallible local backend operation with bounded retries.
pub(crate) async fn retry_io<T>(
    op: &'static str,
    path: &str,
    mut attempt: impl FnMut() -> std::io::Result<T>,
) -> Result<T> {
    let mut last_err = None;
    for n in 0..MAX_ATTEMPTS {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!("{} {} failed (attempt {}): {}", op, path, n + 1, e);
                last_err = Some(e);
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
    match last_err {
        Some(e) => Err(TrackerError::Io(e)),
        None => Err(TrackerError::RetriesExhausted {
            op,
            path: path.to_string(),
            attempts: MAX_ATTEMPTS,
        }),
    }
}

/// Callbacks for local observers (counters, UIs, tests).
pub trait ChangeListener: Send + Sync {
    fn folder_created(&self, _path: &str) {}
    fn folder_deleted(&self, _path: &str) {}
    fn file_created(&self, _path: &str) {}
    fn file_updated(&self, _path: &str) {}
    fn file_deleted(&self, _path: &str) {}
}

/// Listener that ignores everything.
pub struct NullListener;

impl ChangeListener for NullListener {}

/// A file body handed to the transport for upload: a path into the
/// local tree, or bytes already in memory (object-store variant).
#[derive(Debug, Clone)]
pub enum UploadBody {
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// Outbound seam between a tracker and the peer transport.
///
/// Implementations decide suppression (ownership ledger) and fan-out;
/// all three calls are fire-and-forget so a slow peer cannot stall the
/// tracker's event loop.
pub trait EventRelay: Send + Sync {
    /// Ship an event to the manager and every known peer. `upload` is
    /// the tracked entry and file body to send afterwards, when the
    /// event kind carries one.
    fn broadcast(&self, event: Event, upload: Option<(Entry, UploadBody)>);

    /// Ship an event to one named node only.
    fn send_to(&self, target_node: &str, event: Event);

    /// Upload one file body to one named node.
    fn upload(&self, target_node: &str, entry: Entry, body: UploadBody);
}

/// Relay that drops everything (standalone trackers, tests).
pub struct NullRelay;

impl EventRelay for NullRelay {
    fn broadcast(&self, _event: Event, _upload: Option<(Entry, UploadBody)>) {}
    fn send_to(&self, _target_node: &str, _event: Event) {}
    fn upload(&self, _target_node: &str, _entry: Entry, _body: UploadBody) {}
}

/// The capability set every tracker variant implements.
#[async_trait]
pub trait StorageTracker: Send + Sync {
    /// Validate the root, enumerate it, and emit a synthetic create
    /// to the change listener per discovered item. Idempotent. Ends
    /// with status [`NodeStatus::JoiningCluster`].
    async fn initialize(&self, descriptor: &NodeDescriptor) -> Result<()>;

    /// Make the path exist on the backend and in the tree. A file
    /// created fresh is stamped with `mod_time`, so the body a peer
    /// uploads right after its Create directive is never mistaken for
    /// older than the stub it fills.
    async fn create_path(
        &self,
        relative_path: &str,
        is_directory: bool,
        mod_time: DateTime<Utc>,
    ) -> Result<()>;

    /// Atomic rename when both sides are present; create when the
    /// source is empty; recursive remove when the destination is.
    async fn rename(&self, source: &str, destination: &str, is_directory: bool) -> Result<()>;

    /// Remove from tree and backend.
    async fn delete(&self, relative_path: &str) -> Result<()>;

    /// Full entry including current hash and mod time.
    async fn get_entry(&self, relative_path: &str) -> Result<Entry>;

    /// Lexicographic copy of the tree.
    async fn snapshot(&self) -> Vec<Entry>;

    /// Package the snapshot into a Catalog event and broadcast it.
    async fn send_catalog(&self);

    /// Reconcile a peer catalog against the local tree; create missing
    /// directories, request missing or newer files per source node.
    async fn process_catalog(&self, event: &Event) -> Result<()>;

    /// Stream each requested file body to the named node.
    async fn send_requested_paths(&self, requests: RequestedPaths, target_node: &str)
        -> Result<()>;

    /// Persist a file body received from a peer and absorb its entry.
    async fn store_file(&self, entry: &Entry, body: &[u8]) -> Result<()>;

    /// Read a tracked file body back out of the backend.
    async fn read_file(&self, relative_path: &str) -> Result<Vec<u8>>;

    fn statistics(&self) -> &Statistics;

    fn status(&self) -> NodeStatus;

    fn node_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_retry_io_eventually_succeeds() {
        let calls = AtomicUsize::new(0);
        let out = retry_io("test", "p", || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "busy"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_io_gives_up() {
        let calls = AtomicUsize::new(0);
        let out: Result<()> = retry_io("test", "p", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "busy"))
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[test]
    fn test_ignored_leaves() {
        assert!(is_ignored_leaf(".DS_Store"));
        assert!(is_ignored_leaf("Thumbs.db"));
        assert!(!is_ignored_leaf("notes.txt"));
    }
}
