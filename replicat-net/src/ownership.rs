//! Echo suppression for peer-directed changes.
//!
//! Applying a peer directive to the local backend wakes the local
//! watcher, which would re-broadcast the change and bounce it around
//! the cluster forever. Before a directive touches the backend its
//! paths are recorded here under the sending peer's name; while that
//! claim is fresh, every local watcher event for the path stays quiet.
//! An outbound send that is not suppressed claims the path for this
//! node instead. Claims age out after [`OWNERSHIP_TTL`]; there is no
//! eager garbage collection.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// How long a claim shadows a path.
pub const OWNERSHIP_TTL: Duration = Duration::from_secs(20);

struct Claim {
    owner: String,
    at: Instant,
}

#[derive(Default)]
pub struct OwnershipLedger {
    claims: RwLock<HashMap<String, Claim>>,
}

impl OwnershipLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, path: &str, owner: &str, at: Instant) {
        if path.is_empty() {
            return;
        }
        self.claims.write().unwrap().insert(
            path.to_string(),
            Claim {
                owner: owner.to_string(),
                at,
            },
        );
    }

    /// Mark a path as last modified on behalf of the named peer.
    pub fn record_peer(&self, path: &str, owner: &str) {
        self.record(path, owner, Instant::now());
    }

    /// Ask whether a locally observed change may be broadcast. A path
    /// another node claimed within the TTL is an echo of that node's
    /// directive and stays local; otherwise the path is claimed for
    /// this node and the send proceeds. Claims are not consumed: a
    /// directive that wakes the watcher more than once (write plus
    /// mtime pin, say) stays suppressed for every echo.
    pub fn try_claim(&self, path: &str, self_name: &str) -> bool {
        if path.is_empty() {
            return true;
        }
        let mut claims = self.claims.write().unwrap();
        if let Some(claim) = claims.get(path) {
            if claim.owner != self_name && claim.at.elapsed() < OWNERSHIP_TTL {
                tracing::debug!("{} still owned by {}", path, claim.owner);
                return false;
            }
        }
        claims.insert(
            path.to_string(),
            Claim {
                owner: self_name.to_string(),
                at: Instant::now(),
            },
        );
        true
    }

    pub fn len(&self) -> usize {
        self.claims.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_claim_suppresses_every_echo() {
        let ledger = OwnershipLedger::new();
        ledger.record_peer("a/b.txt", "node-b");

        // A directive can wake the watcher more than once; all of its
        // echoes within the TTL stay local.
        assert!(!ledger.try_claim("a/b.txt", "node-a"));
        assert!(!ledger.try_claim("a/b.txt", "node-a"));
    }

    #[test]
    fn test_unclaimed_path_becomes_self_owned() {
        let ledger = OwnershipLedger::new();
        assert!(ledger.try_claim("anything", "node-a"));
        // Our own claim never suppresses our own sends.
        assert!(ledger.try_claim("anything", "node-a"));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_expired_peer_claim_yields() {
        let ledger = OwnershipLedger::new();
        ledger.record("stale.txt", "node-b", Instant::now() - OWNERSHIP_TTL);
        assert!(ledger.try_claim("stale.txt", "node-a"));
    }

    #[test]
    fn test_empty_path_never_recorded() {
        let ledger = OwnershipLedger::new();
        ledger.record_peer("", "node-b");
        assert!(ledger.is_empty());
        assert!(ledger.try_claim("", "node-a"));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_newer_claim_overwrites() {
        let ledger = OwnershipLedger::new();
        ledger.record_peer("x", "node-b");
        ledger.record_peer("x", "node-c");
        assert_eq!(ledger.len(), 1);
        assert!(!ledger.try_claim("x", "node-a"));
    }
}
