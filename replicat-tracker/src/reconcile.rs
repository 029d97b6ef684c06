//! Catalog reconciliation decisions.
//!
//! When a peer's catalog arrives, each remote entry is compared with
//! the local tree: missing directories are created immediately, while
//! missing or newer files go into the needed-files table to be
//! requested from the node that authored them. Last writer wins by
//! mod time; an exact tie (equal mod time and hash) flips a coin so
//! two peers cannot oscillate forever.

use std::collections::HashMap;

use rand::Rng;
use replicat_proto::Entry;
use tracing::trace;

use crate::tree::TreeModel;

/// A path the local node has decided to fetch, and from whom.
#[derive(Debug, Clone)]
pub struct NeededFile {
    pub entry: Entry,
    pub source_node: String,
}

/// Outcome of reconciling one remote catalog.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    /// Remote directories absent locally; create before any transfer.
    pub create_dirs: Vec<Entry>,
    /// Full needed-files table after merging this catalog in.
    pub needed: HashMap<String, NeededFile>,
}

/// Compare a remote catalog against the local tree and the current
/// needed-files table, producing the merged plan.
pub fn reconcile(
    local: &TreeModel,
    remote: &[Entry],
    existing: &HashMap<String, NeededFile>,
    rng: &mut impl Rng,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan {
        create_dirs: Vec::new(),
        needed: existing.clone(),
    };

    for r in remote {
        if r.relative_path.is_empty() || r.relative_path == "." {
            continue;
        }

        let candidate = match local.get(&r.relative_path) {
            None if r.is_directory => {
                plan.create_dirs.push(r.clone());
                continue;
            }
            None => Some(r.clone()),
            Some(_) if r.is_directory => continue,
            Some(local_entry) => {
                let transfer =
                    local_entry.content_hash.is_empty() || local_entry.mod_time < r.mod_time;
                if transfer {
                    Some(r.clone())
                } else {
                    None
                }
            }
        };

        let Some(entry) = candidate else { continue };
        let needed = NeededFile {
            source_node: entry.origin_server.clone(),
            entry,
        };

        match plan.needed.get(&r.relative_path) {
            None => {
                plan.needed.insert(r.relative_path.clone(), needed);
            }
            Some(prev) if prev.entry.mod_time < needed.entry.mod_time => {
                plan.needed.insert(r.relative_path.clone(), needed);
            }
            Some(prev)
                if prev.entry.mod_time == needed.entry.mod_time
                    && prev.entry.content_hash == needed.entry.content_hash =>
            {
                // Equal on every axis that matters; settle by coin flip.
                if rng.gen_bool(0.5) {
                    plan.needed.insert(r.relative_path.clone(), needed);
                } else {
                    trace!("keeping previous candidate for {}", r.relative_path);
                }
            }
            Some(_) => {}
        }
    }

    plan
}

/// Group a needed-files table by source node for file-request emission.
pub fn group_by_source(
    needed: &HashMap<String, NeededFile>,
) -> HashMap<String, replicat_proto::RequestedPaths> {
    let mut by_source: HashMap<String, replicat_proto::RequestedPaths> = HashMap::new();
    for (path, nf) in needed {
        by_source
            .entry(nf.source_node.clone())
            .or_default()
            .insert(path.clone(), nf.entry.clone());
    }
    by_source
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rand::rngs::mock::StepRng;
    use replicat_proto::content_hash;

    fn hashed_file(path: &str, body: &[u8], origin: &str) -> Entry {
        let mut e = Entry::file(path, body.len() as i64, Utc::now()).with_origin(origin);
        e.content_hash = content_hash(body);
        e
    }

    #[test]
    fn test_missing_file_is_needed_from_origin() {
        let local = TreeModel::new();
        let remote = vec![hashed_file("x", b"X", "node-a")];
        let plan = reconcile(&local, &remote, &HashMap::new(), &mut StepRng::new(0, 0));

        assert!(plan.create_dirs.is_empty());
        assert_eq!(plan.needed.len(), 1);
        assert_eq!(plan.needed["x"].source_node, "node-a");
    }

    #[test]
    fn test_missing_directory_is_created_not_requested() {
        let local = TreeModel::new();
        let remote = vec![Entry::directory("sub", Utc::now()).with_origin("node-a")];
        let plan = reconcile(&local, &remote, &HashMap::new(), &mut StepRng::new(0, 0));

        assert_eq!(plan.create_dirs.len(), 1);
        assert!(plan.needed.is_empty());
    }

    #[test]
    fn test_newer_remote_wins_older_loses() {
        let mut local = TreeModel::new();
        let body = b"old";
        let mut mine = hashed_file("x", body, "me");
        mine.mod_time = Utc::now() - Duration::seconds(60);
        local.insert(mine.clone());

        let newer = hashed_file("x", b"new", "node-a");
        let plan = reconcile(&local, &[newer], &HashMap::new(), &mut StepRng::new(0, 0));
        assert!(plan.needed.contains_key("x"));

        let mut older = hashed_file("x", b"ancient", "node-a");
        older.mod_time = mine.mod_time - Duration::seconds(60);
        let plan = reconcile(&local, &[older], &HashMap::new(), &mut StepRng::new(0, 0));
        assert!(plan.needed.is_empty());
    }

    #[test]
    fn test_unhashed_local_always_transfers() {
        let mut local = TreeModel::new();
        let mut mine = Entry::file("x", 3, Utc::now() + Duration::seconds(60));
        mine.content_hash = Vec::new();
        local.insert(mine);

        let remote = vec![hashed_file("x", b"X", "node-a")];
        let plan = reconcile(&local, &remote, &HashMap::new(), &mut StepRng::new(0, 0));
        assert!(plan.needed.contains_key("x"));
    }

    #[test]
    fn test_identical_trees_need_nothing() {
        let mut local = TreeModel::new();
        let shared = hashed_file("x", b"X", "node-a");
        local.insert(shared.clone());

        let plan = reconcile(
            &local,
            std::slice::from_ref(&shared),
            &HashMap::new(),
            &mut StepRng::new(0, 0),
        );
        assert!(plan.needed.is_empty());
        assert!(plan.create_dirs.is_empty());

        // Idempotent: a second pass with the same inputs also requests nothing.
        let plan = reconcile(
            &local,
            std::slice::from_ref(&shared),
            &plan.needed,
            &mut StepRng::new(0, 0),
        );
        assert!(plan.needed.is_empty());
    }

    #[test]
    fn test_later_candidate_replaces_earlier() {
        let local = TreeModel::new();
        let older = hashed_file("x", b"X", "node-a");
        let mut newer = hashed_file("x", b"Y", "node-b");
        newer.mod_time = older.mod_time + Duration::seconds(10);

        let first = reconcile(&local, &[older], &HashMap::new(), &mut StepRng::new(0, 0));
        let second = reconcile(&local, &[newer], &first.needed, &mut StepRng::new(0, 0));

        assert_eq!(second.needed["x"].source_node, "node-b");
    }

    #[test]
    fn test_exact_tie_settles_by_coin_flip() {
        let local = TreeModel::new();
        let a = hashed_file("x", b"same", "node-a");
        let mut b = a.clone();
        b.origin_server = "node-b".to_string();

        let first = reconcile(&local, &[a], &HashMap::new(), &mut StepRng::new(0, 0));
        // StepRng::new(0, 0) makes gen_bool(0.5) deterministic; either
        // outcome is valid, it must just pick exactly one of the two.
        let second = reconcile(&local, &[b], &first.needed, &mut StepRng::new(0, 0));
        assert_eq!(second.needed.len(), 1);
        let source = &second.needed["x"].source_node;
        assert!(source == "node-a" || source == "node-b");
    }

    #[test]
    fn test_group_by_source() {
        let mut needed = HashMap::new();
        needed.insert(
            "x".to_string(),
            NeededFile {
                entry: hashed_file("x", b"X", "node-a"),
                source_node: "node-a".to_string(),
            },
        );
        needed.insert(
            "y".to_string(),
            NeededFile {
                entry: hashed_file("y", b"Y", "node-a"),
                source_node: "node-a".to_string(),
            },
        );
        needed.insert(
            "z".to_string(),
            NeededFile {
                entry: hashed_file("z", b"Z", "node-b"),
                source_node: "node-b".to_string(),
            },
        );

        let by_source = group_by_source(&needed);
        assert_eq!(by_source.len(), 2);
        assert_eq!(by_source["node-a"].len(), 2);
        assert_eq!(by_source["node-b"].len(), 1);
    }
}
