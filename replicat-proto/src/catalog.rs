//! Payload codecs for catalog exchange and file requests.
//!
//! A catalog is the full tree snapshot of one node, serialized as a
//! JSON array of entries in lexicographic path order so the bytes are
//! reproducible. A file request carries the map of paths the requester
//! decided it needs from one specific source node.

use std::collections::BTreeMap;

use crate::entry::Entry;
use crate::errors::Result;

/// Paths requested from a single source node.
pub type RequestedPaths = BTreeMap<String, Entry>;

/// Legacy folder-only snapshot: folder path -> child names.
pub type DirTreeMap = BTreeMap<String, Vec<String>>;

pub fn encode_catalog(entries: &[Entry]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(entries)?)
}

pub fn decode_catalog(raw: &[u8]) -> Result<Vec<Entry>> {
    Ok(serde_json::from_slice(raw)?)
}

pub fn encode_requested_paths(requests: &RequestedPaths) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(requests)?)
}

pub fn decode_requested_paths(raw: &[u8]) -> Result<RequestedPaths> {
    Ok(serde_json::from_slice(raw)?)
}

/// Build the legacy folder tree from a full snapshot.
pub fn dir_tree_of(entries: &[Entry]) -> DirTreeMap {
    let mut tree = DirTreeMap::new();
    tree.insert(String::new(), Vec::new());
    for entry in entries {
        if entry.is_directory {
            tree.entry(entry.relative_path.clone()).or_default();
        }
        let (parent, leaf) = match entry.relative_path.rsplit_once('/') {
            Some((parent, leaf)) => (parent.to_string(), leaf.to_string()),
            None => (String::new(), entry.relative_path.clone()),
        };
        tree.entry(parent).or_default().push(leaf);
    }
    tree
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_catalog_roundtrip_preserves_order() {
        let entries = vec![
            Entry::directory("a", Utc::now()),
            Entry::file("a/one.txt", 5, Utc::now()).with_origin("node-a"),
            Entry::file("b.txt", 9, Utc::now()).with_origin("node-b"),
        ];
        let raw = encode_catalog(&entries).unwrap();
        let back = decode_catalog(&raw).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[0].relative_path, "a");
        assert_eq!(back[1].origin_server, "node-a");
        assert_eq!(back[2].relative_path, "b.txt");
    }

    #[test]
    fn test_requested_paths_roundtrip() {
        let mut requests = RequestedPaths::new();
        requests.insert("x".to_string(), Entry::file("x", 1, Utc::now()));
        let raw = encode_requested_paths(&requests).unwrap();
        let back = decode_requested_paths(&raw).unwrap();
        assert_eq!(back.len(), 1);
        assert!(back.contains_key("x"));
    }

    #[test]
    fn test_dir_tree_of_nests_folders() {
        let entries = vec![
            Entry::directory("a", Utc::now()),
            Entry::directory("a/b", Utc::now()),
            Entry::file("a/b/c.txt", 1, Utc::now()),
        ];
        let tree = dir_tree_of(&entries);
        assert_eq!(tree[""], vec!["a".to_string()]);
        assert_eq!(tree["a"], vec!["b".to_string()]);
        assert_eq!(tree["a/b"], vec!["c.txt".to_string()]);
    }
}
