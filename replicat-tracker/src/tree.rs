//! Canonical in-memory model of one tracked tree.
//!
//! Keys are relative paths; a `BTreeMap` keeps the snapshot in
//! lexicographic order so catalog bytes are reproducible. All mutation
//! happens under the owning tracker's lock.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use replicat_proto::Entry;

#[derive(Debug, Default)]
pub struct TreeModel {
    entries: BTreeMap<String, Entry>,
}

impl TreeModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: Entry) {
        self.entries.insert(entry.relative_path.clone(), entry);
    }

    pub fn remove(&mut self, path: &str) -> Option<Entry> {
        self.entries.remove(path)
    }

    /// Remove `path` and, for directories, everything underneath it.
    /// Returns the removed entries, parents before children.
    pub fn remove_subtree(&mut self, path: &str) -> Vec<Entry> {
        let mut removed = Vec::new();
        if let Some(entry) = self.entries.remove(path) {
            removed.push(entry);
        }
        let prefix = format!("{}/", path);
        let children: Vec<String> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in children {
            if let Some(entry) = self.entries.remove(&key) {
                removed.push(entry);
            }
        }
        removed
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Move an entry (and its children, for directories) from `from`
    /// to `to`, rewriting the stored relative paths.
    pub fn rename(&mut self, from: &str, to: &str) -> Option<Entry> {
        let moved = self.remove_subtree(from);
        if moved.is_empty() {
            return None;
        }
        let mut root = None;
        for mut entry in moved {
            let new_path = if entry.relative_path == from {
                to.to_string()
            } else {
                format!("{}{}", to, &entry.relative_path[from.len()..])
            };
            entry.relative_path = new_path;
            if entry.relative_path == to {
                root = Some(entry.clone());
            }
            self.insert(entry);
        }
        root
    }

    pub fn update_metadata(
        &mut self,
        path: &str,
        size: i64,
        mod_time: DateTime<Utc>,
        content_hash: Vec<u8>,
    ) -> bool {
        match self.entries.get_mut(path) {
            Some(entry) => {
                entry.size = size;
                entry.mod_time = mod_time;
                entry.content_hash = content_hash;
                true
            }
            None => false,
        }
    }

    /// Deterministic, lexicographically ordered copy of the tree.
    pub fn snapshot(&self) -> Vec<Entry> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
