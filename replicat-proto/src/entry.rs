use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bytes::base64_bytes;

/// Metadata record for one tracked path (file or directory).
///
/// Identity is `relative_path`: separator-normalized, rooted at the
/// tracker base, no leading separator. The content hash is empty for
/// directories and for files that have not been fully scanned yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(rename = "RelativePath")]
    pub relative_path: String,

    #[serde(rename = "IsDirectory")]
    pub is_directory: bool,

    /// Blake2b-256 of the file contents, base64 on the wire.
    #[serde(rename = "Hash", with = "base64_bytes", default)]
    pub content_hash: Vec<u8>,

    #[serde(rename = "ModTime")]
    pub mod_time: DateTime<Utc>,

    #[serde(rename = "Size")]
    pub size: i64,

    /// Name of the node that authored the current version.
    #[serde(rename = "ServerName", default)]
    pub origin_server: String,

    /// Platform object identity (inode) used for rename pairing.
    /// Never serialized; only meaningful on the node that stat'ed it.
    #[serde(skip)]
    pub file_id: u64,
}

impl Entry {
    pub fn directory(relative_path: impl Into<String>, mod_time: DateTime<Utc>) -> Self {
        Self {
            relative_path: relative_path.into(),
            is_directory: true,
            content_hash: Vec::new(),
            mod_time,
            size: 0,
            origin_server: String::new(),
            file_id: 0,
        }
    }

    pub fn file(relative_path: impl Into<String>, size: i64, mod_time: DateTime<Utc>) -> Self {
        Self {
            relative_path: relative_path.into(),
            is_directory: false,
            content_hash: Vec::new(),
            mod_time,
            size,
            origin_server: String::new(),
            file_id: 0,
        }
    }

    pub fn with_origin(mut self, origin_server: impl Into<String>) -> Self {
        self.origin_server = origin_server.into();
        self
    }

    /// True for a regular file whose contents have been fully scanned.
    pub fn is_hashed(&self) -> bool {
        !self.is_directory && !self.content_hash.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_wire_field_names() {
        let mut entry = Entry::file("docs/a.txt", 42, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        entry.content_hash = vec![0xab; 32];
        entry.origin_server = "node-a".to_string();
        entry.file_id = 777;

        let json: serde_json::Value = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["RelativePath"], "docs/a.txt");
        assert_eq!(json["IsDirectory"], false);
        assert_eq!(json["Size"], 42);
        assert_eq!(json["ServerName"], "node-a");
        assert!(json["Hash"].is_string());
        // file_id is local-only
        assert!(json.get("file_id").is_none());

        let back: Entry = serde_json::from_value(json).unwrap();
        assert_eq!(back.content_hash, entry.content_hash);
        assert_eq!(back.file_id, 0);
    }

    #[test]
    fn test_empty_hash_roundtrip() {
        let entry = Entry::directory("sub", Utc::now());
        let json = serde_json::to_string(&entry).unwrap();
        let back: Entry = serde_json::from_str(&json).unwrap();
        assert!(back.content_hash.is_empty());
        assert!(!back.is_hashed());
    }
}
