use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bytes::base64_bytes;

/// Semantic change kinds, carried on the wire as string tokens.
///
/// The `notify.*` tokens describe raw backend changes; the `replicat.*`
/// tokens are protocol-level operations authored by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "notify.Create")]
    Create,
    #[serde(rename = "notify.Write")]
    Write,
    #[serde(rename = "notify.Remove")]
    Remove,
    /// A raw backend rename half; peers never receive this directly.
    #[serde(rename = "notify.Rename")]
    RawRename,
    /// A resolved rename with source and destination paths.
    #[serde(rename = "replicat.Rename")]
    Rename,
    #[serde(rename = "replicat.Catalog")]
    Catalog,
    #[serde(rename = "replicat.FileRequest")]
    FileRequest,
    #[serde(rename = "replicat.StartTest")]
    StartTest,
    #[serde(rename = "replicat.EndTest")]
    EndTest,
}

impl EventKind {
    /// Kinds that are followed by a whole-file upload when the
    /// destination path is known and the target is a regular file.
    pub fn carries_body(&self) -> bool {
        matches!(self, EventKind::Create | EventKind::Write | EventKind::Rename)
    }
}

/// A semantic change shipped between peers. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Name of the originating node.
    #[serde(rename = "Source")]
    pub source: String,

    #[serde(rename = "Name")]
    pub kind: EventKind,

    #[serde(rename = "Path")]
    pub path: String,

    /// Rename origin; empty for every other kind.
    #[serde(rename = "SourcePath", default)]
    pub source_path: String,

    /// When the event was observed on the originating node.
    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,

    /// Modification time of the subject path at observation.
    #[serde(rename = "ModTime")]
    pub mod_time: DateTime<Utc>,

    #[serde(rename = "IsDirectory")]
    pub is_directory: bool,

    /// Address the event arrived from, filled in by the receiver.
    #[serde(rename = "NetworkSource", default)]
    pub network_source: String,

    /// Opaque payload for Catalog and FileRequest events.
    #[serde(rename = "RawData", with = "base64_bytes", default)]
    pub raw_payload: Vec<u8>,
}

impl Event {
    pub fn new(kind: EventKind, source: impl Into<String>, path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            source: source.into(),
            kind,
            path: path.into(),
            source_path: String::new(),
            time: now,
            mod_time: now,
            is_directory: false,
            network_source: String::new(),
            raw_payload: Vec::new(),
        }
    }

    pub fn directory(mut self, is_directory: bool) -> Self {
        self.is_directory = is_directory;
        self
    }

    pub fn mod_time(mut self, mod_time: DateTime<Utc>) -> Self {
        self.mod_time = mod_time;
        self
    }

    pub fn source_path(mut self, source_path: impl Into<String>) -> Self {
        self.source_path = source_path.into();
        self
    }

    pub fn payload(mut self, raw_payload: Vec<u8>) -> Self {
        self.raw_payload = raw_payload;
        self
    }

    /// The path the ownership ledger keys this event by: the
    /// destination when known, otherwise the rename origin.
    pub fn ledger_path(&self) -> &str {
        if self.path.is_empty() {
            &self.source_path
        } else {
            &self.path
        }
    }
}
