//! Daemon configuration.
//!
//! Settings come from an optional TOML file with command-line flags
//! layered on top; a flag always wins over the file. The tracked
//! directory and the node name have no sensible defaults and must be
//! supplied one way or the other; everything else has a default, and
//! a node without a manager runs standalone, reachable by whoever
//! pushes it a node map.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::{DaemonError, Result};

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:8001";
pub const DEFAULT_CREDENTIALS: &str = "replicat:replicat";
pub const DEFAULT_CLUSTER_KEY: &str = "default";

/// Partial configuration, as read from one source.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub directory: Option<PathBuf>,
    pub manager: Option<String>,
    pub manager_credentials: Option<String>,
    pub cluster_key: Option<String>,
    pub address: Option<String>,
    pub name: Option<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Layer `over` on top of this one; `over` wins where both set a key.
    pub fn merged(self, over: ConfigFile) -> ConfigFile {
        ConfigFile {
            directory: over.directory.or(self.directory),
            manager: over.manager.or(self.manager),
            manager_credentials: over.manager_credentials.or(self.manager_credentials),
            cluster_key: over.cluster_key.or(self.cluster_key),
            address: over.address.or(self.address),
            name: over.name.or(self.name),
        }
    }

    /// Validate and fill defaults.
    pub fn finalize(self) -> Result<Settings> {
        let directory = self
            .directory
            .ok_or_else(|| DaemonError::Config("a tracked directory is required".into()))?;
        let name = self
            .name
            .ok_or_else(|| DaemonError::Config("a node name is required".into()))?;
        Ok(Settings {
            directory,
            manager: self.manager,
            manager_credentials: self
                .manager_credentials
                .unwrap_or_else(|| DEFAULT_CREDENTIALS.to_string()),
            cluster_key: self
                .cluster_key
                .unwrap_or_else(|| DEFAULT_CLUSTER_KEY.to_string()),
            address: self.address.unwrap_or_else(|| DEFAULT_ADDRESS.to_string()),
            name,
        })
    }
}

/// Complete, validated daemon settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub directory: PathBuf,
    /// None runs the node without registration or heartbeat.
    pub manager: Option<String>,
    pub manager_credentials: String,
    pub cluster_key: String,
    pub address: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_parse_and_defaults() {
        let raw = r#"
            directory = "/srv/data"
            name = "node-a"
            manager = "manager.local:8000"
        "#;
        let file: ConfigFile = toml::from_str(raw).unwrap();
        let settings = file.finalize().unwrap();
        assert_eq!(settings.directory, PathBuf::from("/srv/data"));
        assert_eq!(settings.address, DEFAULT_ADDRESS);
        assert_eq!(settings.manager_credentials, DEFAULT_CREDENTIALS);
        assert_eq!(settings.cluster_key, DEFAULT_CLUSTER_KEY);
    }

    #[test]
    fn test_flags_override_file() {
        let file = ConfigFile {
            directory: Some("/from/file".into()),
            name: Some("file-name".into()),
            manager: Some("file:8000".into()),
            ..Default::default()
        };
        let flags = ConfigFile {
            name: Some("flag-name".into()),
            ..Default::default()
        };
        let settings = file.merged(flags).finalize().unwrap();
        assert_eq!(settings.name, "flag-name");
        assert_eq!(settings.directory, PathBuf::from("/from/file"));
    }

    #[test]
    fn test_missing_required_rejected() {
        assert!(ConfigFile::default().finalize().is_err());
        let no_directory = ConfigFile {
            name: Some("n".into()),
            ..Default::default()
        };
        assert!(no_directory.finalize().is_err());
        let no_name = ConfigFile {
            directory: Some("/d".into()),
            ..Default::default()
        };
        assert!(no_name.finalize().is_err());
    }

    #[test]
    fn test_manager_is_optional() {
        let standalone = ConfigFile {
            directory: Some("/d".into()),
            name: Some("n".into()),
            ..Default::default()
        };
        let settings = standalone.finalize().unwrap();
        assert!(settings.manager.is_none());
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replicat.toml");
        std::fs::write(&path, "name = \"node-a\"\n").unwrap();
        let file = ConfigFile::load(&path).unwrap();
        assert_eq!(file.name.as_deref(), Some("node-a"));
    }
}
