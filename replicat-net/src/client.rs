//! Outbound HTTP client for peer and manager endpoints.
//!
//! Every request carries HTTP Basic credentials shared by the cluster.
//! Addresses are bare `host:port`; the scheme is always plain HTTP on
//! the assumption of a private network, matching the server side.

use std::str::FromStr;
use std::time::Duration;

use replicat_proto::{
    upload_digest, upload_digest_bytes, DirTreeMap, Entry, Event, NodeDescriptor,
};
use replicat_tracker::UploadBody;
use tracing::debug;

use crate::errors::{NetError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared-secret credentials, written `user:password`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl FromStr for Credentials {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((user, pass)) if !user.is_empty() => Ok(Self {
                username: user.to_string(),
                password: pass.to_string(),
            }),
            _ => Err(NetError::BadCredentials),
        }
    }
}

pub struct PeerClient {
    http: reqwest::Client,
    credentials: Credentials,
}

impl PeerClient {
    pub fn new(credentials: Credentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http, credentials })
    }

    fn url(address: &str, path: &str) -> String {
        format!("http://{}{}", address, path)
    }

    async fn check(response: reqwest::Response, address: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(NetError::PeerStatus(address.to_string(), status.as_u16()))
        }
    }

    /// Ship one event to a node's event endpoint.
    pub async fn post_event(&self, address: &str, event: &Event) -> Result<()> {
        let response = self
            .http
            .post(Self::url(address, "/event/"))
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .json(event)
            .send()
            .await?;
        Self::check(response, address).await?;
        Ok(())
    }

    /// Fetch a node's recent event ring.
    pub async fn get_events(&self, address: &str) -> Result<Vec<Event>> {
        let response = self
            .http
            .get(Self::url(address, "/event/"))
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()
            .await?;
        Ok(Self::check(response, address).await?.json().await?)
    }

    /// Fetch a node's folder tree.
    pub async fn get_tree(&self, address: &str) -> Result<DirTreeMap> {
        let response = self
            .http
            .get(Self::url(address, "/tree/"))
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()
            .await?;
        Ok(Self::check(response, address).await?.json().await?)
    }

    /// Push a folder tree for the receiver to materialize.
    pub async fn post_tree(&self, address: &str, tree: &DirTreeMap) -> Result<()> {
        let response = self
            .http
            .post(Self::url(address, "/tree/"))
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .json(tree)
            .send()
            .await?;
        Self::check(response, address).await?;
        Ok(())
    }

    /// Register this node's descriptor with the manager.
    pub async fn register(&self, manager_address: &str, descriptor: &NodeDescriptor) -> Result<()> {
        let response = self
            .http
            .post(Self::url(manager_address, "/config/"))
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .json(descriptor)
            .send()
            .await?;
        Self::check(response, manager_address).await?;
        Ok(())
    }

    /// Upload one file body as a multipart form: the bytes under
    /// `uploadfile`, the MD5 hex digest under `HASH`, and the entry
    /// metadata under `EntryJSON`.
    pub async fn upload(&self, address: &str, entry: &Entry, body: UploadBody) -> Result<()> {
        let (bytes, digest) = match body {
            UploadBody::File(path) => {
                let digest = upload_digest(&path)?;
                (tokio::fs::read(&path).await?, digest)
            }
            UploadBody::Bytes(bytes) => {
                let digest = upload_digest_bytes(&bytes);
                (bytes, digest)
            }
        };
        debug!(
            "uploading {} ({} bytes) to {}",
            entry.relative_path,
            bytes.len(),
            address
        );
        let file_part = reqwest::multipart::Part::bytes(bytes)
            .file_name(entry.relative_path.clone())
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new()
            .part("uploadfile", file_part)
            .text("HASH", digest)
            .text("EntryJSON", serde_json::to_string(entry).map_err(replicat_proto::ProtoError::from)?);

        let response = self
            .http
            .post(Self::url(address, "/upload/"))
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .multipart(form)
            .send()
            .await?;
        Self::check(response, address).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_parse() {
        let creds: Credentials = "alice:s3cret".parse().unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "s3cret");
    }

    #[test]
    fn test_credentials_allow_colon_in_password() {
        let creds: Credentials = "alice:a:b:c".parse().unwrap();
        assert_eq!(creds.password, "a:b:c");
    }

    #[test]
    fn test_credentials_reject_malformed() {
        assert!("no-colon".parse::<Credentials>().is_err());
        assert!(":empty-user".parse::<Credentials>().is_err());
    }
}
