//! Remote drive boundary.
//!
//! `RemoteDrive` is everything DriveMerge needs from a storage provider:
//! the OAuth handshake, quota lookup, chunked uploads, listing and
//! downloading. `google::GoogleDrive` talks to Google Drive v3;
//! `mock::MockDrive` keeps everything in memory for tests and local runs.

pub mod google;
pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("remote API returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("remote account did not grant an offline credential")]
    MissingCredential,
    #[error("unexpected response from remote API: {0}")]
    InvalidResponse(String),
    #[error("remote file `{0}` not found")]
    FileNotFound(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl DriveError {
    /// Whether the error means the stored credential is no longer usable.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            DriveError::MissingCredential | DriveError::Api { status: 400 | 401 | 403, .. }
        )
    }
}

pub type DriveResult<T> = Result<T, DriveError>;

/// Result of a completed OAuth code exchange.
#[derive(Debug, Clone)]
pub struct ConnectedAccount {
    pub email: String,
    pub refresh_token: String,
    pub access_token: String,
}

/// Remote quota in bytes. `total_bytes` is `None` for unlimited plans.
#[derive(Debug, Clone, Copy)]
pub struct RemoteQuota {
    pub used_bytes: u64,
    pub total_bytes: Option<u64>,
}

/// An open upload on the remote side; chunks are sent against `location`.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub location: String,
    pub access_token: String,
}

/// File metadata as listed by the remote drive.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default, deserialize_with = "size_from_string")]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_time: Option<String>,
}

/// A file body streamed back from the remote drive.
pub struct Download {
    pub name: String,
    pub content_type: String,
    pub size: Option<u64>,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

#[async_trait]
pub trait RemoteDrive: Send + Sync {
    /// Consent URL the user is redirected to; `state` is echoed back on callback.
    fn authorize_url(&self, state: &str) -> String;

    async fn exchange_code(&self, code: &str) -> DriveResult<ConnectedAccount>;

    /// Mint a short-lived access token from a stored refresh token.
    async fn access_token(&self, refresh_token: &str) -> DriveResult<String>;

    async fn storage_quota(&self, access_token: &str) -> DriveResult<RemoteQuota>;

    async fn revoke(&self, refresh_token: &str) -> DriveResult<()>;

    /// Every non-final chunk must be a multiple of this many bytes.
    fn chunk_alignment(&self) -> usize {
        1
    }

    async fn start_upload(
        &self,
        access_token: &str,
        filename: &str,
        content_type: &str,
        total_bytes: u64,
    ) -> DriveResult<UploadSession>;

    /// Send `chunk` starting at `offset`. Returns the remote file id once the
    /// last byte has been acknowledged, `None` while more is expected.
    async fn upload_chunk(
        &self,
        session: &UploadSession,
        offset: u64,
        chunk: Bytes,
        total_bytes: u64,
    ) -> DriveResult<Option<String>>;

    async fn list_files(&self, access_token: &str) -> DriveResult<Vec<RemoteFile>>;

    async fn download(&self, access_token: &str, file_id: &str) -> DriveResult<Download>;
}

/// Drive v3 reports sizes as decimal strings.
fn size_from_string<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_file_parses_string_sizes() {
        let file: RemoteFile = serde_json::from_str(
            r#"{"id":"1","name":"a.txt","mimeType":"text/plain","size":"42"}"#,
        )
        .unwrap();
        assert_eq!(file.size, Some(42));
        assert_eq!(file.mime_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn remote_file_size_is_optional() {
        let file: RemoteFile =
            serde_json::from_str(r#"{"id":"1","name":"folder"}"#).unwrap();
        assert_eq!(file.size, None);
    }

    #[test]
    fn auth_failures_are_recognised() {
        let err = DriveError::Api {
            status: 401,
            message: "invalid_grant".into(),
        };
        assert!(err.is_auth_failure());
        let err = DriveError::Api {
            status: 503,
            message: "backend".into(),
        };
        assert!(!err.is_auth_failure());
    }
}
