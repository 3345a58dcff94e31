//! Google OAuth2 + Drive v3 client.
//!
//! Uploads use the resumable protocol: one POST opens a session, then each
//! chunk is PUT with a `Content-Range` header. Google answers `308` until the
//! final chunk, which returns the created file.

use super::{
    ConnectedAccount, Download, DriveError, DriveResult, RemoteDrive, RemoteFile, RemoteQuota,
    UploadSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Response, StatusCode, Url, header};
use serde::Deserialize;
use serde_json::json;
use std::io;
use tracing::debug;

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";
const ABOUT_URL: &str = "https://www.googleapis.com/drive/v3/about";
const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const SCOPES: &str = "https://www.googleapis.com/auth/drive.file \
                      https://www.googleapis.com/auth/userinfo.email";

/// Resumable uploads require non-final chunks in multiples of 256 KiB.
const RESUMABLE_ALIGNMENT: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct GoogleDrive {
    http: Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct About {
    user: Option<AboutUser>,
    storage_quota: Option<AboutQuota>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AboutUser {
    email_address: String,
}

#[derive(Deserialize)]
struct AboutQuota {
    limit: Option<String>,
    usage: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<RemoteFile>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct CreatedFile {
    id: String,
}

impl GoogleDrive {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> DriveResult<Self> {
        // 308 is Google's "resume incomplete", not a redirect to follow.
        let http = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
        })
    }

    async fn about(&self, access_token: &str) -> DriveResult<About> {
        let resp = self
            .http
            .get(ABOUT_URL)
            .bearer_auth(access_token)
            .query(&[("fields", "user(emailAddress),storageQuota(limit,usage)")])
            .send()
            .await?;
        Ok(ensure_success(resp).await?.json().await?)
    }

    async fn file_metadata(&self, access_token: &str, file_id: &str) -> DriveResult<RemoteFile> {
        let resp = self
            .http
            .get(format!("{}/{}", FILES_URL, file_id))
            .bearer_auth(access_token)
            .query(&[("fields", "id,name,mimeType,size,modifiedTime")])
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(DriveError::FileNotFound(file_id.to_string()));
        }
        Ok(ensure_success(resp).await?.json().await?)
    }
}

#[async_trait]
impl RemoteDrive for GoogleDrive {
    fn authorize_url(&self, state: &str) -> String {
        Url::parse_with_params(
            AUTH_URL,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", SCOPES),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .map(String::from)
        .unwrap_or_else(|_| AUTH_URL.to_string())
    }

    async fn exchange_code(&self, code: &str) -> DriveResult<ConnectedAccount> {
        let resp = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("code", code),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?;
        let tokens: TokenResponse = ensure_success(resp).await?.json().await?;
        let refresh_token = tokens.refresh_token.ok_or(DriveError::MissingCredential)?;

        let email = self
            .about(&tokens.access_token)
            .await?
            .user
            .map(|u| u.email_address)
            .ok_or_else(|| DriveError::InvalidResponse("about response has no user".into()))?;

        Ok(ConnectedAccount {
            email,
            refresh_token,
            access_token: tokens.access_token,
        })
    }

    async fn access_token(&self, refresh_token: &str) -> DriveResult<String> {
        if refresh_token.is_empty() {
            return Err(DriveError::MissingCredential);
        }
        let resp = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;
        let tokens: TokenResponse = ensure_success(resp).await?.json().await?;
        Ok(tokens.access_token)
    }

    async fn storage_quota(&self, access_token: &str) -> DriveResult<RemoteQuota> {
        let quota = self
            .about(access_token)
            .await?
            .storage_quota
            .ok_or_else(|| DriveError::InvalidResponse("about response has no quota".into()))?;

        let used_bytes = parse_decimal(quota.usage.as_deref())?.unwrap_or(0);
        let total_bytes = parse_decimal(quota.limit.as_deref())?;
        Ok(RemoteQuota {
            used_bytes,
            total_bytes,
        })
    }

    async fn revoke(&self, refresh_token: &str) -> DriveResult<()> {
        let resp = self
            .http
            .post(REVOKE_URL)
            .form(&[("token", refresh_token)])
            .send()
            .await?;
        ensure_success(resp).await?;
        Ok(())
    }

    fn chunk_alignment(&self) -> usize {
        RESUMABLE_ALIGNMENT
    }

    async fn start_upload(
        &self,
        access_token: &str,
        filename: &str,
        content_type: &str,
        total_bytes: u64,
    ) -> DriveResult<UploadSession> {
        let resp = self
            .http
            .post(UPLOAD_URL)
            .bearer_auth(access_token)
            .query(&[("uploadType", "resumable")])
            .header("X-Upload-Content-Type", content_type)
            .header("X-Upload-Content-Length", total_bytes.to_string())
            .json(&json!({ "name": filename }))
            .send()
            .await?;
        let resp = ensure_success(resp).await?;

        let location = resp
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| DriveError::InvalidResponse("resumable session has no location".into()))?
            .to_string();
        debug!("opened resumable session for {}", filename);

        Ok(UploadSession {
            location,
            access_token: access_token.to_string(),
        })
    }

    async fn upload_chunk(
        &self,
        session: &UploadSession,
        offset: u64,
        chunk: Bytes,
        total_bytes: u64,
    ) -> DriveResult<Option<String>> {
        let content_range = if chunk.is_empty() {
            format!("bytes */{}", total_bytes)
        } else {
            let last = offset + chunk.len() as u64 - 1;
            format!("bytes {}-{}/{}", offset, last, total_bytes)
        };

        let resp = self
            .http
            .put(&session.location)
            .bearer_auth(&session.access_token)
            .header(header::CONTENT_LENGTH, chunk.len())
            .header(header::CONTENT_RANGE, content_range)
            .body(chunk)
            .send()
            .await?;

        if resp.status() == StatusCode::PERMANENT_REDIRECT {
            return Ok(None);
        }
        let created: CreatedFile = ensure_success(resp).await?.json().await?;
        Ok(Some(created.id))
    }

    async fn list_files(&self, access_token: &str) -> DriveResult<Vec<RemoteFile>> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(FILES_URL)
                .bearer_auth(access_token)
                .query(&[
                    ("q", "trashed = false"),
                    ("pageSize", "1000"),
                    (
                        "fields",
                        "nextPageToken,files(id,name,mimeType,size,modifiedTime)",
                    ),
                ]);
            if let Some(token) = page_token.as_deref() {
                request = request.query(&[("pageToken", token)]);
            }

            let page: FileList = ensure_success(request.send().await?).await?.json().await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(files)
    }

    async fn download(&self, access_token: &str, file_id: &str) -> DriveResult<Download> {
        let meta = self.file_metadata(access_token, file_id).await?;
        let resp = self
            .http
            .get(format!("{}/{}", FILES_URL, file_id))
            .bearer_auth(access_token)
            .query(&[("alt", "media")])
            .send()
            .await?;
        let resp = ensure_success(resp).await?;

        let body = resp
            .bytes_stream()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
            .boxed();

        Ok(Download {
            name: meta.name,
            content_type: meta
                .mime_type
                .unwrap_or_else(|| "application/octet-stream".into()),
            size: meta.size,
            body,
        })
    }
}

/// Turn a non-2xx response into `DriveError::Api` carrying the body text.
async fn ensure_success(resp: Response) -> DriveResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(DriveError::Api {
        status: status.as_u16(),
        message,
    })
}

fn parse_decimal(value: Option<&str>) -> DriveResult<Option<u64>> {
    value
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| DriveError::InvalidResponse(format!("not a byte count: {}", v)))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive() -> GoogleDrive {
        GoogleDrive::new("client-id", "secret", "http://localhost:3000/accounts/callback").unwrap()
    }

    #[test]
    fn authorize_url_requests_offline_access() {
        let url = Url::parse(&drive().authorize_url("signed-state")).unwrap();
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "client-id");
        assert_eq!(params["access_type"], "offline");
        assert_eq!(params["state"], "signed-state");
        assert_eq!(params["redirect_uri"], "http://localhost:3000/accounts/callback");
    }

    #[test]
    fn resumable_uploads_use_quarter_mebibyte_alignment() {
        assert_eq!(drive().chunk_alignment(), 256 * 1024);
    }

    #[test]
    fn quota_values_parse_as_decimal() {
        assert_eq!(parse_decimal(Some("1024")).unwrap(), Some(1024));
        assert_eq!(parse_decimal(None).unwrap(), None);
        assert!(parse_decimal(Some("lots")).is_err());
    }
}
