//! In-memory `RemoteDrive` used by tests and by `--drive-backend mock`.
//!
//! OAuth codes map to predictable accounts: code `alice` connects
//! `alice@mock.drive` with refresh token `refresh-alice`. Access tokens are
//! `access-<refresh token>` so every call can be traced back to its owner.

use super::{
    ConnectedAccount, Download, DriveError, DriveResult, RemoteDrive, RemoteFile, RemoteQuota,
    UploadSession,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use std::{
    collections::{HashMap, HashSet},
    io,
    sync::Mutex,
    time::Duration,
};
use uuid::Uuid;

const DEFAULT_TOTAL_BYTES: u64 = 15 * 1024 * 1024 * 1024;

#[derive(Default)]
struct MockState {
    /// session location -> upload in progress
    sessions: HashMap<String, PendingUpload>,
    /// owner refresh token -> stored files
    files: HashMap<String, Vec<StoredFile>>,
    rejected_credentials: HashSet<String>,
    revoked: Vec<String>,
    fail_on_chunk: Option<usize>,
    quota: Option<RemoteQuota>,
}

struct PendingUpload {
    owner: String,
    filename: String,
    content_type: String,
    data: Vec<u8>,
    chunks: usize,
}

#[derive(Clone)]
struct StoredFile {
    id: String,
    name: String,
    content_type: String,
    data: Bytes,
}

#[derive(Default)]
pub struct MockDrive {
    state: Mutex<MockState>,
    chunk_delay: Option<Duration>,
    alignment: usize,
}

impl MockDrive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before acknowledging each chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Require every non-final chunk to be a multiple of `alignment` bytes,
    /// like Google's resumable protocol does.
    pub fn with_chunk_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Fail the `index`-th chunk (0-based) of every upload.
    pub fn fail_on_chunk(&self, index: usize) {
        self.lock().fail_on_chunk = Some(index);
    }

    /// Make `refresh_token` behave like an expired grant.
    pub fn reject_credential(&self, refresh_token: &str) {
        self.lock()
            .rejected_credentials
            .insert(refresh_token.to_string());
    }

    /// Quota reported for every account.
    pub fn set_quota(&self, used_bytes: u64, total_bytes: Option<u64>) {
        self.lock().quota = Some(RemoteQuota {
            used_bytes,
            total_bytes,
        });
    }

    /// Contents of a stored file, looked up by owner and name.
    pub fn stored_file(&self, refresh_token: &str, name: &str) -> Option<Bytes> {
        self.lock()
            .files
            .get(refresh_token)
            .and_then(|files| files.iter().find(|f| f.name == name))
            .map(|f| f.data.clone())
    }

    /// Refresh tokens revoked so far, in call order.
    pub fn revoked(&self) -> Vec<String> {
        self.lock().revoked.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn owner_of(&self, access_token: &str) -> DriveResult<String> {
        let owner = access_token
            .strip_prefix("access-")
            .ok_or_else(|| unauthorized("malformed access token"))?;
        if self.lock().rejected_credentials.contains(owner) {
            return Err(unauthorized("credential revoked"));
        }
        Ok(owner.to_string())
    }
}

fn unauthorized(message: &str) -> DriveError {
    DriveError::Api {
        status: 401,
        message: message.to_string(),
    }
}

#[async_trait]
impl RemoteDrive for MockDrive {
    fn authorize_url(&self, state: &str) -> String {
        format!("https://mock.drive/consent?state={}", state)
    }

    async fn exchange_code(&self, code: &str) -> DriveResult<ConnectedAccount> {
        if code.is_empty() {
            return Err(DriveError::Api {
                status: 400,
                message: "invalid_grant".into(),
            });
        }
        let refresh_token = format!("refresh-{}", code);
        Ok(ConnectedAccount {
            email: format!("{}@mock.drive", code),
            access_token: format!("access-{}", refresh_token),
            refresh_token,
        })
    }

    async fn access_token(&self, refresh_token: &str) -> DriveResult<String> {
        if refresh_token.is_empty() {
            return Err(DriveError::MissingCredential);
        }
        if self.lock().rejected_credentials.contains(refresh_token) {
            return Err(unauthorized("invalid_grant"));
        }
        Ok(format!("access-{}", refresh_token))
    }

    async fn storage_quota(&self, access_token: &str) -> DriveResult<RemoteQuota> {
        let owner = self.owner_of(access_token)?;
        let state = self.lock();
        if let Some(quota) = state.quota {
            return Ok(quota);
        }
        let used_bytes = state
            .files
            .get(&owner)
            .map(|files| files.iter().map(|f| f.data.len() as u64).sum())
            .unwrap_or(0);
        Ok(RemoteQuota {
            used_bytes,
            total_bytes: Some(DEFAULT_TOTAL_BYTES),
        })
    }

    async fn revoke(&self, refresh_token: &str) -> DriveResult<()> {
        let mut state = self.lock();
        state.revoked.push(refresh_token.to_string());
        state.rejected_credentials.insert(refresh_token.to_string());
        Ok(())
    }

    fn chunk_alignment(&self) -> usize {
        self.alignment.max(1)
    }

    async fn start_upload(
        &self,
        access_token: &str,
        filename: &str,
        content_type: &str,
        total_bytes: u64,
    ) -> DriveResult<UploadSession> {
        let owner = self.owner_of(access_token)?;
        let location = format!("mock://upload/{}", Uuid::new_v4());
        self.lock().sessions.insert(
            location.clone(),
            PendingUpload {
                owner,
                filename: filename.to_string(),
                content_type: content_type.to_string(),
                data: Vec::with_capacity(total_bytes as usize),
                chunks: 0,
            },
        );
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
        match self.chunk_delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        let mut state = self.lock();
        let fail_on_chunk = state.fail_on_chunk;
        let pending = state
            .sessions
            .get_mut(&session.location)
            .ok_or_else(|| DriveError::InvalidResponse("unknown upload session".into()))?;

        if fail_on_chunk == Some(pending.chunks) {
            state.sessions.remove(&session.location);
            return Err(DriveError::Api {
                status: 503,
                message: "backend error".into(),
            });
        }
        if offset != pending.data.len() as u64 {
            return Err(DriveError::InvalidResponse(format!(
                "expected offset {}, got {}",
                pending.data.len(),
                offset
            )));
        }

        let is_last = offset + chunk.len() as u64 >= total_bytes;
        if !is_last && chunk.len() % self.chunk_alignment() != 0 {
            return Err(DriveError::Api {
                status: 400,
                message: format!("chunk of {} bytes is not aligned", chunk.len()),
            });
        }

        pending.data.extend_from_slice(&chunk);
        pending.chunks += 1;
        if (pending.data.len() as u64) < total_bytes {
            return Ok(None);
        }

        let Some(done) = state.sessions.remove(&session.location) else {
            return Err(DriveError::InvalidResponse("upload session vanished".into()));
        };
        let id = Uuid::new_v4().simple().to_string();
        state.files.entry(done.owner).or_default().push(StoredFile {
            id: id.clone(),
            name: done.filename,
            content_type: done.content_type,
            data: Bytes::from(done.data),
        });
        Ok(Some(id))
    }

    async fn list_files(&self, access_token: &str) -> DriveResult<Vec<RemoteFile>> {
        let owner = self.owner_of(access_token)?;
        let state = self.lock();
        Ok(state
            .files
            .get(&owner)
            .map(|files| {
                files
                    .iter()
                    .map(|f| RemoteFile {
                        id: f.id.clone(),
                        name: f.name.clone(),
                        mime_type: Some(f.content_type.clone()),
                        size: Some(f.data.len() as u64),
                        modified_time: None,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn download(&self, access_token: &str, file_id: &str) -> DriveResult<Download> {
        let owner = self.owner_of(access_token)?;
        let file = self
            .lock()
            .files
            .get(&owner)
            .and_then(|files| files.iter().find(|f| f.id == file_id).cloned())
            .ok_or_else(|| DriveError::FileNotFound(file_id.to_string()))?;

        let size = file.data.len() as u64;
        let body = stream::once(async move { Ok::<_, io::Error>(file.data) });
        Ok(Download {
            name: file.name,
            content_type: file.content_type,
            size: Some(size),
            body: Box::pin(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn chunks_assemble_into_a_stored_file() {
        let drive = MockDrive::new();
        let account = drive.exchange_code("alice").await.unwrap();
        assert_eq!(account.email, "alice@mock.drive");

        let session = drive
            .start_upload(&account.access_token, "notes.txt", "text/plain", 6)
            .await
            .unwrap();
        let first = drive
            .upload_chunk(&session, 0, Bytes::from_static(b"abc"), 6)
            .await
            .unwrap();
        assert!(first.is_none());
        let id = drive
            .upload_chunk(&session, 3, Bytes::from_static(b"def"), 6)
            .await
            .unwrap()
            .expect("final chunk returns an id");

        let files = drive.list_files(&account.access_token).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].id, id);
        assert_eq!(files[0].size, Some(6));

        let mut download = drive.download(&account.access_token, &id).await.unwrap();
        let body = download.body.next().await.unwrap().unwrap();
        assert_eq!(&body[..], b"abcdef");
    }

    #[tokio::test]
    async fn configured_chunk_failure_aborts_the_session() {
        let drive = MockDrive::new();
        drive.fail_on_chunk(1);
        let token = drive.access_token("refresh-bob").await.unwrap();
        let session = drive.start_upload(&token, "f", "text/plain", 4).await.unwrap();

        drive
            .upload_chunk(&session, 0, Bytes::from_static(b"ab"), 4)
            .await
            .unwrap();
        let err = drive
            .upload_chunk(&session, 2, Bytes::from_static(b"cd"), 4)
            .await
            .unwrap_err();
        assert!(matches!(err, DriveError::Api { status: 503, .. }));
        assert!(drive.stored_file("refresh-bob", "f").is_none());
    }

    #[tokio::test]
    async fn revoked_credentials_stop_working() {
        let drive = MockDrive::new();
        assert!(drive.access_token("refresh-carol").await.is_ok());
        drive.revoke("refresh-carol").await.unwrap();
        let err = drive.access_token("refresh-carol").await.unwrap_err();
        assert!(err.is_auth_failure());
        assert_eq!(drive.revoked(), vec!["refresh-carol".to_string()]);
    }
}
