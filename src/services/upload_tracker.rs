//! UploadTracker: background transfers to remote drives with live progress.
//!
//! Every accepted file becomes an entry in an in-memory registry keyed by a
//! fresh upload id. A spawned task pushes the buffered file to the remote
//! drive chunk by chunk and publishes a `ProgressUpdate` after each one on a
//! broadcast channel, so any number of subscribers can follow the same
//! upload. When the transfer succeeds or fails the entry is removed, the
//! terminal update is published and the channel closes.
//!
//! Capacity was reserved during placement. On success the reservation is
//! committed into `used_space`; on failure it is released and `used_space`
//! is left alone. Failed transfers are not retried.
//!
//! Progress is published once per acknowledged chunk, so its granularity
//! follows the effective chunk size: with Google's 256 KiB alignment a
//! 1 MiB file reports 25, 50, 75 and 100.

use crate::{
    drive::{DriveError, DriveResult, RemoteDrive},
    models::{
        account::{AccountKey, StorageAccount},
        upload::{ProgressUpdate, TransferState, UploadSnapshot},
    },
    services::{account_service::AccountService, transfer_log::TransferLog},
};
use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Updates buffered per subscriber before it starts skipping ahead.
const CHANNEL_CAPACITY: usize = 256;

/// Error recorded on transfers that were running when the server stopped.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by server restart";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// A file accepted for upload, fully buffered.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub filename: String,
    pub content_type: String,
    pub data: Bytes,
}

struct TaskEntry {
    user_id: Uuid,
    filename: String,
    account: AccountKey,
    size_bytes: u64,
    progress: u8,
    state: TransferState,
    updates: broadcast::Sender<ProgressUpdate>,
}

impl TaskEntry {
    fn snapshot(&self, upload_id: Uuid) -> UploadSnapshot {
        UploadSnapshot {
            upload_id,
            filename: self.filename.clone(),
            account: self.account.email.clone(),
            size_bytes: self.size_bytes,
            bytes_sent: match self.state {
                TransferState::Sending { offset } => offset,
                TransferState::Succeeded => self.size_bytes,
                TransferState::Pending | TransferState::Failed(_) => 0,
            },
            progress: self.progress,
        }
    }
}

#[derive(Clone)]
pub struct UploadTracker {
    tasks: Arc<Mutex<HashMap<Uuid, TaskEntry>>>,
    drive: Arc<dyn RemoteDrive>,
    accounts: AccountService,
    history: TransferLog,
    chunk_size: usize,
}

impl UploadTracker {
    /// `chunk_size` is rounded up to the drive's required chunk alignment.
    pub fn new(
        drive: Arc<dyn RemoteDrive>,
        accounts: AccountService,
        history: TransferLog,
        chunk_size: usize,
    ) -> Self {
        let aligned = aligned_chunk_size(chunk_size, drive.chunk_alignment());
        if aligned != chunk_size {
            warn!(
                requested = chunk_size,
                effective = aligned,
                "chunk size rounded up to the remote drive's alignment"
            );
        }
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            drive,
            accounts,
            history,
            chunk_size: aligned,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Settle transfers left `in_progress` by a previous process.
    ///
    /// Must run before the server accepts uploads: every `in_progress` row
    /// is taken to be orphaned, marked failed and its reservation released.
    /// Returns how many transfers were recovered.
    pub async fn recover_interrupted(&self) -> Result<u64, UploadError> {
        let recovered = self.history.fail_interrupted(INTERRUPTED_MESSAGE).await?;
        if recovered > 0 {
            warn!(recovered, "marked interrupted transfers as failed");
        }
        Ok(recovered)
    }

    /// Register an upload onto `account` and start transferring it.
    ///
    /// `account` must already carry a reservation for the file's size. The
    /// transfer runs on its own task; this returns as soon as it is spawned.
    pub async fn begin_upload(
        &self,
        user_id: Uuid,
        upload: NewUpload,
        account: &StorageAccount,
    ) -> Result<Uuid, UploadError> {
        let upload_id = Uuid::new_v4();
        let size_bytes = upload.data.len() as u64;
        let key = AccountKey::from(account);

        if let Err(err) = self
            .history
            .start(upload_id, user_id, &key.email, &upload.filename, size_bytes)
            .await
        {
            self.release_quietly(&key, size_bytes).await;
            return Err(err.into());
        }

        let (updates, _) = broadcast::channel(CHANNEL_CAPACITY);
        self.lock().insert(
            upload_id,
            TaskEntry {
                user_id,
                filename: upload.filename.clone(),
                account: key.clone(),
                size_bytes,
                progress: 0,
                state: TransferState::Pending,
                updates,
            },
        );

        info!(
            upload_id = %upload_id,
            account = %key.email,
            bytes = size_bytes,
            filename = %upload.filename,
            "upload started"
        );

        let tracker = self.clone();
        let refresh_token = account.refresh_token.clone();
        tokio::spawn(async move {
            tracker.run_transfer(upload_id, refresh_token, upload).await;
        });

        Ok(upload_id)
    }

    /// Attach to an in-flight upload's progress channel.
    ///
    /// `None` for unknown ids and for uploads that already finished or failed;
    /// their outcome is in the transfer history.
    pub fn subscribe(&self, upload_id: Uuid) -> Option<broadcast::Receiver<ProgressUpdate>> {
        self.lock()
            .get(&upload_id)
            .map(|entry| entry.updates.subscribe())
    }

    pub fn snapshot(&self, upload_id: Uuid) -> Option<UploadSnapshot> {
        self.lock()
            .get(&upload_id)
            .map(|entry| entry.snapshot(upload_id))
    }

    /// In-flight uploads owned by `user_id`.
    pub fn active_for_user(&self, user_id: Uuid) -> Vec<UploadSnapshot> {
        let mut active: Vec<UploadSnapshot> = self
            .lock()
            .iter()
            .filter(|(_, entry)| entry.user_id == user_id)
            .map(|(id, entry)| entry.snapshot(*id))
            .collect();
        active.sort_by(|a, b| a.filename.cmp(&b.filename));
        active
    }

    async fn run_transfer(self, upload_id: Uuid, refresh_token: String, upload: NewUpload) {
        match self.transfer(upload_id, &refresh_token, &upload).await {
            Ok(remote_id) => self.finish_success(upload_id, &remote_id).await,
            Err(err) => self.finish_failure(upload_id, err).await,
        }
    }

    async fn transfer(
        &self,
        upload_id: Uuid,
        refresh_token: &str,
        upload: &NewUpload,
    ) -> DriveResult<String> {
        let total = upload.data.len() as u64;
        let access_token = self.drive.access_token(refresh_token).await?;
        let session = self
            .drive
            .start_upload(&access_token, &upload.filename, &upload.content_type, total)
            .await?;

        if total == 0 {
            return self
                .drive
                .upload_chunk(&session, 0, Bytes::new(), 0)
                .await?
                .ok_or_else(|| DriveError::InvalidResponse("empty upload was not finalized".into()));
        }

        let mut offset = 0u64;
        while offset < total {
            let start = offset as usize;
            let end = (start + self.chunk_size).min(upload.data.len());
            let chunk = upload.data.slice(start..end);

            self.set_state(upload_id, TransferState::Sending { offset });
            let remote_id = self.drive.upload_chunk(&session, offset, chunk, total).await?;
            offset = end as u64;

            if offset == total {
                return remote_id.ok_or_else(|| {
                    DriveError::InvalidResponse("final chunk was not acknowledged".into())
                });
            }
            self.publish(upload_id, progress_percent(offset, total));
        }

        Err(DriveError::InvalidResponse("upload ended before the last byte".into()))
    }

    async fn finish_success(&self, upload_id: Uuid, remote_id: &str) {
        self.set_state(upload_id, TransferState::Succeeded);

        let reservation = self
            .lock()
            .get(&upload_id)
            .map(|entry| (entry.account.clone(), entry.size_bytes));
        if let Some((account, size_bytes)) = reservation {
            if let Err(err) = self.accounts.commit(&account, size_bytes).await {
                error!(account = %account.email, error = %err, "failed to commit used capacity");
            }
        }
        if let Err(err) = self.history.complete(upload_id, remote_id).await {
            error!(upload_id = %upload_id, error = %err, "failed to record completed transfer");
        }

        let Some(entry) = self.lock().remove(&upload_id) else {
            return;
        };
        info!(
            upload_id = %upload_id,
            account = %entry.account.email,
            bytes = entry.size_bytes,
            remote_id,
            "upload completed"
        );
        let _ = entry.updates.send(ProgressUpdate {
            upload_id,
            progress: 100,
            error: None,
        });
    }

    async fn finish_failure(&self, upload_id: Uuid, err: DriveError) {
        let message = err.to_string();
        warn!(upload_id = %upload_id, error = %message, "upload failed");
        self.set_state(upload_id, TransferState::Failed(message.clone()));

        let reservation = self
            .lock()
            .get(&upload_id)
            .map(|entry| (entry.account.clone(), entry.size_bytes));
        if let Some((account, size_bytes)) = reservation {
            self.release_quietly(&account, size_bytes).await;
        }
        if let Err(err) = self.history.fail(upload_id, &message).await {
            error!(upload_id = %upload_id, error = %err, "failed to record failed transfer");
        }

        let Some(entry) = self.lock().remove(&upload_id) else {
            return;
        };
        let _ = entry.updates.send(ProgressUpdate {
            upload_id,
            progress: entry.progress,
            error: Some(message),
        });
    }

    /// Record progress and push it to every subscriber.
    fn publish(&self, upload_id: Uuid, progress: u8) {
        let mut tasks = self.lock();
        let Some(entry) = tasks.get_mut(&upload_id) else {
            return;
        };
        entry.progress = entry.progress.max(progress);
        // No subscribers is fine; nobody is watching yet.
        let _ = entry.updates.send(ProgressUpdate {
            upload_id,
            progress: entry.progress,
            error: None,
        });
    }

    fn set_state(&self, upload_id: Uuid, state: TransferState) {
        if let Some(entry) = self.lock().get_mut(&upload_id) {
            if entry.state.is_terminal() {
                return;
            }
            debug!(upload_id = %upload_id, state = ?state, "transfer state");
            entry.state = state;
        }
    }

    async fn release_quietly(&self, account: &AccountKey, size_bytes: u64) {
        if let Err(err) = self.accounts.release(account, size_bytes).await {
            error!(account = %account.email, error = %err, "failed to release reserved capacity");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, TaskEntry>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `round(sent / total * 100)`, held at 99 until the last byte is sent so
/// that 100 is only ever reported once.
pub fn progress_percent(sent: u64, total: u64) -> u8 {
    if total == 0 || sent >= total {
        return 100;
    }
    let percent = (sent as f64 / total as f64 * 100.0).round() as u8;
    percent.min(99)
}

fn aligned_chunk_size(requested: usize, alignment: usize) -> usize {
    let alignment = alignment.max(1);
    requested.max(1).div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::test_pool,
        drive::mock::MockDrive,
        models::{
            account::{BYTES_PER_GB, bytes_to_gb},
            transfer::{STATUS_COMPLETED, STATUS_FAILED},
        },
    };

    const MIB: usize = 1024 * 1024;

    struct Harness {
        drive: Arc<MockDrive>,
        accounts: AccountService,
        history: TransferLog,
        tracker: UploadTracker,
        user_id: Uuid,
    }

    async fn harness(drive: MockDrive) -> Harness {
        let db = test_pool().await;
        let drive = Arc::new(drive);
        let accounts = AccountService::new(db.clone());
        let history = TransferLog::new(db);
        let tracker = UploadTracker::new(
            drive.clone(),
            accounts.clone(),
            history.clone(),
            DEFAULT_CHUNK_SIZE,
        );
        let user_id = Uuid::new_v4();
        accounts
            .upsert(user_id, "alice@mock.drive", "refresh-alice", 1.0, 15.0)
            .await
            .unwrap();
        Harness {
            drive,
            accounts,
            history,
            tracker,
            user_id,
        }
    }

    fn file(name: &str, len: usize) -> NewUpload {
        NewUpload {
            filename: name.into(),
            content_type: "application/octet-stream".into(),
            data: Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>()),
        }
    }

    async fn begin(h: &Harness, upload: NewUpload) -> Uuid {
        let account = h
            .accounts
            .place_file(h.user_id, upload.data.len() as u64)
            .await
            .unwrap()
            .expect("account has room");
        h.tracker.begin_upload(h.user_id, upload, &account).await.unwrap()
    }

    async fn drain(mut rx: broadcast::Receiver<ProgressUpdate>) -> Vec<ProgressUpdate> {
        let mut seen = Vec::new();
        while let Ok(update) = rx.recv().await {
            seen.push(update);
        }
        seen
    }

    async fn alice(h: &Harness) -> StorageAccount {
        h.accounts
            .get(h.user_id, "alice@mock.drive")
            .await
            .unwrap()
    }

    async fn used_space(h: &Harness) -> f64 {
        alice(h).await.used_space
    }

    #[tokio::test]
    async fn one_mebibyte_in_64k_chunks_reports_sixteen_updates() {
        let h = harness(MockDrive::new()).await;
        let upload = file("photo.bin", MIB);
        let expected = upload.data.clone();

        let id = begin(&h, upload).await;
        let updates = drain(h.tracker.subscribe(id).unwrap()).await;

        assert_eq!(updates.len(), 16);
        assert!(updates.windows(2).all(|w| w[0].progress <= w[1].progress));
        assert_eq!(updates.last().unwrap().progress, 100);
        assert_eq!(updates.iter().filter(|u| u.progress == 100).count(), 1);
        assert!(updates.iter().all(|u| u.error.is_none() && u.upload_id == id));

        assert!(h.tracker.subscribe(id).is_none());
        assert!(h.tracker.snapshot(id).is_none());
        assert_eq!(h.drive.stored_file("refresh-alice", "photo.bin").unwrap(), expected);
    }

    #[tokio::test]
    async fn success_keeps_exactly_the_file_size_in_used_space() {
        let h = harness(MockDrive::new()).await;
        let before = used_space(&h).await;

        let id = begin(&h, file("a.bin", MIB)).await;
        drain(h.tracker.subscribe(id).unwrap()).await;

        let after = alice(&h).await;
        assert_eq!(after.used_space - before, MIB as f64 / BYTES_PER_GB);
        assert_eq!(after.reserved_bytes, 0);

        let record = h.history.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, STATUS_COMPLETED);
        assert!(record.remote_file_id.is_some());
    }

    #[tokio::test]
    async fn chunk_failure_is_terminal_and_releases_capacity() {
        let drive = MockDrive::new();
        drive.fail_on_chunk(3);
        let h = harness(drive).await;
        let before = used_space(&h).await;

        let id = begin(&h, file("broken.bin", MIB)).await;
        let updates = drain(h.tracker.subscribe(id).unwrap()).await;

        assert_eq!(updates.len(), 4);
        let last = updates.last().unwrap();
        assert!(last.error.is_some());
        assert!(last.progress < 100);
        assert!(updates[..3].iter().all(|u| u.error.is_none()));

        assert_eq!(used_space(&h).await, before);
        assert_eq!(alice(&h).await.reserved_bytes, 0);
        assert!(h.tracker.subscribe(id).is_none());
        let record = h.history.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, STATUS_FAILED);
        assert!(h.drive.stored_file("refresh-alice", "broken.bin").is_none());
    }

    #[tokio::test]
    async fn failed_upload_leaves_used_space_bit_for_bit() {
        let drive = MockDrive::new();
        drive.fail_on_chunk(5);
        let h = harness(drive).await;
        h.accounts
            .upsert(h.user_id, "alice@mock.drive", "refresh-alice", 3.89, 15.0)
            .await
            .unwrap();
        let before = alice(&h).await;

        let id = begin(&h, file("odd.bin", 1_000_003)).await;
        assert_eq!(alice(&h).await.reserved_bytes, 1_000_003);
        let updates = drain(h.tracker.subscribe(id).unwrap()).await;
        assert!(updates.last().unwrap().error.is_some());

        let after = alice(&h).await;
        assert_eq!(after.used_space.to_bits(), before.used_space.to_bits());
        assert_eq!(after.reserved_bytes, 0);
    }

    #[tokio::test]
    async fn restart_fails_orphaned_transfers_and_frees_their_capacity() {
        let h = harness(MockDrive::new()).await;
        let before = alice(&h).await;

        // Left behind by a process that stopped mid-transfer.
        let placed = h
            .accounts
            .place_file(h.user_id, 879_135_997)
            .await
            .unwrap()
            .unwrap();
        let orphan = Uuid::new_v4();
        h.history
            .start(orphan, h.user_id, &placed.email, "lost.bin", 879_135_997)
            .await
            .unwrap();

        let finished = begin(&h, file("kept.bin", 1000)).await;
        drain(h.tracker.subscribe(finished).unwrap()).await;

        let restarted = UploadTracker::new(
            h.drive.clone(),
            h.accounts.clone(),
            h.history.clone(),
            DEFAULT_CHUNK_SIZE,
        );
        assert_eq!(restarted.recover_interrupted().await.unwrap(), 1);

        let record = h.history.get(orphan).await.unwrap().unwrap();
        assert_eq!(record.status, STATUS_FAILED);
        assert_eq!(record.error.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert!(record.finished_at.is_some());
        let kept = h.history.get(finished).await.unwrap().unwrap();
        assert_eq!(kept.status, STATUS_COMPLETED);

        let after = alice(&h).await;
        assert_eq!(after.reserved_bytes, 0);
        assert_eq!(after.used_space, before.used_space + bytes_to_gb(1000));

        assert_eq!(restarted.recover_interrupted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn progress_follows_the_drive_chunk_alignment() {
        let h = harness(MockDrive::new().with_chunk_alignment(256 * 1024)).await;
        assert_eq!(h.tracker.chunk_size(), 256 * 1024);

        let id = begin(&h, file("aligned.bin", MIB)).await;
        let updates = drain(h.tracker.subscribe(id).unwrap()).await;

        let progress: Vec<u8> = updates.iter().map(|u| u.progress).collect();
        assert_eq!(progress, vec![25, 50, 75, 100]);
        assert!(h.drive.stored_file("refresh-alice", "aligned.bin").is_some());
    }

    #[tokio::test]
    async fn rejected_credential_fails_before_any_progress() {
        let drive = MockDrive::new();
        drive.reject_credential("refresh-alice");
        let h = harness(drive).await;
        let before = used_space(&h).await;

        let id = begin(&h, file("a.bin", 1000)).await;
        let updates = drain(h.tracker.subscribe(id).unwrap()).await;

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].progress, 0);
        assert!(updates[0].error.as_deref().unwrap().contains("401"));
        assert_eq!(used_space(&h).await, before);
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_update() {
        let h = harness(MockDrive::new()).await;
        let id = begin(&h, file("shared.bin", 4 * DEFAULT_CHUNK_SIZE)).await;

        let first = h.tracker.subscribe(id).unwrap();
        let second = h.tracker.subscribe(id).unwrap();
        let (a, b) = tokio::join!(drain(first), drain(second));

        assert_eq!(a.len(), 4);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn empty_file_reports_a_single_completion() {
        let h = harness(MockDrive::new()).await;
        let id = begin(&h, file("empty.txt", 0)).await;
        let updates = drain(h.tracker.subscribe(id).unwrap()).await;

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].progress, 100);
        assert!(h.drive.stored_file("refresh-alice", "empty.txt").is_some());
    }

    #[tokio::test]
    async fn unknown_ids_have_nothing_to_subscribe_to() {
        let h = harness(MockDrive::new()).await;
        assert!(h.tracker.subscribe(Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn active_uploads_are_listed_per_user() {
        let h = harness(MockDrive::new()).await;
        let id = begin(&h, file("big.bin", MIB)).await;

        let active = h.tracker.active_for_user(h.user_id);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].upload_id, id);
        assert_eq!(active[0].account, "alice@mock.drive");
        assert!(h.tracker.active_for_user(Uuid::new_v4()).is_empty());

        drain(h.tracker.subscribe(id).unwrap()).await;
        assert!(h.tracker.active_for_user(h.user_id).is_empty());
    }

    #[test]
    fn progress_rounds_and_reserves_one_hundred_for_completion() {
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(1, 2), 50);
        assert_eq!(progress_percent(999, 1000), 99);
        assert_eq!(progress_percent(1000, 1000), 100);
        assert_eq!(progress_percent(0, 0), 100);
    }

    #[test]
    fn chunk_size_is_rounded_to_alignment() {
        assert_eq!(aligned_chunk_size(64 * 1024, 1), 64 * 1024);
        assert_eq!(aligned_chunk_size(64 * 1024, 256 * 1024), 256 * 1024);
        assert_eq!(aligned_chunk_size(300 * 1024, 256 * 1024), 512 * 1024);
        assert_eq!(aligned_chunk_size(0, 1), 1);
    }
}
