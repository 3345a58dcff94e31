//! Transient upload state shared between the tracker and its subscribers.

use serde::Serialize;
use uuid::Uuid;

/// Where a transfer currently is. Only the tracker's transfer task moves it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    Sending { offset: u64 },
    Succeeded,
    Failed(String),
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Succeeded | TransferState::Failed(_))
    }
}

/// A single message on an upload's progress channel.
///
/// A message is terminal when `progress` is 100 or `error` is set; no further
/// messages follow a terminal one.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub upload_id: Uuid,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressUpdate {
    pub fn is_terminal(&self) -> bool {
        self.progress >= 100 || self.error.is_some()
    }
}

/// Point-in-time view of an in-flight upload.
#[derive(Serialize, Clone, Debug)]
pub struct UploadSnapshot {
    pub upload_id: Uuid,
    pub filename: String,
    pub account: String,
    pub size_bytes: u64,
    /// Bytes handed to the remote drive before the chunk currently in flight.
    pub bytes_sent: u64,
    pub progress: u8,
}
