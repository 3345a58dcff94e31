//! Durable history of upload transfers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

pub const STATUS_IN_PROGRESS: &str = "in_progress";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

/// One row of the `transfers` table.
///
/// Written when an upload begins and finalized when it reaches a terminal
/// state. Unlike the tracker's in-memory tasks, these rows survive restarts.
#[derive(Serialize, Clone, FromRow, Debug)]
pub struct TransferRecord {
    /// Same value as the upload id handed to the client.
    pub id: Uuid,
    pub user_id: Uuid,
    pub account_email: String,
    pub filename: String,
    pub size_bytes: i64,
    /// `in_progress`, `completed` or `failed`.
    pub status: String,
    pub error: Option<String>,
    pub remote_file_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
