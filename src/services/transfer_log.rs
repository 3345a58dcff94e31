//! Durable transfer history in the `transfers` table.

use crate::models::transfer::{
    STATUS_COMPLETED, STATUS_FAILED, STATUS_IN_PROGRESS, TransferRecord,
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

const MAX_HISTORY: i64 = 500;

#[derive(Clone)]
pub struct TransferLog {
    db: Arc<SqlitePool>,
}

impl TransferLog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Record a transfer as `in_progress`.
    pub async fn start(
        &self,
        id: Uuid,
        user_id: Uuid,
        account_email: &str,
        filename: &str,
        size_bytes: u64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO transfers (id, user_id, account_email, filename, size_bytes, status, started_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(user_id)
        .bind(account_email)
        .bind(filename)
        .bind(size_bytes as i64)
        .bind(STATUS_IN_PROGRESS)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn complete(&self, id: Uuid, remote_file_id: &str) -> Result<(), sqlx::Error> {
        self.finish(id, STATUS_COMPLETED, None, Some(remote_file_id))
            .await
    }

    pub async fn fail(&self, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        self.finish(id, STATUS_FAILED, Some(error), None).await
    }

    async fn finish(
        &self,
        id: Uuid,
        status: &str,
        error: Option<&str>,
        remote_file_id: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE transfers SET status = ?, error = ?, remote_file_id = ?, finished_at = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(remote_file_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Fail every `in_progress` transfer and release the capacity each one
    /// reserved on its account, in a single transaction.
    ///
    /// Only valid while no transfers are running, i.e. at startup of the
    /// process that owns the database.
    pub async fn fail_interrupted(&self, error: &str) -> Result<u64, sqlx::Error> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "UPDATE storage_accounts
             SET reserved_bytes = MAX(reserved_bytes - (
                 SELECT COALESCE(SUM(t.size_bytes), 0) FROM transfers t
                 WHERE t.status = ?
                   AND t.user_id = storage_accounts.user_id
                   AND t.account_email = storage_accounts.email
             ), 0)
             WHERE EXISTS (
                 SELECT 1 FROM transfers t
                 WHERE t.status = ?
                   AND t.user_id = storage_accounts.user_id
                   AND t.account_email = storage_accounts.email
             )",
        )
        .bind(STATUS_IN_PROGRESS)
        .bind(STATUS_IN_PROGRESS)
        .execute(&mut *tx)
        .await?;

        let failed = sqlx::query(
            "UPDATE transfers SET status = ?, error = ?, finished_at = ? WHERE status = ?",
        )
        .bind(STATUS_FAILED)
        .bind(error)
        .bind(Utc::now())
        .bind(STATUS_IN_PROGRESS)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(failed.rows_affected())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<TransferRecord>, sqlx::Error> {
        sqlx::query_as::<_, TransferRecord>(
            "SELECT id, user_id, account_email, filename, size_bytes, status, error,
                    remote_file_id, started_at, finished_at
             FROM transfers WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await
    }

    /// Most recent transfers for a user, newest first.
    pub async fn history(&self, user_id: Uuid) -> Result<Vec<TransferRecord>, sqlx::Error> {
        sqlx::query_as::<_, TransferRecord>(
            "SELECT id, user_id, account_email, filename, size_bytes, status, error,
                    remote_file_id, started_at, finished_at
             FROM transfers WHERE user_id = ?
             ORDER BY started_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(MAX_HISTORY)
        .fetch_all(&*self.db)
        .await
    }
}
