//! AccountService: connected storage accounts and their capacity bookkeeping.
//!
//! Capacity is reserved at placement time with a single conditional UPDATE,
//! so two uploads racing for the last gigabytes of an account cannot both
//! pass the check. Reservations live in the integer `reserved_bytes` column,
//! apart from `used_space`: a successful upload moves its bytes into
//! `used_space`, a failed one gives them back and leaves `used_space` as it
//! was.

use crate::{
    models::account::{AccountKey, BYTES_PER_GB, StorageAccount, bytes_to_gb},
    services::selector::select_account,
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// How many times placement re-reads accounts after losing a reservation race.
const PLACEMENT_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account `{0}` is not connected")]
    NotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type AccountResult<T> = Result<T, AccountError>;

/// Outcome of one placement attempt against a snapshot of accounts.
#[derive(Debug)]
pub(crate) enum Placement {
    /// Reserved on this account; `reserved_bytes` already includes the file.
    Placed(StorageAccount),
    /// No account in the snapshot can hold the file.
    NoFit,
    /// The chosen account filled up after the snapshot was taken.
    Contended(AccountKey),
}

#[derive(Clone)]
pub struct AccountService {
    db: Arc<SqlitePool>,
}

const ACCOUNT_COLUMNS: &str =
    "user_id, email, refresh_token, used_space, total_space, reserved_bytes, created_at";

impl AccountService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// All accounts connected by `user_id`, oldest first.
    pub async fn list(&self, user_id: Uuid) -> AccountResult<Vec<StorageAccount>> {
        Ok(sqlx::query_as::<_, StorageAccount>(&format!(
            "SELECT {} FROM storage_accounts WHERE user_id = ? ORDER BY created_at, email",
            ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&*self.db)
        .await?)
    }

    pub async fn get(&self, user_id: Uuid, email: &str) -> AccountResult<StorageAccount> {
        sqlx::query_as::<_, StorageAccount>(&format!(
            "SELECT {} FROM storage_accounts WHERE user_id = ? AND email = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .bind(email)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| AccountError::NotFound(email.to_string()))
    }

    /// Insert a newly connected account, or refresh credential and quota when
    /// the same email is connected again.
    ///
    /// A reconnect replaces `used_space` with the remote figure but keeps
    /// `reserved_bytes`: uploads still in flight are not part of the remote
    /// quota yet and will settle their own reservations.
    pub async fn upsert(
        &self,
        user_id: Uuid,
        email: &str,
        refresh_token: &str,
        used_space: f64,
        total_space: f64,
    ) -> AccountResult<StorageAccount> {
        Ok(sqlx::query_as::<_, StorageAccount>(&format!(
            r#"
            INSERT INTO storage_accounts (
                user_id, email, refresh_token, used_space, total_space, reserved_bytes, created_at
            ) VALUES (?, ?, ?, ?, ?, 0, ?)
            ON CONFLICT(user_id, email) DO UPDATE SET
                refresh_token = excluded.refresh_token,
                used_space = excluded.used_space,
                total_space = excluded.total_space
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .bind(email)
        .bind(refresh_token)
        .bind(used_space)
        .bind(total_space)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?)
    }

    /// Remove an account and hand back the deleted row (for credential revocation).
    pub async fn delete(&self, user_id: Uuid, email: &str) -> AccountResult<StorageAccount> {
        sqlx::query_as::<_, StorageAccount>(&format!(
            "DELETE FROM storage_accounts WHERE user_id = ? AND email = ? RETURNING {}",
            ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .bind(email)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| AccountError::NotFound(email.to_string()))
    }

    /// Atomically reserve `size_bytes` on the account if it still fits.
    ///
    /// The fit check is the same `used + reserved + size <= total` that
    /// `StorageAccount::fits` evaluates. Returns `false` when the account is
    /// gone or would overflow.
    pub async fn try_reserve(&self, key: &AccountKey, size_bytes: u64) -> AccountResult<bool> {
        let result = sqlx::query(
            "UPDATE storage_accounts SET reserved_bytes = reserved_bytes + ?
             WHERE user_id = ? AND email = ?
               AND used_space + (MAX(reserved_bytes, 0) + ?) / ? <= total_space",
        )
        .bind(size_bytes as i64)
        .bind(key.user_id)
        .bind(&key.email)
        .bind(size_bytes as i64)
        .bind(BYTES_PER_GB)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Turn a reservation into real usage once the upload has landed.
    pub async fn commit(&self, key: &AccountKey, size_bytes: u64) -> AccountResult<()> {
        let result = sqlx::query(
            "UPDATE storage_accounts
             SET used_space = used_space + ?, reserved_bytes = MAX(reserved_bytes - ?, 0)
             WHERE user_id = ? AND email = ?",
        )
        .bind(bytes_to_gb(size_bytes))
        .bind(size_bytes as i64)
        .bind(key.user_id)
        .bind(&key.email)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            debug!("account {} disconnected before its upload was committed", key.email);
        }
        Ok(())
    }

    /// Give back a reservation taken by `try_reserve`. `used_space` is untouched.
    pub async fn release(&self, key: &AccountKey, size_bytes: u64) -> AccountResult<()> {
        let result = sqlx::query(
            "UPDATE storage_accounts SET reserved_bytes = MAX(reserved_bytes - ?, 0)
             WHERE user_id = ? AND email = ?",
        )
        .bind(size_bytes as i64)
        .bind(key.user_id)
        .bind(&key.email)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            debug!("account {} disconnected before its reservation was released", key.email);
        }
        Ok(())
    }

    /// Choose an account for a file and reserve its size there.
    ///
    /// Returns the chosen account with `reserved_bytes` already including the
    /// file, or `None` if no single account can hold it. Losing the
    /// reservation to a concurrent upload re-reads the accounts and selects
    /// again, at most `PLACEMENT_ATTEMPTS` times.
    pub async fn place_file(
        &self,
        user_id: Uuid,
        size_bytes: u64,
    ) -> AccountResult<Option<StorageAccount>> {
        for attempt in 1..=PLACEMENT_ATTEMPTS {
            let accounts = self.list(user_id).await?;
            match self.try_place(&accounts, size_bytes).await? {
                Placement::Placed(account) => return Ok(Some(account)),
                Placement::NoFit => return Ok(None),
                Placement::Contended(key) => warn!(
                    account = %key.email,
                    attempt,
                    "lost capacity reservation race, re-selecting"
                ),
            }
        }

        Ok(None)
    }

    /// One select-then-reserve step against `accounts`.
    pub(crate) async fn try_place(
        &self,
        accounts: &[StorageAccount],
        size_bytes: u64,
    ) -> AccountResult<Placement> {
        let Some(chosen) = select_account(accounts, size_bytes) else {
            return Ok(Placement::NoFit);
        };

        let key = AccountKey::from(chosen);
        if !self.try_reserve(&key, size_bytes).await? {
            return Ok(Placement::Contended(key));
        }
        let mut reserved = chosen.clone();
        reserved.reserved_bytes += size_bytes as i64;
        Ok(Placement::Placed(reserved))
    }
}
