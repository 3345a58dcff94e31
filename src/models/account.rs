//! Represents a connected remote storage account (one Google Drive login).

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// Bytes per capacity unit. Capacities are tracked in GB (1024^3 bytes).
pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Convert a byte count into the capacity unit used by `StorageAccount`.
pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

/// A remote drive connected by a user.
///
/// Accounts are keyed by `(user_id, email)`; one user may connect several
/// emails, and the same email may be connected by different users.
#[derive(Serialize, Clone, FromRow, Debug)]
pub struct StorageAccount {
    /// Owning DriveMerge user.
    pub user_id: Uuid,

    /// Email address of the remote account.
    pub email: String,

    /// Remote credential used to mint access tokens. Never sent to clients.
    #[serde(skip_serializing)]
    pub refresh_token: String,

    /// Space in use, in GB: the remote quota at connect time plus every
    /// upload completed since.
    pub used_space: f64,

    /// Total capacity, in GB.
    pub total_space: f64,

    /// Bytes held by uploads still in flight. Kept in whole bytes so a
    /// failed upload hands back exactly what it took.
    pub reserved_bytes: i64,

    /// When the account was first connected.
    pub created_at: DateTime<Utc>,
}

impl StorageAccount {
    /// Capacity held by in-flight uploads, in GB.
    pub fn reserved_space(&self) -> f64 {
        bytes_to_gb(self.reserved_bytes.max(0) as u64)
    }

    /// `used_space` plus reservations plus `extra_bytes`, in GB.
    ///
    /// Matches the arithmetic of the reservation UPDATE in `AccountService`.
    pub fn claimed_space(&self, extra_bytes: u64) -> f64 {
        self.used_space + bytes_to_gb(self.reserved_bytes.max(0) as u64 + extra_bytes)
    }

    /// Remaining capacity in GB. May be negative if the remote quota shrank.
    pub fn free_space(&self) -> f64 {
        self.total_space - self.claimed_space(0)
    }

    /// Whether a file of `size_bytes` would still fit within `total_space`.
    pub fn fits(&self, size_bytes: u64) -> bool {
        self.claimed_space(size_bytes) <= self.total_space
    }
}

/// Composite key of a `StorageAccount`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccountKey {
    pub user_id: Uuid,
    pub email: String,
}

impl From<&StorageAccount> for AccountKey {
    fn from(account: &StorageAccount) -> Self {
        Self {
            user_id: account.user_id,
            email: account.email.clone(),
        }
    }
}

/// Client-facing view of an account with derived free space.
#[derive(Serialize, Debug)]
pub struct AccountSummary {
    pub email: String,
    pub used_space: f64,
    pub reserved_space: f64,
    pub total_space: f64,
    pub free_space: f64,
    pub connected_at: DateTime<Utc>,
}

impl From<StorageAccount> for AccountSummary {
    fn from(account: StorageAccount) -> Self {
        let free_space = account.free_space().max(0.0);
        Self {
            reserved_space: account.reserved_space(),
            email: account.email,
            used_space: account.used_space,
            total_space: account.total_space,
            free_space,
            connected_at: account.created_at,
        }
    }
}
