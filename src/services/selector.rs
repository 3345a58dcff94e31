//! Capacity-aware placement of a file onto one of a user's accounts.

use crate::models::account::StorageAccount;

/// Pick the account with the most free space that can still hold the file.
///
/// Accounts where `used + size > total` are skipped, with capacity reserved
/// by in-flight uploads counted as used. Among the rest, the one with the
/// largest `total - used` wins; on a tie the earlier account is kept.
/// Returns `None` when nothing fits. Files are never split across accounts,
/// so a file larger than every single account is rejected even if the pool
/// as a whole has room.
pub fn select_account(
    accounts: &[StorageAccount],
    file_size_bytes: u64,
) -> Option<&StorageAccount> {
    accounts
        .iter()
        .filter(|account| account.fits(file_size_bytes))
        .fold(None, |best: Option<&StorageAccount>, candidate| match best {
            Some(current) if current.free_space() >= candidate.free_space() => Some(current),
            _ => Some(candidate),
        })
}
