//! Shared application state handed to every handler.

use crate::{
    auth::JwtService,
    config::{AppConfig, DriveBackend},
    drive::{RemoteDrive, google::GoogleDrive, mock::MockDrive},
    services::{
        account_service::AccountService, transfer_log::TransferLog,
        upload_tracker::UploadTracker, user_service::UserService,
    },
};
use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
    pub drive: Arc<dyn RemoteDrive>,
    pub jwt: JwtService,
    pub users: UserService,
    pub accounts: AccountService,
    pub transfers: TransferLog,
    pub tracker: UploadTracker,
}

impl AppState {
    /// Build every service on top of `db` and `drive`.
    pub fn new(
        db: Arc<SqlitePool>,
        drive: Arc<dyn RemoteDrive>,
        jwt_secret: &str,
        chunk_size: usize,
        bcrypt_cost: u32,
    ) -> Self {
        let accounts = AccountService::new(db.clone());
        let transfers = TransferLog::new(db.clone());
        let tracker = UploadTracker::new(
            drive.clone(),
            accounts.clone(),
            transfers.clone(),
            chunk_size,
        );

        Self {
            users: UserService::new(db.clone(), bcrypt_cost),
            jwt: JwtService::new(jwt_secret),
            db,
            drive,
            accounts,
            transfers,
            tracker,
        }
    }

    /// Pick the drive backend named in `cfg` and build the state around it.
    pub fn from_config(db: Arc<SqlitePool>, cfg: &AppConfig) -> Result<Self> {
        let drive: Arc<dyn RemoteDrive> = match cfg.drive_backend {
            DriveBackend::Google => {
                info!("Using Google Drive backend, redirect URI {}", cfg.google_redirect_uri);
                Arc::new(GoogleDrive::new(
                    cfg.google_client_id.clone(),
                    cfg.google_client_secret.clone(),
                    cfg.google_redirect_uri.clone(),
                )?)
            }
            DriveBackend::Mock => {
                info!("Using in-memory mock drive backend");
                Arc::new(MockDrive::new())
            }
        };

        Ok(Self::new(
            db,
            drive,
            &cfg.jwt_secret,
            cfg.chunk_size,
            cfg.bcrypt_cost,
        ))
    }
}
