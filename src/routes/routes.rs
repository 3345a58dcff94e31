//! Defines routes for every DriveMerge operation.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Auth**
//!   - `POST   /auth/register`: create a user, returns a bearer token
//!   - `POST   /auth/login`   : exchange credentials for a bearer token
//!
//! - **Storage accounts** (bearer token unless noted)
//!   - `GET    /accounts`         : connected accounts with free space
//!   - `GET    /accounts/connect` : consent URL for a new account
//!   - `GET    /accounts/callback`: OAuth redirect target (authenticated by `state`)
//!   - `DELETE /accounts/{email}` : revoke and forget an account
//!
//! - **Uploads**
//!   - `POST   /uploads`              : multipart batch, placed per file
//!   - `GET    /uploads/active`       : in-flight uploads
//!   - `GET    /uploads/history`      : durable transfer history
//!   - `GET    /uploads/{id}`         : one upload, live or historical
//!   - `GET    /uploads/{id}/progress`: SSE progress stream (keyed by the unguessable id)
//!
//! - **Files**
//!   - `GET    /files`                  : merged listing across accounts
//!   - `GET    /files/{email}/{file_id}`: download, `?inline=true` to preview

use crate::{
    handlers::{
        account_handlers::{connect_account, disconnect_account, list_accounts, oauth_callback},
        auth_handlers::{login, register},
        file_handlers::{download_file, list_files},
        health_handlers::{healthz, readyz},
        upload_handlers::{
            active_uploads, upload_files, upload_history, upload_progress, upload_status,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{delete, get, post},
};

/// Build and return the router for all DriveMerge routes.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // auth
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        // storage accounts
        .route("/accounts", get(list_accounts))
        .route("/accounts/connect", get(connect_account))
        .route("/accounts/callback", get(oauth_callback))
        .route("/accounts/{email}", delete(disconnect_account))
        // uploads
        .route("/uploads", post(upload_files))
        .route("/uploads/active", get(active_uploads))
        .route("/uploads/history", get(upload_history))
        .route("/uploads/{id}", get(upload_status))
        .route("/uploads/{id}/progress", get(upload_progress))
        // merged file view
        .route("/files", get(list_files))
        .route("/files/{email}/{file_id}", get(download_file))
}
