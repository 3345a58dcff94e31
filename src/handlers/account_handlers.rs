//! Connecting, listing and disconnecting remote drive accounts.
//!
//! Connecting is a two-step OAuth dance: `GET /accounts/connect` hands the
//! client a consent URL whose `state` is a short-lived signed token naming
//! the user, and the provider later redirects to `GET /accounts/callback`
//! with that state and an authorization code.

use crate::{
    auth::{AuthUser, TokenPurpose},
    errors::AppError,
    models::account::{AccountSummary, bytes_to_gb},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Capacity recorded for plans without a quota limit.
const UNLIMITED_QUOTA_GB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// `GET /accounts`
pub async fn list_accounts(
    user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<AccountSummary>>, AppError> {
    let accounts = state.accounts.list(user.id).await?;
    Ok(Json(accounts.into_iter().map(AccountSummary::from).collect()))
}

/// `GET /accounts/connect`
pub async fn connect_account(
    user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<ConnectResponse>, AppError> {
    let oauth_state = state.jwt.issue_oauth_state(user.id)?;
    Ok(Json(ConnectResponse {
        url: state.drive.authorize_url(&oauth_state),
    }))
}

/// `GET /accounts/callback?code=..&state=..`
pub async fn oauth_callback(
    State(state): State<AppState>,
    Query(q): Query<CallbackQuery>,
) -> Result<(StatusCode, Json<AccountSummary>), AppError> {
    if let Some(error) = q.error {
        return Err(AppError::bad_request(format!("authorization declined: {}", error)));
    }
    let code = q
        .code
        .ok_or_else(|| AppError::bad_request("missing authorization code"))?;
    let oauth_state = q
        .state
        .ok_or_else(|| AppError::bad_request("missing state"))?;
    let user_id = state.jwt.verify(&oauth_state, TokenPurpose::OAuthState)?;

    let connected = state.drive.exchange_code(&code).await?;
    let quota = state.drive.storage_quota(&connected.access_token).await?;
    let total_space = quota
        .total_bytes
        .map(bytes_to_gb)
        .unwrap_or(UNLIMITED_QUOTA_GB);

    let account = state
        .accounts
        .upsert(
            user_id,
            &connected.email,
            &connected.refresh_token,
            bytes_to_gb(quota.used_bytes),
            total_space,
        )
        .await?;
    info!(user_id = %user_id, account = %account.email, "connected storage account");

    Ok((StatusCode::CREATED, Json(AccountSummary::from(account))))
}

/// `DELETE /accounts/{email}`
///
/// Revoking the remote credential is best effort; the account is removed
/// locally either way.
pub async fn disconnect_account(
    user: AuthUser,
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<StatusCode, AppError> {
    let account = state.accounts.delete(user.id, &email).await?;
    if let Err(err) = state.drive.revoke(&account.refresh_token).await {
        warn!(account = %account.email, error = %err, "could not revoke remote credential");
    }
    info!(user_id = %user.id, account = %account.email, "disconnected storage account");
    Ok(StatusCode::NO_CONTENT)
}
