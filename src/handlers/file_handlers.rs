//! Browsing the merged file set and streaming files back out.

use crate::{
    auth::AuthUser,
    drive::{DriveResult, RemoteFile},
    errors::AppError,
    models::account::StorageAccount,
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Serialize)]
pub struct MergedFile {
    pub account: String,
    #[serde(flatten)]
    pub file: RemoteFile,
}

#[derive(Debug, Serialize)]
pub struct AccountListingError {
    pub account: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct FileListing {
    pub files: Vec<MergedFile>,
    /// Accounts that could not be listed; their files are missing above.
    pub errors: Vec<AccountListingError>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    /// Serve with `Content-Disposition: inline` so browsers preview it.
    #[serde(default)]
    pub inline: bool,
}

/// `GET /files`: files from every connected account, listed concurrently.
pub async fn list_files(
    user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<FileListing>, AppError> {
    let accounts = state.accounts.list(user.id).await?;
    let results = join_all(accounts.iter().map(|account| list_account(&state, account))).await;

    let mut listing = FileListing {
        files: Vec::new(),
        errors: Vec::new(),
    };
    for (account, result) in accounts.iter().zip(results) {
        match result {
            Ok(files) => listing.files.extend(files.into_iter().map(|file| MergedFile {
                account: account.email.clone(),
                file,
            })),
            Err(err) => {
                warn!(account = %account.email, error = %err, "listing remote files failed");
                listing.errors.push(AccountListingError {
                    account: account.email.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
    listing.files.sort_by(|a, b| a.file.name.cmp(&b.file.name));

    Ok(Json(listing))
}

async fn list_account(state: &AppState, account: &StorageAccount) -> DriveResult<Vec<RemoteFile>> {
    let access_token = state.drive.access_token(&account.refresh_token).await?;
    state.drive.list_files(&access_token).await
}

/// `GET /files/{email}/{file_id}`: stream a file, `?inline=true` to preview.
pub async fn download_file(
    user: AuthUser,
    State(state): State<AppState>,
    Path((email, file_id)): Path<(String, String)>,
    Query(q): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    let account = state.accounts.get(user.id, &email).await?;
    let access_token = state.drive.access_token(&account.refresh_token).await?;
    let download = state.drive.download(&access_token, &file_id).await?;

    let mut response = Response::new(Body::from_stream(download.body));
    *response.status_mut() = StatusCode::OK;
    set_download_headers(
        response.headers_mut(),
        &download.name,
        &download.content_type,
        download.size,
        q.inline,
    );
    Ok(response)
}

fn set_download_headers(
    headers: &mut HeaderMap,
    name: &str,
    content_type: &str,
    size: Option<u64>,
    inline: bool,
) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    if let Some(size) = size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }

    let disposition = if inline { "inline" } else { "attachment" };
    let safe_name: String = name
        .chars()
        .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    let value = format!("{}; filename=\"{}\"", disposition, safe_name);
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
}
