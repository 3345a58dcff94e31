//! Upload submission, progress streaming and transfer history.

use crate::{
    auth::AuthUser,
    errors::AppError,
    models::{
        transfer::{STATUS_COMPLETED, STATUS_IN_PROGRESS, TransferRecord},
        upload::UploadSnapshot,
    },
    services::upload_tracker::NewUpload,
    state::AppState,
};
use axum::{
    Json,
    extract::{Multipart, Path, State, multipart::MultipartError},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, stream};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct AcceptedUpload {
    pub upload_id: Uuid,
    pub filename: String,
    pub account: String,
}

#[derive(Debug, Serialize)]
pub struct RejectedUpload {
    pub filename: String,
    pub reason: String,
}

#[derive(Debug, Serialize, Default)]
pub struct UploadBatchResponse {
    pub uploads: Vec<AcceptedUpload>,
    pub rejected: Vec<RejectedUpload>,
    /// Set when the request body broke off after some files had started;
    /// parts after the break were not read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incomplete: Option<String>,
    #[serde(skip)]
    failed_internally: bool,
}

impl UploadBatchResponse {
    fn reject(&mut self, filename: String, reason: &str) {
        self.rejected.push(RejectedUpload {
            filename,
            reason: reason.into(),
        });
    }

    /// A broken multipart body fails the request only if nothing has been
    /// started yet; otherwise the started uploads are still reported.
    fn body_broke_off(&mut self, err: MultipartError) -> Result<(), AppError> {
        if self.uploads.is_empty() {
            return Err(err.into());
        }
        warn!(error = %err, started = self.uploads.len(), "upload body ended early");
        self.incomplete = Some(err.body_text());
        Ok(())
    }

    fn status(&self) -> StatusCode {
        if !self.uploads.is_empty() {
            StatusCode::ACCEPTED
        } else if self.failed_internally {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::INSUFFICIENT_STORAGE
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UploadStatus {
    pub upload_id: Uuid,
    pub filename: String,
    pub account: String,
    pub status: String,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /uploads`: multipart body, one part per file.
///
/// Each file is placed independently: files that fit are reserved on an
/// account and start transferring immediately, files that fit nowhere or
/// could not be started are listed under `rejected`. Responds 202 if
/// anything started, 507 if every file was rejected for lack of space.
pub async fn upload_files(
    user: AuthUser,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadBatchResponse>), AppError> {
    let mut response = UploadBatchResponse::default();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                response.body_broke_off(err)?;
                break;
            }
        };
        let Some(filename) = field.file_name().map(str::to_string) else {
            debug!("skipping non-file multipart field {:?}", field.name());
            continue;
        };
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = match field.bytes().await {
            Ok(data) => data,
            Err(err) => {
                response.body_broke_off(err)?;
                break;
            }
        };
        let size_bytes = data.len() as u64;

        let account = match state.accounts.place_file(user.id, size_bytes).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                info!(user_id = %user.id, filename = %filename, bytes = size_bytes, "upload rejected, no capacity");
                response.reject(filename, "no connected account has enough free space");
                continue;
            }
            Err(err) => {
                error!(filename = %filename, error = %err, "placement failed");
                response.failed_internally = true;
                response.reject(filename, "could not reserve capacity");
                continue;
            }
        };

        let upload = NewUpload {
            filename: filename.clone(),
            content_type,
            data,
        };
        match state.tracker.begin_upload(user.id, upload, &account).await {
            Ok(upload_id) => response.uploads.push(AcceptedUpload {
                upload_id,
                filename,
                account: account.email,
            }),
            Err(err) => {
                error!(filename = %filename, error = %err, "could not start upload");
                response.failed_internally = true;
                response.reject(filename, "could not start the transfer");
            }
        }
    }

    if response.uploads.is_empty() && response.rejected.is_empty() {
        return Err(AppError::bad_request("no files in request"));
    }

    Ok((response.status(), Json(response)))
}

/// `GET /uploads/{id}/progress`: Server-Sent Events.
///
/// One `data:` message per progress update, the last one carrying either
/// `progress: 100` or an `error`. Ids with no in-flight upload get an empty
/// stream.
pub async fn upload_progress(
    State(state): State<AppState>,
    Path(upload_id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let receiver = state.tracker.subscribe(upload_id);
    if receiver.is_none() {
        debug!(upload_id = %upload_id, "progress subscription for unknown or finished upload");
    }

    let events = stream::unfold(receiver, |receiver| async move {
        let mut receiver = receiver?;
        loop {
            match receiver.recv().await {
                Ok(update) => {
                    let next = if update.is_terminal() { None } else { Some(receiver) };
                    return Some((Event::default().json_data(&update), next));
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "progress subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// `GET /uploads/{id}`: current state of one upload, live or historical.
pub async fn upload_status(
    user: AuthUser,
    State(state): State<AppState>,
    Path(upload_id): Path<Uuid>,
) -> Result<Json<UploadStatus>, AppError> {
    let record = state
        .transfers
        .get(upload_id)
        .await?
        .filter(|record| record.user_id == user.id)
        .ok_or_else(|| AppError::not_found(format!("upload `{}` not found", upload_id)))?;

    let live = state.tracker.snapshot(upload_id);
    Ok(Json(status_of(record, live)))
}

/// `GET /uploads/active`
pub async fn active_uploads(
    user: AuthUser,
    State(state): State<AppState>,
) -> Json<Vec<UploadSnapshot>> {
    Json(state.tracker.active_for_user(user.id))
}

/// `GET /uploads/history`
pub async fn upload_history(
    user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<TransferRecord>>, AppError> {
    Ok(Json(state.transfers.history(user.id).await?))
}

fn status_of(record: TransferRecord, live: Option<UploadSnapshot>) -> UploadStatus {
    let progress = match (&live, record.status.as_str()) {
        (Some(snapshot), _) => snapshot.progress,
        (None, STATUS_COMPLETED) => 100,
        _ => 0,
    };
    let status = if live.is_some() {
        STATUS_IN_PROGRESS.to_string()
    } else {
        record.status
    };

    UploadStatus {
        upload_id: record.id,
        filename: record.filename,
        account: record.account_email,
        status,
        progress,
        error: record.error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted(name: &str) -> AcceptedUpload {
        AcceptedUpload {
            upload_id: Uuid::new_v4(),
            filename: name.into(),
            account: "a@mock.drive".into(),
        }
    }

    #[test]
    fn any_started_upload_makes_the_batch_accepted() {
        let mut batch = UploadBatchResponse::default();
        batch.reject("big.bin".into(), "no room");
        batch.failed_internally = true;
        batch.uploads.push(accepted("small.bin"));
        assert_eq!(batch.status(), StatusCode::ACCEPTED);
    }

    #[test]
    fn all_rejected_for_space_is_insufficient_storage() {
        let mut batch = UploadBatchResponse::default();
        batch.reject("big.bin".into(), "no room");
        assert_eq!(batch.status(), StatusCode::INSUFFICIENT_STORAGE);
    }

    #[test]
    fn all_rejected_with_an_internal_failure_is_a_server_error() {
        let mut batch = UploadBatchResponse::default();
        batch.reject("big.bin".into(), "no room");
        batch.reject("a.bin".into(), "could not start the transfer");
        batch.failed_internally = true;
        assert_eq!(batch.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn internal_flag_is_not_serialized() {
        let mut batch = UploadBatchResponse::default();
        batch.failed_internally = true;
        let json = serde_json::to_value(&batch).unwrap();
        assert!(json.get("failed_internally").is_none());
        assert!(json.get("incomplete").is_none());
    }
}
