//! `POST /auth/register` and `POST /auth/login`.

use crate::{errors::AppError, state::AppState};
use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub user_id: Uuid,
    pub email: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<Credentials>,
) -> Result<(StatusCode, Json<TokenResponse>), AppError> {
    let user = state.users.register(&req.email, &req.password).await?;
    tracing::info!(user_id = %user.id, "registered user");
    let token = state.jwt.issue_session(user.id)?;
    Ok((
        StatusCode::CREATED,
        Json(TokenResponse {
            token,
            user_id: user.id,
            email: user.email,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<Credentials>,
) -> Result<Json<TokenResponse>, AppError> {
    let user = state.users.login(&req.email, &req.password).await?;
    let token = state.jwt.issue_session(user.id)?;
    Ok(Json(TokenResponse {
        token,
        user_id: user.id,
        email: user.email,
    }))
}
