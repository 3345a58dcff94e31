//! Authentication: JWT issuance/verification and the `AuthUser` extractor.

pub mod jwt;

use crate::{errors::AppError, state::AppState};
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use uuid::Uuid;

pub use jwt::{JwtService, TokenError, TokenPurpose};

/// The caller of an authenticated endpoint, taken from `Authorization: Bearer`.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub id: Uuid,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| AppError::unauthorized("authentication required"))?;

        let id = state
            .jwt
            .verify(token, TokenPurpose::Session)
            .map_err(|err| AppError::unauthorized(err.to_string()))?;
        Ok(AuthUser { id })
    }
}
