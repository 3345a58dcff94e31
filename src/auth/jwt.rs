//! Signed tokens for API sessions and for the OAuth `state` round-trip.

use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("token was issued for {0:?}")]
    WrongPurpose(TokenPurpose),
    #[error("token subject is not a user id")]
    BadSubject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenPurpose {
    /// Bearer token for API calls.
    Session,
    /// `state` parameter carried through the remote consent screen.
    OAuthState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub purpose: TokenPurpose,
}

#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    session_duration: Duration,
    state_duration: Duration,
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            session_duration: Duration::hours(12),
            state_duration: Duration::minutes(10),
        }
    }

    pub fn issue_session(&self, user_id: Uuid) -> Result<String, TokenError> {
        self.issue(user_id, TokenPurpose::Session, self.session_duration)
    }

    pub fn issue_oauth_state(&self, user_id: Uuid) -> Result<String, TokenError> {
        self.issue(user_id, TokenPurpose::OAuthState, self.state_duration)
    }

    /// Verify `token` and return the user id it was issued to.
    pub fn verify(&self, token: &str, purpose: TokenPurpose) -> Result<Uuid, TokenError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &Validation::default())?.claims;
        if claims.purpose != purpose {
            return Err(TokenError::WrongPurpose(claims.purpose));
        }
        Uuid::parse_str(&claims.sub).map_err(|_| TokenError::BadSubject)
    }

    fn issue(
        &self,
        user_id: Uuid,
        purpose: TokenPurpose,
        lifetime: Duration,
    ) -> Result<String, TokenError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (now + lifetime).timestamp(),
            iat: now.timestamp(),
            purpose,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding_key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_token_round_trips_user_id() {
        let jwt = JwtService::new("test-secret");
        let user_id = Uuid::new_v4();
        let token = jwt.issue_session(user_id).unwrap();
        assert_eq!(jwt.verify(&token, TokenPurpose::Session).unwrap(), user_id);
    }

    #[test]
    fn state_token_is_not_a_session() {
        let jwt = JwtService::new("test-secret");
        let token = jwt.issue_oauth_state(Uuid::new_v4()).unwrap();
        let err = jwt.verify(&token, TokenPurpose::Session).unwrap_err();
        assert!(matches!(err, TokenError::WrongPurpose(TokenPurpose::OAuthState)));
    }

    #[test]
    fn other_secrets_are_rejected() {
        let token = JwtService::new("one").issue_session(Uuid::new_v4()).unwrap();
        assert!(JwtService::new("two")
            .verify(&token, TokenPurpose::Session)
            .is_err());
    }
}
