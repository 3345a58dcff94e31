//! UserService: registration and password login backed by SQLite.

use crate::models::user::User;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum UserError {
    #[error("email `{0}` is already registered")]
    EmailTaken(String),
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Hash(#[from] bcrypt::BcryptError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type UserResult<T> = Result<T, UserError>;

#[derive(Clone)]
pub struct UserService {
    db: Arc<SqlitePool>,
    bcrypt_cost: u32,
}

impl UserService {
    pub fn new(db: Arc<SqlitePool>, bcrypt_cost: u32) -> Self {
        Self { db, bcrypt_cost }
    }

    /// Create a user. Emails are compared case-insensitively.
    pub async fn register(&self, email: &str, password: &str) -> UserResult<User> {
        let email = normalize_email(email)?;
        if password.len() < MIN_PASSWORD_LEN {
            return Err(UserError::Validation(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let user = User {
            id: Uuid::new_v4(),
            email,
            password_hash: bcrypt::hash(password, self.bcrypt_cost)?,
            created_at: Utc::now(),
        };

        match sqlx::query(
            "INSERT INTO users (id, email, password_hash, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .execute(&*self.db)
        .await
        {
            Ok(_) => Ok(user),
            Err(err) if is_unique_violation(&err) => Err(UserError::EmailTaken(user.email)),
            Err(err) => Err(UserError::Sqlx(err)),
        }
    }

    /// Check a password login. Unknown emails and wrong passwords look the same.
    pub async fn login(&self, email: &str, password: &str) -> UserResult<User> {
        let email = normalize_email(email).map_err(|_| UserError::InvalidCredentials)?;
        let user = sqlx::query_as::<_, User>(
            "SELECT id, email, password_hash, created_at FROM users WHERE email = ?",
        )
        .bind(&email)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(UserError::InvalidCredentials)?;

        if bcrypt::verify(password, &user.password_hash)? {
            Ok(user)
        } else {
            Err(UserError::InvalidCredentials)
        }
    }
}

fn normalize_email(email: &str) -> UserResult<String> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(UserError::Validation("invalid email address".into())),
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
