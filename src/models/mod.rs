//! Core data models for the DriveMerge service.
//!
//! Persistent entities derive `sqlx::FromRow` and map onto the tables in
//! `migrations/0001_init.sql`; transient upload state lives in `upload`.

pub mod account;
pub mod transfer;
pub mod upload;
pub mod user;
