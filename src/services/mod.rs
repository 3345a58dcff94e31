//! Business logic behind the HTTP handlers.

pub mod account_service;
pub mod selector;
pub mod transfer_log;
pub mod upload_tracker;
pub mod user_service;
