//! HTTP handlers, grouped by resource.

pub mod account_handlers;
pub mod auth_handlers;
pub mod file_handlers;
pub mod health_handlers;
pub mod upload_handlers;
