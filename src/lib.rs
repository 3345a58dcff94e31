//! DriveMerge: pool several Google Drive accounts behind one upload API.
//!
//! Files are placed on whichever connected account has the most free space
//! (`services::selector`), transferred in the background
//! (`services::upload_tracker`), and followed through a per-upload
//! Server-Sent-Events stream.

pub mod auth;
pub mod config;
pub mod db;
pub mod drive;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

use axum::{Router, extract::DefaultBodyLimit};

pub use state::AppState;

/// Build the full router with state attached.
pub fn build_app(state: AppState, max_upload_bytes: usize) -> Router {
    routes::routes::routes()
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}
