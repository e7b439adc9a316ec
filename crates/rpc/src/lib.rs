//! HTTP API for the vanity name registry.

pub mod auth;
pub mod server;

pub use auth::AuthError;
pub use server::{build_router, start_server, start_server_with_shutdown, ApiError, AppState};
