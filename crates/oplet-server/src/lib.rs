//! Coordinator: accepts submissions, persists the execution queue and
//! serves the runner protocol.

pub mod auth;
pub mod config;
pub mod environment;
pub mod error;
pub mod handlers;
pub mod janitor;
pub mod state;

pub use config::ServerConfig;
pub use error::ApiError;
pub use handlers::router;
pub use state::AppState;
