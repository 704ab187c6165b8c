//! HTTP surface of the terminal bridge: upgrade endpoints, token checks and
//! server configuration.

pub mod auth;
pub mod config;
pub mod routes;
pub mod ws;

pub use auth::{StaticTokenValidator, TokenValidator};
pub use config::ServerConfig;
pub use routes::{cors_layer, router, AppState};
