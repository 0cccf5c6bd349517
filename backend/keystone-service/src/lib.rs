/// Keystone Service Library
///
/// Identity and key-management platform: OAuth 2.1 authorization server,
/// OpenID Connect provider, and barrier-based KMS in a single process.
///
/// ## Modules
///
/// - `config`: Service configuration (YAML + environment + CLI overrides)
/// - `clock`: Nanosecond UTC timestamps shared by storage and services
/// - `db`: Database repositories (dual PostgreSQL/SQLite)
/// - `models`: Data models
/// - `barrier`: Unseal, key hierarchy, envelope encryption
/// - `error`: Error taxonomy and HTTP/OAuth mapping
/// - `http`: Public and admin listeners, middleware
/// - `security`: Password hashing, PKCE, client authentication
/// - `services`: Business logic (authorize, token, session, KMS, jobs)
/// - `telemetry`: Telemetry sink interface
pub mod barrier;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod models;
pub mod security;
pub mod services;
pub mod state;
pub mod telemetry;

// Re-export commonly used types
pub use error::{Result, ServiceError};
pub use state::AppState;
