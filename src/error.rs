//! Error types for the Gatekeeper service.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
///
/// Throttling outcomes (rejections, lockouts) are never errors; they are
/// returned as decisions. Only contract violations at construction time and
/// failures of the surrounding service end up here.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Invalid limiter, lockout or service configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure while loading layered settings
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
