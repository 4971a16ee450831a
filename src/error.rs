//! Error types for the FCP plugin host.

use thiserror::Error;

/// Result type alias for FCP operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for FCP plugin host operations
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure on a plugin connection
    #[error("Connection error: {0}")]
    Connection(#[from] crate::plugin::connection::ConnectionError),

    /// Plugin spawn or handshake failure
    #[error("Plugin error: {0}")]
    Plugin(#[from] crate::plugin::PluginError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Programming-contract violation; not a recoverable runtime condition
    #[error("Contract violation: {0}")]
    Contract(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
