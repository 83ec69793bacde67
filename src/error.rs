//! Error types for worker-rota.

use thiserror::Error;

/// Main error type for worker-rota.
#[derive(Error, Debug)]
pub enum RotaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid pool configuration: {0}")]
    Config(String),

    #[error("Failed to spawn worker after {attempts} attempt(s): {message}")]
    Spawn { attempts: u32, message: String },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Invalid worker id '{0}'")]
    InvalidWorkerId(String),
}

/// Result type alias for worker-rota operations.
pub type Result<T> = std::result::Result<T, RotaError>;
