use std::io;
use thiserror::Error;

/// Central error type for the nocturne engine.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("listen port {0} out of range (1024-65535)")]
    InvalidPort(u16),

    #[error("password hash error: {0}")]
    PasswordHash(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
