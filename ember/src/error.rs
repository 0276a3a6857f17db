// src/error.rs
use std::io;

/// Central error type for the ember engine.
#[derive(Debug)]
pub enum EmberError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Invalid configuration caught at startup.
    Config(String),
    /// The user store rejected or failed an operation.
    Store(String),
    /// The logging backend could not be installed.
    Logger(String),
}

impl std::fmt::Display for EmberError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmberError::Io(e) => write!(f, "I/O error: {}", e),
            EmberError::Config(msg) => write!(f, "Configuration error: {}", msg),
            EmberError::Store(msg) => write!(f, "Store error: {}", msg),
            EmberError::Logger(msg) => write!(f, "Logger error: {}", msg),
        }
    }
}

impl std::error::Error for EmberError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EmberError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EmberError {
    fn from(e: io::Error) -> Self {
        EmberError::Io(e)
    }
}

pub type EmberResult<T> = Result<T, EmberError>;
