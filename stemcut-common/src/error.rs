//! Common error types for stemcut

use thiserror::Error;

/// Common result type for stemcut operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while resolving settings and preparing the folder layout
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// A setting was present but could not be parsed or is out of range
    #[error("Invalid value for {key}: {value:?}")]
    InvalidSetting { key: String, value: String },
}
