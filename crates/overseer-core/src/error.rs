//! Overseer error types.

use thiserror::Error;

/// Errors raised by configuration loading and local persistence.
#[derive(Debug, Error)]
pub enum OverseerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, OverseerError>;
