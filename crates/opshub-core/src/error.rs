use thiserror::Error;

/// Errors raised while building core values from external input.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Unknown adapter type: {0}")]
    UnknownAdapterType(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
