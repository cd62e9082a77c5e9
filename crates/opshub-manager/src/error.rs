use opshub_adapters::AdapterError;
use opshub_context::BridgeError;
use opshub_core::{AdapterType, CoreError, Interruption};
use thiserror::Error;

/// Errors surfaced by the [`AdapterManager`](crate::AdapterManager).
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("Required adapter {adapter_type} failed to initialize: {source}")]
    Initialization {
        adapter_type: AdapterType,
        #[source]
        source: AdapterError,
    },

    #[error("Context recording failed: {0}")]
    Context(#[from] BridgeError),

    #[error("Configuration error: {0}")]
    Config(#[from] CoreError),

    #[error("Adapter manager is shut down")]
    ShutDown,

    #[error("Interrupted: {0}")]
    Interrupted(Interruption),
}

pub type ManagerResult<T> = std::result::Result<T, ManagerError>;

impl ManagerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ManagerError::Adapter(e) => e.is_retryable(),
            ManagerError::Initialization { source, .. } => source.is_retryable(),
            ManagerError::Context(e) => e.is_retryable(),
            ManagerError::Config(_) | ManagerError::ShutDown | ManagerError::Interrupted(_) => false,
        }
    }

    pub fn is_denial(&self) -> bool {
        matches!(self, ManagerError::Adapter(e) if e.is_denial())
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ManagerError::Adapter(e) => e.error_code(),
            ManagerError::Initialization { .. } => "INITIALIZATION_FAILED",
            ManagerError::Context(_) => "CONTEXT_RECORDING_FAILED",
            ManagerError::Config(_) => "CONFIGURATION_ERROR",
            ManagerError::ShutDown => "SHUT_DOWN",
            ManagerError::Interrupted(_) => "INTERRUPTED",
        }
    }

    /// The adapter error underneath, if any.
    pub fn adapter_error(&self) -> Option<&AdapterError> {
        match self {
            ManagerError::Adapter(e) | ManagerError::Initialization { source: e, .. } => Some(e),
            _ => None,
        }
    }
}
