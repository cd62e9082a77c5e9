use opshub_core::{AdapterType, CoreError, Interruption};
use opshub_resilience::{ResilienceError, Retryable};
use thiserror::Error;

/// Errors returned by adapters and the adapter registry.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { status: Option<u16>, message: String },

    #[error("Rate limited by service: {0}")]
    RateLimited(String),

    #[error("Request rejected with status {status}: {message}")]
    RequestRejected { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("restricted operation: {0}")]
    RestrictedOperation(String),

    #[error("{0}")]
    ProductionGuard(String),

    #[error("Circuit breaker open for {0}")]
    CircuitOpen(AdapterType),

    #[error("Local rate limit exceeded for {0}")]
    Throttled(AdapterType),

    #[error("Operation cancelled: {0}")]
    Cancelled(Interruption),

    #[error("Webhook rejected: {0}")]
    WebhookRejected(String),

    #[error("Adapter closed: {0}")]
    Closed(AdapterType),
}

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

impl AdapterError {
    /// Transient transport failures that are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::ConnectionFailed(_)
                | AdapterError::Timeout(_)
                | AdapterError::ServiceUnavailable { .. }
                | AdapterError::RateLimited(_)
        )
    }

    /// A safety-policy refusal, as opposed to a service failure.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            AdapterError::RestrictedOperation(_) | AdapterError::ProductionGuard(_)
        )
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AdapterError::Configuration(_) => "CONFIGURATION_ERROR",
            AdapterError::ConnectionFailed(_) => "CONNECTION_FAILED",
            AdapterError::Timeout(_) => "TIMEOUT",
            AdapterError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            AdapterError::RateLimited(_) => "RATE_LIMITED",
            AdapterError::RequestRejected { .. } => "REQUEST_REJECTED",
            AdapterError::NotFound(_) => "NOT_FOUND",
            AdapterError::PermissionDenied(_) => "PERMISSION_DENIED",
            AdapterError::InvalidRequest(_) => "INVALID_REQUEST",
            AdapterError::UnsupportedOperation(_) => "UNSUPPORTED_OPERATION",
            AdapterError::RestrictedOperation(_) => "RESTRICTED_OPERATION",
            AdapterError::ProductionGuard(_) => "PRODUCTION_GUARD",
            AdapterError::CircuitOpen(_) => "CIRCUIT_OPEN",
            AdapterError::Throttled(_) => "THROTTLED",
            AdapterError::Cancelled(_) => "CANCELLED",
            AdapterError::WebhookRejected(_) => "WEBHOOK_REJECTED",
            AdapterError::Closed(_) => "ADAPTER_CLOSED",
        }
    }

    /// Flatten a resilience outcome for the given adapter. Exhausted retries
    /// surface as service unavailable.
    pub fn from_resilience(adapter_type: AdapterType, err: ResilienceError<AdapterError>) -> Self {
        match err {
            ResilienceError::CircuitOpen => AdapterError::CircuitOpen(adapter_type),
            ResilienceError::RateLimited => AdapterError::Throttled(adapter_type),
            ResilienceError::Interrupted(reason) => AdapterError::Cancelled(reason),
            ResilienceError::Failed(e) => e,
            ResilienceError::Exhausted { attempts, last } => {
                let status = match &last {
                    AdapterError::ServiceUnavailable { status, .. } => *status,
                    _ => None,
                };
                AdapterError::ServiceUnavailable {
                    status,
                    message: format!(
                        "{} failed after {} attempts: {}",
                        adapter_type, attempts, last
                    ),
                }
            }
        }
    }
}

impl Retryable for AdapterError {
    fn is_retryable(&self) -> bool {
        AdapterError::is_retryable(self)
    }
}

impl From<Interruption> for AdapterError {
    fn from(reason: Interruption) -> Self {
        AdapterError::Cancelled(reason)
    }
}

impl From<CoreError> for AdapterError {
    fn from(err: CoreError) -> Self {
        AdapterError::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        AdapterError::InvalidRequest(err.to_string())
    }
}
