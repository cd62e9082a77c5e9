use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::types::AdapterType;

/// Top-level hub configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HubConfig {
    /// Adapters constructed eagerly by the manager's `initialize`.
    #[serde(default)]
    pub required_adapters: Vec<AdapterType>,
    #[serde(default)]
    pub adapters: HashMap<AdapterType, AdapterSettings>,
    #[serde(default)]
    pub context: BridgeSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HubConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_env("OPSHUB")
    }

    /// Load configuration from environment with custom prefix
    ///
    /// Nested keys are separated by `__`, e.g.
    /// `OPSHUB__ADAPTERS__CI_PIPELINE__BASE_URL`.
    pub fn load_from_env(prefix: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(
                Environment::with_prefix(prefix)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("required_adapters")
                    .try_parsing(true),
            )
            .set_default("context.webhook_max_tokens", default_webhook_max_tokens() as i64)?
            .set_default("context.record_timeout_ms", default_record_timeout_ms() as i64)?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.json", false)?;

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load configuration from file with environment overrides
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("OPSHUB")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn with_adapter(mut self, adapter_type: AdapterType, settings: AdapterSettings) -> Self {
        self.adapters.insert(adapter_type, settings);
        self
    }

    pub fn with_required(mut self, adapter_type: AdapterType) -> Self {
        if !self.required_adapters.contains(&adapter_type) {
            self.required_adapters.push(adapter_type);
        }
        self
    }

    pub fn with_context(mut self, context: BridgeSettings) -> Self {
        self.context = context;
        self
    }

    pub fn adapter(&self, adapter_type: AdapterType) -> Option<&AdapterSettings> {
        self.adapters.get(&adapter_type)
    }

    /// Check that every required adapter has settings.
    pub fn validate(&self) -> CoreResult<()> {
        for required in &self.required_adapters {
            if !self.adapters.contains_key(required) {
                return Err(CoreError::InvalidConfig(format!(
                    "required adapter {} has no settings",
                    required
                )));
            }
        }
        Ok(())
    }
}

/// Settings for one adapter type.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdapterSettings {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub safety: SafetySettings,
    /// Provider-specific knobs such as account or project identifiers.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl AdapterSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: None,
            webhook_secret: None,
            request_timeout_ms: default_request_timeout_ms(),
            retry: RetrySettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            rate_limit: RateLimitSettings::default(),
            safety: SafetySettings::default(),
            options: HashMap::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerSettings) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitSettings) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_safety(mut self, safety: SafetySettings) -> Self {
        self.safety = safety;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Retry with exponential backoff (multiplier 2).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl RetrySettings {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms: default_max_delay_ms(),
        }
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    #[serde(default = "default_half_open_success_threshold")]
    pub half_open_success_threshold: u32,
    /// Failures older than this no longer count toward the threshold.
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,
}

impl CircuitBreakerSettings {
    pub fn new(failure_threshold: u32, open_timeout_ms: u64) -> Self {
        Self {
            failure_threshold,
            open_timeout_ms,
            ..Default::default()
        }
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
            half_open_success_threshold: default_half_open_success_threshold(),
            failure_window_ms: default_failure_window_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_success_threshold() -> u32 {
    1
}

fn default_failure_window_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Longest a caller will wait for a token before giving up.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl RateLimitSettings {
    pub fn new(requests_per_second: u32, burst: u32) -> Self {
        Self {
            requests_per_second,
            burst,
            max_wait_ms: default_max_wait_ms(),
        }
    }

    pub fn with_max_wait_ms(mut self, max_wait_ms: u64) -> Self {
        self.max_wait_ms = max_wait_ms;
        self
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

fn default_requests_per_second() -> u32 {
    10
}

fn default_burst() -> u32 {
    20
}

fn default_max_wait_ms() -> u64 {
    5_000
}

/// Extra deny rules merged onto the built-in safety rule for an adapter.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SafetySettings {
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub deny_prefixes: Vec<String>,
}

/// Settings for recording into the conversational context.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeSettings {
    #[serde(default = "default_bridge_retry")]
    pub retry: RetrySettings,
    /// Budget of contexts created on behalf of webhook deliveries.
    #[serde(default = "default_webhook_max_tokens")]
    pub webhook_max_tokens: usize,
    /// Deadline for the manager's detached recording task.
    #[serde(default = "default_record_timeout_ms")]
    pub record_timeout_ms: u64,
}

impl BridgeSettings {
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn record_timeout(&self) -> Duration {
        Duration::from_millis(self.record_timeout_ms)
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            retry: default_bridge_retry(),
            webhook_max_tokens: default_webhook_max_tokens(),
            record_timeout_ms: default_record_timeout_ms(),
        }
    }
}

fn default_bridge_retry() -> RetrySettings {
    RetrySettings::new(3, 100).with_max_delay_ms(2_000)
}

fn default_webhook_max_tokens() -> usize {
    100_000
}

fn default_record_timeout_ms() -> u64 {
    10_000
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_settings_defaults() {
        let settings = AdapterSettings::new("https://ci.example.com");

        assert_eq!(settings.request_timeout(), Duration::from_secs(30));
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.base_delay(), Duration::from_secs(1));
        assert_eq!(settings.circuit_breaker.failure_threshold, 5);
        assert_eq!(settings.circuit_breaker.half_open_success_threshold, 1);
        assert_eq!(settings.rate_limit.requests_per_second, 10);
    }

    #[test]
    fn test_adapter_settings_builder() {
        let settings = AdapterSettings::new("https://github.example.com")
            .with_token("ghp_test")
            .with_webhook_secret("s3cret")
            .with_retry(RetrySettings::new(5, 10))
            .with_option("owner", "acme");

        assert_eq!(settings.api_token.as_deref(), Some("ghp_test"));
        assert_eq!(settings.webhook_secret.as_deref(), Some("s3cret"));
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.option("owner"), Some("acme"));
    }

    #[test]
    fn test_deserialize_from_json() {
        let json = serde_json::json!({
            "required_adapters": ["ci-pipeline"],
            "adapters": {
                "ci-pipeline": {
                    "base_url": "https://ci.example.com",
                    "api_token": "tok",
                    "retry": { "max_attempts": 4 }
                }
            }
        });

        let config: HubConfig = serde_json::from_value(json).unwrap();
        let ci = config.adapter(AdapterType::CiPipeline).unwrap();

        assert_eq!(ci.retry.max_attempts, 4);
        assert_eq!(ci.retry.base_delay_ms, 1_000);
        assert_eq!(config.context.webhook_max_tokens, 100_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_missing_required() {
        let config = HubConfig::default().with_required(AdapterType::GitHub);
        assert!(matches!(config.validate(), Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_unknown_adapter_key_rejected() {
        let json = serde_json::json!({ "adapters": { "jenkins": { "base_url": "x" } } });
        assert!(serde_json::from_value::<HubConfig>(json).is_err());
    }
}
