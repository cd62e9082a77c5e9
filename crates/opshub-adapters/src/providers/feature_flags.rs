//! Feature flag provider.

use opshub_core::{AdapterSettings, AdapterType};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    optional_str, required_str, typed, unsupported_action, unsupported_query, ServiceProvider,
    TypedWebhook,
};
use crate::error::AdapterResult;
use crate::transport::{Method, ServiceRequest};

#[derive(Debug, Deserialize)]
struct FlagChangeEvent {
    #[serde(alias = "featureIdentifier", alias = "flag")]
    identifier: String,
    #[serde(default, alias = "environmentIdentifier")]
    environment: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FeatureFlagsProvider {
    account_id: String,
    default_environment: Option<String>,
}

impl FeatureFlagsProvider {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            default_environment: None,
        }
    }

    pub fn from_settings(settings: &AdapterSettings) -> Self {
        Self {
            account_id: settings.option("account_id").unwrap_or_default().to_string(),
            default_environment: settings.option("environment").map(str::to_string),
        }
    }

    fn environment<'a>(&'a self, params: &'a Value) -> AdapterResult<&'a str> {
        match optional_str(params, "environment") {
            Some(env) => Ok(env),
            None => match self.default_environment.as_deref() {
                Some(env) => Ok(env),
                None => required_str(params, "environment"),
            },
        }
    }

    fn scoped(&self, request: ServiceRequest) -> ServiceRequest {
        request.with_query("accountIdentifier", self.account_id.clone())
    }
}

impl ServiceProvider for FeatureFlagsProvider {
    fn adapter_type(&self) -> AdapterType {
        AdapterType::FeatureFlags
    }

    fn auth_header(&self, token: &str) -> (String, String) {
        ("x-api-key".to_string(), token.to_string())
    }

    fn probe(&self) -> ServiceRequest {
        self.scoped(ServiceRequest::get("cf/admin/features").with_query("pageSize", "1"))
    }

    fn route_action(&self, action: &str, params: &Value) -> AdapterResult<ServiceRequest> {
        let request = match action {
            "toggle_feature_flag" | "update_feature_flag" => {
                let enabled = params.get("enabled").and_then(Value::as_bool).unwrap_or(false);
                ServiceRequest::new(
                    Method::Patch,
                    format!("cf/admin/features/{}", required_str(params, "identifier")?),
                )
                .with_query("environmentIdentifier", self.environment(params)?)
                .with_body(json!({
                    "instructions": [{
                        "kind": "setFeatureFlagState",
                        "parameters": { "state": if enabled { "on" } else { "off" } }
                    }]
                }))
            }
            "create_feature_flag" => {
                let identifier = required_str(params, "identifier")?;
                ServiceRequest::post(
                    "cf/admin/features",
                    json!({
                        "identifier": identifier,
                        "name": optional_str(params, "name").unwrap_or(identifier),
                        "kind": "boolean",
                        "permanent": false,
                    }),
                )
            }
            "delete_feature_flag" => ServiceRequest::new(
                Method::Delete,
                format!("cf/admin/features/{}", required_str(params, "identifier")?),
            ),
            _ => return Err(unsupported_action(action)),
        };
        Ok(self.scoped(request))
    }

    fn route_query(&self, operation: &str, query: &Value) -> AdapterResult<ServiceRequest> {
        let request = match operation {
            "get_feature_flags" => ServiceRequest::get("cf/admin/features"),
            "get_feature_flag" => ServiceRequest::get(format!(
                "cf/admin/features/{}",
                required_str(query, "identifier")?
            )),
            "get_environments" => ServiceRequest::get("ng/api/environments"),
            _ => return Err(unsupported_query(operation)),
        };
        Ok(self.scoped(request))
    }

    fn parse_webhook(&self, label: &str, payload: &Value) -> Option<TypedWebhook> {
        match label {
            "flag_changed" | "feature_flag" => typed::<FlagChangeEvent>(payload).map(|e| {
                let mut hook =
                    TypedWebhook::new("flag_changed").with_metadata("flag", e.identifier);
                if let Some(env) = e.environment {
                    hook = hook.with_metadata("environment", env);
                }
                if let Some(state) = e.state {
                    hook = hook.with_metadata("state", state);
                }
                hook
            }),
            _ => None,
        }
    }
}
