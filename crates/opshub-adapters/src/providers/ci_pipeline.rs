//! CI/CD pipeline provider.
//!
//! Covers pipeline execution plus the cloud-cost endpoints the pipeline
//! platform exposes. Every call is scoped by account, and optionally by
//! organization and project, taken from the call parameters first and the
//! adapter options second.

use opshub_core::{AdapterSettings, AdapterType};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    optional_str, required_str, typed, unsupported_action, unsupported_query, ServiceProvider,
    TypedWebhook,
};
use crate::error::{AdapterError, AdapterResult};
use crate::transport::{Method, ServiceRequest};

#[derive(Debug, Deserialize)]
struct PipelineEvent {
    #[serde(alias = "pipelineIdentifier")]
    pipeline_identifier: String,
    status: String,
    #[serde(default, alias = "executionId")]
    execution_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeploymentEvent {
    service: String,
    environment: String,
    status: String,
}

#[derive(Debug, Clone, Default)]
pub struct CiPipelineProvider {
    account_id: String,
    org_id: Option<String>,
    project_id: Option<String>,
}

impl CiPipelineProvider {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            ..Default::default()
        }
    }

    pub fn from_settings(settings: &AdapterSettings) -> Self {
        Self {
            account_id: settings.option("account_id").unwrap_or_default().to_string(),
            org_id: settings.option("org_id").map(str::to_string),
            project_id: settings.option("project_id").map(str::to_string),
        }
    }

    pub fn with_scope(mut self, org_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self.project_id = Some(project_id.into());
        self
    }

    fn scoped(&self, mut request: ServiceRequest, params: &Value) -> ServiceRequest {
        request = request.with_query("accountIdentifier", self.account_id.clone());
        if let Some(org) = optional_str(params, "org_id").or(self.org_id.as_deref()) {
            request = request.with_query("orgIdentifier", org);
        }
        if let Some(project) = optional_str(params, "project_id").or(self.project_id.as_deref()) {
            request = request.with_query("projectIdentifier", project);
        }
        request
    }

    fn require_project(&self, params: &Value, action: &str) -> AdapterResult<()> {
        if optional_str(params, "project_id").is_none() && self.project_id.is_none() {
            return Err(AdapterError::InvalidRequest(format!(
                "project_id is required for {}",
                action
            )));
        }
        Ok(())
    }
}

impl ServiceProvider for CiPipelineProvider {
    fn adapter_type(&self) -> AdapterType {
        AdapterType::CiPipeline
    }

    fn auth_header(&self, token: &str) -> (String, String) {
        ("x-api-key".to_string(), token.to_string())
    }

    fn probe(&self) -> ServiceRequest {
        ServiceRequest::get("ping").with_query("accountIdentifier", self.account_id.clone())
    }

    fn validate_settings(&self, settings: &AdapterSettings) -> AdapterResult<()> {
        if settings.base_url.trim().is_empty() {
            return Err(AdapterError::Configuration("ci-pipeline: base_url is required".to_string()));
        }
        if settings.api_token.as_deref().unwrap_or_default().is_empty() {
            return Err(AdapterError::Configuration("ci-pipeline: api_token is required".to_string()));
        }
        if self.account_id.is_empty() {
            return Err(AdapterError::Configuration(
                "ci-pipeline: options.account_id is required".to_string(),
            ));
        }
        Ok(())
    }

    fn route_action(&self, action: &str, params: &Value) -> AdapterResult<ServiceRequest> {
        let request = match action {
            "trigger_pipeline" => {
                self.require_project(params, action)?;
                ServiceRequest::post(
                    format!("pipeline/api/pipeline/execute/{}", required_str(params, "pipeline_id")?),
                    json!({ "inputs": params.get("inputs").cloned().unwrap_or_else(|| json!({})) }),
                )
            }
            "stop_pipeline" => ServiceRequest::new(
                Method::Put,
                format!(
                    "pipeline/api/pipeline/execute/interrupt/{}",
                    required_str(params, "execution_id")?
                ),
            )
            .with_query("interruptType", "AbortAll"),
            "rollback_deployment" => {
                self.require_project(params, action)?;
                ServiceRequest::post(
                    "pipeline/api/pipeline/execute/rollback",
                    json!({
                        "service": required_str(params, "service_id")?,
                        "environment": required_str(params, "environment_id")?,
                    }),
                )
            }
            "toggle_feature_flag" => ServiceRequest::new(
                Method::Patch,
                format!("cf/admin/features/{}", required_str(params, "flag_id")?),
            )
            .with_query("environmentIdentifier", required_str(params, "environment")?)
            .with_body(json!({
                "instructions": [{
                    "kind": "setFeatureFlagState",
                    "parameters": {
                        "state": if params.get("enabled").and_then(Value::as_bool).unwrap_or(false) { "on" } else { "off" }
                    }
                }]
            })),
            "apply_ccm_recommendation" => {
                self.require_project(params, action)?;
                ServiceRequest::new(
                    Method::Post,
                    format!("ccm/api/recommendations/{}/apply", required_str(params, "recommendation_id")?),
                )
            }
            "ignore_ccm_recommendation" => ServiceRequest::new(
                Method::Post,
                format!("ccm/api/recommendations/{}/ignore", required_str(params, "recommendation_id")?),
            ),
            "acknowledge_ccm_anomaly" => ServiceRequest::new(
                Method::Post,
                format!("ccm/api/anomaly/{}/acknowledge", required_str(params, "anomaly_id")?),
            ),
            "ignore_ccm_anomaly" => ServiceRequest::new(
                Method::Post,
                format!("ccm/api/anomaly/{}/ignore", required_str(params, "anomaly_id")?),
            ),
            _ => return Err(unsupported_action(action)),
        };
        Ok(self.scoped(request, params))
    }

    fn route_query(&self, operation: &str, query: &Value) -> AdapterResult<ServiceRequest> {
        let request = match operation {
            "get_pipelines" => ServiceRequest::get("pipeline/api/pipelines/list"),
            "get_pipeline_status" => ServiceRequest::get(format!(
                "pipeline/api/pipelines/execution/{}",
                required_str(query, "execution_id")?
            )),
            "get_feature_flags" => ServiceRequest::get("cf/admin/features"),
            "get_ccm_costs" => ServiceRequest::get("ccm/api/costdetails/overview")
                .with_query("period", optional_str(query, "period").unwrap_or("LAST_30_DAYS")),
            "get_ccm_recommendations" => ServiceRequest::get("ccm/api/recommendation/overview/list"),
            "get_ccm_budgets" => ServiceRequest::get("ccm/api/budgets"),
            "get_ccm_anomalies" => ServiceRequest::get("ccm/api/anomaly"),
            _ => return Err(unsupported_query(operation)),
        };
        Ok(self.scoped(request, query))
    }

    fn parse_webhook(&self, label: &str, payload: &Value) -> Option<TypedWebhook> {
        match label {
            "pipeline_start" | "pipeline_end" | "pipeline_success" | "pipeline_failed" => {
                typed::<PipelineEvent>(payload).map(|e| {
                    let mut hook = TypedWebhook::new(label)
                        .with_metadata("pipeline", e.pipeline_identifier)
                        .with_metadata("status", e.status);
                    if let Some(execution) = e.execution_id {
                        hook = hook.with_metadata("execution_id", execution);
                    }
                    hook
                })
            }
            "deployment" => typed::<DeploymentEvent>(payload).map(|e| {
                TypedWebhook::new("deployment")
                    .with_metadata("service", e.service)
                    .with_metadata("environment", e.environment)
                    .with_metadata("status", e.status)
            }),
            _ => None,
        }
    }
}
