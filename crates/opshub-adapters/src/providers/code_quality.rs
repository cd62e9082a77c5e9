//! Code quality provider (SonarQube-style web API).

use opshub_core::{AdapterSettings, AdapterType};
use serde::Deserialize;
use serde_json::Value;

use super::{
    optional_str, required_str, typed, unsupported_action, unsupported_query, ServiceProvider,
    TypedWebhook,
};
use crate::error::AdapterResult;
use crate::transport::{Method, ServiceRequest};

const DEFAULT_METRICS: &str = "bugs,vulnerabilities,code_smells,coverage,duplicated_lines_density";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisEvent {
    task_id: String,
    status: String,
    project: ProjectRef,
    #[serde(default)]
    quality_gate: Option<QualityGate>,
}

#[derive(Debug, Deserialize)]
struct ProjectRef {
    key: String,
}

#[derive(Debug, Deserialize)]
struct QualityGate {
    status: String,
}

#[derive(Debug, Clone, Default)]
pub struct CodeQualityProvider {
    organization: Option<String>,
}

impl CodeQualityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &AdapterSettings) -> Self {
        Self {
            organization: settings.option("organization").map(str::to_string),
        }
    }

    fn with_org(&self, request: ServiceRequest) -> ServiceRequest {
        match &self.organization {
            Some(org) => request.with_query("organization", org.clone()),
            None => request,
        }
    }
}

impl ServiceProvider for CodeQualityProvider {
    fn adapter_type(&self) -> AdapterType {
        AdapterType::CodeQuality
    }

    fn probe(&self) -> ServiceRequest {
        ServiceRequest::get("api/system/status")
    }

    fn route_action(&self, action: &str, params: &Value) -> AdapterResult<ServiceRequest> {
        let project = required_str(params, "project_key")?;
        let request = match action {
            "create_project" => ServiceRequest::new(Method::Post, "api/projects/create")
                .with_query("project", project)
                .with_query("name", optional_str(params, "name").unwrap_or(project)),
            "delete_project" => {
                ServiceRequest::new(Method::Post, "api/projects/delete").with_query("project", project)
            }
            "set_project_tags" => ServiceRequest::new(Method::Post, "api/project_tags/set")
                .with_query("project", project)
                .with_query("tags", required_str(params, "tags")?),
            "select_quality_gate" => ServiceRequest::new(Method::Post, "api/qualitygates/select")
                .with_query("projectKey", project)
                .with_query("gateName", required_str(params, "gate_name")?),
            _ => return Err(unsupported_action(action)),
        };
        Ok(self.with_org(request))
    }

    fn route_query(&self, operation: &str, query: &Value) -> AdapterResult<ServiceRequest> {
        let request = match operation {
            "get_projects" => ServiceRequest::get("api/projects/search"),
            "get_quality_gate_status" => ServiceRequest::get("api/qualitygates/project_status")
                .with_query("projectKey", required_str(query, "project_key")?),
            "get_issues" => ServiceRequest::get("api/issues/search")
                .with_query("componentKeys", required_str(query, "project_key")?)
                .with_query("resolved", "false"),
            "get_metrics" => ServiceRequest::get("api/measures/component")
                .with_query("component", required_str(query, "project_key")?)
                .with_query(
                    "metricKeys",
                    optional_str(query, "metrics").unwrap_or(DEFAULT_METRICS),
                ),
            "get_analysis_task" => {
                ServiceRequest::get("api/ce/task").with_query("id", required_str(query, "task_id")?)
            }
            _ => return Err(unsupported_query(operation)),
        };
        Ok(self.with_org(request))
    }

    fn parse_webhook(&self, label: &str, payload: &Value) -> Option<TypedWebhook> {
        match label {
            "analysis_completed" | "quality_gate" => typed::<AnalysisEvent>(payload).map(|e| {
                let mut hook = TypedWebhook::new(label)
                    .with_metadata("project", e.project.key)
                    .with_metadata("task_id", e.task_id)
                    .with_metadata("status", e.status);
                if let Some(gate) = e.quality_gate {
                    hook = hook.with_metadata("quality_gate", gate.status);
                }
                hook
            }),
            _ => None,
        }
    }
}
