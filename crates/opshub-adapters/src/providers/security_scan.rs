//! Security scanner provider (Xray-style API).

use opshub_core::{AdapterSettings, AdapterType};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    optional_str, required_id, required_str, typed, unsupported_action, unsupported_query,
    ServiceProvider, TypedWebhook,
};
use crate::error::AdapterResult;
use crate::transport::ServiceRequest;

#[derive(Debug, Deserialize)]
struct ViolationEvent {
    watch_name: String,
    #[serde(default)]
    issues: Vec<ViolationIssue>,
}

#[derive(Debug, Deserialize)]
struct ViolationIssue {
    severity: String,
}

#[derive(Debug, Clone, Default)]
pub struct SecurityScanProvider;

impl SecurityScanProvider {
    pub fn new() -> Self {
        Self
    }

    pub fn from_settings(_settings: &AdapterSettings) -> Self {
        Self
    }
}

fn component_summary(component_id: &str) -> ServiceRequest {
    ServiceRequest::post(
        "api/v1/summary/component",
        json!({ "component_details": [{ "component_id": component_id }] }),
    )
}

impl ServiceProvider for SecurityScanProvider {
    fn adapter_type(&self) -> AdapterType {
        AdapterType::SecurityScan
    }

    fn probe(&self) -> ServiceRequest {
        ServiceRequest::get("api/v1/system/ping")
    }

    fn route_action(&self, action: &str, params: &Value) -> AdapterResult<ServiceRequest> {
        let request = match action {
            "scan_artifact" => ServiceRequest::post(
                "api/v1/scanArtifact",
                json!({ "componentId": required_str(params, "component_id")? }),
            ),
            "scan_build" => ServiceRequest::post(
                "api/v1/scanBuild",
                json!({
                    "buildName": required_str(params, "build_name")?,
                    "buildNumber": required_id(params, "build_number")?,
                }),
            ),
            "generate_vulnerabilities_report" => ServiceRequest::post(
                "api/v1/reports/vulnerabilities",
                json!({
                    "name": required_str(params, "name")?,
                    "resources": {
                        "repositories": params.get("repositories").cloned().unwrap_or_else(|| json!([])),
                    },
                }),
            ),
            _ => return Err(unsupported_action(action)),
        };
        Ok(request)
    }

    fn route_query(&self, operation: &str, query: &Value) -> AdapterResult<ServiceRequest> {
        let request = match operation {
            "get_vulnerabilities" | "get_licenses" | "get_component_summary" => {
                component_summary(required_str(query, "component_id")?)
            }
            "get_summary" => ServiceRequest::post(
                "api/v1/summary/artifact",
                json!({ "paths": [required_str(query, "path")?] }),
            ),
            "get_watches" => ServiceRequest::get("api/v2/watches"),
            "get_policies" => ServiceRequest::get("api/v2/policies"),
            "get_system_version" => ServiceRequest::get("api/v1/system/version"),
            "get_scan_status" => {
                let id = match optional_str(query, "component_id") {
                    Some(id) => id.to_string(),
                    None => required_id(query, "scan_id")?,
                };
                ServiceRequest::get(format!("api/v1/artifact/status/{}", id))
            }
            _ => return Err(unsupported_query(operation)),
        };
        Ok(request)
    }

    fn parse_webhook(&self, label: &str, payload: &Value) -> Option<TypedWebhook> {
        match label {
            "violation" | "security_violation" => typed::<ViolationEvent>(payload).map(|e| {
                let highest = e
                    .issues
                    .iter()
                    .map(|i| i.severity.as_str())
                    .max_by_key(|s| severity_rank(s))
                    .unwrap_or("none")
                    .to_string();
                TypedWebhook::new("security_violation")
                    .with_metadata("watch", e.watch_name)
                    .with_metadata("issues", e.issues.len().to_string())
                    .with_metadata("highest_severity", highest)
            }),
            _ => None,
        }
    }
}

fn severity_rank(severity: &str) -> u8 {
    match severity.to_ascii_lowercase().as_str() {
        "critical" => 4,
        "high" => 3,
        "medium" => 2,
        "low" => 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_queries_share_endpoint() {
        let provider = SecurityScanProvider::new();
        let vulns = provider
            .route_query("get_vulnerabilities", &json!({"component_id": "npm://left-pad:1.0.0"}))
            .unwrap();
        let licenses = provider
            .route_query("get_licenses", &json!({"component_id": "npm://left-pad:1.0.0"}))
            .unwrap();

        assert_eq!(vulns, licenses);
        assert_eq!(vulns.path, "api/v1/summary/component");
    }

    #[test]
    fn test_violation_webhook_reports_highest_severity() {
        let hook = SecurityScanProvider::new()
            .parse_webhook(
                "violation",
                &json!({"watch_name": "prod-watch", "issues": [{"severity": "Low"}, {"severity": "Critical"}]}),
            )
            .unwrap();

        assert_eq!(hook.event_type, "security_violation");
        assert!(hook
            .metadata
            .contains(&("highest_severity".to_string(), "Critical".to_string())));
    }
}
