//! Artifact repository provider (Artifactory-style REST API).

use opshub_core::{AdapterSettings, AdapterType};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    optional_str, required_id, required_str, typed, unsupported_action, unsupported_query,
    ServiceProvider, TypedWebhook,
};
use crate::error::AdapterResult;
use crate::transport::{Method, ServiceRequest};

#[derive(Debug, Deserialize)]
struct ArtifactEvent {
    data: ArtifactData,
}

#[derive(Debug, Deserialize)]
struct ArtifactData {
    repo_key: String,
    path: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BuildEvent {
    data: BuildData,
}

#[derive(Debug, Deserialize)]
struct BuildData {
    build_name: String,
    build_number: String,
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactRepoProvider;

impl ArtifactRepoProvider {
    pub fn new() -> Self {
        Self
    }

    pub fn from_settings(_settings: &AdapterSettings) -> Self {
        Self
    }

    fn item_path(params: &Value) -> AdapterResult<String> {
        Ok(format!(
            "{}/{}",
            required_str(params, "repo")?,
            required_str(params, "path")?.trim_start_matches('/')
        ))
    }
}

impl ServiceProvider for ArtifactRepoProvider {
    fn adapter_type(&self) -> AdapterType {
        AdapterType::ArtifactRepo
    }

    fn probe(&self) -> ServiceRequest {
        ServiceRequest::get("api/system/ping")
    }

    fn route_action(&self, action: &str, params: &Value) -> AdapterResult<ServiceRequest> {
        let request = match action {
            "copy_artifact" => ServiceRequest::new(
                Method::Post,
                format!("api/copy/{}", Self::item_path(params)?),
            )
            .with_query("to", required_str(params, "target")?),
            "move_artifact" => ServiceRequest::new(
                Method::Post,
                format!("api/move/{}", Self::item_path(params)?),
            )
            .with_query("to", required_str(params, "target")?),
            "delete_artifact" => ServiceRequest::new(Method::Delete, Self::item_path(params)?),
            "set_properties" => ServiceRequest::new(
                Method::Put,
                format!("api/storage/{}", Self::item_path(params)?),
            )
            .with_query("properties", required_str(params, "properties")?),
            "promote_build" => ServiceRequest::post(
                format!(
                    "api/build/promote/{}/{}",
                    required_str(params, "build_name")?,
                    required_id(params, "build_number")?
                ),
                json!({
                    "status": optional_str(params, "status").unwrap_or("promoted"),
                    "targetRepo": required_str(params, "target_repo")?,
                    "copy": params.get("copy").and_then(Value::as_bool).unwrap_or(true),
                }),
            ),
            _ => return Err(unsupported_action(action)),
        };
        Ok(request)
    }

    fn route_query(&self, operation: &str, query: &Value) -> AdapterResult<ServiceRequest> {
        let request = match operation {
            "get_repositories" => ServiceRequest::get("api/repositories"),
            "get_artifact_info" => {
                ServiceRequest::get(format!("api/storage/{}", Self::item_path(query)?))
            }
            "search_artifacts" => {
                let mut req = ServiceRequest::get("api/search/artifact")
                    .with_query("name", required_str(query, "name")?);
                if let Some(repos) = optional_str(query, "repos") {
                    req = req.with_query("repos", repos);
                }
                req
            }
            "get_build_info" => ServiceRequest::get(format!(
                "api/build/{}/{}",
                required_str(query, "build_name")?,
                required_id(query, "build_number")?
            )),
            _ => return Err(unsupported_query(operation)),
        };
        Ok(request)
    }

    fn parse_webhook(&self, label: &str, payload: &Value) -> Option<TypedWebhook> {
        match label {
            "artifact.deployed" | "artifact.deleted" | "artifact.moved" | "artifact.copied" => {
                typed::<ArtifactEvent>(payload).map(|e| {
                    let mut hook = TypedWebhook::new(label)
                        .with_metadata("repo", e.data.repo_key)
                        .with_metadata("path", e.data.path);
                    if let Some(name) = e.data.name {
                        hook = hook.with_metadata("name", name);
                    }
                    hook
                })
            }
            "build.uploaded" | "build.promoted" => typed::<BuildEvent>(payload).map(|e| {
                TypedWebhook::new(label)
                    .with_metadata("build_name", e.data.build_name)
                    .with_metadata("build_number", e.data.build_number)
            }),
            _ => None,
        }
    }
}
