//! Source control provider (GitHub REST API).

use opshub_core::{AdapterSettings, AdapterType};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    optional_str, required_id, required_str, typed, unsupported_action, unsupported_query,
    ServiceProvider, TypedWebhook,
};
use crate::error::{AdapterError, AdapterResult};
use crate::transport::{Method, ServiceRequest};

#[derive(Debug, Deserialize)]
struct Repository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct PullRequestEvent {
    action: String,
    number: u64,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct IssuesEvent {
    action: String,
    issue: IssueRef,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct IssueRef {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunEvent {
    action: String,
    workflow_run: WorkflowRun,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct WorkflowRun {
    id: u64,
    #[serde(default)]
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PingEvent {
    zen: String,
}

#[derive(Debug, Clone, Default)]
pub struct GitHubProvider {
    default_owner: Option<String>,
}

impl GitHubProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &AdapterSettings) -> Self {
        Self {
            default_owner: settings.option("owner").map(str::to_string),
        }
    }

    pub fn with_default_owner(mut self, owner: impl Into<String>) -> Self {
        self.default_owner = Some(owner.into());
        self
    }

    fn repo_path(&self, params: &Value) -> AdapterResult<String> {
        let owner = match optional_str(params, "owner") {
            Some(owner) => owner,
            None => self
                .default_owner
                .as_deref()
                .ok_or_else(|| AdapterError::InvalidRequest("missing owner parameter".to_string()))?,
        };
        let repo = required_str(params, "repo")?;
        Ok(format!("repos/{}/{}", owner, repo))
    }
}

impl ServiceProvider for GitHubProvider {
    fn adapter_type(&self) -> AdapterType {
        AdapterType::GitHub
    }

    fn probe(&self) -> ServiceRequest {
        ServiceRequest::get("rate_limit")
    }

    fn route_action(&self, action: &str, params: &Value) -> AdapterResult<ServiceRequest> {
        let repo = self.repo_path(params)?;
        let request = match action {
            "create_issue" => ServiceRequest::post(
                format!("{}/issues", repo),
                json!({
                    "title": required_str(params, "title")?,
                    "body": optional_str(params, "body").unwrap_or_default(),
                    "labels": params.get("labels").cloned().unwrap_or_else(|| json!([])),
                }),
            ),
            "close_issue" => ServiceRequest::new(
                Method::Patch,
                format!("{}/issues/{}", repo, required_id(params, "issue_number")?),
            )
            .with_body(json!({ "state": "closed" })),
            "add_comment" => ServiceRequest::post(
                format!("{}/issues/{}/comments", repo, required_id(params, "issue_number")?),
                json!({ "body": required_str(params, "body")? }),
            ),
            "create_pull_request" => ServiceRequest::post(
                format!("{}/pulls", repo),
                json!({
                    "title": required_str(params, "title")?,
                    "head": required_str(params, "head")?,
                    "base": required_str(params, "base")?,
                    "body": optional_str(params, "body").unwrap_or_default(),
                }),
            ),
            "merge_pull_request" => ServiceRequest::new(
                Method::Put,
                format!("{}/pulls/{}/merge", repo, required_id(params, "pull_number")?),
            )
            .with_body(json!({
                "merge_method": optional_str(params, "merge_method").unwrap_or("merge"),
            })),
            "create_branch" => ServiceRequest::post(
                format!("{}/git/refs", repo),
                json!({
                    "ref": format!("refs/heads/{}", required_str(params, "branch")?),
                    "sha": required_str(params, "sha")?,
                }),
            ),
            "trigger_workflow" => ServiceRequest::post(
                format!(
                    "{}/actions/workflows/{}/dispatches",
                    repo,
                    required_id(params, "workflow_id")?
                ),
                json!({
                    "ref": optional_str(params, "ref").unwrap_or("main"),
                    "inputs": params.get("inputs").cloned().unwrap_or_else(|| json!({})),
                }),
            ),
            "delete_branch" => ServiceRequest::new(
                Method::Delete,
                format!("{}/git/refs/heads/{}", repo, required_str(params, "branch")?),
            ),
            _ => return Err(unsupported_action(action)),
        };
        Ok(request)
    }

    fn route_query(&self, operation: &str, query: &Value) -> AdapterResult<ServiceRequest> {
        let repo = self.repo_path(query)?;
        let request = match operation {
            "get_repository" => ServiceRequest::get(repo),
            "list_pull_requests" => ServiceRequest::get(format!("{}/pulls", repo))
                .with_query("state", optional_str(query, "state").unwrap_or("open")),
            "list_issues" => ServiceRequest::get(format!("{}/issues", repo))
                .with_query("state", optional_str(query, "state").unwrap_or("open")),
            "get_pull_request" => ServiceRequest::get(format!(
                "{}/pulls/{}",
                repo,
                required_id(query, "pull_number")?
            )),
            "get_workflow_runs" => ServiceRequest::get(format!("{}/actions/runs", repo)),
            "get_commit" => {
                ServiceRequest::get(format!("{}/commits/{}", repo, required_str(query, "sha")?))
            }
            _ => return Err(unsupported_query(operation)),
        };
        Ok(request)
    }

    fn parse_webhook(&self, label: &str, payload: &Value) -> Option<TypedWebhook> {
        match label {
            "push" => typed::<PushEvent>(payload).map(|e| {
                TypedWebhook::new("push")
                    .with_metadata("repository", e.repository.full_name)
                    .with_metadata("ref", e.git_ref)
            }),
            "pull_request" => typed::<PullRequestEvent>(payload).map(|e| {
                TypedWebhook::new("pull_request")
                    .with_metadata("repository", e.repository.full_name)
                    .with_metadata("action", e.action)
                    .with_metadata("number", e.number.to_string())
            }),
            "issues" => typed::<IssuesEvent>(payload).map(|e| {
                TypedWebhook::new("issues")
                    .with_metadata("repository", e.repository.full_name)
                    .with_metadata("action", e.action)
                    .with_metadata("number", e.issue.number.to_string())
            }),
            "workflow_run" => typed::<WorkflowRunEvent>(payload).map(|e| {
                let mut hook = TypedWebhook::new("workflow_run")
                    .with_metadata("repository", e.repository.full_name)
                    .with_metadata("action", e.action)
                    .with_metadata("run_id", e.workflow_run.id.to_string());
                if let Some(conclusion) = e.workflow_run.conclusion {
                    hook = hook.with_metadata("conclusion", conclusion);
                }
                hook
            }),
            "ping" => typed::<PingEvent>(payload)
                .map(|e| TypedWebhook::new("ping").with_metadata("zen", e.zen)),
            _ => None,
        }
    }
}
