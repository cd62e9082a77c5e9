//! Safety policy for mutating operations
//!
//! A blocklist evaluated before any network call. Each adapter type has one
//! [`SafetyRule`]; checks run in a fixed order: exact deny names, deny
//! prefixes, then conditional rules over the call parameters. Anything not
//! matched is allowed.

use opshub_core::{AdapterType, HubConfig, SafetySettings};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::error::AdapterError;

/// Why an operation was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyDenial {
    #[error("restricted operation: {action}")]
    Restricted { action: String },

    #[error(
        "operation '{action}' changes feature flags in production ({field}={value}) and is not allowed"
    )]
    ProductionGuard {
        action: String,
        field: String,
        value: String,
    },
}

impl From<SafetyDenial> for AdapterError {
    fn from(denial: SafetyDenial) -> Self {
        match denial {
            SafetyDenial::Restricted { action } => AdapterError::RestrictedOperation(action),
            guard @ SafetyDenial::ProductionGuard { .. } => {
                AdapterError::ProductionGuard(guard.to_string())
            }
        }
    }
}

/// A rule that looks at call parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionalRule {
    /// Deny actions naming a mutating verb and a sensitive noun when any of
    /// `env_fields` points at a production environment.
    ProductionGuard {
        verbs: Vec<String>,
        nouns: Vec<String>,
        env_fields: Vec<String>,
    },
    /// Deny `action` when the boolean parameter `param` is true.
    ParamFlag { action: String, param: String },
}

const PRODUCTION_MARKER: &str = "prod";

impl ConditionalRule {
    pub fn flag_production_guard() -> Self {
        ConditionalRule::ProductionGuard {
            verbs: ["toggle", "update", "enable", "disable", "set", "patch", "change"]
                .into_iter()
                .map(String::from)
                .collect(),
            nouns: vec!["flag".to_string()],
            env_fields: [
                "environment",
                "env",
                "environment_id",
                "environment_identifier",
                "environmentIdentifier",
                "target_environment",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }

    fn evaluate(&self, action: &str, params: &Value) -> Option<SafetyDenial> {
        match self {
            ConditionalRule::ProductionGuard {
                verbs,
                nouns,
                env_fields,
            } => {
                let name = action.to_ascii_lowercase();
                let mutating = verbs.iter().any(|v| name.contains(v.as_str()));
                let sensitive = nouns.iter().any(|n| name.contains(n.as_str()));
                if !(mutating && sensitive) {
                    return None;
                }
                env_fields.iter().find_map(|field| {
                    let value = params.get(field)?.as_str()?;
                    value
                        .to_ascii_lowercase()
                        .contains(PRODUCTION_MARKER)
                        .then(|| SafetyDenial::ProductionGuard {
                            action: action.to_string(),
                            field: field.clone(),
                            value: value.to_string(),
                        })
                })
            }
            ConditionalRule::ParamFlag { action: target, param } => {
                let flagged = params.get(param).and_then(Value::as_bool).unwrap_or(false);
                (action == target && flagged).then(|| SafetyDenial::Restricted {
                    action: action.to_string(),
                })
            }
        }
    }
}

/// Deny rules for a single adapter type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SafetyRule {
    deny_names: HashSet<String>,
    deny_prefixes: Vec<String>,
    conditions: Vec<ConditionalRule>,
}

impl SafetyRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(mut self, action: impl Into<String>) -> Self {
        self.deny_names.insert(action.into());
        self
    }

    pub fn deny_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.deny_prefixes.push(prefix.into());
        self
    }

    pub fn with_condition(mut self, rule: ConditionalRule) -> Self {
        self.conditions.push(rule);
        self
    }

    fn merge(mut self, extra: &SafetySettings) -> Self {
        self.deny_names.extend(extra.deny.iter().cloned());
        self.deny_prefixes.extend(extra.deny_prefixes.iter().cloned());
        self
    }

    pub fn check(&self, action: &str, params: &Value) -> Result<(), SafetyDenial> {
        if self.deny_names.contains(action)
            || self.deny_prefixes.iter().any(|p| action.starts_with(p.as_str()))
        {
            return Err(SafetyDenial::Restricted {
                action: action.to_string(),
            });
        }

        match self.conditions.iter().find_map(|c| c.evaluate(action, params)) {
            Some(denial) => Err(denial),
            None => Ok(()),
        }
    }

    /// Built-in rule for an adapter type.
    pub fn builtin(adapter_type: AdapterType) -> Self {
        match adapter_type {
            AdapterType::GitHub => SafetyRule::new()
                .deny("delete_repository")
                .deny("delete_branch")
                .deny("delete_issue")
                .deny("delete_pull_request")
                .with_condition(ConditionalRule::ParamFlag {
                    action: "merge_pull_request".to_string(),
                    param: "force".to_string(),
                }),
            AdapterType::CiPipeline => SafetyRule::new()
                .deny("delete_pipeline")
                .deny("delete_ccm_budget")
                .with_condition(ConditionalRule::flag_production_guard()),
            AdapterType::CodeQuality => SafetyRule::new().deny("delete_project"),
            AdapterType::ArtifactRepo => SafetyRule::new()
                .deny("delete_repository")
                .deny_prefix("purge_"),
            AdapterType::SecurityScan => SafetyRule::new(),
            AdapterType::FeatureFlags => SafetyRule::new()
                .deny("delete_feature_flag")
                .deny_prefix("purge_")
                .with_condition(ConditionalRule::flag_production_guard()),
        }
    }
}

/// Safety rules for every adapter type. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyPolicy {
    rules: HashMap<AdapterType, SafetyRule>,
}

impl SafetyPolicy {
    /// Built-in rules only.
    pub fn new() -> Self {
        Self {
            rules: AdapterType::ALL
                .iter()
                .map(|t| (*t, SafetyRule::builtin(*t)))
                .collect(),
        }
    }

    /// Built-in rules extended with the deny lists from each adapter's settings.
    pub fn from_config(config: &HubConfig) -> Self {
        let mut policy = Self::new();
        for (adapter_type, settings) in &config.adapters {
            let rule = policy.rules.remove(adapter_type).unwrap_or_default();
            policy.rules.insert(*adapter_type, rule.merge(&settings.safety));
        }
        policy
    }

    pub fn with_rule(mut self, adapter_type: AdapterType, rule: SafetyRule) -> Self {
        self.rules.insert(adapter_type, rule);
        self
    }

    pub fn check(
        &self,
        adapter_type: AdapterType,
        action: &str,
        params: &Value,
    ) -> Result<(), SafetyDenial> {
        match self.rules.get(&adapter_type) {
            Some(rule) => rule.check(action, params),
            None => Ok(()),
        }
    }

    /// `Ok(true)` when allowed; a denial is returned as the matching error.
    pub fn is_safe_operation(
        &self,
        adapter_type: AdapterType,
        action: &str,
        params: &Value,
    ) -> Result<bool, AdapterError> {
        self.check(adapter_type, action, params)?;
        Ok(true)
    }
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self::new()
    }
}
