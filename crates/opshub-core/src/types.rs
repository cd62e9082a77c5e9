use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// The closed set of external services the hub integrates with.
///
/// Keys are kebab-case on the wire (`ci-pipeline`); the snake_case spelling
/// is accepted as well so environment variables can name them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AdapterType {
    #[serde(rename = "github")]
    GitHub,
    #[serde(rename = "ci-pipeline", alias = "ci_pipeline")]
    CiPipeline,
    #[serde(rename = "code-quality", alias = "code_quality")]
    CodeQuality,
    #[serde(rename = "artifact-repo", alias = "artifact_repo")]
    ArtifactRepo,
    #[serde(rename = "security-scan", alias = "security_scan")]
    SecurityScan,
    #[serde(rename = "feature-flags", alias = "feature_flags")]
    FeatureFlags,
}

impl AdapterType {
    pub const ALL: [AdapterType; 6] = [
        AdapterType::GitHub,
        AdapterType::CiPipeline,
        AdapterType::CodeQuality,
        AdapterType::ArtifactRepo,
        AdapterType::SecurityScan,
        AdapterType::FeatureFlags,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterType::GitHub => "github",
            AdapterType::CiPipeline => "ci-pipeline",
            AdapterType::CodeQuality => "code-quality",
            AdapterType::ArtifactRepo => "artifact-repo",
            AdapterType::SecurityScan => "security-scan",
            AdapterType::FeatureFlags => "feature-flags",
        }
    }
}

impl fmt::Display for AdapterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        AdapterType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| CoreError::UnknownAdapterType(s.to_string()))
    }
}

/// Health of a live adapter instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum HealthState {
    Initializing,
    Healthy,
    /// Initialized, but the connectivity probe failed.
    Degraded(String),
    Closed,
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthState::Healthy)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Initializing => write!(f, "initializing"),
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded(reason) => write!(f, "unhealthy: {}", reason),
            HealthState::Closed => write!(f, "closed"),
        }
    }
}
