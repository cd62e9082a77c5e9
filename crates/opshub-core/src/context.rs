//! Conversational context model and the store it lives in.
//!
//! A [`Context`] is an ordered, token-budgeted log of [`ContextLogEntry`]s.
//! The store itself is an external collaborator; only its contract is
//! defined here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::call::{CallContext, Interruption};

/// Who produced a context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextRole {
    Tool,
    Event,
    Webhook,
}

impl ContextRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextRole::Tool => "tool",
            ContextRole::Event => "event",
            ContextRole::Webhook => "webhook",
        }
    }
}

/// Rough token estimate used for context budgeting: four bytes per token.
pub fn estimate_tokens(content: &str) -> usize {
    content.len() / 4
}

/// A single append-only entry in a context log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextLogEntry {
    pub role: ContextRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub tokens: usize,
}

impl ContextLogEntry {
    pub fn new(role: ContextRole, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            role,
            tokens: estimate_tokens(&content),
            content,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A token-budgeted conversational log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    pub agent_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub model_id: String,
    #[serde(default)]
    pub content: Vec<ContextLogEntry>,
    pub current_tokens: usize,
    pub max_tokens: usize,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Context {
    pub fn new(agent_id: impl Into<String>, model_id: impl Into<String>, max_tokens: usize) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            session_id: None,
            model_id: model_id.into(),
            content: Vec::new(),
            current_tokens: 0,
            max_tokens,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn append(&mut self, entry: ContextLogEntry) {
        self.current_tokens += entry.tokens;
        self.content.push(entry);
        self.updated_at = Utc::now();
    }

    pub fn is_over_budget(&self) -> bool {
        self.max_tokens > 0 && self.current_tokens > self.max_tokens
    }

    /// Drop entries until the log fits `max_tokens`, returning how many were
    /// removed. The newest entry is always kept, even when it alone exceeds
    /// the budget.
    pub fn truncate(&mut self, strategy: TruncateStrategy) -> usize {
        self.recompute_tokens();
        if !self.is_over_budget() {
            return 0;
        }

        match strategy {
            TruncateStrategy::OldestFirst => {
                let mut drop_until = 0;
                let mut tokens = self.current_tokens;
                while tokens > self.max_tokens && drop_until + 1 < self.content.len() {
                    tokens -= self.content[drop_until].tokens;
                    drop_until += 1;
                }
                self.content.drain(..drop_until);
                self.current_tokens = tokens;
                drop_until
            }
        }
    }

    /// Re-derive `current_tokens` from the retained entries.
    pub fn recompute_tokens(&mut self) {
        self.current_tokens = self.content.iter().map(|e| e.tokens).sum();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncateStrategy {
    #[default]
    OldestFirst,
}

/// How a store applies an update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextUpdateOptions {
    /// Replace the stored log with the supplied one. When false, the supplied
    /// entries are appended to whatever is stored.
    #[serde(default)]
    pub replace_content: bool,
    #[serde(default)]
    pub truncate: bool,
    #[serde(default)]
    pub truncate_strategy: TruncateStrategy,
}

impl ContextUpdateOptions {
    /// Full read-modify-write with oldest-first truncation.
    pub fn replace_truncating() -> Self {
        Self {
            replace_content: true,
            truncate: true,
            truncate_strategy: TruncateStrategy::OldestFirst,
        }
    }

    /// Append supplied entries without reading the stored log first.
    pub fn append_truncating() -> Self {
        Self {
            replace_content: false,
            truncate: true,
            truncate_strategy: TruncateStrategy::OldestFirst,
        }
    }
}

/// Filters for [`ContextStore::list_contexts`]. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub session_id: Option<String>,
    pub limit: Option<usize>,
}

impl ListOptions {
    pub fn latest() -> Self {
        Self {
            session_id: None,
            limit: Some(1),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ContextStoreError {
    #[error("Context not found: {0}")]
    NotFound(String),

    #[error("Context store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid context: {0}")]
    Invalid(String),

    #[error("Context store call interrupted: {0}")]
    Interrupted(#[from] Interruption),
}

impl ContextStoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ContextStoreError::Unavailable(_))
    }
}

/// Durable storage for contexts.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn get_context(&self, ctx: &CallContext, id: &str) -> Result<Context, ContextStoreError>;

    async fn create_context(
        &self,
        ctx: &CallContext,
        context: Context,
    ) -> Result<Context, ContextStoreError>;

    async fn update_context(
        &self,
        ctx: &CallContext,
        id: &str,
        context: &Context,
        options: &ContextUpdateOptions,
    ) -> Result<Context, ContextStoreError>;

    async fn list_contexts(
        &self,
        ctx: &CallContext,
        agent_id: &str,
        options: &ListOptions,
    ) -> Result<Vec<Context>, ContextStoreError>;
}
