//! In-memory context store.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use opshub_core::{
    CallContext, Context, ContextStore, ContextStoreError, ContextUpdateOptions, ListOptions,
};

/// Process-local [`ContextStore`] backed by a concurrent map.
#[derive(Default)]
pub struct InMemoryContextStore {
    contexts: DashMap<String, Context>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

fn check(ctx: &CallContext) -> Result<(), ContextStoreError> {
    match ctx.interruption() {
        Some(reason) => Err(reason.into()),
        None => Ok(()),
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn get_context(&self, ctx: &CallContext, id: &str) -> Result<Context, ContextStoreError> {
        check(ctx)?;
        self.contexts
            .get(id)
            .map(|c| c.clone())
            .ok_or_else(|| ContextStoreError::NotFound(id.to_string()))
    }

    async fn create_context(
        &self,
        ctx: &CallContext,
        mut context: Context,
    ) -> Result<Context, ContextStoreError> {
        check(ctx)?;
        if context.id.is_empty() {
            return Err(ContextStoreError::Invalid("context id is empty".to_string()));
        }
        if self.contexts.contains_key(&context.id) {
            return Err(ContextStoreError::Invalid(format!(
                "context {} already exists",
                context.id
            )));
        }

        context.recompute_tokens();
        self.contexts.insert(context.id.clone(), context.clone());
        Ok(context)
    }

    async fn update_context(
        &self,
        ctx: &CallContext,
        id: &str,
        context: &Context,
        options: &ContextUpdateOptions,
    ) -> Result<Context, ContextStoreError> {
        check(ctx)?;
        let mut stored = self
            .contexts
            .get_mut(id)
            .ok_or_else(|| ContextStoreError::NotFound(id.to_string()))?;

        if options.replace_content {
            stored.content = context.content.clone();
            stored.metadata.extend(context.metadata.clone());
        } else {
            stored.content.extend(context.content.iter().cloned());
        }

        if options.truncate {
            stored.truncate(options.truncate_strategy);
        } else {
            stored.recompute_tokens();
        }
        stored.updated_at = Utc::now();

        Ok(stored.clone())
    }

    async fn list_contexts(
        &self,
        ctx: &CallContext,
        agent_id: &str,
        options: &ListOptions,
    ) -> Result<Vec<Context>, ContextStoreError> {
        check(ctx)?;
        let mut contexts: Vec<Context> = self
            .contexts
            .iter()
            .filter(|c| c.agent_id == agent_id)
            .filter(|c| match &options.session_id {
                Some(session) => c.session_id.as_deref() == Some(session.as_str()),
                None => true,
            })
            .map(|c| c.clone())
            .collect();

        contexts.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = options.limit {
            contexts.truncate(limit);
        }
        Ok(contexts)
    }
}
