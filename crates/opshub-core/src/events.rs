//! Event envelope published by adapters and the manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::types::AdapterType;

/// Well-known event types.
pub mod event_types {
    /// Wildcard topic; listeners on it receive every event.
    pub const ALL: &str = "all";
    pub const OPERATION_SUCCESS: &str = "operation.success";
    pub const OPERATION_FAILURE: &str = "operation.failure";
    pub const WEBHOOK_RECEIVED: &str = "webhook.received";
    pub const ADAPTER_HEALTH_CHANGED: &str = "adapter.health_changed";
    pub const ADAPTER_CLOSED: &str = "adapter.closed";
    /// Fallback type for relayed payloads that carry no type of their own.
    pub const GENERIC_WEBHOOK: &str = "generic_webhook";

    const RESERVED: [&str; 6] = [
        ALL,
        OPERATION_SUCCESS,
        OPERATION_FAILURE,
        WEBHOOK_RECEIVED,
        ADAPTER_HEALTH_CHANGED,
        ADAPTER_CLOSED,
    ];

    /// Whether `event_type` is published by the hub itself. Inbound
    /// webhooks may not claim these.
    pub fn is_reserved(event_type: &str) -> bool {
        RESERVED.iter().any(|r| r.eq_ignore_ascii_case(event_type.trim()))
    }
}

/// Metadata key naming the context an event belongs to.
pub const META_CONTEXT_ID: &str = "contextId";
/// Metadata flag set on events whose content already reached the context log.
pub const META_CONTEXT_RECORDED: &str = "contextRecorded";

/// An immutable notification produced by an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterEvent {
    pub id: Uuid,
    pub adapter_type: AdapterType,
    pub event_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl AdapterEvent {
    pub fn new(
        adapter_type: AdapterType,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            adapter_type,
            event_type: event_type.into(),
            payload,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_context_id(self, context_id: impl Into<String>) -> Self {
        self.with_metadata(META_CONTEXT_ID, context_id)
    }

    /// Context this event should be recorded into, if any.
    pub fn context_id(&self) -> Option<&str> {
        self.metadata
            .get(META_CONTEXT_ID)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    pub fn is_context_recorded(&self) -> bool {
        self.metadata
            .get(META_CONTEXT_RECORDED)
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}
