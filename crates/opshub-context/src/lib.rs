//! Context recording for the OpsHub integration hub
//!
//! This crate provides:
//! - [`ContextBridge`], which writes operations, events and webhook
//!   deliveries into conversational contexts
//! - [`InMemoryContextStore`], a process-local [`opshub_core::ContextStore`]

pub mod bridge;
pub mod store;

pub use bridge::{BridgeError, BridgeResult, ContextBridge, WEBHOOK_MODEL_ID};
pub use store::InMemoryContextStore;
