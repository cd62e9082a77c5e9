//! Service adapters for the OpsHub integration hub
//!
//! This crate provides:
//! - The [`Adapter`] contract and the generic [`ServiceAdapter`]
//! - One provider per supported service
//! - The [`SafetyPolicy`] consulted before every action
//! - Webhook normalization and signature verification
//! - [`AdapterFactory`] and the caching [`AdapterRegistry`]

pub mod error;
pub mod factory;
pub mod providers;
pub mod registry;
pub mod safety;
pub mod traits;
pub mod transport;
pub mod webhook;

pub use error::{AdapterError, AdapterResult};
pub use factory::{AdapterFactory, DefaultAdapterFactory};
pub use providers::{
    ArtifactRepoProvider, CiPipelineProvider, CodeQualityProvider, FeatureFlagsProvider,
    GitHubProvider, SecurityScanProvider, ServiceAdapter, ServiceProvider, TypedWebhook,
};
pub use registry::AdapterRegistry;
pub use safety::{ConditionalRule, SafetyDenial, SafetyPolicy, SafetyRule};
pub use traits::Adapter;
pub use transport::{HttpTransport, Method, ServiceRequest, ServiceResponse, Transport};
pub use webhook::{is_generic_relay, label_event_type, relay_event_type, WebhookVerifier};
