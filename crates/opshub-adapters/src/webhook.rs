//! Inbound webhook handling
//!
//! Generic relay detection for payloads forwarded by CI systems or proxies,
//! and HMAC-SHA256 signature verification.

use hmac::{Hmac, Mac};
use opshub_core::event_types;
use serde_json::Value;
use sha2::Sha256;

use crate::error::{AdapterError, AdapterResult};

type HmacSha256 = Hmac<Sha256>;

/// Whether `payload` looks like a relayed webhook rather than a native one.
pub fn is_generic_relay(payload: &Value) -> bool {
    let Some(obj) = payload.as_object() else {
        return false;
    };

    if obj.contains_key("payload") && obj.contains_key("headers") {
        return true;
    }
    if (obj.contains_key("event_source") || obj.contains_key("event_type"))
        && obj.contains_key("timestamp")
    {
        return true;
    }
    if obj.get("artifacts").map(Value::is_array).unwrap_or(false) {
        return true;
    }
    obj.contains_key("webhook") || obj.contains_key("custom_data")
}

/// Event type carried inside a relayed payload, or `generic_webhook`.
///
/// A type the hub publishes itself is never taken from the payload.
pub fn relay_event_type(payload: &Value) -> String {
    let non_empty = |v: Option<&Value>| {
        v.and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    non_empty(payload.get("event_type"))
        .or_else(|| non_empty(payload.get("type")))
        .or_else(|| non_empty(payload.get("event")))
        .or_else(|| non_empty(payload.pointer("/custom_data/type")))
        .or_else(|| non_empty(payload.pointer("/custom_data/event")))
        .or_else(|| header_event_type(payload))
        .filter(|t| !event_types::is_reserved(t))
        .unwrap_or_else(|| event_types::GENERIC_WEBHOOK.to_string())
}

/// Event type for a webhook delivered under `label`. Empty or reserved
/// labels fall back to `generic_webhook`.
pub fn label_event_type(label: &str) -> &str {
    if label.is_empty() || event_types::is_reserved(label) {
        event_types::GENERIC_WEBHOOK
    } else {
        label
    }
}

fn header_event_type(payload: &Value) -> Option<String> {
    let headers = payload.get("headers")?.as_object()?;
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("x-event-type"))
        .and_then(|(_, value)| value.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Verifies `sha256=<hex>` signatures over the raw request body.
pub struct WebhookVerifier {
    secret: Vec<u8>,
}

impl WebhookVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Compute the signature header value for `payload`.
    pub fn sign(&self, payload: &[u8]) -> AdapterResult<String> {
        Ok(format!("sha256={}", self.compute_signature(payload)?))
    }

    pub fn verify(&self, payload: &[u8], signature_header: &str) -> AdapterResult<()> {
        let provided = signature_header
            .trim()
            .strip_prefix("sha256=")
            .ok_or_else(|| AdapterError::WebhookRejected("unsupported signature format".to_string()))?;

        let expected = self.compute_signature(payload)?;
        if constant_time_compare(&provided.to_ascii_lowercase(), &expected) {
            Ok(())
        } else {
            Err(AdapterError::WebhookRejected("signature mismatch".to_string()))
        }
    }

    fn compute_signature(&self, data: &[u8]) -> AdapterResult<String> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AdapterError::Configuration(format!("invalid webhook secret: {}", e)))?;
        mac.update(data);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }

    result == 0
}
