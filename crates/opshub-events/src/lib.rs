//! In-process event bus
//!
//! Listeners subscribe to an event type, or to [`event_types::ALL`] to see
//! everything. Each delivery runs in its own task: the publisher never waits,
//! and a failing or panicking listener affects nobody else.

use async_trait::async_trait;
use futures::FutureExt;
use opshub_core::{event_types, AdapterEvent, HubMetrics};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Listener failed: {0}")]
    Listener(String),
}

pub type EventResult<T> = std::result::Result<T, EventError>;

/// Receives events from the bus.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: Arc<AdapterEvent>) -> EventResult<()>;

    /// Name used in logs
    fn name(&self) -> &str {
        "listener"
    }
}

/// Adapts an async closure into an [`EventListener`].
pub struct FnListener<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventListener for FnListener<F>
where
    F: Fn(Arc<AdapterEvent>) -> Fut + Send + Sync,
    Fut: Future<Output = EventResult<()>> + Send,
{
    async fn on_event(&self, event: Arc<AdapterEvent>) -> EventResult<()> {
        (self.f)(event).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub fn listener_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventListener>
where
    F: Fn(Arc<AdapterEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EventResult<()>> + Send + 'static,
{
    Arc::new(FnListener {
        name: name.into(),
        f,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    listener: Arc<dyn EventListener>,
}

/// Topic-keyed fan-out of [`AdapterEvent`]s.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
    metrics: Option<Arc<HubMetrics>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HubMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        listener: Arc<dyn EventListener>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let event_type = event_type.into();
        debug!(event_type = %event_type, listener = listener.name(), "Listener subscribed");
        self.subscribers
            .write()
            .entry(event_type)
            .or_default()
            .push(Subscription { id, listener });
        id
    }

    /// Remove a subscription. Returns false if it was not found.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let mut found = false;
        subscribers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            found |= subs.len() != before;
            !subs.is_empty()
        });
        found
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        self.subscribers
            .read()
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Dispatch `event` to listeners of its type and of `all`, returning the
    /// number of deliveries started. Must be called within a Tokio runtime;
    /// outside one the event is dropped.
    pub fn emit(&self, event: AdapterEvent) -> usize {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(event_type = %event.event_type, "No runtime available, event dropped");
                return 0;
            }
        };

        let listeners: Vec<Arc<dyn EventListener>> = {
            let subscribers = self.subscribers.read();
            let exact = subscribers.get(&event.event_type).into_iter().flatten();
            let wildcard = if event.event_type == event_types::ALL {
                None
            } else {
                subscribers.get(event_types::ALL)
            };
            exact
                .chain(wildcard.into_iter().flatten())
                .map(|s| s.listener.clone())
                .collect()
        };

        let event = Arc::new(event);
        for listener in &listeners {
            let listener = listener.clone();
            let event = event.clone();
            handle.spawn(async move {
                let outcome = AssertUnwindSafe(listener.on_event(event.clone()))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        listener = listener.name(),
                        event_type = %event.event_type,
                        event_id = %event.id,
                        error = %e,
                        "Event listener failed"
                    ),
                    Err(_) => error!(
                        listener = listener.name(),
                        event_type = %event.event_type,
                        event_id = %event.id,
                        "Event listener panicked"
                    ),
                }
            });
        }

        if let Some(metrics) = &self.metrics {
            metrics.events_dispatched.inc_by(listeners.len() as u64);
        }
        debug!(
            event_type = %event.event_type,
            adapter_type = %event.adapter_type,
            deliveries = listeners.len(),
            "Event emitted"
        );
        listeners.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opshub_core::AdapterType;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn counting_listener(counter: Arc<AtomicUsize>) -> Arc<dyn EventListener> {
        listener_fn("counter", move |_event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn event(event_type: &str) -> AdapterEvent {
        AdapterEvent::new(AdapterType::GitHub, event_type, json!({}))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_fan_out_to_exact_and_wildcard() {
        let bus = EventBus::new();
        let push = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));
        let other = Arc::new(AtomicUsize::new(0));

        bus.subscribe("push", counting_listener(push.clone()));
        bus.subscribe(event_types::ALL, counting_listener(all.clone()));
        bus.subscribe("pull_request", counting_listener(other.clone()));

        assert_eq!(bus.emit(event("push")), 2);
        settle().await;

        assert_eq!(push.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_listener_is_isolated() {
        let bus = EventBus::new();
        let healthy = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            "push",
            listener_fn("boom", |_event| async { panic!("listener bug") }),
        );
        bus.subscribe(
            "push",
            listener_fn("failing", |_event| async {
                Err(EventError::Listener("nope".into()))
            }),
        );
        bus.subscribe("push", counting_listener(healthy.clone()));

        assert_eq!(bus.emit(event("push")), 3);
        assert_eq!(bus.emit(event("push")), 3);
        settle().await;

        assert_eq!(healthy.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_emit_does_not_wait_for_listeners() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.subscribe(
            "slow",
            listener_fn("slow", move |event| {
                let tx = tx.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let _ = tx.send(event.id);
                    Ok(())
                }
            }),
        );

        let e = event("slow");
        let id = e.id;
        let started = std::time::Instant::now();
        bus.emit(e);
        assert!(started.elapsed() < Duration::from_millis(50));

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(id));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let id = bus.subscribe("push", counting_listener(counter.clone()));
        assert_eq!(bus.listener_count("push"), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        assert_eq!(bus.emit(event("push")), 0);
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_listeners() {
        let bus = EventBus::new().with_metrics(Arc::new(HubMetrics::new()));
        assert_eq!(bus.emit(event("nobody")), 0);
    }

    #[test]
    fn test_emit_outside_runtime_drops() {
        let bus = EventBus::new();
        bus.subscribe("push", counting_listener(Arc::new(AtomicUsize::new(0))));
        assert_eq!(bus.emit(event("push")), 0);
    }
}
