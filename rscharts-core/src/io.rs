//! Host capabilities: external services, the chart registry and delayed
//! message delivery.
//!
//! These are the seams a durable host replaces. The in-process
//! implementations here are complete and suitable for embedded use.

use crate::error::{CoreError, ServiceError};
use crate::event::Message;
use crate::queue::EventQueue;
use async_trait::async_trait;
use dashmap::DashMap;
use rscharts_model::StateChart;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// An external activity that charts send to and query.
///
/// Resolved by activity type through the [`ServiceRegistry`]. A `send`
/// discards the returned value; a `query` writes it to the action's result
/// location.
#[async_trait]
pub trait ExternalService: Send + Sync {
    /// Handles one call. For sends `operation` is the event name being
    /// delivered; for queries it is the query id when set, otherwise the
    /// activity type. `cancel` fires when the calling instance is cancelled;
    /// a cooperative implementation returns [`ServiceError::Cancelled`]
    /// promptly.
    async fn call(
        &self,
        operation: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<Value, ServiceError>;
}

/// Maps activity type strings to service implementations.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: Arc<DashMap<String, Arc<dyn ExternalService>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, activity: impl Into<String>, service: Arc<dyn ExternalService>) {
        self.services.insert(activity.into(), service);
    }

    pub fn get(&self, activity: &str) -> Result<Arc<dyn ExternalService>, ServiceError> {
        self.services
            .get(activity)
            .map(|s| s.clone())
            .ok_or_else(|| ServiceError::NotFound {
                service: activity.to_string(),
            })
    }

    pub fn contains(&self, activity: &str) -> bool {
        self.services.contains_key(activity)
    }
}

/// Named, immutable charts for invoke-by-name.
///
/// Registration is idempotent: putting a chart that is already present with
/// the same checksum succeeds without effect, while a name collision with a
/// different definition is rejected.
#[derive(Default, Clone)]
pub struct ChartRegistry {
    charts: Arc<DashMap<String, Arc<StateChart>>>,
}

impl ChartRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a chart under its own name. Returns false when an
    /// identical chart was already present.
    pub fn put(&self, chart: Arc<StateChart>) -> Result<bool, CoreError> {
        let name = chart.name().to_string();
        if let Some(existing) = self.charts.get(&name) {
            if existing.checksum() == chart.checksum() {
                debug!(chart = %name, "chart already registered, identical definition");
                return Ok(false);
            }
            return Err(CoreError::ChartAlreadyRegistered { name });
        }
        self.charts.insert(name, chart);
        Ok(true)
    }

    pub fn get(&self, name: &str) -> Result<Arc<StateChart>, CoreError> {
        self.charts
            .get(name)
            .map(|c| c.clone())
            .ok_or_else(|| CoreError::ChartNotFound {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.charts.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.charts.iter().map(|e| e.key().clone()).collect()
    }
}

/// Namespaces a timer key by instance so instances can share a scheduler.
pub(crate) fn scheduler_key(instance_id: &str, key: &str) -> String {
    format!("{}/{}", instance_id, key)
}

/// Schedules delayed message delivery.
///
/// Keys are unique per instance: scheduling an existing key replaces the
/// pending delivery.
pub trait EventScheduler: Send + Sync {
    fn schedule(&self, key: String, msg: Message, delay: Duration, queue: Arc<dyn EventQueue>);

    /// Cancels a pending delivery. False when nothing was pending.
    fn cancel(&self, key: &str) -> bool;

    fn cancel_all(&self);

    fn pending(&self) -> usize;
}

/// Scheduler backed by tokio timer tasks.
#[derive(Default)]
pub struct TokioScheduler {
    tasks: Arc<DashMap<String, (u64, CancellationToken)>>,
    generation: AtomicU64,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventScheduler for TokioScheduler {
    fn schedule(&self, key: String, msg: Message, delay: Duration, queue: Arc<dyn EventQueue>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Some((_, previous)) = self.tasks.insert(key.clone(), (generation, token.clone())) {
            previous.cancel();
        }

        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            // Deregister before delivery; skip if rescheduled meanwhile.
            tasks.remove_if(&key, |_, (gen, _)| *gen == generation);
            if let Err(e) = queue.send(msg).await {
                debug!(key = %key, error = %e, "delayed delivery dropped");
            }
        });
    }

    fn cancel(&self, key: &str) -> bool {
        match self.tasks.remove(key) {
            Some((_, (_, token))) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) {
        for entry in self.tasks.iter() {
            entry.value().1.cancel();
        }
        self.tasks.clear();
    }

    fn pending(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryEventQueue;
    use rscharts_model::ChartDocument;

    fn chart(name: &str) -> Arc<StateChart> {
        Arc::new(
            ChartDocument::from_json(&format!(
                r#"{{"name": "{}", "states": [{{"type": "state", "id": "a"}}]}}"#,
                name
            ))
            .unwrap()
            .compile()
            .unwrap(),
        )
    }

    #[test]
    fn test_chart_registry_idempotent_put() {
        let registry = ChartRegistry::new();
        assert!(registry.put(chart("order")).unwrap());
        assert!(!registry.put(chart("order")).unwrap());
        assert!(registry.contains("order"));
    }

    #[test]
    fn test_chart_registry_rejects_changed_definition() {
        let registry = ChartRegistry::new();
        registry.put(chart("order")).unwrap();

        let changed = Arc::new(
            ChartDocument::from_json(
                r#"{"name": "order", "states": [{"type": "state", "id": "b"}]}"#,
            )
            .unwrap()
            .compile()
            .unwrap(),
        );
        let err = registry.put(changed).unwrap_err();
        assert_eq!(err.error_code(), "CHART_ALREADY_REGISTERED");
    }

    #[test]
    fn test_chart_registry_get_missing() {
        let registry = ChartRegistry::new();
        let err = registry.get("missing").unwrap_err();
        assert_eq!(err.error_code(), "CHART_NOT_FOUND");
    }

    #[test]
    fn test_service_registry_lookup() {
        struct Echo;
        #[async_trait]
        impl ExternalService for Echo {
            async fn call(
                &self,
                _operation: &str,
                params: Value,
                _cancel: CancellationToken,
            ) -> Result<Value, ServiceError> {
                Ok(params)
            }
        }

        let registry = ServiceRegistry::new();
        registry.register("echo", Arc::new(Echo));
        assert!(registry.get("echo").is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(ServiceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_scheduler_delivers_after_delay() {
        let scheduler = TokioScheduler::new();
        let queue = Arc::new(InMemoryEventQueue::new());

        scheduler.schedule(
            "t1".to_string(),
            Message::platform("delay.expired.a.0", Value::Null),
            Duration::from_millis(10),
            queue.clone(),
        );
        assert_eq!(scheduler.pending(), 1);

        let msg = queue.recv().await.unwrap();
        assert_eq!(msg.name, "delay.expired.a.0");
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_scheduler_cancel_prevents_delivery() {
        let scheduler = TokioScheduler::new();
        let queue = Arc::new(InMemoryEventQueue::new());

        scheduler.schedule(
            "t1".to_string(),
            Message::platform("late", Value::Null),
            Duration::from_millis(200),
            queue.clone(),
        );
        assert!(scheduler.cancel("t1"));
        assert!(!scheduler.cancel("t1"));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!queue.has_pending());
    }

    #[tokio::test]
    async fn test_scheduler_reschedule_replaces() {
        let scheduler = TokioScheduler::new();
        let queue = Arc::new(InMemoryEventQueue::new());

        scheduler.schedule(
            "t1".to_string(),
            Message::platform("first", Value::Null),
            Duration::from_millis(200),
            queue.clone(),
        );
        scheduler.schedule(
            "t1".to_string(),
            Message::platform("second", Value::Null),
            Duration::from_millis(10),
            queue.clone(),
        );

        let msg = queue.recv().await.unwrap();
        assert_eq!(msg.name, "second");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!queue.has_pending());
    }
}
