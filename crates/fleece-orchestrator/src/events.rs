//! Lifecycle event fan-out with deduplication by key.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One session/issue change event handed to subscribers.
pub struct OrchestratorEvent {
    pub kind: String,
    pub session_id: String,
    pub project_id: String,
    #[serde(default)]
    pub payload: Value,
    /// When present, subscribers see at most one live notification per key.
    #[serde(default)]
    pub dedup_key: Option<String>,
}

impl OrchestratorEvent {
    pub fn new(
        kind: impl Into<String>,
        session_id: impl Into<String>,
        project_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        let kind = kind.into();
        let session_id = session_id.into();
        Self {
            dedup_key: None,
            kind,
            session_id,
            project_id: project_id.into(),
            payload,
        }
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

#[async_trait]
/// Trait contract for `EventSink` behavior.
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: OrchestratorEvent);
}

/// Decorator enforcing the at-most-one-live-notification-per-key contract
/// before events reach the inner sink. Events without a key always pass.
pub struct DedupEventSink {
    inner: Arc<dyn EventSink>,
    seen_keys: Mutex<HashSet<String>>,
}

impl DedupEventSink {
    pub fn new(inner: Arc<dyn EventSink>) -> Self {
        Self {
            inner,
            seen_keys: Mutex::new(HashSet::new()),
        }
    }

    /// Forgets a key so a later event with the same key is delivered again,
    /// e.g. after the underlying notification was dismissed.
    pub fn release_key(&self, key: &str) {
        if let Ok(mut seen) = self.seen_keys.lock() {
            seen.remove(key);
        }
    }
}

#[async_trait]
impl EventSink for DedupEventSink {
    async fn publish(&self, event: OrchestratorEvent) {
        if let Some(key) = &event.dedup_key {
            let fresh = match self.seen_keys.lock() {
                Ok(mut seen) => seen.insert(key.clone()),
                Err(_) => true,
            };
            if !fresh {
                debug!(kind = %event.kind, key = %key, "suppressed duplicate event");
                return;
            }
        }
        self.inner.publish(event).await;
    }
}
