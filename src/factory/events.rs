use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::models::TaskEvent;

/// Topic a project's task events are published on.
pub fn task_topic(project_id: i64) -> String {
    format!("project/{}/tasks", project_id)
}

/// Destination for task events (pub/sub, WebSocket fan-out, ...).
///
/// Delivery is best-effort. Callers log and drop errors.
pub trait EventSink: Send + Sync {
    fn publish(&self, topic: &str, event: &TaskEvent) -> Result<()>;
}

/// One published event together with its topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicMessage {
    pub topic: String,
    pub event: TaskEvent,
}

/// In-process sink backed by a `tokio::sync::broadcast` channel.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<TopicMessage>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopicMessage> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, topic: &str, event: &TaskEvent) -> Result<()> {
        let _ = self.tx.send(TopicMessage {
            topic: topic.to_string(),
            event: event.clone(),
        }); // Ignore error if no receivers
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
