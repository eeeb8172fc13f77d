//! Run event sinks.

use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::result::RunEvent;

/// Receives stage and state changes of runs.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: RunEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _event: RunEvent) {}
}

/// Fans events out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<RunEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: RunEvent) {
        // no subscribers is fine
        if self.sender.send(event).is_err() {
            trace!("Run event dropped, no subscribers");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<RunEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events published so far.
    pub fn events(&self) -> Vec<RunEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events of one run.
    pub fn events_for(&self, run_id: Uuid) -> Vec<RunEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.run_id == run_id)
            .collect()
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: RunEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RunState, Stage};
    use chrono::Utc;

    fn event(run_id: Uuid, stage: Stage) -> RunEvent {
        RunEvent {
            run_id,
            stage,
            state: RunState::Running,
            attempt_count: 0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_memory_sink_filters_by_run() {
        let sink = MemorySink::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        sink.publish(event(a, Stage::Started));
        sink.publish(event(b, Stage::Started));
        sink.publish(event(a, Stage::ApiCallerStarted));
        assert_eq!(sink.events().len(), 3);
        let stages: Vec<_> = sink.events_for(a).iter().map(|e| e.stage).collect();
        assert_eq!(stages, vec![Stage::Started, Stage::ApiCallerStarted]);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers() {
        let sink = BroadcastSink::default();
        let mut rx = sink.subscribe();
        let run_id = Uuid::new_v4();
        sink.publish(event(run_id, Stage::ScraperStarted));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.run_id, run_id);
        assert_eq!(received.stage, Stage::ScraperStarted);
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        let sink = BroadcastSink::new(0);
        sink.publish(event(Uuid::new_v4(), Stage::Started));
    }

    #[test]
    fn test_noop_sink() {
        NoopSink.publish(event(Uuid::new_v4(), Stage::Started));
    }
}
