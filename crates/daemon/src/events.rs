use serde::Serialize;
use tokio::sync::broadcast;

/// Telemetry events broadcast to external listeners (log sinks, a future
/// dashboard). Notification-only: nothing in the pipeline core depends on a
/// subscriber existing.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DaemonEvent {
    /// One per completed batch.
    BatchThroughput {
        stage: String,
        batch_size: usize,
        queue_depth_remaining: usize,
    },
    /// Fired after a stage finishes a batch so listeners can refresh counts.
    StageCompleted { stage: String, processed: usize },
    /// Fired after each library scan.
    ScanCompleted {
        candidates: usize,
        skipped: usize,
        new_records: usize,
    },
}

/// Fire-and-forget broadcast channel for daemon telemetry.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DaemonEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Having no receivers is not an error.
    pub fn emit(&self, event: DaemonEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        bus.emit(DaemonEvent::StageCompleted {
            stage: "analysis".into(),
            processed: 3,
        });
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.emit(DaemonEvent::BatchThroughput {
            stage: "analysis".into(),
            batch_size: 3,
            queue_depth_remaining: 7,
        });
        match rx.recv().await.unwrap() {
            DaemonEvent::BatchThroughput {
                stage, batch_size, ..
            } => {
                assert_eq!(stage, "analysis");
                assert_eq!(batch_size, 3);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
