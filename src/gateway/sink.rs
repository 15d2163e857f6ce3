//! Event emission: persist, then fan out.
//!
//! Every event minted in the process goes through one [`EventSink`]: the
//! sequence number is taken from the bus, the event is appended to the
//! audit table, and only then published to subscribers.  The sink is
//! constructed and owned by the gateway; handing the engine an
//! `Arc<EventSink>` keeps persistence under gateway authority.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::{
    bus::EventBus,
    domain::{Event, EventType},
    observability::Metrics,
    persistence::Repository,
};

pub struct EventSink {
    bus: Arc<EventBus>,
    repo: Arc<dyn Repository>,
    metrics: Arc<Metrics>,
}

impl EventSink {
    pub fn new(bus: Arc<EventBus>, repo: Arc<dyn Repository>, metrics: Arc<Metrics>) -> Self {
        Self { bus, repo, metrics }
    }

    /// Mint a sequence number, persist the event, publish it.
    ///
    /// A repository write failure is logged and does not abort emission —
    /// subscribers still see the event, and the run keeps going.
    pub async fn emit(&self, run_id: Option<&str>, event_type: EventType, payload: Value) -> Event {
        let event = Event {
            run_id: run_id.map(str::to_owned),
            seq: self.bus.next_seq(),
            event_type,
            payload,
            ts: Utc::now(),
        };
        if let Err(err) = self.repo.add_event(&event).await {
            tracing::error!(
                seq = event.seq,
                event_type = event.event_type.as_str(),
                error = %err,
                "failed to persist event"
            );
        }
        self.bus.publish(event.clone());
        event
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteRepository;
    use serde_json::json;

    fn sink() -> (EventSink, Arc<EventBus>, Arc<dyn Repository>) {
        let bus = Arc::new(EventBus::new());
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::in_memory().unwrap());
        let sink = EventSink::new(
            Arc::clone(&bus),
            Arc::clone(&repo),
            Arc::new(Metrics::new()),
        );
        (sink, bus, repo)
    }

    #[tokio::test]
    async fn emit_persists_before_fanout() {
        let (sink, bus, repo) = sink();
        let sub = bus.subscribe();

        let emitted = sink
            .emit(Some("run_1"), EventType::RunProgress, json!({ "step": 1 }))
            .await;

        // Published to the subscriber…
        let received = sub.recv().await.unwrap();
        assert_eq!(received.seq, emitted.seq);

        // …and already visible in the audit log.
        let tail = repo.tail_events(Some("run_1"), None, 200).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, emitted.seq);
        assert_eq!(tail[0].payload["step"], 1);
    }

    #[tokio::test]
    async fn seq_increases_across_emits() {
        let (sink, _bus, _repo) = sink();
        let a = sink.emit(None, EventType::MessageInbound, json!({})).await;
        let b = sink.emit(None, EventType::MessageInbound, json!({})).await;
        assert!(b.seq > a.seq);
    }
}
