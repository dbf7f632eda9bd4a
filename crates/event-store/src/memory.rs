//! In-memory event store for tests and single-node development. Models the
//! deduplicated view by dropping repeats of `(esp, event_id, campaign_id)`
//! at insert time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use sendflow_core::error::SendFlowResult;
use sendflow_core::types::{
    ContextSignal, EngagementEvent, EventType, TimingExplanation, UniversalId,
};

use crate::store::EventStore;

#[derive(Default)]
pub struct MemoryEventStore {
    events: DashMap<String, Vec<EngagementEvent>>,
    seen: DashMap<String, ()>,
    explanations: Mutex<Vec<TimingExplanation>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn dedup_key(event: &EngagementEvent) -> String {
        format!(
            "{}|{}|{}",
            event.esp,
            event.event_id,
            event.campaign_id.as_deref().unwrap_or("")
        )
    }

    /// Total stored (post-dedup) event count.
    pub fn event_count(&self) -> usize {
        self.events.iter().map(|e| e.value().len()).sum()
    }

    /// Snapshot of the explanation log, oldest first.
    pub fn explanations(&self) -> Vec<TimingExplanation> {
        self.explanations.lock().clone()
    }

    /// All stored events for one recipient, ascending by timestamp.
    pub fn all_events_for(&self, universal_id: &UniversalId) -> Vec<EngagementEvent> {
        let mut events = self
            .events
            .get(universal_id.as_str())
            .map(|v| v.clone())
            .unwrap_or_default();
        events.sort_by_key(|e| e.timestamp);
        events
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_events(&self, events: &[EngagementEvent]) -> SendFlowResult<()> {
        for event in events {
            let key = Self::dedup_key(event);
            if self.seen.insert(key, ()).is_some() {
                metrics::counter!("event_store.deduped").increment(1);
                continue;
            }
            self.events
                .entry(event.universal_id.as_str().to_string())
                .or_default()
                .push(event.clone());
        }
        Ok(())
    }

    async fn events_for(
        &self,
        universal_id: &UniversalId,
        event_type: EventType,
        since: DateTime<Utc>,
    ) -> SendFlowResult<Vec<EngagementEvent>> {
        let mut events: Vec<EngagementEvent> = self
            .events
            .get(universal_id.as_str())
            .map(|v| {
                v.iter()
                    .filter(|e| e.event_type == event_type && e.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn context_signals(
        &self,
        universal_id: &UniversalId,
        event_types: &[EventType],
        since: DateTime<Utc>,
    ) -> SendFlowResult<Vec<ContextSignal>> {
        let mut signals: Vec<ContextSignal> = self
            .events
            .get(universal_id.as_str())
            .map(|v| {
                v.iter()
                    .filter(|e| event_types.contains(&e.event_type) && e.timestamp >= since)
                    .map(|e| ContextSignal {
                        universal_id: e.universal_id.clone(),
                        event_type: e.event_type,
                        timestamp: e.timestamp,
                        weight: None,
                        provider: Some(e.esp.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default();
        signals.sort_by_key(|s| s.timestamp);
        Ok(signals)
    }

    async fn append_explanation(&self, row: &TimingExplanation) -> SendFlowResult<()> {
        self.explanations.lock().push(row.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(
        event_id: &str,
        uid: &str,
        event_type: EventType,
        ts: DateTime<Utc>,
    ) -> EngagementEvent {
        EngagementEvent {
            event_id: event_id.to_string(),
            event_type,
            esp: "klaviyo".to_string(),
            universal_id: UniversalId::from_string(uid),
            timestamp: ts,
            recipient_email_hash: None,
            campaign_id: Some("c1".to_string()),
            message_id: None,
            metadata: serde_json::Value::Null,
            latency_seconds: None,
            send_time: None,
            hour_of_day: None,
            minute: None,
            day_of_week: None,
            campaign_type: None,
            payload_size_bytes: None,
            queue_depth_estimate: None,
        }
    }

    #[tokio::test]
    async fn test_insert_dedupes_on_esp_event_campaign() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        let e = event("ev-1", "sf_u1", EventType::Clicked, now);

        store.insert_events(&[e.clone()]).await.unwrap();
        store.insert_events(&[e]).await.unwrap();

        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_events_for_filters_type_and_window() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        let uid = UniversalId::from_string("sf_u1");

        store
            .insert_events(&[
                event("e1", "sf_u1", EventType::Clicked, now - Duration::days(1)),
                event("e2", "sf_u1", EventType::Opened, now - Duration::days(1)),
                event("e3", "sf_u1", EventType::Clicked, now - Duration::days(100)),
            ])
            .await
            .unwrap();

        let clicks = store
            .events_for(&uid, EventType::Clicked, now - Duration::days(90))
            .await
            .unwrap();
        assert_eq!(clicks.len(), 1);
        assert_eq!(clicks[0].event_id, "e1");
    }

    #[tokio::test]
    async fn test_context_signals_sorted_ascending() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        let uid = UniversalId::from_string("sf_u1");

        store
            .insert_events(&[
                event("e1", "sf_u1", EventType::SiteVisit, now - Duration::minutes(5)),
                event("e2", "sf_u1", EventType::SmsClick, now - Duration::minutes(20)),
            ])
            .await
            .unwrap();

        let signals = store
            .context_signals(
                &uid,
                &[EventType::SiteVisit, EventType::SmsClick],
                now - Duration::minutes(30),
            )
            .await
            .unwrap();
        assert_eq!(signals.len(), 2);
        assert!(signals[0].timestamp <= signals[1].timestamp);
        assert_eq!(signals[0].event_type, EventType::SmsClick);
    }
}
