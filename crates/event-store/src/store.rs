//! Typed gateway to the append-only engagement event table and the
//! append-only explanation log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sendflow_core::error::SendFlowResult;
use sendflow_core::types::{
    ContextSignal, EngagementEvent, EventType, TimingExplanation, UniversalId,
};

/// Read/write interface to the analytic event store. One instance is shared
/// by all workers; implementations must be safe for concurrent use.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a batch of normalized events. Downstream deduplication
    /// collapses repeats of `(esp, event_id, campaign_id)`.
    async fn insert_events(&self, events: &[EngagementEvent]) -> SendFlowResult<()>;

    /// Events of one type for one recipient since `since`, ascending by
    /// timestamp.
    async fn events_for(
        &self,
        universal_id: &UniversalId,
        event_type: EventType,
        since: DateTime<Utc>,
    ) -> SendFlowResult<Vec<EngagementEvent>>;

    /// Recent context rows (hot paths, circuit breakers) for one recipient,
    /// filtered by event type, ascending by timestamp.
    async fn context_signals(
        &self,
        universal_id: &UniversalId,
        event_types: &[EventType],
        since: DateTime<Utc>,
    ) -> SendFlowResult<Vec<ContextSignal>>;

    /// Append one row to the `timing_explanations` log.
    async fn append_explanation(&self, row: &TimingExplanation) -> SendFlowResult<()>;
}
