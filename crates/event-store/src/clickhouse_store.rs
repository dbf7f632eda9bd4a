//! ClickHouse-backed event store. Writes go through `JSONEachRow` batches;
//! reads select Unix-timestamp casts into plain row structs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::Row;
use sendflow_core::config::ClickHouseConfig;
use sendflow_core::error::{SendFlowError, SendFlowResult};
use sendflow_core::types::{
    ContextSignal, EngagementEvent, EventType, TimingExplanation, UniversalId,
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::store::EventStore;

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub struct ClickHouseEventStore {
    client: clickhouse::Client,
}

impl ClickHouseEventStore {
    /// Connect and make sure the event and explanation tables exist.
    pub async fn new(config: &ClickHouseConfig) -> anyhow::Result<Self> {
        let client = clickhouse::Client::default()
            .with_url(&config.url)
            .with_database(&config.database);

        Self::ensure_schema(&client).await?;

        Ok(Self { client })
    }

    async fn ensure_schema(client: &clickhouse::Client) -> anyhow::Result<()> {
        client
            .query(
                "CREATE TABLE IF NOT EXISTS engagement_events (
                    event_id String,
                    event_type String,
                    esp String,
                    universal_id String,
                    timestamp DateTime64(3),
                    recipient_email_hash Nullable(String),
                    campaign_id Nullable(String),
                    message_id Nullable(String),
                    metadata String,
                    latency_seconds Nullable(Float64),
                    send_time Nullable(DateTime64(3)),
                    hour_of_day Nullable(UInt8),
                    minute Nullable(UInt8),
                    day_of_week Nullable(UInt8),
                    campaign_type Nullable(String),
                    payload_size_bytes Nullable(UInt64),
                    queue_depth_estimate Nullable(UInt64)
                ) ENGINE = MergeTree()
                ORDER BY (esp, universal_id, timestamp, event_type)
                PARTITION BY toYYYYMM(timestamp)",
            )
            .execute()
            .await?;

        // Deduplicated read view: one row per (esp, event_id, campaign_id).
        client
            .query(
                "CREATE VIEW IF NOT EXISTS engagement_events_deduped AS
                SELECT * FROM engagement_events
                LIMIT 1 BY esp, event_id, campaign_id",
            )
            .execute()
            .await?;

        client
            .query(
                "CREATE TABLE IF NOT EXISTS timing_explanations (
                    decision_id UUID,
                    explanation_ref String,
                    universal_id String,
                    target_minute UInt16,
                    trigger_timestamp_utc DateTime64(3),
                    latency_estimate_seconds Float64,
                    confidence_score Float64,
                    model_version String,
                    base_curve_peak_minute UInt16,
                    applied_weights String,
                    suppressed Bool,
                    suppression_reason Nullable(String),
                    suppression_until Nullable(DateTime64(3)),
                    hot_path_signal Nullable(String),
                    hot_path_weight Nullable(Float64),
                    created_at_utc DateTime64(3)
                ) ENGINE = MergeTree()
                ORDER BY (universal_id, created_at_utc)
                PARTITION BY toYYYYMM(created_at_utc)",
            )
            .execute()
            .await?;

        info!("ClickHouse event store schema verified");
        Ok(())
    }

    /// Flatten an event into the table's JSONEachRow shape (metadata is a
    /// serialized string column, timestamps in ClickHouse text format).
    fn event_row_json(event: &EngagementEvent) -> serde_json::Value {
        serde_json::json!({
            "event_id": event.event_id,
            "event_type": event.event_type.as_str(),
            "esp": event.esp,
            "universal_id": event.universal_id.as_str(),
            "timestamp": event.timestamp.format(TS_FORMAT).to_string(),
            "recipient_email_hash": event.recipient_email_hash,
            "campaign_id": event.campaign_id,
            "message_id": event.message_id,
            "metadata": event.metadata.to_string(),
            "latency_seconds": event.latency_seconds,
            "send_time": event.send_time.map(|t| t.format(TS_FORMAT).to_string()),
            "hour_of_day": event.hour_of_day,
            "minute": event.minute,
            "day_of_week": event.day_of_week,
            "campaign_type": event.campaign_type,
            "payload_size_bytes": event.payload_size_bytes,
            "queue_depth_estimate": event.queue_depth_estimate,
        })
    }
}

#[derive(Debug, Row, Deserialize)]
struct EventRow {
    event_id: String,
    event_type: String,
    esp: String,
    universal_id: String,
    ts_ms: i64,
    recipient_email_hash: Option<String>,
    campaign_id: Option<String>,
    message_id: Option<String>,
    metadata: String,
    latency_seconds: Option<f64>,
    send_time_ms: Option<i64>,
    hour_of_day: Option<u8>,
    minute: Option<u8>,
    day_of_week: Option<u8>,
    campaign_type: Option<String>,
    payload_size_bytes: Option<u64>,
    queue_depth_estimate: Option<u64>,
}

#[derive(Debug, Row, Deserialize)]
struct SignalRow {
    event_type: String,
    ts_ms: i64,
    esp: String,
}

fn millis_to_utc(ms: i64) -> SendFlowResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| SendFlowError::Internal(anyhow::anyhow!("timestamp out of range: {ms}")))
}

fn backend(e: clickhouse::error::Error) -> SendFlowError {
    SendFlowError::BackendUnavailable(format!("clickhouse: {e}"))
}

impl TryFrom<EventRow> for EngagementEvent {
    type Error = SendFlowError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let event_type = EventType::parse(&row.event_type).ok_or_else(|| {
            SendFlowError::Internal(anyhow::anyhow!("unknown event type: {}", row.event_type))
        })?;
        Ok(EngagementEvent {
            event_id: row.event_id,
            event_type,
            esp: row.esp,
            universal_id: UniversalId::from_string(row.universal_id),
            timestamp: millis_to_utc(row.ts_ms)?,
            recipient_email_hash: row.recipient_email_hash,
            campaign_id: row.campaign_id,
            message_id: row.message_id,
            metadata: serde_json::from_str(&row.metadata).unwrap_or(serde_json::Value::Null),
            latency_seconds: row.latency_seconds,
            send_time: row.send_time_ms.map(millis_to_utc).transpose()?,
            hour_of_day: row.hour_of_day,
            minute: row.minute,
            day_of_week: row.day_of_week,
            campaign_type: row.campaign_type,
            payload_size_bytes: row.payload_size_bytes,
            queue_depth_estimate: row.queue_depth_estimate,
        })
    }
}

#[async_trait]
impl EventStore for ClickHouseEventStore {
    async fn insert_events(&self, events: &[EngagementEvent]) -> SendFlowResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let rows: Vec<String> = events
            .iter()
            .map(|e| Self::event_row_json(e).to_string())
            .collect();
        let insert_sql = format!(
            "INSERT INTO engagement_events FORMAT JSONEachRow {}",
            rows.join("\n")
        );
        self.client
            .query(&insert_sql)
            .execute()
            .await
            .map_err(backend)?;
        metrics::counter!("event_store.inserted").increment(events.len() as u64);
        debug!(count = events.len(), "engagement events inserted");
        Ok(())
    }

    async fn events_for(
        &self,
        universal_id: &UniversalId,
        event_type: EventType,
        since: DateTime<Utc>,
    ) -> SendFlowResult<Vec<EngagementEvent>> {
        let rows: Vec<EventRow> = self
            .client
            .query(
                "SELECT event_id, event_type, esp, universal_id,
                        toUnixTimestamp64Milli(timestamp) AS ts_ms,
                        recipient_email_hash, campaign_id, message_id, metadata,
                        latency_seconds,
                        toUnixTimestamp64Milli(send_time) AS send_time_ms,
                        hour_of_day, minute, day_of_week, campaign_type,
                        payload_size_bytes, queue_depth_estimate
                 FROM engagement_events_deduped
                 WHERE universal_id = ? AND event_type = ?
                   AND timestamp >= fromUnixTimestamp64Milli(?)
                 ORDER BY timestamp ASC",
            )
            .bind(universal_id.as_str())
            .bind(event_type.as_str())
            .bind(since.timestamp_millis())
            .fetch_all()
            .await
            .map_err(backend)?;

        rows.into_iter().map(EngagementEvent::try_from).collect()
    }

    async fn context_signals(
        &self,
        universal_id: &UniversalId,
        event_types: &[EventType],
        since: DateTime<Utc>,
    ) -> SendFlowResult<Vec<ContextSignal>> {
        if event_types.is_empty() {
            return Ok(Vec::new());
        }
        // Event type names come from the closed enum, safe to inline.
        let type_list = event_types
            .iter()
            .map(|t| format!("'{}'", t.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT event_type, toUnixTimestamp64Milli(timestamp) AS ts_ms, esp
             FROM engagement_events_deduped
             WHERE universal_id = ? AND event_type IN ({type_list})
               AND timestamp >= fromUnixTimestamp64Milli(?)
             ORDER BY timestamp ASC"
        );
        let rows: Vec<SignalRow> = self
            .client
            .query(&sql)
            .bind(universal_id.as_str())
            .bind(since.timestamp_millis())
            .fetch_all()
            .await
            .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                let event_type = EventType::parse(&row.event_type).ok_or_else(|| {
                    SendFlowError::Internal(anyhow::anyhow!(
                        "unknown event type: {}",
                        row.event_type
                    ))
                })?;
                Ok(ContextSignal {
                    universal_id: universal_id.clone(),
                    event_type,
                    timestamp: millis_to_utc(row.ts_ms)?,
                    weight: None,
                    provider: Some(row.esp),
                })
            })
            .collect()
    }

    async fn append_explanation(&self, row: &TimingExplanation) -> SendFlowResult<()> {
        let json = serde_json::json!({
            "decision_id": row.decision_id.to_string(),
            "explanation_ref": row.explanation_ref,
            "universal_id": row.universal_id.as_str(),
            "target_minute": row.target_minute,
            "trigger_timestamp_utc": row.trigger_timestamp_utc.format(TS_FORMAT).to_string(),
            "latency_estimate_seconds": row.latency_estimate_seconds,
            "confidence_score": row.confidence_score,
            "model_version": row.model_version,
            "base_curve_peak_minute": row.base_curve_peak_minute,
            "applied_weights": row.applied_weights.to_string(),
            "suppressed": row.suppressed,
            "suppression_reason": row.suppression_reason,
            "suppression_until": row.suppression_until.map(|t| t.format(TS_FORMAT).to_string()),
            "hot_path_signal": row.hot_path_signal,
            "hot_path_weight": row.hot_path_weight,
            "created_at_utc": row.created_at_utc.format(TS_FORMAT).to_string(),
        });
        let insert_sql = format!("INSERT INTO timing_explanations FORMAT JSONEachRow {json}");
        self.client
            .query(&insert_sql)
            .execute()
            .await
            .map_err(backend)?;
        metrics::counter!("event_store.explanations").increment(1);
        Ok(())
    }
}
