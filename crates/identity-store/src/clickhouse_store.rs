//! ClickHouse-backed identity store. `identity_graph` and
//! `resolved_identities` use ReplacingMergeTree for replacing-writer
//! semantics; `identity_audit_log` is a plain append-only MergeTree.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::Row;
use sendflow_core::config::ClickHouseConfig;
use sendflow_core::error::{SendFlowError, SendFlowResult};
use sendflow_core::types::{
    AuditRecord, Identifier, IdentifierType, IdentityEdge, ResolutionEntry, UniversalId,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::store::IdentityStore;

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub struct ClickHouseIdentityStore {
    client: clickhouse::Client,
}

impl ClickHouseIdentityStore {
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
                "CREATE TABLE IF NOT EXISTS identity_graph (
                    identifier_a String,
                    type_a String,
                    identifier_b String,
                    type_b String,
                    weight Float64,
                    source String,
                    created_at DateTime64(3),
                    updated_at DateTime64(3)
                ) ENGINE = ReplacingMergeTree(updated_at)
                ORDER BY (identifier_a, identifier_b)",
            )
            .execute()
            .await?;

        client
            .query(
                "CREATE TABLE IF NOT EXISTS resolved_identities (
                    identifier String,
                    type String,
                    universal_id String,
                    confidence Float64,
                    last_seen DateTime64(3),
                    created_at DateTime64(3)
                ) ENGINE = ReplacingMergeTree(last_seen)
                ORDER BY (identifier, type)",
            )
            .execute()
            .await?;

        client
            .query(
                "CREATE TABLE IF NOT EXISTS identity_audit_log (
                    resolution_id UUID,
                    universal_id String,
                    input_identifier String,
                    input_type String,
                    step String,
                    confidence Float64,
                    created_at DateTime64(3)
                ) ENGINE = MergeTree()
                ORDER BY (resolution_id, created_at)",
            )
            .execute()
            .await?;

        info!("ClickHouse identity store schema verified");
        Ok(())
    }
}

#[derive(Debug, Row, Deserialize)]
struct EdgeRow {
    identifier_a: String,
    type_a: String,
    identifier_b: String,
    type_b: String,
    weight: f64,
    source: String,
    created_ms: i64,
    updated_ms: i64,
}

#[derive(Debug, Row, Deserialize)]
struct ResolutionRow {
    identifier: String,
    id_type: String,
    universal_id: String,
    confidence: f64,
    last_seen_ms: i64,
    created_ms: i64,
}

#[derive(Debug, Row, Deserialize)]
struct AuditRow {
    resolution_id: String,
    universal_id: String,
    input_identifier: String,
    input_type: String,
    step: String,
    confidence: f64,
    created_ms: i64,
}

fn backend(e: clickhouse::error::Error) -> SendFlowError {
    SendFlowError::BackendUnavailable(format!("clickhouse: {e}"))
}

fn millis_to_utc(ms: i64) -> SendFlowResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| SendFlowError::Internal(anyhow::anyhow!("timestamp out of range: {ms}")))
}

fn parse_type(s: &str) -> SendFlowResult<IdentifierType> {
    IdentifierType::parse(s)
        .ok_or_else(|| SendFlowError::Internal(anyhow::anyhow!("unknown identifier type: {s}")))
}

impl TryFrom<EdgeRow> for IdentityEdge {
    type Error = SendFlowError;

    fn try_from(row: EdgeRow) -> Result<Self, Self::Error> {
        Ok(IdentityEdge {
            a: Identifier::new(parse_type(&row.type_a)?, row.identifier_a),
            b: Identifier::new(parse_type(&row.type_b)?, row.identifier_b),
            weight: row.weight,
            source: row.source,
            created_at: millis_to_utc(row.created_ms)?,
            updated_at: millis_to_utc(row.updated_ms)?,
        })
    }
}

impl TryFrom<ResolutionRow> for ResolutionEntry {
    type Error = SendFlowError;

    fn try_from(row: ResolutionRow) -> Result<Self, Self::Error> {
        Ok(ResolutionEntry {
            identifier: Identifier::new(parse_type(&row.id_type)?, row.identifier),
            universal_id: UniversalId::from_string(row.universal_id),
            confidence: row.confidence,
            last_seen: millis_to_utc(row.last_seen_ms)?,
            created_at: millis_to_utc(row.created_ms)?,
        })
    }
}

#[async_trait]
impl IdentityStore for ClickHouseIdentityStore {
    async fn upsert_edge(&self, edge: &IdentityEdge) -> SendFlowResult<()> {
        // Canonical unordered pair: smaller identifier key in column a.
        let (first, second) = if edge.a.key() <= edge.b.key() {
            (&edge.a, &edge.b)
        } else {
            (&edge.b, &edge.a)
        };

        // Read the current row so the replacing write keeps the maximum
        // weight and the original created_at.
        let existing: Vec<EdgeRow> = self
            .client
            .query(
                "SELECT identifier_a, type_a, identifier_b, type_b, weight, source,
                        toUnixTimestamp64Milli(created_at) AS created_ms,
                        toUnixTimestamp64Milli(updated_at) AS updated_ms
                 FROM identity_graph FINAL
                 WHERE identifier_a = ? AND identifier_b = ?",
            )
            .bind(&first.value)
            .bind(&second.value)
            .fetch_all()
            .await
            .map_err(backend)?;

        let (weight, created_at) = match existing.first() {
            Some(row) => (row.weight.max(edge.weight), millis_to_utc(row.created_ms)?),
            None => (edge.weight, edge.created_at),
        };

        let json = serde_json::json!({
            "identifier_a": first.value,
            "type_a": first.id_type.as_str(),
            "identifier_b": second.value,
            "type_b": second.id_type.as_str(),
            "weight": weight,
            "source": edge.source,
            "created_at": created_at.format(TS_FORMAT).to_string(),
            "updated_at": edge.updated_at.format(TS_FORMAT).to_string(),
        });
        self.client
            .query(&format!(
                "INSERT INTO identity_graph FORMAT JSONEachRow {json}"
            ))
            .execute()
            .await
            .map_err(backend)?;
        metrics::counter!("identity_store.edges_upserted").increment(1);
        Ok(())
    }

    async fn edges_for(&self, identifier: &Identifier) -> SendFlowResult<Vec<IdentityEdge>> {
        let rows: Vec<EdgeRow> = self
            .client
            .query(
                "SELECT identifier_a, type_a, identifier_b, type_b, weight, source,
                        toUnixTimestamp64Milli(created_at) AS created_ms,
                        toUnixTimestamp64Milli(updated_at) AS updated_ms
                 FROM identity_graph FINAL
                 WHERE (identifier_a = ? AND type_a = ?)
                    OR (identifier_b = ? AND type_b = ?)",
            )
            .bind(&identifier.value)
            .bind(identifier.id_type.as_str())
            .bind(&identifier.value)
            .bind(identifier.id_type.as_str())
            .fetch_all()
            .await
            .map_err(backend)?;

        rows.into_iter().map(IdentityEdge::try_from).collect()
    }

    async fn get_resolution(
        &self,
        identifier: &Identifier,
    ) -> SendFlowResult<Option<ResolutionEntry>> {
        let rows: Vec<ResolutionRow> = self
            .client
            .query(
                "SELECT identifier, type AS id_type, universal_id, confidence,
                        toUnixTimestamp64Milli(last_seen) AS last_seen_ms,
                        toUnixTimestamp64Milli(created_at) AS created_ms
                 FROM resolved_identities FINAL
                 WHERE identifier = ? AND type = ?",
            )
            .bind(&identifier.value)
            .bind(identifier.id_type.as_str())
            .fetch_all()
            .await
            .map_err(backend)?;

        rows.into_iter().next().map(ResolutionEntry::try_from).transpose()
    }

    async fn upsert_resolution(&self, entry: &ResolutionEntry) -> SendFlowResult<()> {
        // Preserve the first created_at across replacing writes.
        let created_at = match self.get_resolution(&entry.identifier).await? {
            Some(existing) => existing.created_at.min(entry.created_at),
            None => entry.created_at,
        };

        let json = serde_json::json!({
            "identifier": entry.identifier.value,
            "type": entry.identifier.id_type.as_str(),
            "universal_id": entry.universal_id.as_str(),
            "confidence": entry.confidence,
            "last_seen": entry.last_seen.format(TS_FORMAT).to_string(),
            "created_at": created_at.format(TS_FORMAT).to_string(),
        });
        self.client
            .query(&format!(
                "INSERT INTO resolved_identities FORMAT JSONEachRow {json}"
            ))
            .execute()
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn resolutions_for_universal(
        &self,
        universal_id: &UniversalId,
    ) -> SendFlowResult<Vec<ResolutionEntry>> {
        let rows: Vec<ResolutionRow> = self
            .client
            .query(
                "SELECT identifier, type AS id_type, universal_id, confidence,
                        toUnixTimestamp64Milli(last_seen) AS last_seen_ms,
                        toUnixTimestamp64Milli(created_at) AS created_ms
                 FROM resolved_identities FINAL
                 WHERE universal_id = ?",
            )
            .bind(universal_id.as_str())
            .fetch_all()
            .await
            .map_err(backend)?;

        rows.into_iter().map(ResolutionEntry::try_from).collect()
    }

    async fn append_audit(&self, record: &AuditRecord) -> SendFlowResult<()> {
        let json = serde_json::json!({
            "resolution_id": record.resolution_id.to_string(),
            "universal_id": record.universal_id.as_str(),
            "input_identifier": record.input_identifier,
            "input_type": record.input_type.as_str(),
            "step": record.step,
            "confidence": record.confidence,
            "created_at": record.created_at.format(TS_FORMAT).to_string(),
        });
        self.client
            .query(&format!(
                "INSERT INTO identity_audit_log FORMAT JSONEachRow {json}"
            ))
            .execute()
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn audit_trail(&self, resolution_id: Uuid) -> SendFlowResult<Vec<AuditRecord>> {
        let rows: Vec<AuditRow> = self
            .client
            .query(
                "SELECT toString(resolution_id) AS resolution_id, universal_id,
                        input_identifier, input_type, step, confidence,
                        toUnixTimestamp64Milli(created_at) AS created_ms
                 FROM identity_audit_log
                 WHERE resolution_id = ?
                 ORDER BY created_at ASC",
            )
            .bind(resolution_id.to_string())
            .fetch_all()
            .await
            .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                Ok(AuditRecord {
                    resolution_id: Uuid::parse_str(&row.resolution_id).map_err(|e| {
                        SendFlowError::Internal(anyhow::anyhow!("bad resolution id: {e}"))
                    })?,
                    universal_id: UniversalId::from_string(row.universal_id),
                    input_identifier: row.input_identifier,
                    input_type: parse_type(&row.input_type)?,
                    step: row.step,
                    confidence: row.confidence,
                    created_at: millis_to_utc(row.created_ms)?,
                })
            })
            .collect()
    }
}
