//! Per-message ingestion: deserialize, validate, resolve identity, hash
//! PII, flag bot traffic, extract latency-model features, and write to the
//! event store. The plain email address never reaches a persisted row.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sendflow_core::error::{SendFlowError, SendFlowResult};
use sendflow_core::types::{EngagementEvent, EventType, IdentifierSet, InboundEvent, UniversalId};
use sendflow_event_store::EventStore;
use sendflow_identity::{hash_email, IdentityResolver};
use sendflow_predictors::HeuristicLatencyPredictor;
use tracing::debug;

/// Apple Mail privacy proxy and scanner detection constants.
const APPLE_RANGE_FIRST_OCTET: u8 = 17;
const GOOGLE_RANGES: [(u8, u8); 2] = [(66, 102), (66, 249)];
const BOT_UA_MARKERS: [&str; 3] = ["bot", "crawler", "spider"];

/// Outcome of a bulk backfill run.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackfillReport {
    pub accepted: usize,
    pub rejected: usize,
}

pub struct IngestProcessor {
    resolver: Arc<IdentityResolver>,
    store: Arc<dyn EventStore>,
    latency_observer: Option<Arc<HeuristicLatencyPredictor>>,
}

impl IngestProcessor {
    pub fn new(resolver: Arc<IdentityResolver>, store: Arc<dyn EventStore>) -> Self {
        Self {
            resolver,
            store,
            latency_observer: None,
        }
    }

    /// Feed observed delivery latencies into the heuristic latency
    /// predictor as events stream through.
    pub fn with_latency_observer(mut self, observer: Arc<HeuristicLatencyPredictor>) -> Self {
        self.latency_observer = Some(observer);
        self
    }

    /// Deserialize, normalize, and insert one raw payload. Errors carry
    /// their retryable/poison classification.
    pub async fn process_payload(&self, payload: &[u8]) -> SendFlowResult<EngagementEvent> {
        let inbound: InboundEvent = serde_json::from_slice(payload)?;
        let event = self.normalize(inbound, Utc::now()).await?;
        self.store.insert_events(&[event.clone()]).await?;
        metrics::counter!("ingest.accepted").increment(1);
        Ok(event)
    }

    /// Validation, identity resolution, PII hashing, bot flagging, and
    /// feature extraction, without the store write.
    pub async fn normalize(
        &self,
        inbound: InboundEvent,
        now: DateTime<Utc>,
    ) -> SendFlowResult<EngagementEvent> {
        // Required fields, present and parseable.
        let event_id = inbound
            .event_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SendFlowError::InvalidInput("missing event_id".to_string()))?
            .to_string();
        let event_type = inbound
            .event_type
            .as_deref()
            .and_then(EventType::parse)
            .ok_or_else(|| {
                SendFlowError::InvalidInput(format!(
                    "missing or unknown event_type: {:?}",
                    inbound.event_type
                ))
            })?;
        let timestamp = inbound
            .timestamp
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| {
                SendFlowError::InvalidInput(format!(
                    "missing or unparseable timestamp: {:?}",
                    inbound.timestamp
                ))
            })?;

        // Identity resolution; adapters that already re-keyed on Universal
        // ID pass it through untouched.
        let universal_id = match inbound.universal_id.as_deref().filter(|s| !s.is_empty()) {
            Some(existing) => UniversalId::from_string(existing),
            None => {
                let set = identifier_set_from(&inbound);
                self.resolver.resolve(&set).await?.universal_id
            }
        };

        // PII hashing; the plain address is dropped here.
        let recipient_email_hash = inbound.recipient_email.as_deref().map(hash_email);

        // Bot flagging into metadata.
        let mut metadata = match inbound.metadata {
            serde_json::Value::Object(map) => serde_json::Value::Object(map),
            _ => serde_json::json!({}),
        };
        flag_bots(event_type, timestamp, now, &mut metadata);

        // Latency-model training features from metadata, all nullable.
        let latency_seconds = metadata.get("latency_seconds").and_then(|v| v.as_f64());
        if let (Some(observer), Some(latency)) = (&self.latency_observer, latency_seconds) {
            observer.observe(latency);
        }

        let event = EngagementEvent {
            event_id,
            event_type,
            esp: inbound.esp.unwrap_or_else(|| "unknown".to_string()),
            universal_id,
            timestamp,
            recipient_email_hash,
            campaign_id: inbound.campaign_id,
            message_id: inbound.message_id,
            latency_seconds,
            send_time: metadata
                .get("send_time")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
            hour_of_day: metadata
                .get("hour_of_day")
                .and_then(|v| v.as_u64())
                .map(|v| v as u8),
            minute: metadata.get("minute").and_then(|v| v.as_u64()).map(|v| v as u8),
            day_of_week: metadata
                .get("day_of_week")
                .and_then(|v| v.as_u64())
                .map(|v| v as u8),
            campaign_type: metadata
                .get("campaign_type")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            payload_size_bytes: metadata.get("payload_size_bytes").and_then(|v| v.as_u64()),
            queue_depth_estimate: metadata
                .get("queue_depth_estimate")
                .and_then(|v| v.as_u64()),
            metadata,
        };

        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            universal_id = %event.universal_id,
            "inbound event normalized"
        );
        Ok(event)
    }

    /// Bulk path: same per-event steps, no offset semantics. Idempotent
    /// through the store's `(esp, event_id, campaign_id)` deduplication.
    pub async fn backfill(&self, batch: Vec<InboundEvent>) -> BackfillReport {
        let now = Utc::now();
        let mut report = BackfillReport::default();
        let mut normalized = Vec::with_capacity(batch.len());

        for inbound in batch {
            match self.normalize(inbound, now).await {
                Ok(event) => normalized.push(event),
                Err(e) => {
                    metrics::counter!("ingest.backfill_rejected").increment(1);
                    debug!(error = %e, "backfill row rejected");
                    report.rejected += 1;
                }
            }
        }

        match self.store.insert_events(&normalized).await {
            Ok(()) => report.accepted = normalized.len(),
            Err(_) => report.rejected += normalized.len(),
        }
        report
    }
}

fn identifier_set_from(inbound: &InboundEvent) -> IdentifierSet {
    let meta_str = |key: &str| {
        inbound
            .metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    IdentifierSet {
        email: inbound.recipient_email.clone(),
        phone: meta_str("phone"),
        klaviyo_id: meta_str("klaviyo_id"),
        shopify_customer_id: meta_str("shopify_customer_id"),
        esp_user_id: meta_str("esp_user_id"),
        ip_device_signature: meta_str("ip_device_signature"),
    }
}

/// Bot heuristics: instant opens, the Apple Mail privacy proxy user agent,
/// known scanner IP ranges, and self-identified crawlers.
fn flag_bots(
    event_type: EventType,
    event_ts: DateTime<Utc>,
    now: DateTime<Utc>,
    metadata: &mut serde_json::Value,
) {
    let mut reasons: Vec<&str> = Vec::new();

    if event_type == EventType::Opened && (now - event_ts).num_seconds().abs() < 2 {
        reasons.push("instant_open");
    }

    let user_agent = metadata
        .get("user_agent")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    if let Some(idx) = user_agent.find("AppleWebKit") {
        if user_agent[idx..].contains("Mail/") {
            reasons.push("apple_mail_privacy_proxy");
        }
    }
    let ua_lower = user_agent.to_lowercase();
    if BOT_UA_MARKERS.iter().any(|m| ua_lower.contains(m)) {
        reasons.push("bot_user_agent");
    }

    if let Some(ip) = metadata.get("ip").and_then(|v| v.as_str()) {
        if is_scanner_ip(ip) {
            reasons.push("known_scanner_ip");
        }
    }

    if !reasons.is_empty() {
        metrics::counter!("ingest.bot_flagged").increment(1);
        if let Some(map) = metadata.as_object_mut() {
            map.insert("suspected_bot".to_string(), serde_json::json!(true));
            map.insert("bot_reasons".to_string(), serde_json::json!(reasons));
        }
    }
}

/// Apple 17.0.0.0/8, Google 66.102.0.0/16 and 66.249.0.0/16.
fn is_scanner_ip(ip: &str) -> bool {
    let octets: Vec<u8> = ip.split('.').filter_map(|o| o.parse().ok()).collect();
    if octets.len() != 4 {
        return false;
    }
    if octets[0] == APPLE_RANGE_FIRST_OCTET {
        return true;
    }
    GOOGLE_RANGES
        .iter()
        .any(|(a, b)| octets[0] == *a && octets[1] == *b)
}
