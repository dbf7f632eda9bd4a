use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a recipient identifier. Deterministic types always carry weight
/// 1.0; probabilistic types carry a configurable default weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    EmailHash,
    PhoneNumber,
    KlaviyoId,
    ShopifyCustomerId,
    EspUserId,
    IpDeviceSignature,
    UniversalId,
}

impl IdentifierType {
    pub fn is_deterministic(&self) -> bool {
        matches!(self, Self::EmailHash | Self::PhoneNumber | Self::UniversalId)
    }

    /// Built-in default weight, overridable through `IdentityConfig`.
    pub fn default_weight(&self) -> f64 {
        match self {
            Self::EmailHash | Self::PhoneNumber | Self::UniversalId => 1.0,
            Self::KlaviyoId => 0.95,
            Self::ShopifyCustomerId => 0.90,
            Self::EspUserId => 0.85,
            Self::IpDeviceSignature => 0.50,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailHash => "email_hash",
            Self::PhoneNumber => "phone_number",
            Self::KlaviyoId => "klaviyo_id",
            Self::ShopifyCustomerId => "shopify_customer_id",
            Self::EspUserId => "esp_user_id",
            Self::IpDeviceSignature => "ip_device_signature",
            Self::UniversalId => "universal_id",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email_hash" => Some(Self::EmailHash),
            "phone_number" => Some(Self::PhoneNumber),
            "klaviyo_id" => Some(Self::KlaviyoId),
            "shopify_customer_id" => Some(Self::ShopifyCustomerId),
            "esp_user_id" => Some(Self::EspUserId),
            "ip_device_signature" => Some(Self::IpDeviceSignature),
            "universal_id" => Some(Self::UniversalId),
            _ => None,
        }
    }
}

impl std::fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized `(type, value)` identifier pair. Values are opaque strings;
/// normalization happens before construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub id_type: IdentifierType,
    pub value: String,
}

impl Identifier {
    pub fn new(id_type: IdentifierType, value: impl Into<String>) -> Self {
        Self {
            id_type,
            value: value.into(),
        }
    }

    /// Unique index key, `type:value`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.id_type.as_str(), self.value)
    }
}

/// Stable opaque token identifying one subject across all identifiers bound
/// to them. Created once, never reassigned, never destroyed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniversalId(String);

impl UniversalId {
    pub const PREFIX: &'static str = "sf_";

    /// Generate a fresh Universal ID: `sf_` plus 16 hex chars from the OS
    /// cryptographic RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let suffix: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        Self(format!("{}{}", Self::PREFIX, suffix))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UniversalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UniversalId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Engagement event types flowing through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Complained,
    Unsubscribed,
    SiteVisit,
    SmsClick,
    ProductView,
    CartAdd,
    SearchPerformed,
    SupportTicket,
    UnsubscribeRequest,
    SpamReport,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Bounced => "bounced",
            Self::Complained => "complained",
            Self::Unsubscribed => "unsubscribed",
            Self::SiteVisit => "site_visit",
            Self::SmsClick => "sms_click",
            Self::ProductView => "product_view",
            Self::CartAdd => "cart_add",
            Self::SearchPerformed => "search_performed",
            Self::SupportTicket => "support_ticket",
            Self::UnsubscribeRequest => "unsubscribe_request",
            Self::SpamReport => "spam_report",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "opened" => Some(Self::Opened),
            "clicked" => Some(Self::Clicked),
            "bounced" => Some(Self::Bounced),
            "complained" => Some(Self::Complained),
            "unsubscribed" => Some(Self::Unsubscribed),
            "site_visit" => Some(Self::SiteVisit),
            "sms_click" => Some(Self::SmsClick),
            "product_view" => Some(Self::ProductView),
            "cart_add" => Some(Self::CartAdd),
            "search_performed" => Some(Self::SearchPerformed),
            "support_ticket" => Some(Self::SupportTicket),
            "unsubscribe_request" => Some(Self::UnsubscribeRequest),
            "spam_report" => Some(Self::SpamReport),
            _ => None,
        }
    }

    /// Hot paths temporarily raise propensity in the minutes after they occur.
    pub fn is_hot_path(&self) -> bool {
        matches!(
            self,
            Self::SiteVisit
                | Self::SmsClick
                | Self::ProductView
                | Self::CartAdd
                | Self::SearchPerformed
        )
    }

    /// Circuit breakers force suppression for a cooling-off window.
    pub fn is_circuit_breaker(&self) -> bool {
        matches!(
            self,
            Self::SupportTicket | Self::Complained | Self::UnsubscribeRequest | Self::SpamReport
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized engagement event row, keyed by
/// `(esp, universal_id, timestamp, event_type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub esp: String,
    pub universal_id: UniversalId,
    pub timestamp: DateTime<Utc>,
    /// 64 lowercase hex chars; the plain address is never stored.
    pub recipient_email_hash: Option<String>,
    pub campaign_id: Option<String>,
    pub message_id: Option<String>,
    /// Free-form provider metadata; bot flags live here
    /// (`suspected_bot`, `bot_reasons`).
    #[serde(default)]
    pub metadata: serde_json::Value,
    // Latency-model training features, extracted at ingest (all nullable).
    pub latency_seconds: Option<f64>,
    pub send_time: Option<DateTime<Utc>>,
    pub hour_of_day: Option<u8>,
    pub minute: Option<u8>,
    pub day_of_week: Option<u8>,
    pub campaign_type: Option<String>,
    pub payload_size_bytes: Option<u64>,
    pub queue_depth_estimate: Option<u64>,
}

/// Undirected identity-graph relation between two identifiers. Stored keyed
/// on the unordered pair; re-inserts keep the maximum weight seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityEdge {
    pub a: Identifier,
    pub b: Identifier,
    pub weight: f64,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdentityEdge {
    pub fn new(a: Identifier, b: Identifier, weight: f64, source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            a,
            b,
            weight,
            source: source.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Canonical unordered-pair key, smaller identifier key first.
    pub fn pair_key(&self) -> (String, String) {
        let (ka, kb) = (self.a.key(), self.b.key());
        if ka <= kb {
            (ka, kb)
        } else {
            (kb, ka)
        }
    }

    /// Edge weight per the data model: 1.0 when either endpoint is a
    /// deterministic type, otherwise the supplied weight.
    pub fn effective_weight(a: &Identifier, b: &Identifier, supplied: f64) -> f64 {
        if a.id_type.is_deterministic() || b.id_type.is_deterministic() {
            1.0
        } else {
            supplied
        }
    }
}

/// Resolution cache row mapping one identifier to a Universal ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionEntry {
    pub identifier: Identifier,
    pub universal_id: UniversalId,
    /// Minimum edge weight along the derivation path (1.0 for direct
    /// deterministic hits).
    pub confidence: f64,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit row; the records sharing a `resolution_id` reconstruct
/// one resolution derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub resolution_id: Uuid,
    pub universal_id: UniversalId,
    pub input_identifier: String,
    pub input_type: IdentifierType,
    pub step: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one resolver call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub universal_id: UniversalId,
    pub confidence: f64,
    pub resolution_id: Uuid,
    /// True when a new Universal ID was synthesized for this subject.
    pub created: bool,
    pub steps: Vec<String>,
}

/// Ephemeral context row consumed by the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSignal {
    pub universal_id: UniversalId,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub weight: Option<f64>,
    pub provider: Option<String>,
}

/// One contextual weight applied to the engagement curve, kept for the
/// decision's explanation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedWeight {
    pub signal: EventType,
    pub magnitude: f64,
    pub minutes_ago: i64,
}

/// Append-only timing decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingDecision {
    pub decision_id: Uuid,
    pub universal_id: UniversalId,
    /// Slot in `[0, 10079]` the message should land on.
    pub target_minute: u32,
    /// Instant the delivery gateway should fire.
    pub trigger_timestamp_utc: DateTime<Utc>,
    pub latency_estimate_seconds: f64,
    pub confidence_score: f64,
    pub model_version: String,
    pub base_curve_peak_minute: u32,
    pub applied_weights: Vec<AppliedWeight>,
    pub suppressed: bool,
    pub suppression_reason: Option<String>,
    pub suppression_until: Option<DateTime<Utc>>,
    pub explanation_ref: String,
    pub created_at: DateTime<Utc>,
}

/// Row shape of the append-only `timing_explanations` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingExplanation {
    pub decision_id: Uuid,
    pub explanation_ref: String,
    pub universal_id: UniversalId,
    pub target_minute: u32,
    pub trigger_timestamp_utc: DateTime<Utc>,
    pub latency_estimate_seconds: f64,
    pub confidence_score: f64,
    pub model_version: String,
    pub base_curve_peak_minute: u32,
    pub applied_weights: serde_json::Value,
    pub suppressed: bool,
    pub suppression_reason: Option<String>,
    pub suppression_until: Option<DateTime<Utc>>,
    pub hot_path_signal: Option<String>,
    pub hot_path_weight: Option<f64>,
    pub created_at_utc: DateTime<Utc>,
}

impl TimingExplanation {
    /// Flatten a decision into its explanation row. The strongest hot-path
    /// signal is denormalized into dedicated columns for dashboard filters.
    pub fn from_decision(decision: &TimingDecision) -> Self {
        let strongest = decision
            .applied_weights
            .iter()
            .max_by(|a, b| {
                a.magnitude
                    .partial_cmp(&b.magnitude)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        Self {
            decision_id: decision.decision_id,
            explanation_ref: decision.explanation_ref.clone(),
            universal_id: decision.universal_id.clone(),
            target_minute: decision.target_minute,
            trigger_timestamp_utc: decision.trigger_timestamp_utc,
            latency_estimate_seconds: decision.latency_estimate_seconds,
            confidence_score: decision.confidence_score,
            model_version: decision.model_version.clone(),
            base_curve_peak_minute: decision.base_curve_peak_minute,
            applied_weights: serde_json::to_value(&decision.applied_weights)
                .unwrap_or(serde_json::Value::Null),
            suppressed: decision.suppressed,
            suppression_reason: decision.suppression_reason.clone(),
            suppression_until: decision.suppression_until,
            hot_path_signal: strongest.map(|w| w.signal.as_str().to_string()),
            hot_path_weight: strongest.map(|w| w.magnitude),
            created_at_utc: decision.created_at,
        }
    }
}

/// Raw identifier set accepted by the decision API and the ingestion
/// boundary, prior to normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentifierSet {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub klaviyo_id: Option<String>,
    pub shopify_customer_id: Option<String>,
    pub esp_user_id: Option<String>,
    pub ip_device_signature: Option<String>,
}

impl IdentifierSet {
    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.phone.is_none()
            && self.klaviyo_id.is_none()
            && self.shopify_customer_id.is_none()
            && self.esp_user_id.is_none()
            && self.ip_device_signature.is_none()
    }
}

/// Synchronous decision request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub identifiers: IdentifierSet,
    pub send_after: Option<DateTime<Utc>>,
    pub send_before: Option<DateTime<Utc>>,
    pub latency_estimate_seconds: Option<f64>,
}

/// Raw inbound event envelope as it arrives from adapters. Required fields
/// are optional here so that validation (not deserialization) rejects them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    pub timestamp: Option<String>,
    pub esp: Option<String>,
    pub universal_id: Option<String>,
    pub recipient_email: Option<String>,
    pub campaign_id: Option<String>,
    pub message_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Dead-letter payload published alongside the main log transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub error: String,
    pub original_key: Option<String>,
    pub original_value: String,
    pub partition: u32,
    pub offset: u64,
    pub ingested_at: DateTime<Utc>,
}

/// Rolling engagement counters kept next to the cached curve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngagementCounters {
    pub opens_1d: u64,
    pub opens_7d: u64,
    pub opens_30d: u64,
    pub clicks_1d: u64,
    pub clicks_7d: u64,
    pub clicks_30d: u64,
    pub first_open: Option<DateTime<Utc>>,
    pub last_open: Option<DateTime<Utc>>,
    pub first_click: Option<DateTime<Utc>>,
    pub last_click: Option<DateTime<Utc>>,
}

/// One entry of the top-K peak summary kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakWindow {
    pub slot: u32,
    pub probability: f64,
    pub label: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_universal_id_shape() {
        let id = UniversalId::generate();
        assert!(id.as_str().starts_with("sf_"));
        assert_eq!(id.as_str().len(), 3 + 16);
        assert!(id.as_str()[3..].chars().all(|c| c.is_ascii_hexdigit()));

        let other = UniversalId::generate();
        assert_ne!(id, other);
    }

    #[test]
    fn test_identifier_type_weights() {
        assert_eq!(IdentifierType::EmailHash.default_weight(), 1.0);
        assert_eq!(IdentifierType::PhoneNumber.default_weight(), 1.0);
        assert_eq!(IdentifierType::KlaviyoId.default_weight(), 0.95);
        assert_eq!(IdentifierType::IpDeviceSignature.default_weight(), 0.50);
        assert!(IdentifierType::EmailHash.is_deterministic());
        assert!(!IdentifierType::KlaviyoId.is_deterministic());
    }

    #[test]
    fn test_edge_pair_key_is_unordered() {
        let a = Identifier::new(IdentifierType::EmailHash, "aaa");
        let b = Identifier::new(IdentifierType::KlaviyoId, "k_1");
        let e1 = IdentityEdge::new(a.clone(), b.clone(), 0.95, "test");
        let e2 = IdentityEdge::new(b, a, 0.95, "test");
        assert_eq!(e1.pair_key(), e2.pair_key());
    }

    #[test]
    fn test_edge_effective_weight() {
        let det = Identifier::new(IdentifierType::EmailHash, "h");
        let prob = Identifier::new(IdentifierType::EspUserId, "u");
        let prob2 = Identifier::new(IdentifierType::IpDeviceSignature, "sig");
        assert_eq!(IdentityEdge::effective_weight(&det, &prob, 0.3), 1.0);
        assert_eq!(IdentityEdge::effective_weight(&prob, &prob2, 0.5), 0.5);
    }

    #[test]
    fn test_event_type_roundtrip() {
        for s in [
            "sent",
            "clicked",
            "site_visit",
            "support_ticket",
            "unsubscribe_request",
            "spam_report",
        ] {
            let et = EventType::parse(s).unwrap();
            assert_eq!(et.as_str(), s);
        }
        assert!(EventType::parse("nonsense").is_none());
    }

    #[test]
    fn test_event_classification() {
        assert!(EventType::SiteVisit.is_hot_path());
        assert!(EventType::CartAdd.is_hot_path());
        assert!(!EventType::Clicked.is_hot_path());
        assert!(EventType::SupportTicket.is_circuit_breaker());
        assert!(EventType::SpamReport.is_circuit_breaker());
        assert!(!EventType::Opened.is_circuit_breaker());
    }

    #[test]
    fn test_identifier_set_empty() {
        assert!(IdentifierSet::default().is_empty());
        let set = IdentifierSet {
            email: Some("a@b.com".into()),
            ..Default::default()
        };
        assert!(!set.is_empty());
    }

    #[test]
    fn test_explanation_denormalizes_strongest_signal() {
        let decision = TimingDecision {
            decision_id: Uuid::new_v4(),
            universal_id: UniversalId::from_string("sf_0011223344556677"),
            target_minute: 540,
            trigger_timestamp_utc: Utc::now(),
            latency_estimate_seconds: 120.0,
            confidence_score: 0.4,
            model_version: "heuristic-v1".into(),
            base_curve_peak_minute: 540,
            applied_weights: vec![
                AppliedWeight {
                    signal: EventType::SiteVisit,
                    magnitude: 1.43,
                    minutes_ago: 5,
                },
                AppliedWeight {
                    signal: EventType::ProductView,
                    magnitude: 0.7,
                    minutes_ago: 12,
                },
            ],
            suppressed: false,
            suppression_reason: None,
            suppression_until: None,
            explanation_ref: "exp_1".into(),
            created_at: Utc::now(),
        };

        let row = TimingExplanation::from_decision(&decision);
        assert_eq!(row.hot_path_signal.as_deref(), Some("site_visit"));
        assert_eq!(row.hot_path_weight, Some(1.43));
        assert!(row.applied_weights.is_array());
    }
}
