use serde::Deserialize;

use crate::types::{EventType, IdentifierType};

/// Root application configuration. Loaded from environment variables with
/// the prefix `SENDFLOW__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    #[serde(default = "default_dlq_subject")]
    pub dlq_subject: String,
    #[serde(default = "default_nats_max_reconnects")]
    pub max_reconnects: usize,
}

impl NatsConfig {
    /// Subject carrying one partition of the inbound event log.
    pub fn partition_subject(&self, partition: u32) -> String {
        format!("{}.events.{}", self.stream_name, partition)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    #[serde(default = "default_clickhouse_url")]
    pub url: String,
    #[serde(default = "default_clickhouse_db")]
    pub database: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

/// Identity resolver knobs (§ identity graph traversal and normalization).
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_phone_region")]
    pub phone_default_region: String,
    #[serde(default = "default_bfs_depth")]
    pub bfs_depth: u32,
    #[serde(default = "default_bfs_budget")]
    pub bfs_budget: u32,
    /// When false the resolver fails with `IdentityUnresolved` instead of
    /// synthesizing a new Universal ID.
    #[serde(default = "default_synthesize_missing")]
    pub synthesize_missing: bool,
    #[serde(default = "default_klaviyo_weight")]
    pub klaviyo_id_weight: f64,
    #[serde(default = "default_shopify_weight")]
    pub shopify_customer_id_weight: f64,
    #[serde(default = "default_esp_user_weight")]
    pub esp_user_id_weight: f64,
    #[serde(default = "default_ip_device_weight")]
    pub ip_device_signature_weight: f64,
}

impl IdentityConfig {
    /// Default weight for an identifier type, with config overrides for the
    /// probabilistic types.
    pub fn weight_for(&self, id_type: IdentifierType) -> f64 {
        match id_type {
            IdentifierType::KlaviyoId => self.klaviyo_id_weight,
            IdentifierType::ShopifyCustomerId => self.shopify_customer_id_weight,
            IdentifierType::EspUserId => self.esp_user_id_weight,
            IdentifierType::IpDeviceSignature => self.ip_device_signature_weight,
            _ => id_type.default_weight(),
        }
    }

    /// Probabilistic lookup order: highest default weight first.
    pub fn probabilistic_priority(&self) -> Vec<IdentifierType> {
        let mut types = vec![
            IdentifierType::KlaviyoId,
            IdentifierType::ShopifyCustomerId,
            IdentifierType::EspUserId,
            IdentifierType::IpDeviceSignature,
        ];
        types.sort_by(|a, b| {
            self.weight_for(*b)
                .partial_cmp(&self.weight_for(*a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        types
    }
}

/// Engagement feature engine knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct FeatureConfig {
    #[serde(default = "default_smoothing_sigma")]
    pub smoothing_sigma_minutes: f64,
    #[serde(default = "default_laplace_alpha")]
    pub laplace_alpha: f64,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default = "default_primary_event_type")]
    pub primary_event_type: String,
    /// Fall back to `opened` when fewer primary events than this exist.
    #[serde(default = "default_fallback_min_events")]
    pub fallback_min_events: usize,
    #[serde(default = "default_curve_cache_max_age")]
    pub curve_cache_max_age_seconds: u64,
}

/// Timing decision engine knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct DecisionConfig {
    #[serde(default = "default_hot_path_window_minutes")]
    pub hot_path_window_minutes: i64,
    #[serde(default = "default_hot_path_event_types")]
    pub hot_path_event_types: Vec<String>,
    #[serde(default = "default_support_ticket_hours")]
    pub support_ticket_window_hours: u32,
    #[serde(default = "default_complaint_hours")]
    pub complaint_window_hours: u32,
    #[serde(default = "default_unsubscribe_request_hours")]
    pub unsubscribe_request_window_hours: u32,
    /// Spam reports suppress permanently; modeled as a 100-year window so
    /// every suppressed decision carries a concrete `suppression_until`.
    #[serde(default = "default_spam_report_hours")]
    pub spam_report_window_hours: u32,
    #[serde(default = "default_latency_seconds")]
    pub default_latency_seconds: f64,
    #[serde(default = "default_latency_clamp_min")]
    pub latency_clamp_min_seconds: f64,
    #[serde(default = "default_latency_clamp_max")]
    pub latency_clamp_max_seconds: f64,
    #[serde(default = "default_soft_deadline_ms")]
    pub soft_deadline_ms: u64,
    #[serde(default = "default_hard_deadline_ms")]
    pub hard_deadline_ms: u64,
    #[serde(default = "default_model_version")]
    pub model_version: String,
}

impl DecisionConfig {
    /// Cooling-off window for a circuit-breaker event type, in hours.
    pub fn breaker_window_hours(&self, event_type: EventType) -> Option<u32> {
        match event_type {
            EventType::SupportTicket => Some(self.support_ticket_window_hours),
            EventType::Complained => Some(self.complaint_window_hours),
            EventType::UnsubscribeRequest => Some(self.unsubscribe_request_window_hours),
            EventType::SpamReport => Some(self.spam_report_window_hours),
            _ => None,
        }
    }

    pub fn is_hot_path(&self, event_type: EventType) -> bool {
        self.hot_path_event_types
            .iter()
            .any(|t| t == event_type.as_str())
    }
}

/// Ingestion pipeline knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_nats_urls() -> Vec<String> {
    vec!["nats://localhost:4222".to_string()]
}
fn default_stream_name() -> String {
    "sendflow".to_string()
}
fn default_partitions() -> u32 {
    8
}
fn default_dlq_subject() -> String {
    "sendflow.events.dlq".to_string()
}
fn default_nats_max_reconnects() -> usize {
    60
}
fn default_redis_urls() -> Vec<String> {
    vec!["redis://localhost:6379".to_string()]
}
fn default_pool_size() -> u32 {
    32
}
fn default_cache_ttl_secs() -> u64 {
    86_400
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}
fn default_clickhouse_db() -> String {
    "sendflow".to_string()
}
fn default_batch_size() -> usize {
    10_000
}
fn default_flush_interval_ms() -> u64 {
    1000
}
fn default_phone_region() -> String {
    "US".to_string()
}
fn default_bfs_depth() -> u32 {
    3
}
fn default_bfs_budget() -> u32 {
    128
}
fn default_synthesize_missing() -> bool {
    true
}
fn default_klaviyo_weight() -> f64 {
    0.95
}
fn default_shopify_weight() -> f64 {
    0.90
}
fn default_esp_user_weight() -> f64 {
    0.85
}
fn default_ip_device_weight() -> f64 {
    0.50
}
fn default_smoothing_sigma() -> f64 {
    30.0
}
fn default_laplace_alpha() -> f64 {
    1.0
}
fn default_lookback_days() -> u32 {
    90
}
fn default_primary_event_type() -> String {
    "clicked".to_string()
}
fn default_fallback_min_events() -> usize {
    5
}
fn default_curve_cache_max_age() -> u64 {
    3600
}
fn default_hot_path_window_minutes() -> i64 {
    30
}
fn default_hot_path_event_types() -> Vec<String> {
    vec![
        "site_visit".to_string(),
        "sms_click".to_string(),
        "product_view".to_string(),
        "cart_add".to_string(),
        "search_performed".to_string(),
    ]
}
fn default_support_ticket_hours() -> u32 {
    48
}
fn default_complaint_hours() -> u32 {
    48
}
fn default_unsubscribe_request_hours() -> u32 {
    168
}
fn default_spam_report_hours() -> u32 {
    876_000
}
fn default_latency_seconds() -> f64 {
    120.0
}
fn default_latency_clamp_min() -> f64 {
    1.0
}
fn default_latency_clamp_max() -> f64 {
    3600.0
}
fn default_soft_deadline_ms() -> u64 {
    200
}
fn default_hard_deadline_ms() -> u64 {
    1000
}
fn default_model_version() -> String {
    "heuristic-v1".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_base_ms() -> u64 {
    100
}
fn default_retry_max_ms() -> u64 {
    5000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: default_nats_urls(),
            stream_name: default_stream_name(),
            partitions: default_partitions(),
            dlq_subject: default_dlq_subject(),
            max_reconnects: default_nats_max_reconnects(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            urls: default_redis_urls(),
            pool_size: default_pool_size(),
            ttl_secs: default_cache_ttl_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: default_clickhouse_url(),
            database: default_clickhouse_db(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            phone_default_region: default_phone_region(),
            bfs_depth: default_bfs_depth(),
            bfs_budget: default_bfs_budget(),
            synthesize_missing: default_synthesize_missing(),
            klaviyo_id_weight: default_klaviyo_weight(),
            shopify_customer_id_weight: default_shopify_weight(),
            esp_user_id_weight: default_esp_user_weight(),
            ip_device_signature_weight: default_ip_device_weight(),
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            smoothing_sigma_minutes: default_smoothing_sigma(),
            laplace_alpha: default_laplace_alpha(),
            lookback_days: default_lookback_days(),
            primary_event_type: default_primary_event_type(),
            fallback_min_events: default_fallback_min_events(),
            curve_cache_max_age_seconds: default_curve_cache_max_age(),
        }
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            hot_path_window_minutes: default_hot_path_window_minutes(),
            hot_path_event_types: default_hot_path_event_types(),
            support_ticket_window_hours: default_support_ticket_hours(),
            complaint_window_hours: default_complaint_hours(),
            unsubscribe_request_window_hours: default_unsubscribe_request_hours(),
            spam_report_window_hours: default_spam_report_hours(),
            default_latency_seconds: default_latency_seconds(),
            latency_clamp_min_seconds: default_latency_clamp_min(),
            latency_clamp_max_seconds: default_latency_clamp_max(),
            soft_deadline_ms: default_soft_deadline_ms(),
            hard_deadline_ms: default_hard_deadline_ms(),
            model_version: default_model_version(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            nats: NatsConfig::default(),
            redis: RedisConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            identity: IdentityConfig::default(),
            features: FeatureConfig::default(),
            decision: DecisionConfig::default(),
            ingestion: IngestionConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("SENDFLOW")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_spec() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.features.smoothing_sigma_minutes, 30.0);
        assert_eq!(cfg.features.laplace_alpha, 1.0);
        assert_eq!(cfg.features.lookback_days, 90);
        assert_eq!(cfg.features.primary_event_type, "clicked");
        assert_eq!(cfg.identity.bfs_depth, 3);
        assert_eq!(cfg.identity.bfs_budget, 128);
        assert_eq!(cfg.decision.default_latency_seconds, 120.0);
        assert_eq!(cfg.decision.hot_path_window_minutes, 30);
        assert_eq!(cfg.decision.support_ticket_window_hours, 48);
        assert_eq!(cfg.decision.unsubscribe_request_window_hours, 168);
    }

    #[test]
    fn test_probabilistic_priority_order() {
        let cfg = IdentityConfig::default();
        assert_eq!(
            cfg.probabilistic_priority(),
            vec![
                IdentifierType::KlaviyoId,
                IdentifierType::ShopifyCustomerId,
                IdentifierType::EspUserId,
                IdentifierType::IpDeviceSignature,
            ]
        );
    }

    #[test]
    fn test_breaker_windows() {
        let cfg = DecisionConfig::default();
        assert_eq!(cfg.breaker_window_hours(EventType::SupportTicket), Some(48));
        assert_eq!(
            cfg.breaker_window_hours(EventType::UnsubscribeRequest),
            Some(168)
        );
        assert_eq!(
            cfg.breaker_window_hours(EventType::SpamReport),
            Some(876_000)
        );
        assert_eq!(cfg.breaker_window_hours(EventType::Clicked), None);
    }

    #[test]
    fn test_hot_path_config() {
        let cfg = DecisionConfig::default();
        assert!(cfg.is_hot_path(EventType::SiteVisit));
        assert!(cfg.is_hot_path(EventType::SearchPerformed));
        assert!(!cfg.is_hot_path(EventType::Opened));
    }

    #[test]
    fn test_partition_subject() {
        let cfg = NatsConfig::default();
        assert_eq!(cfg.partition_subject(3), "sendflow.events.3");
    }
}
