//! Feature cache gateway. Two-tier caching: LocalCache (L1) -> Redis (L2),
//! with a per-key single-flight guard so concurrent recomputes for the same
//! Universal ID collapse into one computation.

use crate::document::FeatureDocument;
use crate::local::LocalCache;
use dashmap::DashMap;
use redis::AsyncCommands;
use sendflow_core::config::RedisConfig;
use sendflow_core::error::{SendFlowError, SendFlowResult};
use sendflow_core::types::UniversalId;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Redis-backed feature cache with a local L1 layer. Runs L1-only when
/// constructed without a Redis connection (tests, single-node dev).
pub struct FeatureCache {
    client: Option<redis::Client>,
    local: Arc<LocalCache>,
    ttl_secs: u64,
    inflight: DashMap<String, Arc<OnceCell<Arc<FeatureDocument>>>>,
}

impl FeatureCache {
    /// Connect to Redis and verify connectivity.
    pub async fn new(config: &RedisConfig) -> anyhow::Result<Self> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        info!(url = %url, "Connecting to Redis");

        let client = redis::Client::open(url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(response = %pong, "Redis connection established");

        Ok(Self {
            client: Some(client),
            local: Arc::new(LocalCache::new(100_000)),
            ttl_secs: config.ttl_secs,
            inflight: DashMap::new(),
        })
    }

    /// L1-only cache without a Redis backend.
    pub fn in_memory(ttl_secs: u64) -> Self {
        Self {
            client: None,
            local: Arc::new(LocalCache::new(100_000)),
            ttl_secs,
            inflight: DashMap::new(),
        }
    }

    fn redis_key(universal_id: &UniversalId) -> String {
        format!("features:{}", universal_id.as_str())
    }

    /// Fetch a document no older than `max_age_seconds`. Checks L1, then L2.
    pub async fn get(
        &self,
        universal_id: &UniversalId,
        max_age_seconds: u64,
    ) -> Option<Arc<FeatureDocument>> {
        let now = chrono::Utc::now();

        if let Some(doc) = self.local.get(universal_id.as_str()) {
            if doc.age_seconds(now) <= max_age_seconds as i64 {
                metrics::counter!("cache.l1.hit").increment(1);
                return Some(doc);
            }
        }
        metrics::counter!("cache.l1.miss").increment(1);

        let client = self.client.as_ref()?;
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Redis unavailable, treating as cache miss");
                return None;
            }
        };
        let data: Option<String> = conn.get(Self::redis_key(universal_id)).await.ok()?;

        match data {
            Some(json) => {
                let doc: FeatureDocument = serde_json::from_str(&json).ok()?;
                if doc.age_seconds(now) > max_age_seconds as i64 {
                    metrics::counter!("cache.l2.stale").increment(1);
                    return None;
                }
                let doc = Arc::new(doc);
                self.local
                    .put(universal_id.as_str().to_string(), Arc::clone(&doc));
                metrics::counter!("cache.l2.hit").increment(1);
                Some(doc)
            }
            None => {
                metrics::counter!("cache.l2.miss").increment(1);
                debug!(universal_id = %universal_id, "feature cache miss");
                None
            }
        }
    }

    /// Store a document in both tiers.
    pub async fn put(&self, document: Arc<FeatureDocument>) -> SendFlowResult<()> {
        self.local.put(
            document.universal_id.as_str().to_string(),
            Arc::clone(&document),
        );

        if let Some(client) = &self.client {
            let json = serde_json::to_string(document.as_ref())?;
            let mut conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| SendFlowError::BackendUnavailable(format!("redis: {e}")))?;
            conn.set_ex::<_, _, ()>(Self::redis_key(&document.universal_id), json, self.ttl_secs)
                .await
                .map_err(|e| SendFlowError::BackendUnavailable(format!("redis: {e}")))?;
        }
        Ok(())
    }

    /// Fetch-or-recompute with single-flight: when several callers miss on
    /// the same key at once, the first runs `compute` and the rest await
    /// its result.
    pub async fn get_or_compute<F, Fut>(
        &self,
        universal_id: &UniversalId,
        max_age_seconds: u64,
        compute: F,
    ) -> SendFlowResult<Arc<FeatureDocument>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SendFlowResult<FeatureDocument>>,
    {
        if let Some(doc) = self.get(universal_id, max_age_seconds).await {
            return Ok(doc);
        }

        let key = universal_id.as_str().to_string();
        let cell = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell
            .get_or_try_init(|| async {
                metrics::counter!("cache.recompute").increment(1);
                let doc = Arc::new(compute().await?);
                self.put(Arc::clone(&doc)).await?;
                Ok::<_, SendFlowError>(doc)
            })
            .await
            .cloned();

        self.inflight.remove(&key);
        result
    }

    /// Periodic maintenance: sweep L1 documents older than the L2 TTL.
    pub async fn maintenance(&self) {
        let evicted = self.local.evict_stale(self.ttl_secs);
        if evicted > 0 {
            debug!(evicted = evicted, "local feature cache eviction complete");
        }
    }

    pub fn local_cache_size(&self) -> usize {
        self.local.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sendflow_core::types::EngagementCounters;
    use sendflow_grid::ContinuousCurve;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn doc(uid: &UniversalId) -> FeatureDocument {
        FeatureDocument::new(
            uid.clone(),
            &ContinuousCurve::uniform(),
            0.0,
            false,
            EngagementCounters::default(),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_get_or_compute_populates_cache() {
        let cache = FeatureCache::in_memory(3600);
        let uid = UniversalId::from_string("sf_1111111111111111");

        let fetched = cache
            .get_or_compute(&uid, 3600, || async { Ok(doc(&uid)) })
            .await
            .unwrap();
        assert_eq!(fetched.universal_id, uid);
        assert!(cache.get(&uid, 3600).await.is_some());
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_concurrent_recomputes() {
        let cache = Arc::new(FeatureCache::in_memory(3600));
        let uid = UniversalId::from_string("sf_2222222222222222");
        let computes = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let uid = uid.clone();
            let computes = Arc::clone(&computes);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(&uid, 3600, || async {
                        computes.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
                        Ok(doc(&uid))
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(computes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compute_error_propagates() {
        let cache = FeatureCache::in_memory(3600);
        let uid = UniversalId::from_string("sf_3333333333333333");

        let err = cache
            .get_or_compute(&uid, 3600, || async {
                Err(SendFlowError::BackendUnavailable("clickhouse down".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "backend_unavailable");
        assert!(cache.get(&uid, 3600).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_document_triggers_recompute() {
        let cache = FeatureCache::in_memory(3600);
        let uid = UniversalId::from_string("sf_4444444444444444");

        let mut stale = doc(&uid);
        stale.computed_at = chrono::Utc::now() - chrono::Duration::hours(2);
        cache.put(Arc::new(stale)).await.unwrap();
        // The two-hour-old document fails any zero max-age read.
        let recomputed = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&recomputed);
        let uid_for_compute = uid.clone();
        cache
            .get_or_compute(&uid, 0, || async move {
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(doc(&uid_for_compute))
            })
            .await
            .unwrap();
        assert_eq!(recomputed.load(Ordering::SeqCst), 1);
    }
}
