//! In-process layer in front of Redis. Entries carry no expiry of their
//! own: freshness is judged per request against each document's
//! `computed_at` (see `FeatureCache::get`), so one cached document can
//! satisfy callers with different max-age requirements. The only policy
//! this layer owns is displacement: when full, the stalest curve goes
//! first, since it is the one closest to being recomputed anyway.

use crate::document::FeatureDocument;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

pub struct LocalCache {
    store: DashMap<String, Arc<FeatureDocument>>,
    max_entries: usize,
}

impl LocalCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: DashMap::with_capacity(max_entries.min(4096)),
            max_entries,
        }
    }

    /// Look up a document. Staleness is the caller's judgment; this layer
    /// returns whatever it holds.
    pub fn get(&self, universal_id: &str) -> Option<Arc<FeatureDocument>> {
        self.store
            .get(universal_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Insert or refresh a document. At capacity, the incoming document
    /// displaces the stalest cached one; a document staler than everything
    /// already cached is not worth a slot and is dropped.
    pub fn put(&self, universal_id: String, document: Arc<FeatureDocument>) {
        if self.store.len() >= self.max_entries && !self.store.contains_key(&universal_id) {
            let Some((stalest_key, stalest_computed_at)) = self.stalest() else {
                return;
            };
            if document.computed_at <= stalest_computed_at {
                return;
            }
            self.store.remove(&stalest_key);
        }
        self.store.insert(universal_id, document);
    }

    /// Key and `computed_at` of the least fresh cached document.
    fn stalest(&self) -> Option<(String, chrono::DateTime<Utc>)> {
        self.store
            .iter()
            .min_by_key(|entry| entry.value().computed_at)
            .map(|entry| (entry.key().clone(), entry.value().computed_at))
    }

    /// Drop documents whose curves are older than `max_age_seconds`.
    /// Called periodically; anything past the Redis TTL is dead weight
    /// here too.
    pub fn evict_stale(&self, max_age_seconds: u64) -> usize {
        let now = Utc::now();
        let before = self.store.len();
        self.store
            .retain(|_, document| document.age_seconds(now) <= max_age_seconds as i64);
        before - self.store.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sendflow_core::types::{EngagementCounters, UniversalId};
    use sendflow_grid::ContinuousCurve;

    fn doc_computed_at(uid: &str, age_hours: i64) -> Arc<FeatureDocument> {
        let mut document = FeatureDocument::new(
            UniversalId::from_string(uid),
            &ContinuousCurve::uniform(),
            0.0,
            false,
            EngagementCounters::default(),
            Vec::new(),
        );
        document.computed_at = Utc::now() - Duration::hours(age_hours);
        Arc::new(document)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let cache = LocalCache::new(100);
        cache.put("sf_a".to_string(), doc_computed_at("sf_a", 0));
        assert!(cache.get("sf_a").is_some());
        assert!(cache.get("sf_b").is_none());
    }

    #[test]
    fn test_full_cache_displaces_stalest_document() {
        let cache = LocalCache::new(2);
        cache.put("sf_old".to_string(), doc_computed_at("sf_old", 10));
        cache.put("sf_mid".to_string(), doc_computed_at("sf_mid", 5));

        // A fresher document pushes out the stalest one.
        cache.put("sf_new".to_string(), doc_computed_at("sf_new", 1));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("sf_old").is_none());
        assert!(cache.get("sf_mid").is_some());
        assert!(cache.get("sf_new").is_some());
    }

    #[test]
    fn test_full_cache_rejects_staler_than_everything() {
        let cache = LocalCache::new(2);
        cache.put("sf_a".to_string(), doc_computed_at("sf_a", 2));
        cache.put("sf_b".to_string(), doc_computed_at("sf_b", 3));

        cache.put("sf_ancient".to_string(), doc_computed_at("sf_ancient", 48));
        assert!(cache.get("sf_ancient").is_none());
        assert_eq!(cache.len(), 2);

        // Refreshing a key already present always goes through.
        cache.put("sf_a".to_string(), doc_computed_at("sf_a", 0));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_get_does_not_judge_staleness() {
        // A document stale for one caller may still serve another with a
        // looser max-age bound, so get() returns it regardless of age.
        let cache = LocalCache::new(100);
        cache.put("sf_a".to_string(), doc_computed_at("sf_a", 100));
        assert!(cache.get("sf_a").is_some());
    }

    #[test]
    fn test_evict_stale_sweeps_by_curve_age() {
        let cache = LocalCache::new(100);
        cache.put("sf_fresh".to_string(), doc_computed_at("sf_fresh", 1));
        cache.put("sf_stale".to_string(), doc_computed_at("sf_stale", 30));

        // Sweep bound of one day: the thirty-hour-old curve goes.
        let evicted = cache.evict_stale(24 * 3600);
        assert_eq!(evicted, 1);
        assert!(cache.get("sf_fresh").is_some());
        assert!(cache.get("sf_stale").is_none());
        assert!(!cache.is_empty());
    }
}
