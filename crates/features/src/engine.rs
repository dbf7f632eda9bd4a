//! Engagement feature engine: reduces a recipient's event history into a
//! smoothed minute-of-week probability surface plus recency counters, and
//! caches the result under the Universal ID.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sendflow_cache::{FeatureCache, FeatureDocument};
use sendflow_core::config::FeatureConfig;
use sendflow_core::error::{SendFlowError, SendFlowResult};
use sendflow_core::types::{EngagementCounters, EngagementEvent, EventType, PeakWindow, UniversalId};
use sendflow_event_store::EventStore;
use sendflow_grid::{datetime_to_slot, slot_label, ContinuousCurve, SLOTS_PER_WEEK};
use tracing::debug;

use crate::cohort::CohortPriorProvider;

/// Number of peak windows kept in the cached summary.
const PEAK_SUMMARY_SIZE: usize = 5;
/// Minimum circular separation between summarized peaks, in slots.
const PEAK_SEPARATION_SLOTS: u32 = 60;

pub struct FeatureEngine {
    store: Arc<dyn EventStore>,
    cache: Arc<FeatureCache>,
    cohort_prior: Option<Arc<dyn CohortPriorProvider>>,
    config: FeatureConfig,
}

impl FeatureEngine {
    pub fn new(
        store: Arc<dyn EventStore>,
        cache: Arc<FeatureCache>,
        config: FeatureConfig,
    ) -> Self {
        Self {
            store,
            cache,
            cohort_prior: None,
            config,
        }
    }

    pub fn with_cohort_prior(mut self, provider: Arc<dyn CohortPriorProvider>) -> Self {
        self.cohort_prior = Some(provider);
        self
    }

    /// Cached feature document for a recipient, recomputed through the
    /// single-flight guard when missing or older than the configured
    /// max age.
    pub async fn features_for(
        &self,
        universal_id: &UniversalId,
    ) -> SendFlowResult<Arc<FeatureDocument>> {
        self.cache
            .get_or_compute(
                universal_id,
                self.config.curve_cache_max_age_seconds,
                || self.compute(universal_id),
            )
            .await
    }

    /// Full recompute from the event store, bypassing the cache read path.
    pub async fn compute(&self, universal_id: &UniversalId) -> SendFlowResult<FeatureDocument> {
        let now = Utc::now();
        let since = now - Duration::days(i64::from(self.config.lookback_days));

        let primary_type =
            EventType::parse(&self.config.primary_event_type).unwrap_or(EventType::Clicked);

        let clicks = self.pull(universal_id, primary_type, since).await?;
        let opens = self.pull(universal_id, EventType::Opened, since).await?;

        // Clicks drive the surface; opens are only a fallback sample.
        let (sample, degraded) = if clicks.len() >= self.config.fallback_min_events {
            (&clicks, false)
        } else if !opens.is_empty() {
            (&opens, true)
        } else {
            (&clicks, !clicks.is_empty())
        };

        let curve = if sample.is_empty() {
            match self
                .cohort_prior
                .as_ref()
                .and_then(|p| p.prior_histogram())
            {
                Some(prior) => ContinuousCurve::from_histogram(
                    &prior,
                    self.config.laplace_alpha,
                    self.config.smoothing_sigma_minutes,
                )
                .map_err(SendFlowError::Internal)?,
                None => ContinuousCurve::uniform(),
            }
        } else {
            let mut counts = vec![0.0f64; SLOTS_PER_WEEK as usize];
            for event in sample.iter() {
                counts[datetime_to_slot(event.timestamp) as usize] += 1.0;
            }
            ContinuousCurve::from_histogram(
                &counts,
                self.config.laplace_alpha,
                self.config.smoothing_sigma_minutes,
            )
            .map_err(SendFlowError::Internal)?
        };

        let confidence = if sample.is_empty() {
            0.0
        } else {
            curve.confidence()
        };
        let counters = build_counters(&opens, &clicks, now);
        let peaks = peak_summary(&curve);

        metrics::counter!("features.computed").increment(1);
        debug!(
            universal_id = %universal_id,
            samples = sample.len(),
            degraded,
            confidence,
            "engagement features computed"
        );

        Ok(FeatureDocument::new(
            universal_id.clone(),
            &curve,
            confidence,
            degraded,
            counters,
            peaks,
        ))
    }

    /// Pull one event type, dropping rows flagged as suspected bot traffic.
    async fn pull(
        &self,
        universal_id: &UniversalId,
        event_type: EventType,
        since: DateTime<Utc>,
    ) -> SendFlowResult<Vec<EngagementEvent>> {
        let events = self
            .store
            .events_for(universal_id, event_type, since)
            .await
            .map_err(|e| SendFlowError::CurveUnavailable(e.to_string()))?;
        Ok(events.into_iter().filter(|e| !is_suspected_bot(e)).collect())
    }
}

fn is_suspected_bot(event: &EngagementEvent) -> bool {
    event
        .metadata
        .get("suspected_bot")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn build_counters(
    opens: &[EngagementEvent],
    clicks: &[EngagementEvent],
    now: DateTime<Utc>,
) -> EngagementCounters {
    let count_within = |events: &[EngagementEvent], days: i64| {
        events
            .iter()
            .filter(|e| e.timestamp >= now - Duration::days(days))
            .count() as u64
    };
    let first = |events: &[EngagementEvent]| events.iter().map(|e| e.timestamp).min();
    let last = |events: &[EngagementEvent]| events.iter().map(|e| e.timestamp).max();

    EngagementCounters {
        opens_1d: count_within(opens, 1),
        opens_7d: count_within(opens, 7),
        opens_30d: count_within(opens, 30),
        clicks_1d: count_within(clicks, 1),
        clicks_7d: count_within(clicks, 7),
        clicks_30d: count_within(clicks, 30),
        first_open: first(opens),
        last_open: last(opens),
        first_click: first(clicks),
        last_click: last(clicks),
    }
}

/// Top-K slots by probability with a minimum circular separation, so the
/// summary names distinct windows rather than one peak's neighbors.
fn peak_summary(curve: &ContinuousCurve) -> Vec<PeakWindow> {
    let mut slots: Vec<u32> = (0..SLOTS_PER_WEEK).collect();
    slots.sort_by(|a, b| {
        curve
            .get(*b)
            .partial_cmp(&curve.get(*a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(b))
    });

    let mut peaks: Vec<PeakWindow> = Vec::new();
    for slot in slots {
        if peaks.len() >= PEAK_SUMMARY_SIZE {
            break;
        }
        let separated = peaks.iter().all(|p| {
            let d = slot.abs_diff(p.slot);
            d.min(SLOTS_PER_WEEK - d) >= PEAK_SEPARATION_SLOTS
        });
        if separated {
            peaks.push(PeakWindow {
                slot,
                probability: curve.interpolate(f64::from(slot)),
                label: slot_label(slot),
            });
        }
    }
    peaks
}
