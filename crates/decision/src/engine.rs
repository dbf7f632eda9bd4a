//! Timing decision engine: combines the cached engagement curve with
//! real-time context (hot paths, circuit breakers), clips to the request
//! window, picks the target minute, compensates for gateway latency, and
//! persists an explanation row for every decision it returns.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use sendflow_core::config::DecisionConfig;
use sendflow_core::error::{SendFlowError, SendFlowResult};
use sendflow_core::types::{
    AppliedWeight, ContextSignal, EventType, TimingDecision, TimingExplanation, UniversalId,
};
use sendflow_event_store::EventStore;
use sendflow_features::FeatureEngine;
use sendflow_grid::{datetime_to_slot, next_occurrence_after, SlotWeight, SLOTS_PER_WEEK};
use sendflow_predictors::{LatencyFeatures, LatencyPredictor, SignalWeightPredictor};
use tracing::{debug, warn};
use uuid::Uuid;

/// Circuit-breaker event types, checked on every decision.
const CIRCUIT_BREAKERS: [EventType; 4] = [
    EventType::SupportTicket,
    EventType::Complained,
    EventType::UnsubscribeRequest,
    EventType::SpamReport,
];

/// Hot-path weights cover the hour immediately following `now`.
const ACCELERATION_SPAN_MINUTES: u32 = 60;

pub struct TimingDecisionEngine {
    features: Arc<FeatureEngine>,
    store: Arc<dyn EventStore>,
    latency_predictor: Arc<dyn LatencyPredictor>,
    signal_weights: Arc<dyn SignalWeightPredictor>,
    config: DecisionConfig,
}

impl TimingDecisionEngine {
    pub fn new(
        features: Arc<FeatureEngine>,
        store: Arc<dyn EventStore>,
        latency_predictor: Arc<dyn LatencyPredictor>,
        signal_weights: Arc<dyn SignalWeightPredictor>,
        config: DecisionConfig,
    ) -> Self {
        Self {
            features,
            store,
            latency_predictor,
            signal_weights,
            config,
        }
    }

    /// Produce one timing decision under the hard deadline. Nothing is
    /// persisted unless the full pipeline succeeds.
    pub async fn decide(
        &self,
        universal_id: &UniversalId,
        send_after: Option<DateTime<Utc>>,
        send_before: Option<DateTime<Utc>>,
        latency_override: Option<f64>,
    ) -> SendFlowResult<TimingDecision> {
        let started = std::time::Instant::now();
        metrics::counter!("decision.requests").increment(1);

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(self.config.hard_deadline_ms),
            self.decide_at(universal_id, send_after, send_before, latency_override, Utc::now()),
        )
        .await
        .map_err(|_| {
            metrics::counter!("decision.timeouts").increment(1);
            SendFlowError::Timeout(format!(
                "decision exceeded hard deadline of {} ms",
                self.config.hard_deadline_ms
            ))
        })?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        metrics::histogram!("decision.latency_ms").record(elapsed_ms as f64);
        if elapsed_ms > self.config.soft_deadline_ms {
            warn!(elapsed_ms, "decision exceeded soft deadline");
        }
        if result.is_err() {
            metrics::counter!("decision.errors").increment(1);
        }
        result
    }

    /// Deadline-free pipeline against an explicit `now`, used directly by
    /// tests for deterministic instants.
    pub async fn decide_at(
        &self,
        universal_id: &UniversalId,
        send_after: Option<DateTime<Utc>>,
        send_before: Option<DateTime<Utc>>,
        latency_override: Option<f64>,
        now: DateTime<Utc>,
    ) -> SendFlowResult<TimingDecision> {
        // Window validation. Windows are absolute instants; a window that
        // already closed is unsatisfiable.
        if let (Some(after), Some(before)) = (send_after, send_before) {
            if after > before {
                return Err(SendFlowError::InvalidInput(
                    "send_after is later than send_before".to_string(),
                ));
            }
        }
        if let Some(before) = send_before {
            if before < now {
                return Err(SendFlowError::WindowExpired(format!(
                    "send_before {before} is in the past"
                )));
            }
        }

        // 1. Curve fetch.
        let document = self.features.features_for(universal_id).await?;
        let base_confidence = document.confidence;
        let mut curve = document.curve().map_err(SendFlowError::Internal)?;
        let base_curve_peak_minute = curve.peak_in_window(0, SLOTS_PER_WEEK - 1);

        // 2. Latency estimate, clamped.
        let latency_seconds = self.estimate_latency(latency_override, now);

        // 3. Circuit breakers first; an active one short-circuits the rest.
        if let Some(decision) = self
            .check_breakers(universal_id, now, base_confidence, base_curve_peak_minute, latency_seconds)
            .await?
        {
            self.persist(&decision).await?;
            metrics::counter!("decision.suppressed").increment(1);
            return Ok(decision);
        }

        // 4. Hot-path acceleration weights over the next hour.
        let (applied_weights, slot_weights) = self.acceleration_weights(universal_id, now).await?;
        curve.apply_weights(&slot_weights);

        // 5. Clip to the earliest viable week of the request window.
        let effective_after = send_after.map_or(now, |after| after.max(now));
        let mut window_slots: Option<(u32, u32)> = None;
        if let Some(before) = send_before {
            if before - effective_after < Duration::days(7) {
                let clip = (datetime_to_slot(effective_after), datetime_to_slot(before));
                curve.clip_to_window(clip.0, clip.1);
                window_slots = Some(clip);
            }
        }

        // 6. A curve with no remaining mass cannot place a send.
        if curve.is_suppressed() {
            let until = send_before.unwrap_or(now);
            let decision = self.suppressed_decision(
                universal_id,
                "curve_collapsed",
                until,
                0.0,
                base_curve_peak_minute,
                latency_seconds,
                applied_weights,
            );
            self.persist(&decision).await?;
            metrics::counter!("decision.suppressed").increment(1);
            return Ok(decision);
        }

        // 7. Target pick; ties break toward the smaller slot.
        let target_slot = match window_slots {
            Some((start, end)) => curve.peak_in_window(start, end),
            None => curve.peak_in_window(0, SLOTS_PER_WEEK - 1),
        };

        // 8. Trigger computation with latency compensation.
        let mut target_instant = next_occurrence_after(target_slot, effective_after);
        let mut trigger = target_instant - Duration::milliseconds((latency_seconds * 1000.0) as i64);
        if trigger < now {
            // Too late to hit this occurrence; advance a week.
            target_instant += Duration::days(7);
            trigger = target_instant - Duration::milliseconds((latency_seconds * 1000.0) as i64);
        }
        if let Some(before) = send_before {
            if target_instant > before {
                return Err(SendFlowError::WindowExpired(format!(
                    "no viable occurrence of slot {target_slot} before {before}"
                )));
            }
        }

        // 9. Confidence after reweighting, discounted by data sufficiency.
        let sufficiency = (document.counters.clicks_7d as f64 / 10.0).min(1.0);
        let confidence_score = (curve.confidence() * sufficiency).clamp(0.0, 1.0);

        // 10. Emit and persist.
        let decision = TimingDecision {
            decision_id: Uuid::new_v4(),
            universal_id: universal_id.clone(),
            target_minute: target_slot,
            trigger_timestamp_utc: trigger,
            latency_estimate_seconds: latency_seconds,
            confidence_score,
            model_version: self.config.model_version.clone(),
            base_curve_peak_minute,
            applied_weights,
            suppressed: false,
            suppression_reason: None,
            suppression_until: None,
            explanation_ref: format!("exp_{}", Uuid::new_v4().simple()),
            created_at: now,
        };
        self.persist(&decision).await?;

        debug!(
            universal_id = %universal_id,
            target_minute = target_slot,
            trigger = %trigger,
            confidence = confidence_score,
            "timing decision emitted"
        );
        Ok(decision)
    }

    fn estimate_latency(&self, latency_override: Option<f64>, now: DateTime<Utc>) -> f64 {
        let raw = match latency_override {
            Some(supplied) => supplied,
            None => {
                let features = LatencyFeatures {
                    hour_of_day: now.hour() as u8,
                    day_of_week: now.weekday().num_days_from_monday() as u8,
                    ..Default::default()
                };
                match self.latency_predictor.predict_latency_seconds(&features) {
                    Some(predicted) => predicted,
                    None => {
                        metrics::counter!("decision.predictor_fallback").increment(1);
                        warn!("latency predictor unavailable, using configured default");
                        self.config.default_latency_seconds
                    }
                }
            }
        };
        raw.clamp(
            self.config.latency_clamp_min_seconds,
            self.config.latency_clamp_max_seconds,
        )
    }

    /// Returns a suppressed decision when an active circuit breaker exists.
    /// `suppression_until` derives from the most recent breaker event.
    async fn check_breakers(
        &self,
        universal_id: &UniversalId,
        now: DateTime<Utc>,
        base_confidence: f64,
        base_curve_peak_minute: u32,
        latency_seconds: f64,
    ) -> SendFlowResult<Option<TimingDecision>> {
        let widest_hours = CIRCUIT_BREAKERS
            .iter()
            .filter_map(|t| self.config.breaker_window_hours(*t))
            .max()
            .unwrap_or(0);
        let signals = self
            .store
            .context_signals(
                universal_id,
                &CIRCUIT_BREAKERS,
                now - Duration::hours(i64::from(widest_hours)),
            )
            .await?;

        let active: Vec<&ContextSignal> = signals
            .iter()
            .filter(|s| {
                self.config
                    .breaker_window_hours(s.event_type)
                    .map(|hours| s.timestamp + Duration::hours(i64::from(hours)) > now)
                    .unwrap_or(false)
            })
            .collect();

        let Some(latest) = active.iter().max_by_key(|s| s.timestamp) else {
            return Ok(None);
        };
        let window_hours = self
            .config
            .breaker_window_hours(latest.event_type)
            .unwrap_or(0);
        let until = latest.timestamp + Duration::hours(i64::from(window_hours));

        Ok(Some(self.suppressed_decision(
            universal_id,
            latest.event_type.as_str(),
            until,
            base_confidence,
            base_curve_peak_minute,
            latency_seconds,
            Vec::new(),
        )))
    }

    /// A suppressed decision targets the suppression boundary itself; no
    /// latency subtraction is applied.
    #[allow(clippy::too_many_arguments)]
    fn suppressed_decision(
        &self,
        universal_id: &UniversalId,
        reason: &str,
        until: DateTime<Utc>,
        confidence: f64,
        base_curve_peak_minute: u32,
        latency_seconds: f64,
        applied_weights: Vec<AppliedWeight>,
    ) -> TimingDecision {
        TimingDecision {
            decision_id: Uuid::new_v4(),
            universal_id: universal_id.clone(),
            target_minute: datetime_to_slot(until),
            trigger_timestamp_utc: until,
            latency_estimate_seconds: latency_seconds,
            confidence_score: confidence.clamp(0.0, 1.0),
            model_version: self.config.model_version.clone(),
            base_curve_peak_minute,
            applied_weights,
            suppressed: true,
            suppression_reason: Some(reason.to_string()),
            suppression_until: Some(until),
            explanation_ref: format!("exp_{}", Uuid::new_v4().simple()),
            created_at: Utc::now(),
        }
    }

    /// Hot-path signals within the configured recency window become
    /// multiplicative weights across the hour following `now`.
    async fn acceleration_weights(
        &self,
        universal_id: &UniversalId,
        now: DateTime<Utc>,
    ) -> SendFlowResult<(Vec<AppliedWeight>, Vec<SlotWeight>)> {
        let hot_types: Vec<EventType> = self
            .config
            .hot_path_event_types
            .iter()
            .filter_map(|s| EventType::parse(s))
            .collect();
        if hot_types.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let signals = self
            .store
            .context_signals(
                universal_id,
                &hot_types,
                now - Duration::minutes(self.config.hot_path_window_minutes),
            )
            .await?;

        let start_slot = datetime_to_slot(now);
        let end_slot = (start_slot + ACCELERATION_SPAN_MINUTES) % SLOTS_PER_WEEK;

        let mut applied = Vec::new();
        let mut slot_weights = Vec::new();
        for signal in &signals {
            let magnitude = self.signal_weights.weight(signal, now);
            if magnitude <= 0.0 {
                continue;
            }
            applied.push(AppliedWeight {
                signal: signal.event_type,
                magnitude,
                minutes_ago: (now - signal.timestamp).num_minutes().max(0),
            });
            slot_weights.push(SlotWeight {
                start_slot,
                end_slot,
                magnitude,
            });
        }
        Ok((applied, slot_weights))
    }

    async fn persist(&self, decision: &TimingDecision) -> SendFlowResult<()> {
        self.store
            .append_explanation(&TimingExplanation::from_decision(decision))
            .await
    }
}
