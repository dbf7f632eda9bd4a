//! Cached per-recipient feature document: the packed engagement curve plus
//! recency counters, confidence, and the peak summary.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use sendflow_core::types::{EngagementCounters, PeakWindow, UniversalId};
use sendflow_grid::ContinuousCurve;
use serde::{Deserialize, Serialize};

/// The unit stored in the feature cache under one Universal ID. The curve
/// is packed as little-endian `f32` and base64-encoded so the whole
/// document serializes as one JSON value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureDocument {
    pub universal_id: UniversalId,
    curve_packed: String,
    pub confidence: f64,
    /// True when the engine fell back from clicks to opens.
    pub degraded: bool,
    pub counters: EngagementCounters,
    pub peaks: Vec<PeakWindow>,
    pub computed_at: DateTime<Utc>,
}

impl FeatureDocument {
    pub fn new(
        universal_id: UniversalId,
        curve: &ContinuousCurve,
        confidence: f64,
        degraded: bool,
        counters: EngagementCounters,
        peaks: Vec<PeakWindow>,
    ) -> Self {
        Self {
            universal_id,
            curve_packed: base64::engine::general_purpose::STANDARD.encode(curve.to_packed_f32()),
            confidence,
            degraded,
            counters,
            peaks,
            computed_at: Utc::now(),
        }
    }

    /// Rehydrate the engagement curve from the packed representation.
    pub fn curve(&self) -> anyhow::Result<ContinuousCurve> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(&self.curve_packed)?;
        ContinuousCurve::from_packed_f32(&bytes)
    }

    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.computed_at).num_seconds().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_curve_roundtrip() {
        let curve = ContinuousCurve::uniform();
        let doc = FeatureDocument::new(
            UniversalId::from_string("sf_0123456789abcdef"),
            &curve,
            0.0,
            false,
            EngagementCounters::default(),
            Vec::new(),
        );

        let json = serde_json::to_string(&doc).unwrap();
        let back: FeatureDocument = serde_json::from_str(&json).unwrap();
        let restored = back.curve().unwrap();
        assert!((restored.sum() - 1.0).abs() <= 1e-6);

        let expected = ContinuousCurve::from_packed_f32(&curve.to_packed_f32()).unwrap();
        assert_eq!(restored.probabilities(), expected.probabilities());
    }

    #[test]
    fn test_age_is_non_negative() {
        let doc = FeatureDocument::new(
            UniversalId::from_string("sf_0123456789abcdef"),
            &ContinuousCurve::uniform(),
            0.0,
            false,
            EngagementCounters::default(),
            Vec::new(),
        );
        assert!(doc.age_seconds(Utc::now()) >= 0);
        assert_eq!(doc.age_seconds(doc.computed_at - chrono::Duration::hours(1)), 0);
    }
}
