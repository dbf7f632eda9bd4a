//! Signal-weight predictor port. Maps a recent hot-path signal to the
//! acceleration weight applied over the next hour of the engagement curve.

use chrono::{DateTime, Utc};
use sendflow_core::types::ContextSignal;

/// Pluggable acceleration-weight predictor. Weights are non-negative;
/// zero means the signal contributes nothing.
pub trait SignalWeightPredictor: Send + Sync {
    fn weight(&self, signal: &ContextSignal, now: DateTime<Utc>) -> f64;
}

/// Fallback heuristic: `2.0 * exp(-minutes_since_event / 15)`, honoring a
/// provider-supplied weight when the signal carries one.
#[derive(Debug, Default)]
pub struct HeuristicSignalWeightPredictor;

impl HeuristicSignalWeightPredictor {
    pub const BASE: f64 = 2.0;
    pub const DECAY_MINUTES: f64 = 15.0;

    pub fn new() -> Self {
        Self
    }
}

impl SignalWeightPredictor for HeuristicSignalWeightPredictor {
    fn weight(&self, signal: &ContextSignal, now: DateTime<Utc>) -> f64 {
        if let Some(supplied) = signal.weight {
            return supplied.max(0.0);
        }
        let minutes_since = (now - signal.timestamp).num_seconds().max(0) as f64 / 60.0;
        Self::BASE * (-minutes_since / Self::DECAY_MINUTES).exp()
    }
}
