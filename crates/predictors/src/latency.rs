//! Gateway latency predictor port. A trained model can be plugged in behind
//! the trait; the default heuristic answers with the median of recently
//! observed delivery latencies.

use ndarray::Array1;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Context available at decision time for latency prediction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyFeatures {
    pub esp: Option<String>,
    pub hour_of_day: u8,
    pub day_of_week: u8,
    pub campaign_class: Option<String>,
    pub payload_size_bytes: Option<u64>,
    pub queue_depth_estimate: Option<u64>,
}

impl LatencyFeatures {
    /// Numeric framing for model inference.
    pub fn to_vector(&self) -> Array1<f64> {
        Array1::from(vec![
            f64::from(self.hour_of_day),
            f64::from(self.day_of_week),
            self.payload_size_bytes.map(|b| b as f64 / 1024.0).unwrap_or(0.0),
            self.queue_depth_estimate.map(|q| q as f64).unwrap_or(0.0),
        ])
    }
}

/// Pluggable latency predictor. Returns None when the predictor cannot
/// produce an estimate; callers fall back to their configured default.
pub trait LatencyPredictor: Send + Sync {
    fn predict_latency_seconds(&self, features: &LatencyFeatures) -> Option<f64>;
}

/// Fallback predictor: median of a rolling window of observed delivery
/// latencies, or the configured default while the window is empty.
pub struct HeuristicLatencyPredictor {
    default_seconds: f64,
    recent: RwLock<VecDeque<f64>>,
    window: usize,
}

impl HeuristicLatencyPredictor {
    pub fn new(default_seconds: f64) -> Self {
        Self {
            default_seconds,
            recent: RwLock::new(VecDeque::new()),
            window: 1024,
        }
    }

    /// Feed one observed delivery latency (seconds) into the rolling window.
    pub fn observe(&self, latency_seconds: f64) {
        if !latency_seconds.is_finite() || latency_seconds <= 0.0 {
            return;
        }
        let mut recent = self.recent.write();
        if recent.len() >= self.window {
            recent.pop_front();
        }
        recent.push_back(latency_seconds);
    }

    fn median_recent(&self) -> Option<f64> {
        let recent = self.recent.read();
        if recent.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = recent.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Some(sorted[sorted.len() / 2])
    }
}

impl LatencyPredictor for HeuristicLatencyPredictor {
    fn predict_latency_seconds(&self, _features: &LatencyFeatures) -> Option<f64> {
        Some(self.median_recent().unwrap_or(self.default_seconds))
    }
}
