//! ML predictor ports — pluggable latency and signal-weight predictors
//! with heuristic fallbacks used when no model is loaded.

pub mod latency;
pub mod signal_weight;

pub use latency::{HeuristicLatencyPredictor, LatencyFeatures, LatencyPredictor};
pub use signal_weight::{HeuristicSignalWeightPredictor, SignalWeightPredictor};
