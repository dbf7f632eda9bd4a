//! Engagement feature engine — click-weighted minute histograms with
//! Laplace smoothing and circular Gaussian blur, recency counters, and
//! cached per-recipient feature documents.

pub mod cohort;
pub mod engine;

pub use cohort::{CohortPriorProvider, NoCohortPrior};
pub use engine::FeatureEngine;
