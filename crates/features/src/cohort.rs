//! Cohort prior port. When configured, a provider supplies a cohort-level
//! minute histogram used as the cold-start prior; without one the engine
//! falls back to the uniform curve.

/// Optional source of a cohort-level engagement histogram (10,080 counts).
pub trait CohortPriorProvider: Send + Sync {
    fn prior_histogram(&self) -> Option<Vec<f64>>;
}

/// Provider that never supplies a prior; cold starts stay uniform.
#[derive(Debug, Default)]
pub struct NoCohortPrior;

impl CohortPriorProvider for NoCohortPrior {
    fn prior_histogram(&self) -> Option<Vec<f64>> {
        None
    }
}
