//! Timing decision engine — turns a recipient's engagement curve and
//! real-time context into a latency-compensated UTC trigger instant with an
//! auditable explanation.

pub mod engine;

pub use engine::TimingDecisionEngine;
