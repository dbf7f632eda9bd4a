//! Feature cache gateway — keyed binary cache of serialized engagement
//! curves and counters, two-tier (local L1 + Redis L2) with single-flight
//! recompute coalescing.

pub mod client;
pub mod document;
pub mod local;

pub use client::FeatureCache;
pub use document::FeatureDocument;
pub use local::LocalCache;
