//! Event ingestion pipeline — drives the durable event log into the
//! analytic store with identity resolution, PII hashing, bot flagging, and
//! dead-letter handling at the boundary.

pub mod manager;
pub mod processor;
pub mod worker;

pub use manager::IngestManager;
pub use processor::{BackfillReport, IngestProcessor};
pub use worker::IngestWorker;
