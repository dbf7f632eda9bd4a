//! Event store gateway — typed access to the append-only engagement event
//! table (partitioned by month, ordered by `(esp, universal_id, timestamp,
//! event_type)`) and the append-only timing explanation log.

pub mod clickhouse_store;
pub mod memory;
pub mod store;

pub use clickhouse_store::ClickHouseEventStore;
pub use memory::MemoryEventStore;
pub use store::EventStore;
