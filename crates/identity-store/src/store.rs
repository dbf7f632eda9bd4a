//! Persistence interface for the identity edge graph, the per-identifier
//! resolution cache, and the append-only audit log.

use async_trait::async_trait;
use sendflow_core::error::SendFlowResult;
use sendflow_core::types::{AuditRecord, Identifier, IdentityEdge, ResolutionEntry, UniversalId};
use uuid::Uuid;

/// Gateway to the identity tables. The edge graph is append-only in the
/// sense that edges are never removed and re-inserts only ever raise the
/// stored weight; the resolution cache is last-writer-wins on `last_seen`.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Idempotent edge upsert keyed on the unordered identifier pair.
    /// Re-inserting an existing edge refreshes `updated_at` and keeps the
    /// maximum weight seen; the row count does not grow.
    async fn upsert_edge(&self, edge: &IdentityEdge) -> SendFlowResult<()>;

    /// All edges incident to `identifier`.
    async fn edges_for(&self, identifier: &Identifier) -> SendFlowResult<Vec<IdentityEdge>>;

    /// Resolution cache lookup for one identifier.
    async fn get_resolution(
        &self,
        identifier: &Identifier,
    ) -> SendFlowResult<Option<ResolutionEntry>>;

    /// Replacing upsert on `(identifier, type)`; newest `last_seen` wins,
    /// the original `created_at` is preserved.
    async fn upsert_resolution(&self, entry: &ResolutionEntry) -> SendFlowResult<()>;

    /// Every cache row currently pointing at `universal_id` (used by the
    /// conflict-merge path to repoint the losing side).
    async fn resolutions_for_universal(
        &self,
        universal_id: &UniversalId,
    ) -> SendFlowResult<Vec<ResolutionEntry>>;

    /// Append one audit record.
    async fn append_audit(&self, record: &AuditRecord) -> SendFlowResult<()>;

    /// The derivation trace of one resolution, ascending by creation time.
    async fn audit_trail(&self, resolution_id: Uuid) -> SendFlowResult<Vec<AuditRecord>>;
}
