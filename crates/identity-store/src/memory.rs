//! In-memory identity store for tests and single-node development.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use sendflow_core::error::SendFlowResult;
use sendflow_core::types::{AuditRecord, Identifier, IdentityEdge, ResolutionEntry, UniversalId};
use uuid::Uuid;

use crate::store::IdentityStore;

#[derive(Default)]
pub struct MemoryIdentityStore {
    /// Canonical pair key -> edge.
    edges: DashMap<String, IdentityEdge>,
    /// Identifier key -> pair keys of incident edges.
    adjacency: DashMap<String, Vec<String>>,
    /// Identifier key -> resolution cache entry.
    resolutions: DashMap<String, ResolutionEntry>,
    audit: Mutex<Vec<AuditRecord>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn edge_key(edge: &IdentityEdge) -> String {
        let (a, b) = edge.pair_key();
        format!("{a}||{b}")
    }

    /// Number of distinct edges (idempotence checks).
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Full audit log snapshot, insertion order.
    pub fn audit_log(&self) -> Vec<AuditRecord> {
        self.audit.lock().clone()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn upsert_edge(&self, edge: &IdentityEdge) -> SendFlowResult<()> {
        let key = Self::edge_key(edge);
        match self.edges.get_mut(&key) {
            Some(mut existing) => {
                existing.weight = existing.weight.max(edge.weight);
                existing.updated_at = edge.updated_at.max(existing.updated_at);
            }
            None => {
                self.edges.insert(key.clone(), edge.clone());
                for endpoint in [&edge.a, &edge.b] {
                    let mut incident = self.adjacency.entry(endpoint.key()).or_default();
                    if !incident.contains(&key) {
                        incident.push(key.clone());
                    }
                }
            }
        }
        Ok(())
    }

    async fn edges_for(&self, identifier: &Identifier) -> SendFlowResult<Vec<IdentityEdge>> {
        let keys = self
            .adjacency
            .get(&identifier.key())
            .map(|v| v.clone())
            .unwrap_or_default();
        Ok(keys
            .iter()
            .filter_map(|k| self.edges.get(k).map(|e| e.clone()))
            .collect())
    }

    async fn get_resolution(
        &self,
        identifier: &Identifier,
    ) -> SendFlowResult<Option<ResolutionEntry>> {
        Ok(self.resolutions.get(&identifier.key()).map(|e| e.clone()))
    }

    async fn upsert_resolution(&self, entry: &ResolutionEntry) -> SendFlowResult<()> {
        let key = entry.identifier.key();
        match self.resolutions.get_mut(&key) {
            Some(mut existing) => {
                if entry.last_seen >= existing.last_seen {
                    let created_at = existing.created_at;
                    *existing = entry.clone();
                    existing.created_at = created_at;
                }
            }
            None => {
                self.resolutions.insert(key, entry.clone());
            }
        }
        Ok(())
    }

    async fn resolutions_for_universal(
        &self,
        universal_id: &UniversalId,
    ) -> SendFlowResult<Vec<ResolutionEntry>> {
        Ok(self
            .resolutions
            .iter()
            .filter(|e| &e.value().universal_id == universal_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn append_audit(&self, record: &AuditRecord) -> SendFlowResult<()> {
        self.audit.lock().push(record.clone());
        Ok(())
    }

    async fn audit_trail(&self, resolution_id: Uuid) -> SendFlowResult<Vec<AuditRecord>> {
        let mut trail: Vec<AuditRecord> = self
            .audit
            .lock()
            .iter()
            .filter(|r| r.resolution_id == resolution_id)
            .cloned()
            .collect();
        trail.sort_by_key(|r| r.created_at);
        Ok(trail)
    }
}
