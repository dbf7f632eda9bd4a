//! Identity resolution: deterministic cache lookup, weight-ordered bounded
//! BFS over the edge graph, and synthesis of new Universal IDs, with an
//! auditable step trace for every derivation.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use sendflow_core::config::IdentityConfig;
use sendflow_core::error::{SendFlowError, SendFlowResult};
use sendflow_core::types::{
    AuditRecord, Identifier, IdentifierSet, IdentifierType, IdentityEdge, Resolution,
    ResolutionEntry, UniversalId,
};
use sendflow_identity_store::IdentityStore;
use tracing::{debug, info};
use uuid::Uuid;

use crate::normalize::normalize_set;

/// Deterministic lookup priority; first hit wins.
const DETERMINISTIC_PRIORITY: [IdentifierType; 2] =
    [IdentifierType::EmailHash, IdentifierType::PhoneNumber];

/// Source tag for edges written by the resolver itself.
const RESOLUTION_SOURCE: &str = "resolution";

/// Outcome of a graph traversal.
struct GraphHit {
    universal_id: UniversalId,
    confidence: f64,
    /// Audit steps, one per hop, with the path confidence at that hop.
    hops: Vec<(String, f64)>,
    /// Identifiers visited along the winning path.
    path: Vec<Identifier>,
}

pub struct IdentityResolver {
    store: Arc<dyn IdentityStore>,
    config: IdentityConfig,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn IdentityStore>, config: IdentityConfig) -> Self {
        Self { store, config }
    }

    /// Resolve a set of raw identifiers to one Universal ID. Idempotent:
    /// any subset sharing an identifier with a previous resolution maps to
    /// the same Universal ID, and re-runs ingest no duplicate edges.
    pub async fn resolve(&self, set: &IdentifierSet) -> SendFlowResult<Resolution> {
        let identifiers = normalize_set(set, &self.config)?;
        let resolution_id = Uuid::new_v4();
        let mut steps: Vec<(String, f64)> = Vec::new();

        // Step 1: deterministic hits, fixed priority order.
        let mut det_hits: Vec<(Identifier, ResolutionEntry)> = Vec::new();
        for id_type in DETERMINISTIC_PRIORITY {
            if let Some(ident) = identifiers.iter().find(|i| i.id_type == id_type) {
                if let Some(entry) = self.store.get_resolution(ident).await? {
                    det_hits.push((ident.clone(), entry));
                }
            }
        }

        let mut resolved: Option<(UniversalId, f64)> = None;
        let mut created = false;

        if let Some((winner_ident, winner_entry)) = det_hits
            .iter()
            .min_by_key(|(_, entry)| entry.created_at)
            .cloned()
        {
            let winner_uid = winner_entry.universal_id.clone();
            self.merge_conflicts(&winner_ident, &winner_uid, &det_hits, &mut steps)
                .await?;

            steps.push((
                format!(
                    "found_via_{}:{}",
                    winner_ident.id_type,
                    truncate(&winner_ident.value)
                ),
                1.0,
            ));
            metrics::counter!("resolver.deterministic_hits").increment(1);
            resolved = Some((winner_uid, 1.0));
        }

        // Step 2: probabilistic identifiers, highest default weight first.
        if resolved.is_none() {
            for id_type in self.config.probabilistic_priority() {
                let Some(ident) = identifiers.iter().find(|i| i.id_type == id_type) else {
                    continue;
                };
                let cached = self.store.get_resolution(ident).await?;

                if let Some(entry) = &cached {
                    if entry.confidence >= 1.0 {
                        steps.push((
                            format!("found_via_{}:{}", ident.id_type, truncate(&ident.value)),
                            1.0,
                        ));
                        resolved = Some((entry.universal_id.clone(), 1.0));
                        break;
                    }
                }

                // A cached probabilistic mapping can be superseded by a
                // stronger derivation through the graph.
                if let Some(hit) = self.traverse(ident).await? {
                    let stronger = cached
                        .as_ref()
                        .map_or(true, |entry| hit.confidence > entry.confidence);
                    if stronger {
                        for (step, conf) in &hit.hops {
                            steps.push((step.clone(), *conf));
                        }
                        for visited in &hit.path {
                            self.bind(visited, &hit.universal_id, hit.confidence).await?;
                        }
                        metrics::counter!("resolver.graph_hits").increment(1);
                        resolved = Some((hit.universal_id, hit.confidence));
                        break;
                    }
                }

                if let Some(entry) = cached {
                    steps.push((
                        format!("found_via_{}:{}", ident.id_type, truncate(&ident.value)),
                        entry.confidence,
                    ));
                    resolved = Some((entry.universal_id.clone(), entry.confidence));
                    break;
                }
            }
        }

        // Step 3: synthesize when nothing resolves.
        let (universal_id, confidence) = match resolved {
            Some(found) => found,
            None => {
                if !self.config.synthesize_missing {
                    return Err(SendFlowError::IdentityUnresolved(
                        "no mapping found and synthesis is disabled".to_string(),
                    ));
                }
                let uid = UniversalId::generate();
                created = true;
                let confidence = identifiers
                    .iter()
                    .map(|i| self.weight_of(i))
                    .fold(0.0f64, f64::max);
                steps.push(("created:new_universal_id".to_string(), confidence));
                metrics::counter!("resolver.synthesized").increment(1);
                info!(universal_id = %uid, "new universal id synthesized");
                (uid, confidence)
            }
        };

        // Bind every supplied identifier and connect them in the graph.
        for ident in &identifiers {
            let bound_confidence = confidence.min(self.weight_of(ident));
            self.bind(ident, &universal_id, bound_confidence).await?;
        }
        if let Some((anchor, rest)) = identifiers.split_first() {
            for other in rest {
                let supplied = self.weight_of(anchor).min(self.weight_of(other));
                let weight = IdentityEdge::effective_weight(anchor, other, supplied);
                self.store
                    .upsert_edge(&IdentityEdge::new(
                        anchor.clone(),
                        other.clone(),
                        weight,
                        RESOLUTION_SOURCE,
                    ))
                    .await?;
            }
        }

        // Audit trail, one record per step.
        let input = &identifiers[0];
        for (step, step_confidence) in &steps {
            self.store
                .append_audit(&AuditRecord {
                    resolution_id,
                    universal_id: universal_id.clone(),
                    input_identifier: input.value.clone(),
                    input_type: input.id_type,
                    step: step.clone(),
                    confidence: *step_confidence,
                    created_at: Utc::now(),
                })
                .await?;
        }

        debug!(
            universal_id = %universal_id,
            confidence,
            created,
            steps = steps.len(),
            "identity resolved"
        );

        Ok(Resolution {
            universal_id,
            confidence,
            resolution_id,
            created,
            steps: steps.into_iter().map(|(s, _)| s).collect(),
        })
    }

    /// Insert an externally sourced edge (webhook adapters, manual links).
    pub async fn link_edge(
        &self,
        a: Identifier,
        b: Identifier,
        weight: f64,
        source: &str,
    ) -> SendFlowResult<()> {
        let weight = IdentityEdge::effective_weight(&a, &b, weight);
        self.store
            .upsert_edge(&IdentityEdge::new(a, b, weight, source))
            .await
    }

    /// Conflicting deterministic hits: the older Universal ID wins, the
    /// loser's cache rows are repointed, and a weight-1.0 merge edge records
    /// the join. Nothing is deleted.
    async fn merge_conflicts(
        &self,
        winner_ident: &Identifier,
        winner_uid: &UniversalId,
        det_hits: &[(Identifier, ResolutionEntry)],
        steps: &mut Vec<(String, f64)>,
    ) -> SendFlowResult<()> {
        for (loser_ident, loser_entry) in det_hits {
            if &loser_entry.universal_id == winner_uid {
                continue;
            }
            self.store
                .upsert_edge(&IdentityEdge::new(
                    winner_ident.clone(),
                    loser_ident.clone(),
                    1.0,
                    "identity_merge",
                ))
                .await?;
            for entry in self
                .store
                .resolutions_for_universal(&loser_entry.universal_id)
                .await?
            {
                self.bind(&entry.identifier, winner_uid, entry.confidence)
                    .await?;
            }
            steps.push(("conflict_merged".to_string(), 1.0));
            metrics::counter!("resolver.conflicts").increment(1);
            info!(
                winner = %winner_uid,
                loser = %loser_entry.universal_id,
                "conflicting deterministic mappings merged"
            );
        }
        Ok(())
    }

    /// Depth- and budget-bounded BFS over the edge graph, exploring each
    /// node's edges in decreasing weight order. Stops on the first endpoint
    /// with a known resolution; confidence is the minimum edge weight along
    /// the path.
    async fn traverse(&self, start: &Identifier) -> SendFlowResult<Option<GraphHit>> {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(start.key());

        type Frame = (Identifier, u32, f64, Vec<(String, f64)>, Vec<Identifier>);
        let mut queue: VecDeque<Frame> = VecDeque::new();
        queue.push_back((start.clone(), 0, 1.0, Vec::new(), Vec::new()));
        let mut expansions = 0u32;

        while let Some((node, depth, confidence, hops, path)) = queue.pop_front() {
            if depth >= self.config.bfs_depth {
                continue;
            }
            let mut edges = self.store.edges_for(&node).await?;
            edges.sort_by(|a, b| {
                b.weight
                    .partial_cmp(&a.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            for edge in edges {
                expansions += 1;
                if expansions > self.config.bfs_budget {
                    debug!(start = %start.key(), "traversal budget exhausted");
                    return Ok(None);
                }
                let other = if edge.a == node { edge.b } else { edge.a };
                if !visited.insert(other.key()) {
                    continue;
                }
                let next_confidence = confidence.min(edge.weight);
                let mut next_hops = hops.clone();
                next_hops.push((
                    format!("graph_traversal:{}->{}", node.id_type, other.id_type),
                    next_confidence,
                ));
                let mut next_path = path.clone();
                next_path.push(other.clone());

                if let Some(entry) = self.store.get_resolution(&other).await? {
                    return Ok(Some(GraphHit {
                        universal_id: entry.universal_id,
                        confidence: next_confidence,
                        hops: next_hops,
                        path: next_path,
                    }));
                }
                queue.push_back((other, depth + 1, next_confidence, next_hops, next_path));
            }
        }
        Ok(None)
    }

    /// Idempotent resolution-cache upsert. Refreshing an existing mapping
    /// to the same Universal ID never lowers its confidence; a repoint to a
    /// different Universal ID takes the supplied confidence as-is.
    async fn bind(
        &self,
        identifier: &Identifier,
        universal_id: &UniversalId,
        confidence: f64,
    ) -> SendFlowResult<()> {
        let confidence = match self.store.get_resolution(identifier).await? {
            Some(existing) if &existing.universal_id == universal_id => {
                existing.confidence.max(confidence)
            }
            _ => confidence,
        };
        let now = Utc::now();
        self.store
            .upsert_resolution(&ResolutionEntry {
                identifier: identifier.clone(),
                universal_id: universal_id.clone(),
                confidence,
                last_seen: now,
                created_at: now,
            })
            .await
    }

    fn weight_of(&self, identifier: &Identifier) -> f64 {
        if identifier.id_type.is_deterministic() {
            1.0
        } else {
            self.config.weight_for(identifier.id_type)
        }
    }
}

fn truncate(value: &str) -> String {
    value.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::hash_email;
    use sendflow_identity_store::MemoryIdentityStore;

    fn resolver() -> (Arc<MemoryIdentityStore>, IdentityResolver) {
        let store = Arc::new(MemoryIdentityStore::new());
        let resolver = IdentityResolver::new(store.clone(), IdentityConfig::default());
        (store, resolver)
    }

    fn email_set(email: &str) -> IdentifierSet {
        IdentifierSet {
            email: Some(email.to_string()),
            ..Default::default()
        }
    }

    fn klaviyo_set(id: &str) -> IdentifierSet {
        IdentifierSet {
            klaviyo_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fresh_user_synthesizes_universal_id() {
        let (_, resolver) = resolver();
        let resolution = resolver.resolve(&email_set("alice@example.com")).await.unwrap();

        assert!(resolution.created);
        assert!(resolution.universal_id.as_str().starts_with("sf_"));
        assert_eq!(resolution.confidence, 1.0);
        assert!(resolution
            .steps
            .iter()
            .any(|s| s == "created:new_universal_id"));
    }

    #[tokio::test]
    async fn test_repeat_resolution_is_idempotent() {
        let (store, resolver) = resolver();
        let first = resolver.resolve(&email_set("alice@example.com")).await.unwrap();
        let second = resolver.resolve(&email_set("alice@example.com")).await.unwrap();

        assert_eq!(first.universal_id, second.universal_id);
        assert!(!second.created);
        assert_eq!(second.confidence, 1.0);
        // Re-resolution must not grow the edge graph.
        assert_eq!(store.edge_count(), 0);
    }

    #[tokio::test]
    async fn test_subset_resolution_returns_same_universal_id() {
        let (store, resolver) = resolver();
        let combined = IdentifierSet {
            email: Some("alice@example.com".to_string()),
            klaviyo_id: Some("k_alice".to_string()),
            ..Default::default()
        };
        let full = resolver.resolve(&combined).await.unwrap();
        let edges_after_first = store.edge_count();

        let by_klaviyo = resolver.resolve(&klaviyo_set("k_alice")).await.unwrap();
        assert_eq!(full.universal_id, by_klaviyo.universal_id);
        assert!(!by_klaviyo.created);

        // Idempotence: no duplicate edges from the second pass.
        let _ = resolver.resolve(&combined).await.unwrap();
        assert_eq!(store.edge_count(), edges_after_first);
    }

    #[tokio::test]
    async fn test_unlinked_klaviyo_then_graph_traversal() {
        let (store, resolver) = resolver();

        // Fresh email user.
        let alice = resolver.resolve(&email_set("alice@example.com")).await.unwrap();

        // Klaviyo ID with no prior link resolves to a different subject.
        let k_only = resolver.resolve(&klaviyo_set("k_alice")).await.unwrap();
        assert_ne!(alice.universal_id, k_only.universal_id);

        // Link the identifiers, then the Klaviyo ID resolves to the
        // original Universal ID through the graph with confidence 1.0.
        resolver
            .link_edge(
                Identifier::new(IdentifierType::EmailHash, hash_email("alice@example.com")),
                Identifier::new(IdentifierType::KlaviyoId, "k_alice"),
                1.0,
                "test",
            )
            .await
            .unwrap();

        let relinked = resolver.resolve(&klaviyo_set("k_alice")).await.unwrap();
        assert_eq!(relinked.universal_id, alice.universal_id);
        assert_eq!(relinked.confidence, 1.0);
        assert!(relinked
            .steps
            .iter()
            .any(|s| s == "graph_traversal:klaviyo_id->email_hash"));

        let trail = store.audit_trail(relinked.resolution_id).await.unwrap();
        assert!(trail
            .iter()
            .any(|r| r.step == "graph_traversal:klaviyo_id->email_hash"));
    }

    #[tokio::test]
    async fn test_probabilistic_confidence_is_path_minimum() {
        let (_, resolver) = resolver();

        // Subject known by email; a weak device signature is linked to an
        // esp user id, which is linked to the email hash.
        let alice = resolver.resolve(&email_set("alice@example.com")).await.unwrap();
        let email_ident =
            Identifier::new(IdentifierType::EmailHash, hash_email("alice@example.com"));
        let esp_ident = Identifier::new(IdentifierType::EspUserId, "esp_1");
        let device_ident = Identifier::new(IdentifierType::IpDeviceSignature, "sig_1");

        resolver
            .link_edge(email_ident, esp_ident.clone(), 1.0, "test")
            .await
            .unwrap();
        resolver
            .link_edge(esp_ident, device_ident, 0.5, "test")
            .await
            .unwrap();

        let by_device = resolver
            .resolve(&IdentifierSet {
                ip_device_signature: Some("sig_1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(by_device.universal_id, alice.universal_id);
        assert_eq!(by_device.confidence, 0.5);
    }

    #[tokio::test]
    async fn test_conflicting_deterministic_hits_merge_to_older() {
        let (store, resolver) = resolver();

        // Two independently created subjects.
        let older = resolver.resolve(&email_set("alice@example.com")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = resolver
            .resolve(&IdentifierSet {
                phone: Some("+15550100123".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_ne!(older.universal_id, newer.universal_id);

        // A request carrying both deterministic identifiers triggers the
        // merge: the older Universal ID wins.
        let merged = resolver
            .resolve(&IdentifierSet {
                email: Some("alice@example.com".to_string()),
                phone: Some("+15550100123".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(merged.universal_id, older.universal_id);
        assert!(merged.steps.iter().any(|s| s == "conflict_merged"));

        // The loser's identifier now points at the winner.
        let phone_ident = Identifier::new(IdentifierType::PhoneNumber, "+15550100123");
        let entry = store.get_resolution(&phone_ident).await.unwrap().unwrap();
        assert_eq!(entry.universal_id, older.universal_id);

        // Merge edge recorded with full weight.
        let edges = store
            .edges_for(&Identifier::new(
                IdentifierType::EmailHash,
                hash_email("alice@example.com"),
            ))
            .await
            .unwrap();
        assert!(edges
            .iter()
            .any(|e| e.source == "identity_merge" && e.weight == 1.0));
    }

    #[tokio::test]
    async fn test_empty_identifier_set_rejected() {
        let (_, resolver) = resolver();
        let err = resolver.resolve(&IdentifierSet::default()).await.unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[tokio::test]
    async fn test_synthesis_disabled_yields_identity_unresolved() {
        let store = Arc::new(MemoryIdentityStore::new());
        let config = IdentityConfig {
            synthesize_missing: false,
            ..Default::default()
        };
        let resolver = IdentityResolver::new(store, config);

        let err = resolver.resolve(&email_set("ghost@example.com")).await.unwrap_err();
        assert_eq!(err.code(), "identity_unresolved");
    }

    #[tokio::test]
    async fn test_audit_trail_reconstructs_derivation() {
        let (store, resolver) = resolver();
        let resolution = resolver.resolve(&email_set("alice@example.com")).await.unwrap();

        let trail = store.audit_trail(resolution.resolution_id).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].step, "created:new_universal_id");
        assert_eq!(trail[0].universal_id, resolution.universal_id);
        assert_eq!(trail[0].input_type, IdentifierType::EmailHash);
    }
}
