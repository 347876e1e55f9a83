//! Collaborator traits the Project Coordinator and Knowledge Ingestor depend
//! on but don't implement themselves: decomposing a query into subtasks,
//! integrating subtask results into an answer, and storing facts.
//!
//! Shaped after this codebase's planner module, which defines `NoopPolicy`/
//! `NoopMemory`/`NoopStream` marker structs that satisfy a collaborator
//! trait for testing and placeholder wiring. `StubLlmGateway` and
//! `InMemoryKnowledgeStore` below play the same role here: real deployments
//! swap in an LLM-backed gateway and a durable store, but the crate itself
//! never depends on either.

use crate::hsp::messages::{Fact, SemanticKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One step of a decomposed project: a named unit of work, the capability
/// name it should run against, its parameters (which may reference other
/// subtasks' outputs), and the subtask names it depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub name: String,
    pub capability_name: String,
    pub parameters: HashMap<String, serde_json::Value>,
    pub depends_on: Vec<String>,
}

/// A decomposition of a user query into a subtask DAG.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectPlan {
    pub subtasks: Vec<SubtaskSpec>,
}

/// Decomposes queries into subtask DAGs and integrates subtask results back
/// into a final answer. The actual reasoning (calling out to an LLM, a
/// rules engine, whatever) is entirely up to the implementation.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn decompose(&self, query: &str) -> Result<ProjectPlan, String>;
    async fn integrate(&self, query: &str, results: &HashMap<String, serde_json::Value>) -> Result<String, String>;
}

/// A deterministic placeholder gateway: treats the whole query as a single
/// subtask against a capability named after the query itself, and
/// integrates by rendering the collected results as JSON. Exists so the
/// crate and its tests don't require a real LLM to exercise the Coordinator.
#[derive(Debug, Clone, Default)]
pub struct StubLlmGateway;

#[async_trait]
impl LlmGateway for StubLlmGateway {
    async fn decompose(&self, query: &str) -> Result<ProjectPlan, String> {
        Ok(ProjectPlan {
            subtasks: vec![SubtaskSpec {
                name: "step1".to_string(),
                capability_name: query.to_string(),
                parameters: HashMap::new(),
                depends_on: Vec::new(),
            }],
        })
    }

    async fn integrate(
        &self,
        _query: &str,
        results: &HashMap<String, serde_json::Value>,
    ) -> Result<String, String> {
        serde_json::to_string(results).map_err(|e| e.to_string())
    }
}

/// A stored fact plus the scorecard state the Knowledge Ingestor maintains
/// for it: corroboration count and the effective confidence it was last
/// ingested with.
///
/// `supersedes`/`superseded_by` link a record to whichever fact replaced it
/// (or was replaced by it), so a superseded record is never overwritten in
/// place: it stays queryable by fact id for audit even after it drops out of
/// the live semantic-key index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFact {
    pub fact: Fact,
    pub effective_confidence: f64,
    pub corroboration_count: u32,
    pub superseded: bool,
    pub supersedes: Option<String>,
    pub superseded_by: Option<String>,
}

/// Durable storage for ingested facts, keyed by semantic key. The crate
/// ships [`InMemoryKnowledgeStore`] as the reference implementation; a real
/// deployment swaps in a persistent store behind the same trait.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn query_by_semantic_key(&self, key: &SemanticKey) -> Option<StoredFact>;
    async fn store(&self, key: SemanticKey, fact: StoredFact);
    async fn supersede(&self, key: &SemanticKey, fact: StoredFact);
    async fn increment_corroboration(&self, key: &SemanticKey);
    /// Look up any record, live or superseded, by its own fact id. Backs the
    /// audit trail a supersession leaves behind.
    async fn query_by_fact_id(&self, fact_id: &str) -> Option<StoredFact>;
    /// Persist a fact with no semantic key to dedup against (a natural-language
    /// or structured-document statement), addressable only by fact id.
    async fn store_unkeyed(&self, fact: StoredFact);
}

/// An in-memory `KnowledgeStore`. `facts` holds the live record per semantic
/// key; `by_fact_id` holds every record ever stored, live or superseded, so
/// supersession history and unkeyed facts stay queryable.
#[derive(Default)]
pub struct InMemoryKnowledgeStore {
    facts: RwLock<HashMap<SemanticKey, StoredFact>>,
    by_fact_id: RwLock<HashMap<String, StoredFact>>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn query_by_semantic_key(&self, key: &SemanticKey) -> Option<StoredFact> {
        self.facts.read().await.get(key).cloned()
    }

    async fn store(&self, key: SemanticKey, fact: StoredFact) {
        self.facts.write().await.insert(key, fact.clone());
        self.by_fact_id.write().await.insert(fact.fact.fact_id.clone(), fact);
    }

    /// Replace the live record under `key` with `new_fact`, but keep the old
    /// one around (marked `superseded`, back-linked) in `by_fact_id` instead
    /// of dropping it.
    async fn supersede(&self, key: &SemanticKey, mut new_fact: StoredFact) {
        let mut facts = self.facts.write().await;
        let mut by_id = self.by_fact_id.write().await;

        if let Some(mut old) = facts.get(key).cloned() {
            new_fact.supersedes = Some(old.fact.fact_id.clone());
            old.superseded = true;
            old.superseded_by = Some(new_fact.fact.fact_id.clone());
            by_id.insert(old.fact.fact_id.clone(), old);
        }

        facts.insert(key.clone(), new_fact.clone());
        by_id.insert(new_fact.fact.fact_id.clone(), new_fact);
    }

    async fn increment_corroboration(&self, key: &SemanticKey) {
        let updated = {
            let mut facts = self.facts.write().await;
            let Some(stored) = facts.get_mut(key) else {
                return;
            };
            stored.corroboration_count += 1;
            stored.clone()
        };
        self.by_fact_id
            .write()
            .await
            .insert(updated.fact.fact_id.clone(), updated);
    }

    async fn query_by_fact_id(&self, fact_id: &str) -> Option<StoredFact> {
        self.by_fact_id.read().await.get(fact_id).cloned()
    }

    async fn store_unkeyed(&self, fact: StoredFact) {
        self.by_fact_id.write().await.insert(fact.fact.fact_id.clone(), fact);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_gateway_decomposes_to_a_single_subtask() {
        let gateway = StubLlmGateway;
        let plan = gateway.decompose("what is 2+2").await.unwrap();
        assert_eq!(plan.subtasks.len(), 1);
        assert!(plan.subtasks[0].depends_on.is_empty());
    }

    #[tokio::test]
    async fn in_memory_store_roundtrips_and_increments_corroboration() {
        let store = InMemoryKnowledgeStore::new();
        let key = SemanticKey {
            subject: "sky".to_string(),
            predicate: "is".to_string(),
            object: "blue".to_string(),
        };
        let fact = Fact::triple("f1", "agent-1", "sky", "is", "blue", 0.8);
        store
            .store(
                key.clone(),
                StoredFact {
                    fact,
                    effective_confidence: 0.7,
                    corroboration_count: 1,
                    superseded: false,
                    supersedes: None,
                    superseded_by: None,
                },
            )
            .await;
        store.increment_corroboration(&key).await;
        let stored = store.query_by_semantic_key(&key).await.unwrap();
        assert_eq!(stored.corroboration_count, 2);
    }

    #[tokio::test]
    async fn supersession_keeps_the_old_record_queryable_by_fact_id() {
        let store = InMemoryKnowledgeStore::new();
        let key = SemanticKey {
            subject: "sky".to_string(),
            predicate: "is".to_string(),
            object: "blue".to_string(),
        };
        let old = Fact::triple("f1", "agent-1", "sky", "is", "blue", 0.6);
        store
            .store(
                key.clone(),
                StoredFact {
                    fact: old,
                    effective_confidence: 0.6,
                    corroboration_count: 1,
                    superseded: false,
                    supersedes: None,
                    superseded_by: None,
                },
            )
            .await;

        let new = Fact::triple("f2", "agent-2", "sky", "is", "blue", 0.95);
        store
            .supersede(
                &key,
                StoredFact {
                    fact: new,
                    effective_confidence: 0.95,
                    corroboration_count: 1,
                    superseded: false,
                    supersedes: None,
                    superseded_by: None,
                },
            )
            .await;

        let live = store.query_by_semantic_key(&key).await.unwrap();
        assert_eq!(live.fact.fact_id, "f2");
        assert_eq!(live.supersedes.as_deref(), Some("f1"));

        let old_record = store.query_by_fact_id("f1").await.unwrap();
        assert!(old_record.superseded);
        assert_eq!(old_record.superseded_by.as_deref(), Some("f2"));
    }
}
