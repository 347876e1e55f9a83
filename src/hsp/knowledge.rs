//! The Knowledge Ingestor: scores, deduplicates, and reconciles incoming
//! facts against what's already known — the "Fact Scorecard".
//!
//! No teacher file owns durable memory directly; the per-key read-modify-write
//! here follows the same `RwLock`-guarded `HashMap` idiom this codebase uses
//! throughout (`ToolRegistry`, `UnifiedMcpServer`), scoped per semantic key
//! via the [`KnowledgeStore`] collaborator so concurrent ingests of
//! *different* facts never block each other.

use crate::hsp::config::OrchestratorConfig;
use crate::hsp::error::IngestError;
use crate::hsp::gateway::{KnowledgeStore, StoredFact};
use crate::hsp::messages::{Fact, SemanticKey, Statement};
use crate::hsp::trust::TrustPolicy;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Below this effective confidence (`confidence_score * trust`), an incoming
/// fact is quarantined rather than stored.
pub const DEFAULT_INGESTION_FLOOR: f64 = 0.2;
/// Bonus added to a fact's effective confidence when it introduces a brand
/// new semantic key, capped at 1.0.
pub const NOVELTY_BONUS: f64 = 0.05;
/// Two effective-confidence scores within this margin are treated as tied;
/// a tied incoming fact corroborates rather than supersedes.
pub const SUPERSESSION_EPSILON: f64 = 0.01;

/// What the ingestor did with one fact.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Brand new semantic key: stored with a novelty bonus applied.
    Novel,
    /// An existing record at the same semantic key corroborated, not replaced.
    Corroborated,
    /// This fact's effective confidence exceeded the existing record's by
    /// more than the epsilon: the existing record was replaced.
    Superseded,
    /// The existing record was kept because it had the higher (or tied)
    /// effective confidence.
    Rejected,
}

fn semantic_key_of(fact: &Fact) -> Option<SemanticKey> {
    match &fact.statement {
        Statement::SemanticTriple {
            subject,
            predicate,
            object,
        } => Some(SemanticKey {
            subject: subject.to_lowercase(),
            predicate: predicate.to_lowercase(),
            object: object.to_lowercase(),
        }),
        _ => None,
    }
}

/// Computes effective confidence, deduplicates, and reconciles incoming
/// facts against a [`KnowledgeStore`].
pub struct KnowledgeIngestor {
    store: Arc<dyn KnowledgeStore>,
    trust_policy: Arc<dyn TrustPolicy>,
    ingestion_floor: f64,
    // Serializes ingestion per-process so two concurrent facts for the same
    // semantic key can't both observe the pre-update state and race each
    // other into a lost update.
    ingest_lock: Mutex<()>,
}

impl KnowledgeIngestor {
    pub fn new(store: Arc<dyn KnowledgeStore>, trust_policy: Arc<dyn TrustPolicy>) -> Self {
        Self {
            store,
            trust_policy,
            ingestion_floor: DEFAULT_INGESTION_FLOOR,
            ingest_lock: Mutex::new(()),
        }
    }

    pub fn with_ingestion_floor(mut self, floor: f64) -> Self {
        self.ingestion_floor = floor;
        self
    }

    /// Apply the relevant fields of an [`OrchestratorConfig`] to this ingestor.
    pub fn with_config(mut self, config: &OrchestratorConfig) -> Self {
        self.ingestion_floor = config.ingestion_floor;
        self
    }

    /// Ingest one fact, scored from the trust of `direct_sender_id` — the
    /// agent that handed us this fact, which may differ from
    /// `fact.originating_agent_id` if it arrived relayed. Facts without a
    /// semantic-triple statement are persisted unconditionally (there's
    /// nothing to deduplicate against) as long as they clear the ingestion
    /// floor; they just aren't corroborated or superseded like triples are.
    pub async fn ingest(&self, fact: Fact, direct_sender_id: &str) -> Result<IngestOutcome, IngestError> {
        let _guard = self.ingest_lock.lock().await;

        let trust = self.trust_policy.trust_of(direct_sender_id);
        let base_confidence = fact.confidence_score * trust;

        let Some(semantic_key) = semantic_key_of(&fact) else {
            if base_confidence < self.ingestion_floor {
                return Err(IngestError::Quarantined {
                    fact_id: fact.fact_id.clone(),
                    effective_confidence: base_confidence,
                });
            }
            info!("fact {} persisted without deduplication (non-triple statement)", fact.fact_id);
            self.store
                .store_unkeyed(StoredFact {
                    fact: fact.clone(),
                    effective_confidence: base_confidence,
                    corroboration_count: 1,
                    superseded: false,
                    supersedes: None,
                    superseded_by: None,
                })
                .await;
            return Ok(IngestOutcome::Novel);
        };

        match self.store.query_by_semantic_key(&semantic_key).await {
            None => {
                let effective_confidence = (base_confidence + NOVELTY_BONUS).min(1.0);
                if effective_confidence < self.ingestion_floor {
                    return Err(IngestError::Quarantined {
                        fact_id: fact.fact_id.clone(),
                        effective_confidence,
                    });
                }
                info!("fact {} is novel at semantic key {:?}", fact.fact_id, semantic_key);
                self.store
                    .store(
                        semantic_key,
                        StoredFact {
                            fact,
                            effective_confidence,
                            corroboration_count: 1,
                            superseded: false,
                            supersedes: None,
                            superseded_by: None,
                        },
                    )
                    .await;
                Ok(IngestOutcome::Novel)
            }
            Some(existing) => {
                if base_confidence < self.ingestion_floor {
                    return Err(IngestError::Quarantined {
                        fact_id: fact.fact_id.clone(),
                        effective_confidence: base_confidence,
                    });
                }

                let delta = base_confidence - existing.effective_confidence;
                if delta.abs() <= SUPERSESSION_EPSILON {
                    // Same conclusion, corroborating evidence: bump the counter,
                    // leave the stored confidence and fact content untouched.
                    self.store.increment_corroboration(&semantic_key).await;
                    Ok(IngestOutcome::Corroborated)
                } else if delta > SUPERSESSION_EPSILON {
                    warn!(
                        "fact {} supersedes existing record at {:?} ({:.3} > {:.3})",
                        fact.fact_id, semantic_key, base_confidence, existing.effective_confidence
                    );
                    let corroboration_count = existing.corroboration_count;
                    self.store
                        .supersede(
                            &semantic_key,
                            StoredFact {
                                fact,
                                effective_confidence: base_confidence,
                                corroboration_count,
                                superseded: false,
                                supersedes: None,
                                superseded_by: None,
                            },
                        )
                        .await;
                    Ok(IngestOutcome::Superseded)
                } else {
                    Ok(IngestOutcome::Rejected)
                }
            }
        }
    }
}
