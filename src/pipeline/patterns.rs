/// Pattern detection: recurring context/outcome co-occurrence.
///
/// Scans the window for context `(key, value)` pairs that repeatedly
/// co-occur with the same outcome. Pairs at or above the support threshold
/// emit a context concept, an outcome concept, and a `CoOccursWith`
/// relationship whose confidence is the observed frequency over the window,
/// with the supporting episode ids as evidence.
use super::{context_label, StageOutcome};
use crate::error::MemoryResult;
use crate::semantic::SemanticStore;
use crate::types::{Concept, ExperienceRecord, RecordId, RelationKind, Relationship};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Pattern detection configuration.
#[derive(Debug, Clone)]
pub struct PatternConfig {
    /// Minimum co-occurrence count before a pattern is emitted
    pub support_threshold: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            support_threshold: 3,
        }
    }
}

/// The pattern-detection stage.
pub struct PatternDetector {
    config: PatternConfig,
}

impl PatternDetector {
    /// Create the stage with its configuration.
    pub fn new(config: PatternConfig) -> Self {
        Self { config }
    }

    /// Scan the window and emit supported patterns into the semantic store.
    pub(crate) fn run(
        &self,
        window: &[Arc<ExperienceRecord>],
        semantic: &SemanticStore,
    ) -> MemoryResult<StageOutcome> {
        let mut outcome = StageOutcome::new();
        if window.is_empty() {
            return Ok(outcome);
        }

        // (context key, context value, outcome) -> supporting episodes
        let mut support: BTreeMap<(String, String, String), BTreeSet<RecordId>> = BTreeMap::new();

        for record in window {
            let Some(observed) = &record.outcome else {
                continue;
            };
            let mut skipped_value = false;
            for (key, value) in &record.context {
                match crate::types::scalar_key(value) {
                    Some(rendered) => {
                        support
                            .entry((key.clone(), rendered, observed.clone()))
                            .or_default()
                            .insert(record.id);
                    }
                    None => skipped_value = true,
                }
            }
            if skipped_value {
                outcome
                    .skipped
                    .push((record.id, "non-scalar context value".to_string()));
            }
        }

        let window_size = window.len();
        for ((key, value, observed), evidence) in support {
            if evidence.len() < self.config.support_threshold {
                continue;
            }
            let confidence = evidence.len() as f64 / window_size as f64;

            let context_id = semantic.upsert_concept(
                Concept::new(context_label(&key, &value))
                    .with_attribute("kind", json!("context"))
                    .with_attribute("context_key", json!(key))
                    .with_attribute("context_value", json!(value))
                    .with_confidence(confidence),
            )?;
            let outcome_id = semantic.upsert_concept(
                Concept::new(&observed)
                    .with_attribute("kind", json!("outcome"))
                    .with_confidence(confidence),
            )?;
            semantic.upsert_relationship(
                Relationship::new(context_id, RelationKind::CoOccursWith, outcome_id)
                    .with_confidence(confidence)
                    .with_evidence(evidence.iter().copied()),
            )?;
            outcome.emitted += 3;

            debug!(
                context = %context_label(&key, &value),
                outcome = %observed,
                support = evidence.len(),
                "pattern emitted"
            );
        }

        Ok(outcome)
    }
}
