/// Causal analysis: antecedent context recurring before a consistent outcome.
///
/// For every context `(key, value)` occurrence, resolves its outcome - the
/// record's own, or the earliest following outcome-bearing record within
/// the lag window - and counts conditional co-occurrence. A pair seen at
/// least `min_samples` times emits a `Causes` relationship whose confidence
/// is count(context AND outcome) / count(context with any resolved outcome).
/// The minimum sample count keeps single observations from becoming causal
/// claims.
use super::{context_label, StageOutcome};
use crate::error::MemoryResult;
use crate::semantic::SemanticStore;
use crate::types::{Concept, ExperienceRecord, RecordId, RelationKind, Relationship};
use chrono::Duration as ChronoDuration;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Causal analysis configuration.
#[derive(Debug, Clone)]
pub struct CausalConfig {
    /// How far after an antecedent a following outcome may resolve
    pub lag: Duration,
    /// Minimum co-occurrence count before a causal edge is emitted
    pub min_samples: usize,
}

impl Default for CausalConfig {
    fn default() -> Self {
        Self {
            lag: Duration::from_secs(60),
            min_samples: 5,
        }
    }
}

/// The causal-analysis stage.
pub struct CausalAnalyzer {
    config: CausalConfig,
}

impl CausalAnalyzer {
    /// Create the stage with its configuration.
    pub fn new(config: CausalConfig) -> Self {
        Self { config }
    }

    /// The outcome an antecedent record resolves to: its own, or the
    /// earliest following outcome-bearing record within the lag window.
    fn resolve_outcome(
        &self,
        index: usize,
        window: &[Arc<ExperienceRecord>],
    ) -> Option<(String, RecordId)> {
        let record = &window[index];
        if let Some(own) = &record.outcome {
            return Some((own.clone(), record.id));
        }

        let lag = ChronoDuration::from_std(self.config.lag).ok()?;
        let deadline = record.timestamp.checked_add_signed(lag)?;
        for following in &window[index + 1..] {
            if following.timestamp > deadline {
                break;
            }
            if let Some(observed) = &following.outcome {
                return Some((observed.clone(), following.id));
            }
        }
        None
    }

    /// Scan the window (ascending time order) and emit supported causal
    /// edges into the semantic store.
    pub(crate) fn run(
        &self,
        window: &[Arc<ExperienceRecord>],
        semantic: &SemanticStore,
    ) -> MemoryResult<StageOutcome> {
        let mut outcome = StageOutcome::new();
        if window.is_empty() {
            return Ok(outcome);
        }

        // (context key, context value) -> occurrences with any resolved outcome
        let mut resolved_totals: BTreeMap<(String, String), usize> = BTreeMap::new();
        // (context key, context value, outcome) -> (co-occurrence count, evidence)
        let mut co_occurrence: BTreeMap<(String, String, String), (usize, BTreeSet<RecordId>)> =
            BTreeMap::new();

        for (index, record) in window.iter().enumerate() {
            let Some((observed, outcome_record)) = self.resolve_outcome(index, window) else {
                continue;
            };
            let mut skipped_value = false;
            for (key, value) in &record.context {
                match crate::types::scalar_key(value) {
                    Some(rendered) => {
                        *resolved_totals
                            .entry((key.clone(), rendered.clone()))
                            .or_default() += 1;
                        let (count, evidence) = co_occurrence
                            .entry((key.clone(), rendered, observed.clone()))
                            .or_default();
                        *count += 1;
                        evidence.insert(record.id);
                        evidence.insert(outcome_record);
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

        for ((key, value, observed), (samples, evidence)) in co_occurrence {
            if samples < self.config.min_samples {
                continue;
            }

            let total = resolved_totals
                .get(&(key.clone(), value.clone()))
                .copied()
                .unwrap_or(samples);
            let confidence = samples as f64 / total as f64;

            let antecedent = semantic.upsert_concept(
                Concept::new(context_label(&key, &value))
                    .with_attribute("kind", json!("context"))
                    .with_attribute("context_key", json!(key))
                    .with_attribute("context_value", json!(value))
                    .with_confidence(confidence),
            )?;
            let consequent = semantic.upsert_concept(
                Concept::new(&observed)
                    .with_attribute("kind", json!("outcome"))
                    .with_confidence(confidence),
            )?;
            semantic.upsert_relationship(
                Relationship::new(antecedent, RelationKind::Causes, consequent)
                    .with_confidence(confidence)
                    .with_evidence(evidence.iter().copied()),
            )?;
            outcome.emitted += 3;

            debug!(
                antecedent = %context_label(&key, &value),
                consequent = %observed,
                samples,
                confidence,
                "causal edge emitted"
            );
        }

        Ok(outcome)
    }
}
