/// Knowledge compilation: distilling the existing graph into shortcut edges.
///
/// Two passes, both strictly additive and idempotent. Transitive closure
/// chains `Causes`/`Implies`/`IsA` edges into `Implies` shortcuts with
/// product confidence, repeated until no round changes anything. Label
/// consolidation links concepts whose normalized labels coincide with a
/// `SimilarTo` edge, so near-duplicate labels stay queryable as one notion.
use super::StageOutcome;
use crate::error::MemoryResult;
use crate::semantic::SemanticStore;
use crate::types::{RecordId, RelationKind, Relationship};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Knowledge compilation configuration.
#[derive(Debug, Clone)]
pub struct CompileConfig {
    /// Ceiling on closure rounds; each round chains one more hop
    pub max_closure_rounds: usize,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            max_closure_rounds: 4,
        }
    }
}

/// The knowledge-compilation stage.
pub struct KnowledgeCompiler {
    config: CompileConfig,
}

impl KnowledgeCompiler {
    /// Create the stage with its configuration.
    pub fn new(config: CompileConfig) -> Self {
        Self { config }
    }

    /// Compile the semantic graph in place.
    pub(crate) fn run(&self, semantic: &SemanticStore) -> MemoryResult<StageOutcome> {
        let mut outcome = StageOutcome::new();
        outcome.emitted += self.close_transitive(semantic)?;
        outcome.emitted += self.consolidate_labels(semantic)?;
        Ok(outcome)
    }

    /// Chain transitive edges into `Implies` shortcuts until fixpoint.
    fn close_transitive(&self, semantic: &SemanticStore) -> MemoryResult<usize> {
        let floor = semantic.config().confidence_floor;
        let mut emitted = 0;

        for round in 0..self.config.max_closure_rounds {
            // source -> [(target, confidence, evidence)], live transitive edges only
            let mut adjacency: BTreeMap<String, Vec<(String, f64, BTreeSet<RecordId>)>> =
                BTreeMap::new();
            let mut edges = semantic.all_relationships();
            edges.retain(|r| !r.orphaned && r.kind.is_transitive());
            edges.sort_by(|a, b| a.id.cmp(&b.id));
            for edge in &edges {
                adjacency.entry(edge.source.clone()).or_default().push((
                    edge.target.clone(),
                    edge.confidence,
                    edge.evidence.clone(),
                ));
            }

            let mut round_emitted = 0;
            for edge in &edges {
                let Some(continuations) = adjacency.get(&edge.target) else {
                    continue;
                };
                for (target, confidence, evidence) in continuations {
                    if *target == edge.source {
                        continue;
                    }
                    let chained = edge.confidence * confidence;
                    if chained < floor {
                        continue;
                    }
                    let mut combined: BTreeSet<RecordId> = edge.evidence.clone();
                    combined.extend(evidence.iter().copied());

                    // Skip when the shortcut already subsumes this chain,
                    // otherwise reruns never reach a fixpoint.
                    if let Some(existing) = semantic.relationship_between(
                        &edge.source,
                        RelationKind::Implies,
                        target,
                    ) {
                        if existing.confidence >= chained
                            && combined.is_subset(&existing.evidence)
                        {
                            continue;
                        }
                    }

                    semantic.upsert_relationship(
                        Relationship::new(edge.source.clone(), RelationKind::Implies, target)
                            .with_confidence(chained)
                            .with_evidence(combined),
                    )?;
                    round_emitted += 1;
                }
            }

            debug!(round, emitted = round_emitted, "closure round");
            if round_emitted == 0 {
                break;
            }
            emitted += round_emitted;
        }

        Ok(emitted)
    }

    /// Link concepts whose labels normalize to the same form.
    fn consolidate_labels(&self, semantic: &SemanticStore) -> MemoryResult<usize> {
        let mut by_normalized: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for concept in semantic.all_concepts() {
            by_normalized
                .entry(normalize_label(&concept.label))
                .or_default()
                .push(concept.id);
        }

        let mut emitted = 0;
        for (_, mut ids) in by_normalized {
            if ids.len() < 2 {
                continue;
            }
            ids.sort();
            // Pairwise in both id orders collapses to one edge per pair:
            // the lower id is always the source.
            for pair in ids.windows(2) {
                let (source, target) = (&pair[0], &pair[1]);
                let evidence: BTreeSet<RecordId> = [source, target]
                    .iter()
                    .filter_map(|id| semantic.concept(id))
                    .flat_map(|c| c.examples)
                    .collect();

                if let Some(existing) =
                    semantic.relationship_between(source, RelationKind::SimilarTo, target)
                {
                    if evidence.is_subset(&existing.evidence) {
                        continue;
                    }
                }

                semantic.upsert_relationship(
                    Relationship::new(source.clone(), RelationKind::SimilarTo, target.clone())
                        .with_confidence(1.0)
                        .with_evidence(evidence),
                )?;
                emitted += 1;
            }
        }

        Ok(emitted)
    }
}

/// Lowercased, with whitespace/hyphen runs collapsed to single underscores.
fn normalize_label(label: &str) -> String {
    let mut normalized = String::with_capacity(label.len());
    let mut pending_separator = false;
    for c in label.trim().chars() {
        if c.is_whitespace() || c == '-' || c == '_' {
            pending_separator = !normalized.is_empty();
        } else {
            if pending_separator {
                normalized.push('_');
                pending_separator = false;
            }
            normalized.extend(c.to_lowercase());
        }
    }
    normalized
}
