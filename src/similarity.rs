/// Pluggable similarity scoring for episodic recall.
///
/// The episodic store treats scoring as an opaque injected capability: any
/// `score(a, b) -> f64` that is deterministic for identical inputs can
/// drive `find_similar`. Embedding-model scorers live outside this crate;
/// the shipped default scores on tag and context overlap so the engine
/// works out of the box with no ML dependency.
use crate::types::ExperienceRecord;
use std::collections::BTreeSet;

/// A similarity scoring capability.
///
/// Must be deterministic for identical inputs. Higher scores mean more
/// similar; the episodic store imposes no other interpretation.
pub trait SimilarityScorer: Send + Sync {
    /// Score the similarity of two records.
    fn score(&self, a: &ExperienceRecord, b: &ExperienceRecord) -> f64;
}

/// Default scorer: weighted Jaccard overlap of tags and context entries.
///
/// Context entries match on exact `key=value` equality of their JSON
/// rendering. Purely structural and fully deterministic.
#[derive(Debug, Clone)]
pub struct ContextOverlapScorer {
    /// Weight of tag overlap in the combined score
    pub tag_weight: f64,
    /// Weight of context-entry overlap in the combined score
    pub context_weight: f64,
}

impl Default for ContextOverlapScorer {
    fn default() -> Self {
        Self {
            tag_weight: 0.5,
            context_weight: 0.5,
        }
    }
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

impl SimilarityScorer for ContextOverlapScorer {
    fn score(&self, a: &ExperienceRecord, b: &ExperienceRecord) -> f64 {
        let tags_a: BTreeSet<String> = a.tags.iter().cloned().collect();
        let tags_b: BTreeSet<String> = b.tags.iter().cloned().collect();

        let ctx_a: BTreeSet<String> = a
            .context
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let ctx_b: BTreeSet<String> = b
            .context
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        self.tag_weight * jaccard(&tags_a, &tags_b)
            + self.context_weight * jaccard(&ctx_a, &ctx_b)
    }
}
