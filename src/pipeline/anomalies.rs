/// Anomaly detection: statistical outliers against a context baseline.
///
/// Groups the window by context `(key, value)` pair; within each
/// sufficiently-large group, every numeric context feature gets a
/// mean/stddev baseline, and records deviating beyond the z-score threshold
/// are annotated with an [`AnomalyMarker`] in the semantic store. Flagged
/// records are retained and never mutated - the marker only references
/// them. Zero-variance baselines flag nothing.
use super::StageOutcome;
use crate::error::MemoryResult;
use crate::semantic::SemanticStore;
use crate::types::{AnomalyMarker, ExperienceRecord, RecordId};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Anomaly detection configuration.
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    /// Flag records whose |z-score| exceeds this
    pub anomaly_threshold: f64,
    /// Minimum peer-group size before a baseline is trusted
    pub min_baseline: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            anomaly_threshold: 3.0,
            min_baseline: 4,
        }
    }
}

/// The anomaly-detection stage.
pub struct AnomalyDetector {
    config: AnomalyConfig,
}

impl AnomalyDetector {
    /// Create the stage with its configuration.
    pub fn new(config: AnomalyConfig) -> Self {
        Self { config }
    }

    /// Scan the window and annotate outliers.
    pub(crate) fn run(
        &self,
        window: &[Arc<ExperienceRecord>],
        semantic: &SemanticStore,
    ) -> MemoryResult<StageOutcome> {
        let mut outcome = StageOutcome::new();

        // (context key, context value) -> member records
        let mut groups: BTreeMap<(String, String), Vec<&Arc<ExperienceRecord>>> = BTreeMap::new();
        for record in window {
            for (key, value) in &record.context {
                if let Some(rendered) = crate::types::scalar_key(value) {
                    groups
                        .entry((key.clone(), rendered))
                        .or_default()
                        .push(record);
                }
            }
        }

        for ((group_key, group_value), members) in groups {
            if members.len() < self.config.min_baseline {
                continue;
            }

            // Numeric features present in this group, excluding the
            // grouping key itself
            let mut features: BTreeMap<String, Vec<(RecordId, f64)>> = BTreeMap::new();
            for record in &members {
                for (key, value) in &record.context {
                    if key == &group_key {
                        continue;
                    }
                    if let Some(number) = value.as_f64() {
                        features
                            .entry(key.clone())
                            .or_default()
                            .push((record.id, number));
                    }
                }
            }

            for (feature, samples) in features {
                if samples.len() < self.config.min_baseline {
                    continue;
                }
                let n = samples.len() as f64;
                let mean = samples.iter().map(|(_, v)| v).sum::<f64>() / n;
                let variance =
                    samples.iter().map(|(_, v)| (v - mean).powi(2)).sum::<f64>() / n;
                let stddev = variance.sqrt();
                if stddev == 0.0 {
                    continue;
                }

                for (record_id, observed) in samples {
                    let deviation = ((observed - mean) / stddev).abs();
                    if deviation <= self.config.anomaly_threshold {
                        continue;
                    }
                    semantic.annotate_anomaly(AnomalyMarker {
                        id: AnomalyMarker::id_for(record_id, &group_key, &group_value, &feature),
                        record: record_id,
                        feature: feature.clone(),
                        observed,
                        baseline_mean: mean,
                        baseline_stddev: stddev,
                        deviation,
                        context_key: group_key.clone(),
                        context_value: group_value.clone(),
                        detected_at: Utc::now(),
                    })?;
                    outcome.emitted += 1;

                    debug!(
                        record = %record_id,
                        feature = %feature,
                        deviation,
                        "anomaly annotated"
                    );
                }
            }
        }

        Ok(outcome)
    }
}
