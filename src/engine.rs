/// The memory engine facade.
///
/// Wires the three memory tiers - episodic, semantic, working - over one
/// shared record store, fronted by the recall cache and fed by the
/// processing pipeline. Cheap to clone; every clone shares the same
/// underlying state.
///
/// With a data directory configured, every durable mutation is journaled
/// before it is applied, and startup replays the journal so a crash between
/// snapshots loses nothing that was acknowledged. Without one, the engine
/// runs fully in memory.
use crate::cache::{CacheConfig, CacheStats, RecallCache};
use crate::episodic::{self, EpisodicStore};
use crate::error::{MemoryError, MemoryResult};
use crate::persistence::{self, FileJournal, SnapshotInfo, StoreSnapshot};
use crate::pipeline::{AnalysisWindow, Pipeline, PipelineConfig, PipelineReport, PipelineStats};
use crate::semantic::{self, InferenceQuery, SemanticConfig, SemanticStore};
use crate::similarity::{ContextOverlapScorer, SimilarityScorer};
use crate::store::{Journal, RecordStore};
use crate::types::{
    AnomalyMarker, Concept, ConceptId, DerivedFact, ExperienceRecord, RecordId, Relationship,
    RelationshipId, Sequence, SequenceId,
};
use crate::working::{WorkingConfig, WorkingItem, WorkingMemory, WorkingStats};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const JOURNAL_FILE: &str = "journal.log";

/// Engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Directory for the journal; `None` runs fully in memory
    pub data_dir: Option<PathBuf>,
    pub cache: CacheConfig,
    pub working: WorkingConfig,
    pub semantic: SemanticConfig,
    pub pipeline: PipelineConfig,
}

impl EngineConfig {
    /// In-memory configuration with all defaults.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Durable configuration journaling under `data_dir`.
    pub fn durable(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            ..Self::default()
        }
    }
}

/// Aggregate engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub episodes: usize,
    pub sequences: usize,
    pub concepts: usize,
    pub relationships: usize,
    pub anomalies: usize,
    pub working_items: usize,
    pub cache: CacheStats,
    pub working: WorkingStats,
    pub pipeline: PipelineStats,
}

/// The engine. Clones share all state.
#[derive(Clone)]
pub struct MemoryEngine {
    store: Arc<RecordStore>,
    cache: Arc<RecallCache>,
    episodic: Arc<EpisodicStore>,
    semantic: Arc<SemanticStore>,
    working: Arc<WorkingMemory>,
    pipeline: Arc<Pipeline>,
    journal: Option<Arc<FileJournal>>,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("episodes", &self.episodic.len())
            .field("concepts", &self.semantic.concept_count())
            .field("working_items", &self.working.len())
            .finish()
    }
}

impl MemoryEngine {
    /// Start an in-memory engine with default configuration.
    pub async fn start() -> MemoryResult<Self> {
        Self::start_with_config(EngineConfig::default()).await
    }

    /// Start with custom configuration, using the default context-overlap
    /// similarity scorer.
    pub async fn start_with_config(config: EngineConfig) -> MemoryResult<Self> {
        Self::start_with_scorer(config, Arc::new(ContextOverlapScorer::default())).await
    }

    /// Start with custom configuration and similarity scorer.
    ///
    /// When a data directory is configured, the journal is replayed before
    /// any operation is accepted, and the in-memory views are rebuilt from
    /// the recovered store.
    pub async fn start_with_scorer(
        config: EngineConfig,
        scorer: Arc<dyn SimilarityScorer>,
    ) -> MemoryResult<Self> {
        let (store, journal) = match &config.data_dir {
            Some(dir) => {
                let journal = Arc::new(
                    FileJournal::open(dir.join(JOURNAL_FILE))
                        .map_err(|e| MemoryError::io("opening journal", e))?,
                );
                let store = Arc::new(RecordStore::with_journal(Arc::clone(&journal) as Arc<dyn Journal>));
                (store, Some(journal))
            }
            None => (Arc::new(RecordStore::new()), None),
        };

        store.register_collection(episodic::COLLECTION, episodic::index_defs())?;
        store.register_collection(episodic::SEQUENCES, episodic::sequence_index_defs())?;
        store.register_collection(semantic::CONCEPTS, semantic::concept_index_defs())?;
        store.register_collection(semantic::RELATIONSHIPS, semantic::relationship_index_defs())?;
        store.register_collection(semantic::ANOMALIES, semantic::anomaly_index_defs())?;

        let cache = Arc::new(RecallCache::with_config(config.cache.clone()));
        let episodic = Arc::new(EpisodicStore::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            scorer,
        ));
        let semantic = Arc::new(SemanticStore::new(
            Arc::clone(&store),
            config.semantic.clone(),
        ));
        let working = Arc::new(WorkingMemory::with_config(config.working.clone()));
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&episodic),
            Arc::clone(&semantic),
            config.pipeline.clone(),
        ));

        if let Some(dir) = &config.data_dir {
            let replayed = persistence::replay_journal(&store, &dir.join(JOURNAL_FILE))?;
            if replayed > 0 {
                episodic.rebuild_from_store()?;
                semantic.rebuild_from_store()?;
                info!(replayed, "journal replayed");
            }
        }

        Ok(Self {
            store,
            cache,
            episodic,
            semantic,
            working,
            pipeline,
            journal,
        })
    }

    // ---- episodic tier ----

    /// Append an experience record to the episodic log.
    pub async fn append(&self, record: ExperienceRecord) -> MemoryResult<RecordId> {
        self.episodic.append(record)
    }

    /// Recall one record by id; `None` when it was never appended.
    pub async fn recall(&self, id: RecordId) -> MemoryResult<Option<Arc<ExperienceRecord>>> {
        match self.episodic.get(id) {
            Ok(record) => Ok(Some(record)),
            Err(MemoryError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Records with `start <= timestamp <= end`, ascending `(timestamp, id)`.
    pub async fn recall_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Arc<ExperienceRecord>> {
        self.episodic.get_range(start, end)
    }

    /// Records carrying a tag, ascending `(timestamp, id)`.
    pub async fn recall_by_tag(&self, tag: &str) -> MemoryResult<Vec<Arc<ExperienceRecord>>> {
        self.episodic.find_by_tag(tag)
    }

    /// Records with a given outcome, ascending `(timestamp, id)`.
    pub async fn recall_by_outcome(
        &self,
        outcome: &str,
    ) -> MemoryResult<Vec<Arc<ExperienceRecord>>> {
        self.episodic.find_by_outcome(outcome)
    }

    /// The `k` records most similar to `query`, best first.
    pub async fn find_similar(
        &self,
        query: &ExperienceRecord,
        k: usize,
    ) -> Vec<(Arc<ExperienceRecord>, f64)> {
        self.episodic.find_similar(query, k)
    }

    /// Create a named, initially empty sequence of episodes.
    pub async fn create_sequence(&self, name: impl Into<String>) -> MemoryResult<SequenceId> {
        self.episodic.create_sequence(name)
    }

    /// Add an appended record to a sequence.
    pub async fn extend_sequence(
        &self,
        sequence_id: SequenceId,
        record_id: RecordId,
    ) -> MemoryResult<()> {
        self.episodic.extend_sequence(sequence_id, record_id)
    }

    /// All sequences containing a record, ordered by name then id.
    pub async fn sequences_for(&self, record_id: RecordId) -> MemoryResult<Vec<Arc<Sequence>>> {
        self.episodic.sequences_for(record_id)
    }

    // ---- semantic tier ----

    /// Insert or merge a concept, returning its content id.
    pub async fn learn_concept(&self, concept: Concept) -> MemoryResult<ConceptId> {
        self.semantic.upsert_concept(concept)
    }

    /// Insert or merge a relationship between existing concepts.
    pub async fn learn_relationship(
        &self,
        relationship: Relationship,
    ) -> MemoryResult<RelationshipId> {
        self.semantic.upsert_relationship(relationship)
    }

    /// Look up a concept by label.
    pub async fn concept_by_label(&self, label: &str) -> Option<Concept> {
        self.semantic.concept_by_label(label)
    }

    /// Direct neighbors of a concept, in both edge directions.
    pub async fn relate(&self, concept_id: &str) -> MemoryResult<Vec<(Relationship, Concept)>> {
        self.semantic.relate(concept_id)
    }

    /// Bounded-depth inference from the query's start concepts.
    pub async fn infer(&self, query: &InferenceQuery) -> MemoryResult<Vec<DerivedFact>> {
        self.semantic.infer(query)
    }

    /// Delete a concept under the configured delete policy.
    pub async fn forget_concept(&self, concept_id: &str) -> MemoryResult<()> {
        self.semantic.delete_concept(concept_id)
    }

    /// Anomaly markers attached to a record.
    pub async fn anomalies_for(&self, record: RecordId) -> MemoryResult<Vec<AnomalyMarker>> {
        self.semantic.anomalies_for(record)
    }

    // ---- working tier ----

    /// Hold a transient value under `key` with an eviction priority and TTL.
    pub async fn remember(&self, key: impl Into<String>, value: JsonValue, priority: f64, ttl: Duration) {
        self.working.set(key, value, priority, ttl);
    }

    /// Look up a transient value; expired items are absent.
    pub async fn recall_working(&self, key: &str) -> Option<JsonValue> {
        self.working.get(key)
    }

    /// All live working items, highest priority first.
    pub async fn working_snapshot(&self) -> Vec<WorkingItem> {
        self.working.peek_all()
    }

    /// Re-prioritize a working item in place.
    pub async fn reprioritize(&self, key: &str, priority: f64) -> bool {
        self.working.set_priority(key, priority)
    }

    /// Drop a working item, returning its value if present.
    pub async fn forget_working(&self, key: &str) -> Option<JsonValue> {
        self.working.remove(key)
    }

    // ---- pipeline ----

    /// Run all four pipeline stages over a window of the episodic log.
    pub async fn run_pipeline(&self, window: &AnalysisWindow) -> MemoryResult<PipelineReport> {
        self.pipeline.run(window)
    }

    /// The pipeline, for running individual stages.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    // ---- component access ----

    pub fn episodic(&self) -> &EpisodicStore {
        &self.episodic
    }

    pub fn semantic(&self) -> &SemanticStore {
        &self.semantic
    }

    pub fn working(&self) -> &WorkingMemory {
        &self.working
    }

    pub fn cache(&self) -> &RecallCache {
        &self.cache
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    // ---- snapshots ----

    /// Write a checksummed snapshot of all persistent collections.
    ///
    /// Transient tiers (cache, working memory) are not part of a snapshot.
    pub async fn save_snapshot(&self, path: impl AsRef<Path>) -> MemoryResult<SnapshotInfo> {
        persistence::save(&self.store, path.as_ref()).await
    }

    /// Replace all persistent state from a snapshot.
    ///
    /// The snapshot is validated before anything is replaced - a corrupt
    /// file or a dangling relationship endpoint leaves current state
    /// untouched. On a journaled engine the journal is rewritten from the
    /// restored state before it is installed, so a later restart recovers
    /// the restore, not the history it discarded. On success the cache and
    /// working memory are cleared, so no pre-restore value can be observed
    /// afterwards.
    pub async fn restore_snapshot(&self, path: impl AsRef<Path>) -> MemoryResult<()> {
        let snapshot = persistence::load(path.as_ref()).await?;
        validate_snapshot(&snapshot)?;

        if let Some(journal) = &self.journal {
            journal
                .rewrite_from(&snapshot.collections)
                .map_err(|e| MemoryError::io("rewriting journal from restored state", e))?;
        }

        self.store.install_state(snapshot.collections);
        self.episodic.rebuild_from_store()?;
        self.semantic.rebuild_from_store()?;
        self.cache.clear();
        self.working.clear();
        info!(path = %path.as_ref().display(), "snapshot restored");
        Ok(())
    }

    // ---- maintenance ----

    /// Spawn the background sweeper when a sweep interval is configured.
    ///
    /// Sweeping is an optimization; expiry is enforced lazily on every read
    /// either way. The task runs until the handle is aborted.
    pub fn spawn_sweeper(&self) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.working.sweep_interval()?;
        let working = Arc::clone(&self.working);
        let cache = Arc::clone(&self.cache);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let swept = working.sweep() + cache.purge_expired();
                if swept > 0 {
                    tracing::debug!(swept, "sweeper reclaimed expired entries");
                }
            }
        }))
    }

    /// Aggregate statistics across all tiers.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            episodes: self.episodic.len(),
            sequences: self.episodic.sequence_count(),
            concepts: self.semantic.concept_count(),
            relationships: self.semantic.relationship_count(),
            anomalies: self.semantic.anomaly_count(),
            working_items: self.working.len(),
            cache: self.cache.stats(),
            working: self.working.stats(),
            pipeline: self.pipeline.stats(),
        }
    }
}

/// Structural validation of a snapshot before it replaces live state.
fn validate_snapshot(snapshot: &StoreSnapshot) -> MemoryResult<()> {
    let mut concept_ids = std::collections::BTreeSet::new();
    let mut relationships = Vec::new();
    let mut episode_ids = std::collections::BTreeSet::new();
    let mut sequences = Vec::new();

    for collection in &snapshot.collections {
        match collection.name.as_str() {
            semantic::CONCEPTS => {
                for (id, stored) in &collection.records {
                    let concept: Concept = serde_json::from_value(stored.clone())
                        .map_err(|e| MemoryError::Corrupt {
                            reason: format!("undecodable concept '{id}' in snapshot: {e}"),
                        })?;
                    concept_ids.insert(concept.id);
                }
            }
            semantic::RELATIONSHIPS => {
                for (id, stored) in &collection.records {
                    let relationship: Relationship = serde_json::from_value(stored.clone())
                        .map_err(|e| MemoryError::Corrupt {
                            reason: format!("undecodable relationship '{id}' in snapshot: {e}"),
                        })?;
                    relationships.push(relationship);
                }
            }
            episodic::COLLECTION => {
                for (id, stored) in &collection.records {
                    let record: ExperienceRecord = serde_json::from_value(stored.clone())
                        .map_err(|e| MemoryError::Corrupt {
                            reason: format!("undecodable episode '{id}' in snapshot: {e}"),
                        })?;
                    episode_ids.insert(record.id);
                }
            }
            episodic::SEQUENCES => {
                for (id, stored) in &collection.records {
                    let sequence: Sequence = serde_json::from_value(stored.clone())
                        .map_err(|e| MemoryError::Corrupt {
                            reason: format!("undecodable sequence '{id}' in snapshot: {e}"),
                        })?;
                    sequences.push(sequence);
                }
            }
            _ => {}
        }
    }

    for relationship in relationships {
        if relationship.orphaned {
            continue;
        }
        for endpoint in [&relationship.source, &relationship.target] {
            if !concept_ids.contains(endpoint) {
                warn!(
                    relationship = %relationship.id,
                    endpoint = %endpoint,
                    "snapshot rejected: dangling relationship endpoint"
                );
                return Err(MemoryError::Corrupt {
                    reason: format!(
                        "relationship '{}' references missing concept '{}'",
                        relationship.id, endpoint
                    ),
                });
            }
        }
    }

    for sequence in sequences {
        for event in &sequence.events {
            if !episode_ids.contains(event) {
                warn!(
                    sequence = %sequence.id,
                    event = %event,
                    "snapshot rejected: sequence references missing episode"
                );
                return Err(MemoryError::Corrupt {
                    reason: format!(
                        "sequence '{}' references missing episode '{}'",
                        sequence.id, event
                    ),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_start_in_memory_and_round_trip() {
        let engine = MemoryEngine::start().await.unwrap();

        let record = ExperienceRecord::new(json!({"event": "login"})).with_tags(["auth"]);
        let id = engine.append(record).await.unwrap();

        let recalled = engine.recall(id).await.unwrap().unwrap();
        assert_eq!(recalled.payload, json!({"event": "login"}));
        assert!(engine.recall(RecordId::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let engine = MemoryEngine::start().await.unwrap();
        let clone = engine.clone();

        let id = engine
            .append(ExperienceRecord::new(json!(1)))
            .await
            .unwrap();
        assert!(clone.recall(id).await.unwrap().is_some());

        clone.remember("focus", json!("task-7"), 1.0, Duration::from_secs(60)).await;
        assert_eq!(engine.recall_working("focus").await, Some(json!("task-7")));
    }

    #[tokio::test]
    async fn test_stats_reflect_all_tiers() {
        let engine = MemoryEngine::start().await.unwrap();
        engine
            .append(ExperienceRecord::new(json!(1)))
            .await
            .unwrap();
        engine
            .learn_concept(Concept::new("alpha"))
            .await
            .unwrap();
        engine.remember("k", json!(2), 0.5, Duration::from_secs(60)).await;

        let stats = engine.stats();
        assert_eq!(stats.episodes, 1);
        assert_eq!(stats.concepts, 1);
        assert_eq!(stats.working_items, 1);
    }
}
