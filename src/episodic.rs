/// Episodic store: the append-ordered log of experience.
///
/// Owns every [`ExperienceRecord`]. Records are immutable once appended and
/// totally ordered by `(timestamp, id)`, so event-time appends may arrive
/// out of order and still land in a deterministic position.
///
/// The in-memory log is the read path (binary-searchable ordered vector plus
/// an id map, records shared as `Arc`); every append writes through to the
/// record store's `"episodes"` collection first, where the journal and the
/// tag/outcome indexes live. Time-range reads binary-search the ordered log
/// directly. Point lookups go cache-aside through the shared recall cache.
///
/// Records can additionally be grouped into named [`Sequence`]s; membership
/// is indexed so all sequences containing a record resolve in one posting
/// lookup.
use crate::cache::RecallCache;
use crate::error::{MemoryError, MemoryResult};
use crate::similarity::SimilarityScorer;
use crate::store::{IndexDef, RecordStore};
use crate::types::{ExperienceRecord, RecordId, Sequence, SequenceId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Collection name in the record store.
pub(crate) const COLLECTION: &str = "episodes";

/// Index declarations for the episodes collection.
pub(crate) fn index_defs() -> Vec<IndexDef> {
    vec![
        IndexDef::new("tag", "tags"),
        IndexDef::new("outcome", "outcome"),
    ]
}

/// Collection name for named sequences.
pub(crate) const SEQUENCES: &str = "sequences";

/// Index declarations for the sequences collection: one posting per member
/// record, fanned out from the `events` array.
pub(crate) fn sequence_index_defs() -> Vec<IndexDef> {
    vec![IndexDef::new("event", "events")]
}

fn cache_key(id: RecordId) -> String {
    format!("episode:{id}")
}

/// Ordered log state behind one lock: readers see appends atomically.
struct EpisodeLog {
    /// All records in `(timestamp, id)` order
    ordered: Vec<Arc<ExperienceRecord>>,
    /// Point-lookup map sharing the same `Arc`s
    by_id: HashMap<RecordId, Arc<ExperienceRecord>>,
}

impl EpisodeLog {
    fn new() -> Self {
        Self {
            ordered: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    fn insert(&mut self, record: Arc<ExperienceRecord>) {
        let position = self
            .ordered
            .partition_point(|existing| existing.order_key() < record.order_key());
        self.ordered.insert(position, Arc::clone(&record));
        self.by_id.insert(record.id, record);
    }
}

/// The append-ordered experience log.
pub struct EpisodicStore {
    store: Arc<RecordStore>,
    cache: Arc<RecallCache>,
    scorer: Arc<dyn SimilarityScorer>,
    log: RwLock<EpisodeLog>,
    sequences: DashMap<SequenceId, Arc<Sequence>>,
    /// Serializes sequence mutations; reads stay lock-free on the map
    sequence_write: Mutex<()>,
}

impl std::fmt::Debug for EpisodicStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpisodicStore")
            .field("len", &self.len())
            .finish()
    }
}

impl EpisodicStore {
    /// Create an episodic store over the shared substrate.
    ///
    /// The `"episodes"` and `"sequences"` collections must already be
    /// registered on `store`.
    pub fn new(
        store: Arc<RecordStore>,
        cache: Arc<RecallCache>,
        scorer: Arc<dyn SimilarityScorer>,
    ) -> Self {
        Self {
            store,
            cache,
            scorer,
            log: RwLock::new(EpisodeLog::new()),
            sequences: DashMap::new(),
            sequence_write: Mutex::new(()),
        }
    }

    fn read_log(&self) -> std::sync::RwLockReadGuard<'_, EpisodeLog> {
        self.log.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_log(&self) -> std::sync::RwLockWriteGuard<'_, EpisodeLog> {
        self.log.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a record to the log.
    ///
    /// Persists first - the journal and every index commit as one atomic
    /// unit inside the record store - then inserts into the ordered log at
    /// its `(timestamp, id)` position. A persistence failure surfaces as
    /// `Io` and leaves the log without the record.
    pub fn append(&self, record: ExperienceRecord) -> MemoryResult<RecordId> {
        let mut log = self.write_log();
        if log.by_id.contains_key(&record.id) {
            return Err(MemoryError::InvalidInput {
                reason: format!("record '{}' already appended", record.id),
            });
        }

        let stored = serde_json::to_value(&record)?;
        let id = record.id;
        self.store.put(COLLECTION, &id.to_string(), stored)?;

        log.insert(Arc::new(record));
        debug!(id = %id, "episode appended");
        Ok(id)
    }

    /// Fetch one record by id, cache-aside through the recall cache.
    pub fn get(&self, id: RecordId) -> MemoryResult<Arc<ExperienceRecord>> {
        let key = cache_key(id);
        if let Some(cached) = self.cache.get(&key) {
            let record: ExperienceRecord = serde_json::from_value(cached)?;
            return Ok(Arc::new(record));
        }

        let record = {
            let log = self.read_log();
            log.by_id
                .get(&id)
                .cloned()
                .ok_or_else(|| MemoryError::not_found(COLLECTION, id.to_string()))?
        };

        self.cache
            .put(key, serde_json::to_value(record.as_ref())?, None);
        Ok(record)
    }

    /// Records with `start <= timestamp <= end`, ascending `(timestamp, id)`.
    pub fn get_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Arc<ExperienceRecord>> {
        if start > end {
            return Vec::new();
        }
        let log = self.read_log();
        let lo = log
            .ordered
            .partition_point(|r| r.order_key() < (start, Uuid::nil()));
        let hi = log
            .ordered
            .partition_point(|r| r.order_key() <= (end, Uuid::max()));
        log.ordered[lo..hi].to_vec()
    }

    /// Records carrying the tag, ascending `(timestamp, id)`.
    pub fn find_by_tag(&self, tag: &str) -> MemoryResult<Vec<Arc<ExperienceRecord>>> {
        let ids = self.store.query_by_index(COLLECTION, "tag", tag)?;
        Ok(self.resolve_ordered(&ids))
    }

    /// Records with the given outcome, ascending `(timestamp, id)`.
    pub fn find_by_outcome(&self, outcome: &str) -> MemoryResult<Vec<Arc<ExperienceRecord>>> {
        let ids = self.store.query_by_index(COLLECTION, "outcome", outcome)?;
        Ok(self.resolve_ordered(&ids))
    }

    fn resolve_ordered(&self, ids: &[String]) -> Vec<Arc<ExperienceRecord>> {
        let log = self.read_log();
        let mut records: Vec<Arc<ExperienceRecord>> = ids
            .iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .filter_map(|id| log.by_id.get(&id).cloned())
            .collect();
        records.sort_by_key(|r| r.order_key());
        records
    }

    /// The `k` most similar records to `query`, best first.
    ///
    /// Scoring is delegated to the injected [`SimilarityScorer`]; ties break
    /// toward the more recent timestamp, then id. The query record itself
    /// (matched by id) is excluded.
    pub fn find_similar(
        &self,
        query: &ExperienceRecord,
        k: usize,
    ) -> Vec<(Arc<ExperienceRecord>, f64)> {
        if k == 0 {
            return Vec::new();
        }
        let log = self.read_log();
        let mut scored: Vec<(Arc<ExperienceRecord>, f64)> = log
            .ordered
            .iter()
            .filter(|r| r.id != query.id)
            .map(|r| (Arc::clone(r), self.scorer.score(query, r)))
            .collect();
        drop(log);

        scored.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| b.0.timestamp.cmp(&a.0.timestamp))
                .then_with(|| b.0.id.cmp(&a.0.id))
        });
        scored.truncate(k);
        scored
    }

    // ---- sequences ----

    /// Create a named, initially empty sequence.
    ///
    /// Names are labels, not keys - several sequences may share one.
    pub fn create_sequence(&self, name: impl Into<String>) -> MemoryResult<SequenceId> {
        let sequence = Sequence {
            id: Uuid::new_v4(),
            name: name.into(),
            events: Vec::new(),
            metadata: BTreeMap::new(),
        };
        let _guard = self.sequence_guard();
        self.store.put(
            SEQUENCES,
            &sequence.id.to_string(),
            serde_json::to_value(&sequence)?,
        )?;
        let id = sequence.id;
        self.sequences.insert(id, Arc::new(sequence));
        debug!(id = %id, "sequence created");
        Ok(id)
    }

    /// Add an appended record to a sequence, in arrival order.
    ///
    /// `NotFound` if either side is unknown. Adding a record that is
    /// already a member changes nothing.
    pub fn extend_sequence(
        &self,
        sequence_id: SequenceId,
        record_id: RecordId,
    ) -> MemoryResult<()> {
        if !self.read_log().by_id.contains_key(&record_id) {
            return Err(MemoryError::not_found(COLLECTION, record_id.to_string()));
        }

        let _guard = self.sequence_guard();
        let current = self
            .sequences
            .get(&sequence_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MemoryError::not_found(SEQUENCES, sequence_id.to_string()))?;
        if current.events.contains(&record_id) {
            return Ok(());
        }

        let mut updated = (*current).clone();
        updated.events.push(record_id);
        self.store.put(
            SEQUENCES,
            &sequence_id.to_string(),
            serde_json::to_value(&updated)?,
        )?;
        self.sequences.insert(sequence_id, Arc::new(updated));
        Ok(())
    }

    /// Fetch one sequence by id.
    pub fn sequence(&self, id: SequenceId) -> Option<Arc<Sequence>> {
        self.sequences.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// All sequences containing the record, ordered by name then id.
    pub fn sequences_for(&self, record_id: RecordId) -> MemoryResult<Vec<Arc<Sequence>>> {
        let ids = self
            .store
            .query_by_index(SEQUENCES, "event", &record_id.to_string())?;
        let mut found: Vec<Arc<Sequence>> = ids
            .iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .filter_map(|id| self.sequence(id))
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    /// Number of sequences.
    pub fn sequence_count(&self) -> usize {
        self.sequences.len()
    }

    fn sequence_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.sequence_write
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of records in the log.
    pub fn len(&self) -> usize {
        self.read_log().ordered.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.read_log().ordered.is_empty()
    }

    /// Earliest and latest timestamps, if any records exist.
    pub fn span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let log = self.read_log();
        match (log.ordered.first(), log.ordered.last()) {
            (Some(first), Some(last)) => Some((first.timestamp, last.timestamp)),
            _ => None,
        }
    }

    /// Consistent read snapshot of the whole log, for pipeline scans.
    pub fn snapshot(&self) -> Vec<Arc<ExperienceRecord>> {
        self.read_log().ordered.clone()
    }

    /// Rebuild the in-memory log from the persisted collection.
    ///
    /// Used after a snapshot restore or journal replay. Any undecodable
    /// record is a structural failure - the log is left empty and `Corrupt`
    /// is returned rather than silently dropping experience.
    pub fn rebuild_from_store(&self) -> MemoryResult<()> {
        let mut rebuilt = EpisodeLog::new();
        for (id, stored) in self.store.scan(COLLECTION)? {
            let record: ExperienceRecord =
                serde_json::from_value(stored).map_err(|e| MemoryError::Corrupt {
                    reason: format!("undecodable episode '{id}': {e}"),
                })?;
            rebuilt.insert(Arc::new(record));
        }

        let mut sequences = Vec::new();
        for (id, stored) in self.store.scan(SEQUENCES)? {
            let sequence: Sequence =
                serde_json::from_value(stored).map_err(|e| MemoryError::Corrupt {
                    reason: format!("undecodable sequence '{id}': {e}"),
                })?;
            sequences.push(sequence);
        }

        let count = rebuilt.ordered.len();
        *self.write_log() = rebuilt;

        let _guard = self.sequence_guard();
        self.sequences.clear();
        for sequence in sequences {
            self.sequences.insert(sequence.id, Arc::new(sequence));
        }

        debug!(count, "episodic log rebuilt from store");
        Ok(())
    }
}
