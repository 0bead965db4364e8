/// Durable record storage with synchronously-maintained secondary indexes.
///
/// The `RecordStore` is the substrate every memory tier writes through. It
/// owns named collections; each collection holds a primary `id -> record`
/// map plus the secondary indexes declared for it at registration time.
///
/// ## Atomicity
///
/// A collection's records and postings live behind a single `RwLock`, so a
/// write updates the record and every affected index before the lock is
/// released. Readers take the read lock and always observe record + indexes
/// as a consistent unit; they never see a partially-applied write.
///
/// ## Durability
///
/// An optional [`Journal`] is consulted *before* any in-memory mutation.
/// If the journal refuses the write, the store returns `MemoryError::Io`
/// with its prior state untouched - a failed write can never leave the
/// primary record and its indexes in disagreement.
use crate::error::{MemoryError, MemoryResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Declaration of a secondary index over a collection.
///
/// `path` is a dot-separated JSON field path. A scalar value at the path
/// yields one index key; an array yields one key per scalar element. Records
/// without the field simply have no postings in this index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name, unique within the collection
    pub name: String,
    /// Dot-separated field path into the record JSON
    pub path: String,
}

impl IndexDef {
    /// Declare an index.
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Extract the index keys this record contributes.
    fn keys_for(&self, record: &JsonValue) -> Vec<String> {
        let mut cursor = record;
        for segment in self.path.split('.') {
            match cursor.get(segment) {
                Some(next) => cursor = next,
                None => return Vec::new(),
            }
        }
        match cursor {
            JsonValue::Array(items) => items
                .iter()
                .filter_map(crate::types::scalar_key)
                .collect(),
            other => crate::types::scalar_key(other).into_iter().collect(),
        }
    }
}

/// A write operation offered to the journal before the store applies it.
#[derive(Debug)]
pub enum JournalOp<'a> {
    /// A record is about to be inserted or replaced
    Put {
        collection: &'a str,
        id: &'a str,
        record: &'a JsonValue,
    },
    /// A record is about to be removed
    Delete { collection: &'a str, id: &'a str },
}

/// Durability hook consulted before every store mutation.
///
/// Implementations must be cheap enough to sit inside the write path; the
/// crate ships [`crate::persistence::FileJournal`] (append-only JSON lines).
/// Returning an error vetoes the mutation - the store surfaces it as
/// `MemoryError::Io` and leaves its state untouched.
pub trait Journal: Send + Sync {
    /// Durably record the operation, or refuse it.
    fn record(&self, op: JournalOp<'_>) -> std::io::Result<()>;
}

/// Serializable point-in-time copy of one collection.
///
/// Records are sorted by id so identical states serialize to identical
/// bytes. Indexes are carried as declarations only; postings are rebuilt
/// from the records on install.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    /// Collection name
    pub name: String,
    /// Index declarations active at snapshot time
    pub indexes: Vec<IndexDef>,
    /// All records, sorted by id
    pub records: Vec<(String, JsonValue)>,
}

/// Primary records plus index postings for one collection.
///
/// Everything behind one lock: `postings[index][key]` is the set of record
/// ids whose indexed field matches `key`.
struct CollectionState {
    indexes: Vec<IndexDef>,
    records: BTreeMap<String, JsonValue>,
    postings: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl CollectionState {
    fn new(indexes: Vec<IndexDef>) -> Self {
        let postings = indexes
            .iter()
            .map(|def| (def.name.clone(), BTreeMap::new()))
            .collect();
        Self {
            indexes,
            records: BTreeMap::new(),
            postings,
        }
    }

    /// Remove all postings contributed by `record` under `id`.
    fn unindex(&mut self, id: &str, record: &JsonValue) {
        for def in &self.indexes {
            if let Some(index) = self.postings.get_mut(&def.name) {
                for key in def.keys_for(record) {
                    if let Some(ids) = index.get_mut(&key) {
                        ids.remove(id);
                        if ids.is_empty() {
                            index.remove(&key);
                        }
                    }
                }
            }
        }
    }

    /// Add postings for `record` under `id`.
    fn index(&mut self, id: &str, record: &JsonValue) {
        for def in &self.indexes {
            if let Some(index) = self.postings.get_mut(&def.name) {
                for key in def.keys_for(record) {
                    index.entry(key).or_default().insert(id.to_string());
                }
            }
        }
    }

    /// Insert or replace a record, keeping every index in step.
    fn apply_put(&mut self, id: &str, record: JsonValue) {
        if let Some(old) = self.records.remove(id) {
            self.unindex(id, &old);
        }
        self.index(id, &record);
        self.records.insert(id.to_string(), record);
    }

    /// Remove a record and its postings. Returns the old record.
    fn apply_delete(&mut self, id: &str) -> Option<JsonValue> {
        let old = self.records.remove(id)?;
        self.unindex(id, &old);
        Some(old)
    }
}

/// Recover a read guard even if a writer panicked mid-hold.
///
/// Mutations happen only after the journal has acknowledged, so a poisoned
/// state is still structurally valid - the write either fully applied or
/// never started.
fn read_state(lock: &RwLock<CollectionState>) -> RwLockReadGuard<'_, CollectionState> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_state(lock: &RwLock<CollectionState>) -> RwLockWriteGuard<'_, CollectionState> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The shared persistence and index substrate.
///
/// Thread-safe: collection lookup is lock-free via `DashMap`, and each
/// collection serializes its own mutations behind its `RwLock` (single
/// writer per collection, concurrent consistent readers). There is no
/// global lock across collections.
pub struct RecordStore {
    collections: DashMap<String, Arc<RwLock<CollectionState>>>,
    journal: Option<Arc<dyn Journal>>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("collections", &self.collections.len())
            .field("journaled", &self.journal.is_some())
            .finish()
    }
}

impl RecordStore {
    /// Create an in-memory store with no journal.
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
            journal: None,
        }
    }

    /// Create a store that offers every mutation to `journal` first.
    pub fn with_journal(journal: Arc<dyn Journal>) -> Self {
        Self {
            collections: DashMap::new(),
            journal: Some(journal),
        }
    }

    /// Declare a collection and its secondary indexes.
    ///
    /// Idempotent for an existing collection with the same declarations;
    /// re-registering with different indexes is rejected.
    pub fn register_collection(
        &self,
        name: impl Into<String>,
        indexes: Vec<IndexDef>,
    ) -> MemoryResult<()> {
        let name = name.into();
        if let Some(existing) = self.collections.get(&name) {
            let state = read_state(&existing);
            if state.indexes == indexes {
                return Ok(());
            }
            return Err(MemoryError::InvalidInput {
                reason: format!("collection '{name}' already registered with different indexes"),
            });
        }
        debug!(collection = %name, indexes = indexes.len(), "collection registered");
        self.collections
            .insert(name, Arc::new(RwLock::new(CollectionState::new(indexes))));
        Ok(())
    }

    fn collection(&self, name: &str) -> MemoryResult<Arc<RwLock<CollectionState>>> {
        self.collections
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MemoryError::InvalidInput {
                reason: format!("unknown collection '{name}'"),
            })
    }

    /// Store a record, updating every declared index before returning.
    ///
    /// The journal (if any) is consulted first, inside the write lock; a
    /// journal refusal surfaces as `Io` with no state change at all.
    pub fn put(&self, collection: &str, id: &str, record: JsonValue) -> MemoryResult<()> {
        let lock = self.collection(collection)?;
        let mut state = write_state(&lock);

        if let Some(journal) = &self.journal {
            journal
                .record(JournalOp::Put {
                    collection,
                    id,
                    record: &record,
                })
                .map_err(|e| MemoryError::io(format!("journaling put to '{collection}'"), e))?;
        }

        state.apply_put(id, record);
        Ok(())
    }

    /// Fetch a record by id.
    pub fn get(&self, collection: &str, id: &str) -> MemoryResult<JsonValue> {
        let lock = self.collection(collection)?;
        let state = read_state(&lock);
        state
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| MemoryError::not_found(collection, id))
    }

    /// Remove a record and all its index postings. Returns the old record.
    pub fn delete(&self, collection: &str, id: &str) -> MemoryResult<JsonValue> {
        let lock = self.collection(collection)?;
        let mut state = write_state(&lock);

        if !state.records.contains_key(id) {
            return Err(MemoryError::not_found(collection, id));
        }

        if let Some(journal) = &self.journal {
            journal
                .record(JournalOp::Delete { collection, id })
                .map_err(|e| {
                    MemoryError::io(format!("journaling delete from '{collection}'"), e)
                })?;
        }

        // Presence checked above while holding the write lock
        state
            .apply_delete(id)
            .ok_or_else(|| MemoryError::not_found(collection, id))
    }

    /// Ids whose indexed field equals `key`, ascending.
    pub fn query_by_index(
        &self,
        collection: &str,
        index: &str,
        key: &str,
    ) -> MemoryResult<Vec<String>> {
        let lock = self.collection(collection)?;
        let state = read_state(&lock);
        let postings = state
            .postings
            .get(index)
            .ok_or_else(|| MemoryError::InvalidInput {
                reason: format!("unknown index '{index}' on collection '{collection}'"),
            })?;
        Ok(postings
            .get(key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// All records in a collection, ascending by id.
    pub fn scan(&self, collection: &str) -> MemoryResult<Vec<(String, JsonValue)>> {
        let lock = self.collection(collection)?;
        let state = read_state(&lock);
        Ok(state
            .records
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect())
    }

    /// Number of records in a collection.
    pub fn count(&self, collection: &str) -> MemoryResult<usize> {
        let lock = self.collection(collection)?;
        Ok(read_state(&lock).records.len())
    }

    /// Total records across all collections.
    pub fn record_count(&self) -> usize {
        self.collections
            .iter()
            .map(|entry| read_state(entry.value()).records.len())
            .sum()
    }

    /// Consistent full-state copy for the persistence layer.
    ///
    /// Each collection is copied under its read lock; collections are
    /// emitted in name order for deterministic snapshot bytes.
    pub fn snapshot_state(&self) -> Vec<CollectionSnapshot> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(entry) = self.collections.get(&name) {
                let state = read_state(entry.value());
                out.push(CollectionSnapshot {
                    name: name.clone(),
                    indexes: state.indexes.clone(),
                    records: state
                        .records
                        .iter()
                        .map(|(id, record)| (id.clone(), record.clone()))
                        .collect(),
                });
            }
        }
        out
    }

    /// Replace the entire store state wholesale.
    ///
    /// Index postings are rebuilt from the records - indexes are always
    /// derivable from the primary store, so a snapshot never has to carry
    /// them. Existing collections are dropped.
    pub fn install_state(&self, snapshots: Vec<CollectionSnapshot>) {
        self.collections.clear();
        for snapshot in snapshots {
            let mut state = CollectionState::new(snapshot.indexes);
            for (id, record) in snapshot.records {
                state.apply_put(&id, record);
            }
            self.collections
                .insert(snapshot.name, Arc::new(RwLock::new(state)));
        }
    }

    /// Re-apply a journaled operation without re-journaling it.
    ///
    /// Used by journal replay during recovery. Unknown collections are an
    /// error: replay runs after collection registration.
    pub(crate) fn apply_replayed(
        &self,
        collection: &str,
        id: &str,
        record: Option<JsonValue>,
    ) -> MemoryResult<()> {
        let lock = self.collection(collection)?;
        let mut state = write_state(&lock);
        match record {
            Some(value) => state.apply_put(id, value),
            None => {
                state.apply_delete(id);
            }
        }
        Ok(())
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}
