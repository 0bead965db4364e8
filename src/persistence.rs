/// Durability for the record store: write-ahead journal and snapshots.
///
/// Two cooperating mechanisms:
///
/// - **Journal**: [`FileJournal`] appends one JSON line per mutation before
///   the store applies it. On restart, [`replay_journal`] re-applies the
///   surviving lines to rebuild state.
/// - **Snapshot**: [`save`] writes a point-in-time copy of every collection
///   to a single file - magic header, crc32 checksum, then the JSON body -
///   using the write-to-temp-then-rename pattern so a crash mid-save never
///   clobbers the previous snapshot. [`load`] verifies magic, checksum, and
///   format version and refuses the whole file with `Corrupt` if any check
///   fails; it never installs a partial restore.
///
/// Working memory and the recall cache are transient projections and are
/// deliberately absent from both mechanisms.
use crate::error::{MemoryError, MemoryResult};
use crate::store::{CollectionSnapshot, Journal, JournalOp, RecordStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tracing::{info, warn};

/// Snapshot file magic: "MEMSNAP" plus a format byte.
const SNAPSHOT_MAGIC: &[u8; 8] = b"MEMSNAP\x01";

/// Format version carried inside the snapshot body.
const SNAPSHOT_VERSION: u32 = 1;

/// Serializable full-state snapshot of the record store.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Format version for forward compatibility
    pub version: u32,
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
    /// One entry per collection, sorted by name
    pub collections: Vec<CollectionSnapshot>,
}

/// Handle describing a snapshot that was written to disk.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    /// Where the snapshot lives
    pub path: PathBuf,
    /// When it was taken
    pub taken_at: DateTime<Utc>,
    /// crc32 of the snapshot body
    pub checksum: u32,
    /// Total records captured
    pub record_count: usize,
}

/// One journaled mutation, as a JSON line on disk.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalLine {
    Put {
        at: DateTime<Utc>,
        collection: String,
        id: String,
        record: JsonValue,
    },
    Delete {
        at: DateTime<Utc>,
        collection: String,
        id: String,
    },
}

/// Append-only journal backed by a single file of JSON lines.
///
/// Sits inside the store's write path: the store calls [`Journal::record`]
/// under its collection write lock, so lines land in the same order writes
/// apply. Each line is flushed before the call returns - an `Err` here
/// means the mutation was vetoed and the store stays untouched.
pub struct FileJournal {
    file: Mutex<std::fs::File>,
    path: PathBuf,
}

impl FileJournal {
    /// Open (or create) the journal file in append mode.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the journal wholesale with one describing `collections`.
    ///
    /// Used after a snapshot restore: the surviving journal must describe
    /// the installed state, not the history the restore discarded, or the
    /// next restart would replay resurrected records over it. The new
    /// journal is written to a temp file and renamed into place while the
    /// journal lock is held, so concurrent appends and a crash mid-rewrite
    /// both observe a complete journal (old or new, never a mix).
    pub fn rewrite_from(&self, collections: &[CollectionSnapshot]) -> std::io::Result<()> {
        let at = Utc::now();
        let mut body = String::new();
        for collection in collections {
            for (id, record) in &collection.records {
                let line = JournalLine::Put {
                    at,
                    collection: collection.name.clone(),
                    id: id.clone(),
                    record: record.clone(),
                };
                body.push_str(&serde_json::to_string(&line).map_err(std::io::Error::other)?);
                body.push('\n');
            }
        }

        let mut file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let temp_path = self.path.with_extension("rewrite");
        std::fs::write(&temp_path, body.as_bytes())?;
        std::fs::rename(&temp_path, &self.path)?;
        *file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(())
    }
}

impl Journal for FileJournal {
    fn record(&self, op: JournalOp<'_>) -> std::io::Result<()> {
        let line = match op {
            JournalOp::Put {
                collection,
                id,
                record,
            } => JournalLine::Put {
                at: Utc::now(),
                collection: collection.to_string(),
                id: id.to_string(),
                record: record.clone(),
            },
            JournalOp::Delete { collection, id } => JournalLine::Delete {
                at: Utc::now(),
                collection: collection.to_string(),
                id: id.to_string(),
            },
        };
        let encoded = serde_json::to_string(&line).map_err(std::io::Error::other)?;

        let mut file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(file, "{encoded}")?;
        file.flush()
    }
}

/// Re-apply journaled mutations to a store.
///
/// Collections must already be registered. A missing journal file is a
/// clean start (returns 0). Replay stops at the first malformed line - a
/// torn tail from a crash mid-append - and keeps everything before it.
pub fn replay_journal(store: &RecordStore, path: &Path) -> MemoryResult<usize> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(MemoryError::io("reading journal", e)),
    };

    let mut applied = 0;
    for line in contents.lines() {
        if line.is_empty() {
            continue;
        }
        let entry: JournalLine = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, applied, "journal replay stopped at malformed line");
                break;
            }
        };
        match entry {
            JournalLine::Put {
                collection,
                id,
                record,
                ..
            } => store.apply_replayed(&collection, &id, Some(record))?,
            JournalLine::Delete { collection, id, .. } => {
                store.apply_replayed(&collection, &id, None)?
            }
        }
        applied += 1;
    }

    if applied > 0 {
        info!(applied, path = %path.display(), "journal replayed");
    }
    Ok(applied)
}

/// Write an immutable point-in-time snapshot of the store to `path`.
///
/// The file is written to `<path>.tmp` first and atomically renamed into
/// place, so the previous snapshot survives a crash mid-write.
pub async fn save(store: &RecordStore, path: &Path) -> MemoryResult<SnapshotInfo> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| MemoryError::io("creating snapshot directory", e))?;
    }

    let snapshot = StoreSnapshot {
        version: SNAPSHOT_VERSION,
        taken_at: Utc::now(),
        collections: store.snapshot_state(),
    };
    let record_count = snapshot.collections.iter().map(|c| c.records.len()).sum();

    let body = serde_json::to_vec(&snapshot)?;
    let checksum = crc32fast::hash(&body);

    let mut bytes = Vec::with_capacity(SNAPSHOT_MAGIC.len() + 4 + body.len());
    bytes.extend_from_slice(SNAPSHOT_MAGIC);
    bytes.extend_from_slice(&checksum.to_le_bytes());
    bytes.extend_from_slice(&body);

    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, &bytes)
        .await
        .map_err(|e| MemoryError::io("writing snapshot temp file", e))?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|e| MemoryError::io("renaming snapshot into place", e))?;

    info!(path = %path.display(), record_count, checksum, "snapshot saved");
    Ok(SnapshotInfo {
        path: path.to_path_buf(),
        taken_at: snapshot.taken_at,
        checksum,
        record_count,
    })
}

/// Read and verify a snapshot file.
///
/// Fails closed: a bad magic, checksum mismatch, undecodable body, or
/// unknown format version all return `Corrupt` and nothing is installed.
/// Installing the result into a store is the caller's wholesale operation.
pub async fn load(path: &Path) -> MemoryResult<StoreSnapshot> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| MemoryError::io("reading snapshot file", e))?;

    if bytes.len() < SNAPSHOT_MAGIC.len() + 4 {
        return Err(MemoryError::Corrupt {
            reason: "snapshot file truncated before header".to_string(),
        });
    }
    if &bytes[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
        return Err(MemoryError::Corrupt {
            reason: "bad snapshot magic".to_string(),
        });
    }

    let checksum_bytes: [u8; 4] = bytes[SNAPSHOT_MAGIC.len()..SNAPSHOT_MAGIC.len() + 4]
        .try_into()
        .map_err(|_| MemoryError::Corrupt {
            reason: "snapshot checksum field truncated".to_string(),
        })?;
    let expected = u32::from_le_bytes(checksum_bytes);

    let body = &bytes[SNAPSHOT_MAGIC.len() + 4..];
    let actual = crc32fast::hash(body);
    if actual != expected {
        return Err(MemoryError::Corrupt {
            reason: format!("checksum mismatch: expected {expected:08x}, got {actual:08x}"),
        });
    }

    let snapshot: StoreSnapshot =
        serde_json::from_slice(body).map_err(|e| MemoryError::Corrupt {
            reason: format!("undecodable snapshot body: {e}"),
        })?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(MemoryError::Corrupt {
            reason: format!(
                "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
                snapshot.version
            ),
        });
    }

    Ok(snapshot)
}

/// Check whether a snapshot file exists.
pub async fn exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IndexDef;
    use serde_json::json;
    use std::sync::Arc;

    fn seeded_store() -> RecordStore {
        let store = RecordStore::new();
        store
            .register_collection("episodes", vec![IndexDef::new("tag", "tags")])
            .unwrap();
        store
            .put("episodes", "e1", json!({"tags": ["a"], "n": 1}))
            .unwrap();
        store
            .put("episodes", "e2", json!({"tags": ["b"], "n": 2}))
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let store = seeded_store();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.snap");

        let info = save(&store, &path).await.unwrap();
        assert_eq!(info.record_count, 2);

        let snapshot = load(&path).await.unwrap();
        let fresh = RecordStore::new();
        fresh.install_state(snapshot.collections);

        assert_eq!(fresh.get("episodes", "e1").unwrap()["n"], json!(1));
        assert_eq!(fresh.query_by_index("episodes", "tag", "b").unwrap(), vec!["e2"]);
    }

    #[tokio::test]
    async fn test_load_rejects_flipped_byte() {
        let store = seeded_store();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.snap");
        save(&store, &path).await.unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            load(&path).await,
            Err(MemoryError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.snap");
        std::fs::write(&path, b"NOTASNAPSHOTFILE....").unwrap();

        assert!(matches!(
            load(&path).await,
            Err(MemoryError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_missing_file_is_io_not_corrupt() {
        let result = load(Path::new("/nonexistent/memory.snap")).await;
        assert!(matches!(result, Err(MemoryError::Io { .. })));
    }

    #[test]
    fn test_journal_replay_rebuilds_state() {
        let dir = tempfile::tempdir().unwrap();
        let journal_path = dir.path().join("journal.log");

        {
            let journal = Arc::new(FileJournal::open(&journal_path).unwrap());
            let store = RecordStore::with_journal(journal);
            store
                .register_collection("episodes", vec![IndexDef::new("tag", "tags")])
                .unwrap();
            store
                .put("episodes", "e1", json!({"tags": ["a"]}))
                .unwrap();
            store
                .put("episodes", "e2", json!({"tags": ["b"]}))
                .unwrap();
            store.delete("episodes", "e1").unwrap();
        }

        let recovered = RecordStore::new();
        recovered
            .register_collection("episodes", vec![IndexDef::new("tag", "tags")])
            .unwrap();
        let applied = replay_journal(&recovered, &journal_path).unwrap();

        assert_eq!(applied, 3);
        assert!(recovered.get("episodes", "e1").is_err());
        assert_eq!(recovered.get("episodes", "e2").unwrap()["tags"], json!(["b"]));
        assert_eq!(recovered.query_by_index("episodes", "tag", "b").unwrap(), vec!["e2"]);
    }

    #[test]
    fn test_journal_rewrite_replaces_history() {
        let dir = tempfile::tempdir().unwrap();
        let journal_path = dir.path().join("journal.log");

        {
            let journal = Arc::new(FileJournal::open(&journal_path).unwrap());
            let store = RecordStore::with_journal(journal.clone());
            store.register_collection("episodes", vec![]).unwrap();
            store.put("episodes", "e1", json!({"n": 1})).unwrap();
            store.put("episodes", "e2", json!({"n": 2})).unwrap();

            // Rewrite from a state that never saw e2
            let desired = RecordStore::new();
            desired.register_collection("episodes", vec![]).unwrap();
            desired.put("episodes", "e1", json!({"n": 1})).unwrap();
            journal.rewrite_from(&desired.snapshot_state()).unwrap();

            // The live handle must append to the rewritten file
            store.put("episodes", "e3", json!({"n": 3})).unwrap();
        }

        let recovered = RecordStore::new();
        recovered.register_collection("episodes", vec![]).unwrap();
        let applied = replay_journal(&recovered, &journal_path).unwrap();

        assert_eq!(applied, 2);
        assert!(recovered.get("episodes", "e1").is_ok());
        assert!(recovered.get("episodes", "e2").is_err());
        assert!(recovered.get("episodes", "e3").is_ok());
    }

    #[test]
    fn test_journal_replay_survives_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let journal_path = dir.path().join("journal.log");

        {
            let journal = Arc::new(FileJournal::open(&journal_path).unwrap());
            let store = RecordStore::with_journal(journal);
            store.register_collection("episodes", vec![]).unwrap();
            store.put("episodes", "e1", json!({"n": 1})).unwrap();
        }
        // Simulate a crash mid-append
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&journal_path)
                .unwrap();
            write!(file, "{{\"op\":\"put\",\"at\":").unwrap();
        }

        let recovered = RecordStore::new();
        recovered.register_collection("episodes", vec![]).unwrap();
        let applied = replay_journal(&recovered, &journal_path).unwrap();

        assert_eq!(applied, 1);
        assert!(recovered.get("episodes", "e1").is_ok());
    }

    #[test]
    fn test_journal_replay_missing_file_is_clean_start() {
        let store = RecordStore::new();
        let applied = replay_journal(&store, Path::new("/nonexistent/journal.log")).unwrap();
        assert_eq!(applied, 0);
    }
}
