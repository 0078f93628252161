//! Persistent conversion state.
//!
//! All durable state lives inside the target Git repository, keyed by refs
//! under `refs/accugit/`. Two shapes exist: single-value blobs (high-water
//! marks, the processing checkpoint) and append-logs, refs whose linear
//! commit ancestry *is* the recorded sequence. Every log commit carries the
//! message `transaction {id}`, which is how the sequence position is read
//! back.
//!
//! [`StateStore`] is the seam: [`GitStateStore`] is the real backing store,
//! [`MemoryStateStore`] mirrors the contract for tests.

pub mod git_store;
pub mod memory;

use git2::Oid;

use crate::errors::StoreError;
use crate::models::{HighWaterMark, ProcessingCheckpoint};

pub use git_store::GitStateStore;
pub use memory::MemoryStateStore;

// ---------------------------------------------------------------------------
// Key layout
// ---------------------------------------------------------------------------

/// Root of all conversion refs inside the target repository.
pub const REF_ROOT: &str = "refs/accugit/";

/// Append-log of depot list snapshots.
pub const DEPOTS_KEY: &str = "refs/accugit/depots";

/// Blob holding the processing checkpoint.
pub const PROCESSING_STATE_KEY: &str = "refs/accugit/processing_state";

/// Notes namespace for the per-commit conversion annotations.
pub const ANNOTATION_NOTES_REF: &str = "refs/notes/accugit";

/// Notes namespace for raw transaction XML attached to branch commits.
pub const RAW_NOTES_REF: &str = "refs/notes/accugit-raw";

/// Metadata history ref for one stream. Keys use depot and stream numbers;
/// names are mutable in AccuRev and never appear in refs.
pub fn stream_info_key(depot: u64, stream: u64) -> String {
    format!("refs/accugit/{}/streams/stream_{}_info", depot, stream)
}

/// Content history ref for one stream.
pub fn stream_data_key(depot: u64, stream: u64) -> String {
    format!("refs/accugit/{}/streams/stream_{}_data", depot, stream)
}

/// High-water mark blob ref for one stream.
pub fn stream_hwm_key(depot: u64, stream: u64) -> String {
    format!("refs/accugit/{}/streams/stream_{}_hwm", depot, stream)
}

/// Prefix of every per-stream ref of one depot.
pub fn depot_prefix(depot: u64) -> String {
    format!("refs/accugit/{}/", depot)
}

// ---------------------------------------------------------------------------
// Entries and records
// ---------------------------------------------------------------------------

/// Where an appended entry's tree comes from.
#[derive(Debug, Clone)]
pub enum TreeSource {
    /// Flat file set, written as blobs into a fresh tree.
    Files(Vec<(String, Vec<u8>)>),
    /// A tree that already exists in the object database.
    Existing(Oid),
}

/// One entry to append to a log key.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub transaction: u64,
    pub tree: TreeSource,
    pub author_name: String,
    pub author_email: String,
    pub time_secs: i64,
    pub offset_minutes: i32,
}

impl LogEntry {
    pub fn from_files(
        transaction: u64,
        files: Vec<(String, Vec<u8>)>,
        author_name: &str,
        author_email: &str,
        time_secs: i64,
        offset_minutes: i32,
    ) -> Self {
        Self {
            transaction,
            tree: TreeSource::Files(files),
            author_name: author_name.to_string(),
            author_email: author_email.to_string(),
            time_secs,
            offset_minutes,
        }
    }

    pub fn from_tree(
        transaction: u64,
        tree: Oid,
        author_name: &str,
        author_email: &str,
        time_secs: i64,
        offset_minutes: i32,
    ) -> Self {
        Self {
            transaction,
            tree: TreeSource::Existing(tree),
            author_name: author_name.to_string(),
            author_email: author_email.to_string(),
            time_secs,
            offset_minutes,
        }
    }
}

/// One already-appended entry of a log key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    pub commit: Oid,
    pub tree: Oid,
    pub transaction: u64,
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Durable key-value and append-log storage.
///
/// Writes are atomic at one-key granularity: `append` performs a
/// compare-and-swap against the tip it read, and a write that reports
/// success without moving the visible tip is an error, never retried.
pub trait StateStore {
    /// Read a single-value key. `None` if the key has never been written.
    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Overwrite a single-value key.
    fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Append one entry to a log key and return the new entry's commit id.
    fn append(&self, key: &str, entry: LogEntry) -> Result<Oid, StoreError>;

    /// All entries of a log key, oldest first. Empty if the key is absent.
    fn log(&self, key: &str) -> Result<Vec<LogRecord>, StoreError>;

    /// The most recent entry of a log key.
    fn last(&self, key: &str) -> Result<Option<LogRecord>, StoreError>;

    /// The entry a given transaction produced, if any.
    fn entry_at(&self, key: &str, transaction: u64) -> Result<Option<LogRecord>, StoreError>;

    /// Bytes of a named file inside an appended entry's tree.
    fn read_file(&self, commit: Oid, name: &str) -> Result<Vec<u8>, StoreError>;
}

/// Parse a log commit message back into its transaction id.
pub(crate) fn transaction_from_message(key: &str, message: &str) -> Result<u64, StoreError> {
    let mut parts = message.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("transaction"), Some(id), None) => {
            id.parse().map_err(|_| StoreError::Corrupt {
                key: key.to_string(),
                detail: format!("log message carries a non-numeric id: {:?}", message),
            })
        }
        _ => Err(StoreError::Corrupt {
            key: key.to_string(),
            detail: format!("unexpected log message: {:?}", message),
        }),
    }
}

pub(crate) fn log_message(transaction: u64) -> String {
    format!("transaction {}", transaction)
}

// ---------------------------------------------------------------------------
// Typed convenience wrappers
// ---------------------------------------------------------------------------

pub fn read_hwm(
    store: &dyn StateStore,
    depot: u64,
    stream: u64,
) -> Result<Option<HighWaterMark>, StoreError> {
    let key = stream_hwm_key(depot, stream);
    match store.get_blob(&key)? {
        Some(bytes) => {
            let hwm = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                key,
                detail: e.to_string(),
            })?;
            Ok(Some(hwm))
        }
        None => Ok(None),
    }
}

pub fn write_hwm(
    store: &dyn StateStore,
    depot: u64,
    stream: u64,
    hwm: &HighWaterMark,
) -> Result<(), StoreError> {
    let key = stream_hwm_key(depot, stream);
    let bytes = serde_json::to_vec(hwm).map_err(|e| StoreError::Corrupt {
        key: key.clone(),
        detail: e.to_string(),
    })?;
    store.put_blob(&key, &bytes)
}

pub fn read_checkpoint(store: &dyn StateStore) -> Result<Option<ProcessingCheckpoint>, StoreError> {
    match store.get_blob(PROCESSING_STATE_KEY)? {
        Some(bytes) => {
            let checkpoint = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                key: PROCESSING_STATE_KEY.to_string(),
                detail: e.to_string(),
            })?;
            Ok(Some(checkpoint))
        }
        None => Ok(None),
    }
}

pub fn write_checkpoint(
    store: &dyn StateStore,
    checkpoint: &ProcessingCheckpoint,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(checkpoint).map_err(|e| StoreError::Corrupt {
        key: PROCESSING_STATE_KEY.to_string(),
        detail: e.to_string(),
    })?;
    store.put_blob(PROCESSING_STATE_KEY, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(
            stream_info_key(4, 17),
            "refs/accugit/4/streams/stream_17_info"
        );
        assert_eq!(
            stream_data_key(4, 17),
            "refs/accugit/4/streams/stream_17_data"
        );
        assert_eq!(stream_hwm_key(4, 17), "refs/accugit/4/streams/stream_17_hwm");
        assert!(stream_info_key(4, 17).starts_with(&depot_prefix(4)));
        assert!(DEPOTS_KEY.starts_with(REF_ROOT));
    }

    #[test]
    fn test_transaction_message_round_trip() {
        assert_eq!(transaction_from_message("k", &log_message(42)).unwrap(), 42);
        assert!(transaction_from_message("k", "transaction").is_err());
        assert!(transaction_from_message("k", "transaction forty-two").is_err());
        assert!(transaction_from_message("k", "transaction 1 extra").is_err());
        assert!(transaction_from_message("k", "merged branch").is_err());
    }

    #[test]
    fn test_hwm_round_trip() {
        let store = MemoryStateStore::new();
        assert!(read_hwm(&store, 1, 2).unwrap().is_none());
        write_hwm(&store, 1, 2, &HighWaterMark { high_water_mark: 9 }).unwrap();
        assert_eq!(read_hwm(&store, 1, 2).unwrap().unwrap().high_water_mark, 9);
        // Unrelated stream is untouched.
        assert!(read_hwm(&store, 1, 3).unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let store = MemoryStateStore::new();
        assert!(read_checkpoint(&store).unwrap().is_none());
        let mut stream_map = std::collections::BTreeMap::new();
        stream_map.insert(2u64, "widgets".to_string());
        write_checkpoint(
            &store,
            &ProcessingCheckpoint {
                depot: 1,
                stream_map,
                last_transaction: 12,
            },
        )
        .unwrap();
        let read = read_checkpoint(&store).unwrap().unwrap();
        assert_eq!(read.last_transaction, 12);
        assert_eq!(read.stream_map.get(&2).map(String::as_str), Some("widgets"));
    }
}
