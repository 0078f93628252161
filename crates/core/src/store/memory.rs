//! In-memory [`StateStore`] with the same observable contract as the Git
//! backing store. Used by tests that exercise bookkeeping without a
//! repository on disk.

use std::collections::HashMap;
use std::sync::Mutex;

use git2::{ObjectType, Oid};

use crate::errors::{GitError, StoreError};

use super::{LogEntry, LogRecord, StateStore, TreeSource};

#[derive(Default)]
struct Inner {
    blobs: HashMap<String, Vec<u8>>,
    logs: HashMap<String, Vec<LogRecord>>,
    trees: HashMap<Oid, Vec<(String, Vec<u8>)>>,
    commit_trees: HashMap<Oid, Oid>,
}

#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Content-address arbitrary bytes so fabricated ids behave like real ones:
/// stable, unique per content, printable.
fn synthetic_id(payload: &[u8]) -> Result<Oid, StoreError> {
    Ok(Oid::hash_object(ObjectType::Blob, payload).map_err(GitError::from)?)
}

impl StateStore for MemoryStateStore {
    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock().blobs.get(key).cloned())
    }

    fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.lock().blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn append(&self, key: &str, entry: LogEntry) -> Result<Oid, StoreError> {
        let (tree, files) = match entry.tree {
            TreeSource::Files(files) => {
                let mut payload = Vec::new();
                for (name, bytes) in &files {
                    payload.extend_from_slice(name.as_bytes());
                    payload.push(0);
                    payload.extend_from_slice(bytes);
                    payload.push(0);
                }
                (synthetic_id(&payload)?, Some(files))
            }
            TreeSource::Existing(oid) => (oid, None),
        };

        let mut inner = self.lock();
        let log = inner.logs.entry(key.to_string()).or_default();
        let parent = log.last().map(|record| record.commit);
        let payload = format!(
            "{} {} {:?} {} {} {}",
            key,
            tree,
            parent,
            entry.transaction,
            entry.author_email,
            entry.time_secs
        );
        let commit = synthetic_id(payload.as_bytes())?;
        log.push(LogRecord {
            commit,
            tree,
            transaction: entry.transaction,
        });
        if let Some(files) = files {
            inner.trees.insert(tree, files);
        }
        inner.commit_trees.insert(commit, tree);
        Ok(commit)
    }

    fn log(&self, key: &str) -> Result<Vec<LogRecord>, StoreError> {
        Ok(self.lock().logs.get(key).cloned().unwrap_or_default())
    }

    fn last(&self, key: &str) -> Result<Option<LogRecord>, StoreError> {
        Ok(self.lock().logs.get(key).and_then(|log| log.last().copied()))
    }

    fn entry_at(&self, key: &str, transaction: u64) -> Result<Option<LogRecord>, StoreError> {
        Ok(self
            .lock()
            .logs
            .get(key)
            .and_then(|log| log.iter().find(|record| record.transaction == transaction))
            .copied())
    }

    fn read_file(&self, commit: Oid, name: &str) -> Result<Vec<u8>, StoreError> {
        let inner = self.lock();
        let tree = inner.commit_trees.get(&commit).ok_or_else(|| StoreError::FileMissing {
            name: name.to_string(),
            commit: commit.to_string(),
        })?;
        inner
            .trees
            .get(tree)
            .and_then(|files| {
                files
                    .iter()
                    .find(|(file_name, _)| file_name == name)
                    .map(|(_, bytes)| bytes.clone())
            })
            .ok_or_else(|| StoreError::FileMissing {
                name: name.to_string(),
                commit: commit.to_string(),
            })
    }
}
