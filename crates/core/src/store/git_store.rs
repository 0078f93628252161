//! [`StateStore`] backed by refs in the target Git repository.

use std::path::Path;

use git2::Oid;
use tracing::debug;

use crate::errors::StoreError;
use crate::git::{signature_from_parts, GitClient};

use super::{log_message, transaction_from_message, LogEntry, LogRecord, StateStore, TreeSource};

/// Store writing through its own handle on the target repository. The
/// conversion engine holds a second handle for branch work; both see the
/// same object database and refs.
pub struct GitStateStore {
    client: GitClient,
}

impl GitStateStore {
    pub fn open<P: AsRef<Path>>(repo_path: P) -> Result<Self, StoreError> {
        Ok(Self {
            client: GitClient::open(repo_path)?,
        })
    }

    fn record_for(&self, key: &str, commit: Oid) -> Result<LogRecord, StoreError> {
        let detail = self.client.commit_detail(commit)?;
        let transaction = transaction_from_message(key, detail.message.trim())?;
        Ok(LogRecord {
            commit,
            tree: detail.tree,
            transaction,
        })
    }
}

impl StateStore for GitStateStore {
    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.client.read_blob_ref(key)?)
    }

    fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.client.write_blob_ref(key, bytes, "state update")?;
        Ok(())
    }

    fn append(&self, key: &str, entry: LogEntry) -> Result<Oid, StoreError> {
        let tip = self.client.ref_tip(key)?;
        let tree = match &entry.tree {
            TreeSource::Files(files) => self.client.build_tree(files)?,
            TreeSource::Existing(oid) => *oid,
        };
        let signature = signature_from_parts(
            &entry.author_name,
            &entry.author_email,
            entry.time_secs,
            entry.offset_minutes,
        )?;
        let parents: Vec<Oid> = tip.into_iter().collect();
        let message = log_message(entry.transaction);
        let commit =
            self.client
                .commit_from_tree(tree, &parents, &signature, &signature, &message)?;
        self.client.update_ref_cas(key, commit, tip, &message)?;
        debug!(key, transaction = entry.transaction, commit = %commit, "appended log entry");
        Ok(commit)
    }

    fn log(&self, key: &str) -> Result<Vec<LogRecord>, StoreError> {
        if self.client.ref_tip(key)?.is_none() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for commit in self.client.ref_log(key)? {
            records.push(self.record_for(key, commit)?);
        }
        Ok(records)
    }

    fn last(&self, key: &str) -> Result<Option<LogRecord>, StoreError> {
        match self.client.ref_tip(key)? {
            Some(tip) => Ok(Some(self.record_for(key, tip)?)),
            None => Ok(None),
        }
    }

    fn entry_at(&self, key: &str, transaction: u64) -> Result<Option<LogRecord>, StoreError> {
        Ok(self
            .log(key)?
            .into_iter()
            .find(|record| record.transaction == transaction))
    }

    fn read_file(&self, commit: Oid, name: &str) -> Result<Vec<u8>, StoreError> {
        match self.client.file_bytes(commit, name)? {
            Some(bytes) => Ok(bytes),
            None => Err(StoreError::FileMissing {
                name: name.to_string(),
                commit: commit.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{read_hwm, write_hwm};
    use crate::models::HighWaterMark;

    fn test_store() -> (tempfile::TempDir, GitStateStore) {
        let dir = tempfile::tempdir().unwrap();
        GitClient::init_or_open(dir.path()).unwrap();
        let store = GitStateStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn entry(transaction: u64, body: &str) -> LogEntry {
        LogEntry::from_files(
            transaction,
            vec![("hist.xml".to_string(), body.as_bytes().to_vec())],
            "tester",
            "tester@example.com",
            1_325_000_000 + transaction as i64,
            0,
        )
    }

    #[test]
    fn test_append_and_log_sequence() {
        let (_dir, store) = test_store();
        let key = "refs/accugit/1/streams/stream_2_info";
        assert!(store.log(key).unwrap().is_empty());
        assert!(store.last(key).unwrap().is_none());

        let first = store.append(key, entry(3, "<a/>")).unwrap();
        let second = store.append(key, entry(7, "<b/>")).unwrap();

        let log = store.log(key).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].commit, first);
        assert_eq!(log[0].transaction, 3);
        assert_eq!(log[1].commit, second);
        assert_eq!(log[1].transaction, 7);
        assert_eq!(store.last(key).unwrap().unwrap().commit, second);
        assert_eq!(store.entry_at(key, 3).unwrap().unwrap().commit, first);
        assert!(store.entry_at(key, 4).unwrap().is_none());
    }

    #[test]
    fn test_read_file_from_entry() {
        let (_dir, store) = test_store();
        let key = "refs/accugit/1/streams/stream_2_info";
        let commit = store.append(key, entry(5, "<hist/>")).unwrap();
        assert_eq!(store.read_file(commit, "hist.xml").unwrap(), b"<hist/>");
        assert!(matches!(
            store.read_file(commit, "diff.xml"),
            Err(StoreError::FileMissing { .. })
        ));
    }

    #[test]
    fn test_append_existing_tree() {
        let (dir, store) = test_store();
        let client = GitClient::open(dir.path()).unwrap();
        let tree = client
            .build_tree(&[("file.c".to_string(), b"int x;".to_vec())])
            .unwrap();
        let key = "refs/accugit/1/streams/stream_2_data";
        let record = store
            .append(key, LogEntry::from_tree(9, tree, "t", "t@e.com", 1_325_000_500, 0))
            .unwrap();
        assert_eq!(store.last(key).unwrap().unwrap().commit, record);
        assert_eq!(store.last(key).unwrap().unwrap().tree, tree);
        assert_eq!(store.read_file(record, "file.c").unwrap(), b"int x;");
    }

    #[test]
    fn test_blob_round_trip_via_helpers() {
        let (_dir, store) = test_store();
        assert!(read_hwm(&store, 1, 2).unwrap().is_none());
        write_hwm(&store, 1, 2, &HighWaterMark { high_water_mark: 11 }).unwrap();
        assert_eq!(read_hwm(&store, 1, 2).unwrap().unwrap().high_water_mark, 11);
        write_hwm(&store, 1, 2, &HighWaterMark { high_water_mark: 12 }).unwrap();
        assert_eq!(read_hwm(&store, 1, 2).unwrap().unwrap().high_water_mark, 12);
    }

    #[test]
    fn test_foreign_message_is_corrupt() {
        let (dir, store) = test_store();
        let client = GitClient::open(dir.path()).unwrap();
        let tree = client.empty_tree().unwrap();
        let signature = signature_from_parts("t", "t@e.com", 1_325_000_000, 0).unwrap();
        let commit = client
            .commit_from_tree(tree, &[], &signature, &signature, "not a log entry")
            .unwrap();
        client
            .update_ref_cas("refs/accugit/1/streams/stream_2_info", commit, None, "seed")
            .unwrap();
        assert!(matches!(
            store.last("refs/accugit/1/streams/stream_2_info"),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
