//! Retrieval stage: mirror a stream's AccuRev history into the state store.
//!
//! Each stream gets two append-log refs with identical transaction
//! sequences. The metadata pass queries the server and appends one entry
//! per content-changing transaction (`hist.xml`, `streams.xml` and, except
//! for the first entry, `diff.xml`). The content pass then replays any
//! metadata entries the content ref does not have yet: sync the working
//! tree to the content tip, delete the stored diff paths (or clear
//! everything under the `pop` method), populate from the server and append
//! the resulting tree. An entry whose tree matches its predecessor still
//! becomes a commit; the two histories stay transaction-aligned.
//!
//! The high-water mark is written only after both refs reach the end of
//! the range, so a crash anywhere in between resumes cleanly from the refs
//! themselves.

use std::collections::BTreeSet;

use tracing::{debug, info, instrument, warn};

use crate::accurev::parser::{parse_diff, parse_hist};
use crate::accurev::AccuRevClient;
use crate::config::Method;
use crate::errors::{ConvertError, GitError, StoreError};
use crate::git::GitClient;
use crate::models::{HighWaterMark, Stream, Transaction, TransactionKind};
use crate::store::{
    self, stream_data_key, stream_info_key, LogEntry, LogRecord, StateStore,
};
use crate::usermap::UserMap;

pub struct Retriever<'a> {
    accurev: &'a AccuRevClient,
    git: &'a GitClient,
    store: &'a dyn StateStore,
    usermap: &'a UserMap,
    depot_name: &'a str,
    depot_number: u64,
    method: Method,
    preserve_empty_dirs: bool,
}

impl<'a> Retriever<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accurev: &'a AccuRevClient,
        git: &'a GitClient,
        store: &'a dyn StateStore,
        usermap: &'a UserMap,
        depot_name: &'a str,
        depot_number: u64,
        method: Method,
        preserve_empty_dirs: bool,
    ) -> Self {
        Self {
            accurev,
            git,
            store,
            usermap,
            depot_name,
            depot_number,
            method,
            preserve_empty_dirs,
        }
    }

    /// Bring one stream's metadata and content refs up to `end`, then move
    /// its high-water mark. Returns the last recorded transaction and the
    /// content tip, or `None` when the range holds nothing for this stream.
    #[instrument(skip(self, stream), fields(stream = %stream.name, start, end))]
    pub async fn retrieve_stream(
        &self,
        stream: &Stream,
        start: u64,
        end: u64,
    ) -> Result<Option<(u64, git2::Oid)>, ConvertError> {
        let info_key = stream_info_key(self.depot_number, stream.stream_number);
        let data_key = stream_data_key(self.depot_number, stream.stream_number);

        // Metadata pass.
        let mut current = match self.store.last(&info_key)? {
            Some(record) => {
                info!(
                    stream = %stream.name,
                    transaction = record.transaction,
                    "resuming from metadata tip"
                );
                record.transaction
            }
            None => match self.first_transaction(stream, start, end).await? {
                Some(first) => {
                    self.append_metadata_entry(stream.stream_number, &first).await?;
                    first.id
                }
                None => {
                    info!(stream = %stream.name, "no transactions in range");
                    return Ok(None);
                }
            },
        };

        // The mark can sit past the metadata tip when a previous run ended
        // in a quiet tail; that stretch is already known to hold nothing for
        // this stream and must not be re-queried.
        let mark = store::read_hwm(self.store, self.depot_number, stream.stream_number)?
            .map(|hwm| hwm.high_water_mark);
        if let Some(mark) = mark {
            if mark > current {
                debug!(
                    stream = %stream.name,
                    from = current,
                    to = mark,
                    "skipping ahead to high-water mark"
                );
                current = mark;
            }
        }

        let schedule = match self.method {
            Method::DeepHist if current < end => {
                Some(self.deep_hist_schedule(stream, current, end).await?)
            }
            _ => None,
        };

        while current < end {
            let next = self
                .find_next_change(stream.stream_number, current, end, schedule.as_ref())
                .await?;
            if next > end {
                debug!(stream = %stream.name, end, "reached end of range");
                break;
            }
            let transaction = self.transaction_at(next).await?;
            self.append_metadata_entry(stream.stream_number, &transaction)
                .await?;
            info!(
                stream = %stream.name,
                transaction = transaction.id,
                kind = %transaction.kind,
                "recorded metadata entry"
            );
            current = transaction.id;
        }

        // Content pass: replay whatever the metadata ref has that the
        // content ref does not.
        self.replay_content(stream, &info_key, &data_key).await?;

        // Both refs must agree before the high-water mark moves.
        let info_last = self.store.last(&info_key)?;
        let data_last = self.store.last(&data_key)?;
        let (info_last, data_last) = match (info_last, data_last) {
            (Some(info), Some(data)) => (info, data),
            _ => return Ok(None),
        };
        if info_last.transaction != data_last.transaction {
            return Err(ConvertError::HistoryMisaligned {
                stream: stream.name.clone(),
                metadata_tx: info_last.transaction,
                content_tx: data_last.transaction,
            });
        }

        // The mark never regresses, even when a later run uses a shorter
        // configured range.
        let high_water_mark = end.max(mark.unwrap_or(0));
        store::write_hwm(
            self.store,
            self.depot_number,
            stream.stream_number,
            &HighWaterMark { high_water_mark },
        )?;
        info!(stream = %stream.name, high_water_mark, "retrieval complete");
        Ok(Some((data_last.transaction, data_last.commit)))
    }

    /// The first transaction to record for a stream with no history yet:
    /// its `mkstream` (depot transaction 1 for the root stream), clipped
    /// forward to the configured start.
    async fn first_transaction(
        &self,
        stream: &Stream,
        start: u64,
        end: u64,
    ) -> Result<Option<Transaction>, ConvertError> {
        let number = stream.stream_number.to_string();
        let mkstream = self
            .accurev
            .hist(self.depot_name, Some(&number), "now", Some("mkstream"))
            .await?;
        let mut first = match mkstream.into_iter().max_by_key(|tr| tr.id) {
            Some(tr) => tr,
            None => {
                // The root stream predates its own depot's mkstream records.
                info!(stream = %stream.name, "no mkstream transaction, starting at 1");
                match self
                    .accurev
                    .hist(self.depot_name, None, "1", None)
                    .await?
                    .into_iter()
                    .next()
                {
                    Some(tr) => tr,
                    None => return Ok(None),
                }
            }
        };
        if first.id < start {
            if let Some(tr) = self
                .accurev
                .hist(self.depot_name, None, &start.to_string(), None)
                .await?
                .into_iter()
                .max_by_key(|tr| tr.id)
            {
                debug!(
                    stream = %stream.name,
                    creation = first.id,
                    clipped = tr.id,
                    "stream predates configured start"
                );
                first = tr;
            }
        }
        if first.id > end {
            return Ok(None);
        }
        Ok(Some(first))
    }

    /// Next transaction after `current` that changes the stream's content.
    /// Returns `end + 1` when the rest of the range leaves it untouched.
    async fn find_next_change(
        &self,
        stream_number: u64,
        current: u64,
        end: u64,
        schedule: Option<&BTreeSet<u64>>,
    ) -> Result<u64, ConvertError> {
        let spec = stream_number.to_string();
        match self.method {
            Method::Pop => Ok(current + 1),
            Method::Diff => {
                // One transaction at a time: a revert inside a wider range
                // would cancel out of the diff and be skipped.
                let mut candidate = current + 1;
                while candidate <= end {
                    let report = self.accurev.diff(&spec, current, candidate).await?;
                    if !report.is_empty() {
                        return Ok(candidate);
                    }
                    candidate += 1;
                }
                Ok(end + 1)
            }
            Method::DeepHist => {
                let schedule = match schedule {
                    Some(schedule) => schedule,
                    None => return Ok(end + 1),
                };
                for &candidate in schedule.range((current + 1)..=end) {
                    let report = self.accurev.diff(&spec, current, candidate).await?;
                    if !report.is_empty() {
                        return Ok(candidate);
                    }
                }
                Ok(end + 1)
            }
        }
    }

    /// Transactions in `current..=end` that could affect the stream: its
    /// own history plus promotes into every basis-chain ancestor, honoring
    /// time-locks along the chain.
    async fn deep_hist_schedule(
        &self,
        stream: &Stream,
        current: u64,
        end: u64,
    ) -> Result<BTreeSet<u64>, ConvertError> {
        let range = format!("{}-{}", current, end);
        let mut ids = BTreeSet::new();
        for tr in self
            .accurev
            .hist(
                self.depot_name,
                Some(&stream.stream_number.to_string()),
                &range,
                None,
            )
            .await?
        {
            ids.insert(tr.id);
        }

        let snapshot = self
            .accurev
            .streams(self.depot_name, None, Some(&current.to_string()))
            .await?;
        let mut time_lock = stream.time_lock;
        let mut cursor = snapshot
            .by_number(stream.stream_number)
            .and_then(|s| snapshot.basis_of(s));
        let mut visited = BTreeSet::new();
        while let Some(ancestor) = cursor {
            if !visited.insert(ancestor.stream_number) {
                break;
            }
            let promotes = self
                .accurev
                .hist(
                    self.depot_name,
                    Some(&ancestor.stream_number.to_string()),
                    &range,
                    Some("promote"),
                )
                .await?;
            for tr in promotes {
                let locked_out = time_lock.map(|lock| tr.time > lock).unwrap_or(false);
                if !locked_out {
                    ids.insert(tr.id);
                }
            }
            time_lock = match (time_lock, ancestor.time_lock) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            cursor = snapshot.basis_of(ancestor);
        }
        info!(
            stream = %stream.name,
            candidates = ids.len(),
            "deep history prefetch complete"
        );
        Ok(ids)
    }

    /// The depot transaction at exactly `id` (the server resolves a single
    /// spec to the latest transaction at or before it).
    async fn transaction_at(&self, id: u64) -> Result<Transaction, ConvertError> {
        let transactions = self
            .accurev
            .hist(self.depot_name, None, &id.to_string(), None)
            .await?;
        transactions
            .into_iter()
            .max_by_key(|tr| tr.id)
            .ok_or_else(|| {
                ConvertError::StreamNotFound {
                    depot: self.depot_name.to_string(),
                    stream: format!("transaction {}", id),
                }
            })
    }

    /// One appended commit on the metadata ref: `hist.xml`, `streams.xml`
    /// and, past the first/`mkstream` entry, `diff.xml` covering the
    /// transaction against its predecessor.
    async fn append_metadata_entry(
        &self,
        stream_number: u64,
        transaction: &Transaction,
    ) -> Result<(), ConvertError> {
        let spec = transaction.id.to_string();
        let hist_xml = self
            .accurev
            .hist_xml(self.depot_name, None, &spec, None)
            .await?;
        let streams_xml = self
            .accurev
            .streams_xml(self.depot_name, None, Some(&spec))
            .await?;
        let mut files = vec![
            ("hist.xml".to_string(), hist_xml.into_bytes()),
            ("streams.xml".to_string(), streams_xml.into_bytes()),
        ];
        if transaction.id > 1 && transaction.kind != TransactionKind::MkStream {
            let diff_xml = self
                .accurev
                .diff_xml(
                    &stream_number.to_string(),
                    transaction.id - 1,
                    transaction.id,
                )
                .await?;
            files.push(("diff.xml".to_string(), diff_xml.into_bytes()));
        }

        let identity = self.usermap.resolve(&transaction.user);
        let entry = LogEntry::from_files(
            transaction.id,
            files,
            &identity.name,
            &identity.email,
            transaction.time.timestamp(),
            identity.offset_minutes,
        );
        self.store
            .append(&stream_info_key(self.depot_number, stream_number), entry)?;
        Ok(())
    }

    /// Append content entries for every metadata entry the content ref
    /// lacks. The content ref must be a prefix of the metadata sequence.
    async fn replay_content(
        &self,
        stream: &Stream,
        info_key: &str,
        data_key: &str,
    ) -> Result<(), ConvertError> {
        let info_log = self.store.log(info_key)?;
        let data_tip = self.store.last(data_key)?;
        let pending = pending_entries(stream, &info_log, data_tip.as_ref())?;
        if pending.is_empty() {
            debug!(stream = %stream.name, "content ref already aligned");
            return Ok(());
        }
        info!(
            stream = %stream.name,
            entries = pending.len(),
            "replaying content entries"
        );

        let mut fresh = data_tip.is_none();
        for record in pending {
            let transaction = self.stored_transaction(&record)?;
            self.append_content_entry(stream, data_key, &record, &transaction, fresh)
                .await?;
            info!(
                stream = %stream.name,
                transaction = transaction.id,
                kind = %transaction.kind,
                "recorded content entry"
            );
            fresh = false;
        }
        Ok(())
    }

    /// Parse the transaction out of a stored metadata entry.
    fn stored_transaction(&self, record: &LogRecord) -> Result<Transaction, ConvertError> {
        let hist_bytes = self.store.read_file(record.commit, "hist.xml")?;
        let hist = String::from_utf8_lossy(&hist_bytes);
        let transactions = parse_hist(&hist)?;
        transactions
            .into_iter()
            .find(|tr| tr.id == record.transaction)
            .ok_or(ConvertError::HistoryMisaligned {
                stream: record.commit.to_string(),
                metadata_tx: record.transaction,
                content_tx: 0,
            })
    }

    async fn append_content_entry(
        &self,
        stream: &Stream,
        data_key: &str,
        info_record: &LogRecord,
        transaction: &Transaction,
        fresh: bool,
    ) -> Result<(), ConvertError> {
        // Working tree to the content tip, verified clean.
        match self.store.last(data_key)? {
            Some(tip) => {
                self.git.force_checkout_tree(tip.tree)?;
                if self.git.worktree_differs_from(tip.tree)? {
                    return Err(ConvertError::GitError(GitError::DirtyWorkTree(format!(
                        "working tree diverges from {} after checkout",
                        data_key
                    ))));
                }
            }
            None => self.git.clear_worktree()?,
        }

        let overwrite = fresh || self.method == Method::Pop;
        if overwrite {
            self.git.clear_worktree()?;
        } else {
            match self.store.read_file(info_record.commit, "diff.xml") {
                Ok(bytes) => {
                    let report = parse_diff(&String::from_utf8_lossy(&bytes))?;
                    self.git.remove_paths(&report.paths)?;
                    self.git.prune_empty_dirs()?;
                }
                // First or mkstream entries carry no diff; take the slow path.
                Err(StoreError::FileMissing { .. }) => self.git.clear_worktree()?,
                Err(e) => return Err(e.into()),
            }
        }

        self.accurev
            .pop(
                &stream.stream_number.to_string(),
                transaction.id,
                self.git.repo_path(),
                overwrite,
            )
            .await?;
        if self.preserve_empty_dirs {
            self.git.preserve_empty_dirs()?;
        }

        let tree = self.git.snapshot_worktree()?;
        let identity = self.usermap.resolve(&transaction.user);
        let entry = LogEntry::from_tree(
            transaction.id,
            tree,
            &identity.name,
            &identity.email,
            transaction.time.timestamp(),
            identity.offset_minutes,
        );
        self.store.append(data_key, entry)?;
        Ok(())
    }
}

/// Metadata entries the content ref has not replayed yet. The content tip
/// must name a transaction the metadata ref knows, and can never be ahead.
fn pending_entries(
    stream: &Stream,
    info_log: &[LogRecord],
    data_tip: Option<&LogRecord>,
) -> Result<Vec<LogRecord>, ConvertError> {
    let data_tx = match data_tip {
        Some(tip) => tip.transaction,
        None => return Ok(info_log.to_vec()),
    };
    if !info_log.iter().any(|record| record.transaction == data_tx) {
        warn!(
            stream = %stream.name,
            content_tx = data_tx,
            "content ref names a transaction missing from the metadata ref"
        );
        return Err(ConvertError::HistoryMisaligned {
            stream: stream.name.clone(),
            metadata_tx: info_log.last().map(|r| r.transaction).unwrap_or(0),
            content_tx: data_tx,
        });
    }
    Ok(info_log
        .iter()
        .filter(|record| record.transaction > data_tx)
        .cloned()
        .collect())
}
