//! Processing stage: replay the stored histories onto user-visible branches.
//!
//! Processing is ref-only. Commits are built from the trees the content
//! refs already hold; the working tree and the server are never touched.
//! The global schedule is the ascending union of every configured stream's
//! metadata transaction ids, capped at the depot-wide floor of the
//! per-stream high-water marks. One transaction is replayed across all
//! streams holding an entry for it, destination first, before the
//! checkpoint advances.
//!
//! Every branch commit carries a JSON annotation note; a commit without one
//! is not part of the converted history and gets rolled back by the drift
//! recovery pass at the next start.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use git2::Oid;
use tracing::{debug, info, instrument, warn};

use crate::accurev::parser::{parse_hist, parse_streams};
use crate::errors::{ConvertError, StoreError};
use crate::format::{sanitize_branch_name, MessageFormatter};
use crate::git::{signature_from_parts, GitClient};
use crate::merge::{commit_or_merge, CommitRequest};
use crate::models::{
    CommitAnnotation, ProcessingCheckpoint, Stream, StreamSnapshot, Transaction, TransactionKind,
};
use crate::store::{
    self, stream_data_key, stream_info_key, LogRecord, StateStore, ANNOTATION_NOTES_REF,
    PROCESSING_STATE_KEY, RAW_NOTES_REF,
};
use crate::usermap::UserMap;

type TxIndex = HashMap<u64, BTreeMap<u64, LogRecord>>;

pub struct Processor<'a> {
    git: &'a GitClient,
    store: &'a dyn StateStore,
    usermap: &'a UserMap,
    formatter: &'a MessageFormatter,
    depot_name: &'a str,
    depot_number: u64,
    /// Stream number to branch name. Mutated by `chstream` renames and
    /// persisted in the checkpoint.
    branches: BTreeMap<u64, String>,
    /// Streams whose branch name is fixed by configuration; renames leave
    /// these alone.
    pinned: BTreeSet<u64>,
}

impl<'a> Processor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        git: &'a GitClient,
        store: &'a dyn StateStore,
        usermap: &'a UserMap,
        formatter: &'a MessageFormatter,
        depot_name: &'a str,
        depot_number: u64,
        branches: BTreeMap<u64, String>,
        pinned: BTreeSet<u64>,
    ) -> Self {
        Self {
            git,
            store,
            usermap,
            formatter,
            depot_name,
            depot_number,
            branches,
            pinned,
        }
    }

    /// Branch names after the run, including any renames.
    pub fn branches(&self) -> &BTreeMap<u64, String> {
        &self.branches
    }

    /// Replay everything between the checkpoint and the retrieval floor.
    /// Returns the transaction id processing is now current through.
    #[instrument(skip(self), fields(depot = %self.depot_name))]
    pub fn run(&mut self) -> Result<u64, ConvertError> {
        if self.branches.is_empty() {
            warn!("no streams configured; nothing to process");
            return Ok(0);
        }

        // Depot-wide floor: no transaction past the least-retrieved stream.
        let mut bound = u64::MAX;
        for (&number, branch) in &self.branches {
            match store::read_hwm(self.store, self.depot_number, number)? {
                Some(hwm) => bound = bound.min(hwm.high_water_mark),
                None => {
                    return Err(ConvertError::NotRetrieved {
                        stream: branch.clone(),
                    })
                }
            }
        }

        let mut last_processed = 0;
        if let Some(checkpoint) = store::read_checkpoint(self.store)? {
            if checkpoint.depot != self.depot_number {
                return Err(ConvertError::StoreError(StoreError::Corrupt {
                    key: PROCESSING_STATE_KEY.to_string(),
                    detail: format!(
                        "checkpoint belongs to depot {}, current depot is {}",
                        checkpoint.depot, self.depot_number
                    ),
                }));
            }
            last_processed = checkpoint.last_transaction;
            // Branch names may have drifted from the configured defaults
            // through renames; the checkpoint's map wins except where the
            // configuration pins a name.
            for (number, branch) in checkpoint.stream_map {
                if !self.pinned.contains(&number) {
                    if let Some(entry) = self.branches.get_mut(&number) {
                        *entry = branch;
                    }
                }
            }
        }

        // Load every stream's logs once and build the schedule.
        let mut info_index: TxIndex = HashMap::new();
        let mut data_index: TxIndex = HashMap::new();
        let mut schedule: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for &number in self.branches.keys() {
            let info = self.store.log(&stream_info_key(self.depot_number, number))?;
            let data = self.store.log(&stream_data_key(self.depot_number, number))?;
            for record in &info {
                if record.transaction <= bound {
                    schedule.entry(record.transaction).or_default().push(number);
                }
            }
            info_index.insert(number, info.into_iter().map(|r| (r.transaction, r)).collect());
            data_index.insert(number, data.into_iter().map(|r| (r.transaction, r)).collect());
        }

        self.recover_drift()?;

        let mut prev_snapshot = self.snapshot_at_or_before(last_processed, &info_index)?;
        let pending: Vec<(u64, Vec<u64>)> = schedule
            .range(last_processed + 1..)
            .map(|(&tx, numbers)| (tx, numbers.clone()))
            .collect();
        info!(
            transactions = pending.len(),
            from = last_processed,
            through = bound,
            "processing schedule built"
        );

        for (tx, numbers) in pending {
            let lead = match numbers.first().and_then(|n| {
                info_index.get(n).and_then(|log| log.get(&tx)).copied()
            }) {
                Some(record) => record,
                None => continue,
            };
            let transaction = self.load_transaction(&lead)?;
            let snapshot = self.load_snapshot(&lead)?;
            self.apply_transaction(
                &transaction,
                &snapshot,
                prev_snapshot.as_ref(),
                &numbers,
                &info_index,
                &data_index,
            )?;
            store::write_checkpoint(
                self.store,
                &ProcessingCheckpoint {
                    depot: self.depot_number,
                    stream_map: self.branches.clone(),
                    last_transaction: tx,
                },
            )?;
            prev_snapshot = Some(snapshot);
            last_processed = tx;
        }

        // Record that everything up to the floor has been considered, so a
        // quiet tail of the range does not read as lag.
        if last_processed < bound {
            store::write_checkpoint(
                self.store,
                &ProcessingCheckpoint {
                    depot: self.depot_number,
                    stream_map: self.branches.clone(),
                    last_transaction: bound,
                },
            )?;
        }
        info!(through = bound, "processing complete");
        Ok(bound)
    }

    // -----------------------------------------------------------------------
    // Drift recovery
    // -----------------------------------------------------------------------

    /// Roll every branch back to its nearest annotated commit. The one
    /// sanctioned rollback: a tip without an annotation is the residue of a
    /// crash between a commit and its annotation write.
    fn recover_drift(&self) -> Result<(), ConvertError> {
        for branch in self.branches.values() {
            self.recover_branch(branch)?;
        }
        Ok(())
    }

    fn recover_branch(&self, branch: &str) -> Result<(), ConvertError> {
        let tip = match self.git.branch_tip(branch)? {
            Some(tip) => tip,
            None => return Ok(()),
        };
        let mut cursor = tip;
        let mut steps = 0usize;
        loop {
            if self.read_annotation(cursor)?.is_some() {
                break;
            }
            let detail = self.git.commit_detail(cursor)?;
            if detail.parents.len() > 1 && steps > 0 {
                // Only the tip itself can legitimately lack an annotation;
                // an unannotated merge below it is not ours to unwind.
                return Err(ConvertError::MissingAnnotation {
                    commit: cursor.to_string(),
                    branch: branch.to_string(),
                });
            }
            match detail.parents.first() {
                Some(&parent) => {
                    cursor = parent;
                    steps += 1;
                }
                None => {
                    warn!(branch, "no annotated ancestry; dropping branch");
                    self.git.delete_branch(branch)?;
                    return Ok(());
                }
            }
        }
        if cursor != tip {
            warn!(
                branch,
                from = %tip,
                to = %cursor,
                "rolled branch back to last annotated commit"
            );
            self.git.set_branch(branch, cursor, Some(tip), "drift recovery")?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transaction dispatch
    // -----------------------------------------------------------------------

    fn apply_transaction(
        &mut self,
        transaction: &Transaction,
        snapshot: &StreamSnapshot,
        prev_snapshot: Option<&StreamSnapshot>,
        numbers: &[u64],
        info_index: &TxIndex,
        data_index: &TxIndex,
    ) -> Result<(), ConvertError> {
        debug!(
            transaction = transaction.id,
            kind = %transaction.kind,
            streams = numbers.len(),
            "replaying transaction"
        );
        match transaction.kind {
            TransactionKind::MkStream => self.apply_mkstream(
                transaction,
                snapshot,
                prev_snapshot,
                numbers,
                info_index,
                data_index,
            ),
            TransactionKind::ChStream => {
                self.apply_chstream(transaction, snapshot, numbers, data_index)
            }
            TransactionKind::Promote => {
                self.apply_promote(transaction, snapshot, numbers, data_index)
            }
            TransactionKind::Defunct | TransactionKind::Purge => {
                self.apply_removal(transaction, snapshot, numbers, data_index)
            }
            TransactionKind::DefComp => {
                info!(transaction = transaction.id, "defcomp transaction ignored");
                Ok(())
            }
            TransactionKind::Add
            | TransactionKind::Keep
            | TransactionKind::Co
            | TransactionKind::Move => {
                for &number in numbers {
                    let tree = self.content_tree(number, transaction.id, data_index)?;
                    self.place_commit(number, transaction, snapshot, tree, None, None, None)?;
                }
                Ok(())
            }
        }
    }

    fn apply_mkstream(
        &mut self,
        transaction: &Transaction,
        snapshot: &StreamSnapshot,
        prev_snapshot: Option<&StreamSnapshot>,
        numbers: &[u64],
        info_index: &TxIndex,
        data_index: &TxIndex,
    ) -> Result<(), ConvertError> {
        // The transaction does not name the created stream. A tracked
        // stream whose metadata history starts here is the one being made;
        // the listing set-difference catches streams created outside the
        // tracked set's own histories.
        let mut created: BTreeSet<u64> = numbers
            .iter()
            .copied()
            .filter(|n| {
                info_index
                    .get(n)
                    .and_then(|log| log.keys().next())
                    .is_some_and(|first| *first == transaction.id)
            })
            .collect();
        if transaction.id == 1 {
            created.extend(snapshot.streams.iter().map(|s| s.stream_number));
        } else if let Some(prev) = prev_snapshot {
            let before = prev.name_set();
            created.extend(
                snapshot
                    .streams
                    .iter()
                    .filter(|s| !before.contains(&s.name))
                    .map(|s| s.stream_number),
            );
        }

        let mut handled = BTreeSet::new();
        for number in created {
            if !self.branches.contains_key(&number) {
                debug!(stream = number, "created stream is not tracked");
                continue;
            }
            if !numbers.contains(&number) {
                debug!(stream = number, "created stream has no entry here");
                continue;
            }
            self.create_branch_at_basis(number, snapshot)?;
            let tree = self.content_tree(number, transaction.id, data_index)?;
            self.place_commit(number, transaction, snapshot, tree, None, None, None)?;
            handled.insert(number);
        }

        // Under the pop policy every tracked stream holds an entry at every
        // transaction; the rest get their (unchanged) trees committed.
        for &number in numbers {
            if handled.contains(&number) {
                continue;
            }
            let tree = self.content_tree(number, transaction.id, data_index)?;
            self.place_commit(number, transaction, snapshot, tree, None, None, None)?;
        }
        Ok(())
    }

    /// Point a not-yet-existing branch at its basis branch's tip, so the
    /// stream's first commit is empty relative to the basis. No basis or an
    /// untracked one leaves the branch to start as an orphan.
    fn create_branch_at_basis(
        &self,
        number: u64,
        snapshot: &StreamSnapshot,
    ) -> Result<(), ConvertError> {
        let branch = match self.branches.get(&number) {
            Some(branch) => branch,
            None => return Ok(()),
        };
        if self.git.branch_tip(branch)?.is_some() {
            return Ok(());
        }
        let basis_tip = snapshot
            .by_number(number)
            .and_then(|s| snapshot.basis_of(s))
            .and_then(|basis| self.branches.get(&basis.stream_number))
            .map(|basis_branch| self.git.branch_tip(basis_branch))
            .transpose()?
            .flatten();
        if let Some(tip) = basis_tip {
            self.git.set_branch(branch, tip, None, "stream created")?;
            info!(branch, basis_tip = %tip, "branch created at basis");
        }
        Ok(())
    }

    fn apply_chstream(
        &mut self,
        transaction: &Transaction,
        snapshot: &StreamSnapshot,
        numbers: &[u64],
        data_index: &TxIndex,
    ) -> Result<(), ConvertError> {
        for &number in numbers {
            let branch = match self.branches.get(&number) {
                Some(branch) => branch.clone(),
                None => continue,
            };
            // Replays after a completed pass must not rename or reset again.
            if let Some(tip) = self.git.branch_tip(&branch)? {
                if let Some(annotation) = self.read_annotation(tip)? {
                    if annotation.transaction_number == transaction.id {
                        debug!(branch, transaction = transaction.id, "already replayed");
                        continue;
                    }
                }
            }
            let stream = match snapshot.by_number(number) {
                Some(stream) => stream,
                None => continue,
            };
            if stream.prev_name.is_some() {
                self.rename_stream_branch(number, stream)?;
            }
            if stream.prev_basis.is_some() || stream.prev_basis_stream_number.is_some() {
                self.reparent_branch(number, stream, snapshot)?;
            }
            let tree = self.content_tree(number, transaction.id, data_index)?;
            self.place_commit(number, transaction, snapshot, tree, None, None, None)?;
        }
        Ok(())
    }

    fn rename_stream_branch(&mut self, number: u64, stream: &Stream) -> Result<(), ConvertError> {
        if self.pinned.contains(&number) {
            debug!(stream = %stream.name, "branch name pinned; rename skipped");
            return Ok(());
        }
        let new_name = sanitize_branch_name(&stream.name);
        let old_name = match self.branches.get(&number) {
            Some(name) => name.clone(),
            None => return Ok(()),
        };
        if old_name == new_name {
            return Ok(());
        }
        let have_old = self.git.branch_tip(&old_name)?.is_some();
        let have_new = self.git.branch_tip(&new_name)?.is_some();
        match (have_old, have_new) {
            (true, false) => self.git.rename_branch(&old_name, &new_name)?,
            (false, true) => debug!(old = %old_name, new = %new_name, "branch already renamed"),
            (true, true) => {
                return Err(ConvertError::GitError(crate::errors::GitError::StaleRefUpdate {
                    reference: format!("refs/heads/{}", new_name),
                    detail: format!("rename target already exists (renaming '{}')", old_name),
                }))
            }
            // Branch not created yet; only the tracked name changes.
            (false, false) => {}
        }
        self.branches.insert(number, new_name);
        Ok(())
    }

    /// Hard-reset a re-parented stream's branch onto the new basis tip.
    fn reparent_branch(
        &self,
        number: u64,
        stream: &Stream,
        snapshot: &StreamSnapshot,
    ) -> Result<(), ConvertError> {
        let branch = match self.branches.get(&number) {
            Some(branch) => branch,
            None => return Ok(()),
        };
        let basis_tip = snapshot
            .basis_of(stream)
            .and_then(|basis| self.branches.get(&basis.stream_number))
            .map(|basis_branch| self.git.branch_tip(basis_branch))
            .transpose()?
            .flatten();
        let basis_tip = match basis_tip {
            Some(tip) => tip,
            None => {
                warn!(branch, stream = %stream.name, "new basis untracked; reset skipped");
                return Ok(());
            }
        };
        let tip = self.git.branch_tip(branch)?;
        if tip == Some(basis_tip) {
            return Ok(());
        }
        info!(branch, to = %basis_tip, "re-parented; branch reset to new basis tip");
        self.git.set_branch(branch, basis_tip, tip, "reparent")?;
        Ok(())
    }

    fn apply_promote(
        &mut self,
        transaction: &Transaction,
        snapshot: &StreamSnapshot,
        numbers: &[u64],
        data_index: &TxIndex,
    ) -> Result<(), ConvertError> {
        let dst = transaction
            .to_stream()
            .and_then(|name| snapshot.by_name(name));
        let src = transaction.from_stream().and_then(|(name, num)| {
            num.and_then(|n| snapshot.by_number(n))
                .or_else(|| snapshot.by_name(name))
        });

        let mut handled = BTreeSet::new();
        let mut inherit_source = None;
        if let Some(dst_stream) = dst {
            let number = dst_stream.stream_number;
            if numbers.contains(&number) {
                let mut source_tip = None;
                if let Some(src_stream) = src {
                    if let Some(src_branch) = self.branches.get(&src_stream.stream_number) {
                        source_tip = self.git.branch_tip(src_branch)?;
                    }
                }
                let tree = self.content_tree(number, transaction.id, data_index)?;
                let commit =
                    self.place_commit(number, transaction, snapshot, tree, source_tip, dst, src)?;
                inherit_source = Some(commit);
                handled.insert(number);
            }
        }
        if let Some(src_stream) = src {
            // The source's content did not change; any entry it holds here
            // (pop policy) stays off its branch.
            handled.insert(src_stream.stream_number);
        }

        // Descendants that saw the change inherit it from the destination's
        // fresh commit, basis-parents first.
        let rest: Vec<u64> = numbers
            .iter()
            .copied()
            .filter(|n| !handled.contains(n))
            .collect();
        for number in topo_order(snapshot, &rest)? {
            let tree = self.content_tree(number, transaction.id, data_index)?;
            self.place_commit(number, transaction, snapshot, tree, inherit_source, dst, src)?;
        }
        Ok(())
    }

    fn apply_removal(
        &mut self,
        transaction: &Transaction,
        snapshot: &StreamSnapshot,
        numbers: &[u64],
        data_index: &TxIndex,
    ) -> Result<(), ConvertError> {
        let primary = transaction
            .to_stream()
            .and_then(|name| snapshot.by_name(name));

        let mut handled = BTreeSet::new();
        let mut inherit_source = None;
        let mut propagate = false;
        if let Some(stream) = primary {
            let number = stream.stream_number;
            if numbers.contains(&number) {
                let tree = self.content_tree(number, transaction.id, data_index)?;
                let commit =
                    self.place_commit(number, transaction, snapshot, tree, None, primary, None)?;
                handled.insert(number);
                if !stream.is_workspace() {
                    inherit_source = Some(commit);
                    propagate = true;
                }
            }
        }

        let rest: Vec<u64> = numbers
            .iter()
            .copied()
            .filter(|n| !handled.contains(n))
            .collect();
        let ordered = if propagate {
            topo_order(snapshot, &rest)?
        } else {
            rest
        };
        for number in ordered {
            let tree = self.content_tree(number, transaction.id, data_index)?;
            self.place_commit(
                number,
                transaction,
                snapshot,
                tree,
                inherit_source,
                primary,
                None,
            )?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Commit placement
    // -----------------------------------------------------------------------

    /// Put one transaction's tree on one branch: idempotency check, commit
    /// (possibly upgraded to a merge), annotation, rollback on annotation
    /// failure. Returns the branch's resulting tip.
    fn place_commit(
        &self,
        number: u64,
        transaction: &Transaction,
        snapshot: &StreamSnapshot,
        tree: Oid,
        source_tip: Option<Oid>,
        dst: Option<&Stream>,
        src: Option<&Stream>,
    ) -> Result<Oid, ConvertError> {
        let branch = match self.branches.get(&number) {
            Some(branch) => branch.clone(),
            None => {
                return Err(ConvertError::StreamNotFound {
                    depot: self.depot_name.to_string(),
                    stream: format!("stream {}", number),
                })
            }
        };
        if let Some(tip) = self.git.branch_tip(&branch)? {
            if let Some(annotation) = self.read_annotation(tip)? {
                if annotation.transaction_number == transaction.id {
                    debug!(branch, transaction = transaction.id, "tip already carries this transaction");
                    return Ok(tip);
                }
            }
        }

        let stream = snapshot.by_number(number);
        let stream_name = stream
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("stream_{}", number));
        let formatted = self.formatter.format(transaction, stream, dst, src);
        let identity = self.usermap.resolve(&transaction.user);
        let author = signature_from_parts(
            &identity.name,
            &identity.email,
            transaction.time.timestamp(),
            identity.offset_minutes,
        )?;
        let log_message = format!("transaction {}", transaction.id);

        let outcome = commit_or_merge(
            self.git,
            &CommitRequest {
                branch: &branch,
                tree,
                source_tip,
                author: &author,
                committer: &author,
                message: &formatted.message,
                log_message: &log_message,
            },
        )?;

        let annotation = CommitAnnotation {
            depot: self.depot_name.to_string(),
            stream: stream_name,
            stream_number: number,
            transaction_number: transaction.id,
            transaction_kind: transaction.kind,
            dst_stream: dst.map(|s| s.name.clone()),
            dst_stream_number: dst.map(|s| s.stream_number),
            src_stream: src.map(|s| s.name.clone()),
            src_stream_number: src.map(|s| s.stream_number),
        };
        let json = serde_json::to_string(&annotation).map_err(|e| {
            ConvertError::StoreError(StoreError::Corrupt {
                key: ANNOTATION_NOTES_REF.to_string(),
                detail: e.to_string(),
            })
        })?;
        let annotate = self
            .git
            .add_note(ANNOTATION_NOTES_REF, outcome.commit, &json, &author)
            .and_then(|_| match &formatted.note {
                Some(note) => self.git.add_note(RAW_NOTES_REF, outcome.commit, note, &author),
                None => Ok(()),
            });
        if let Err(e) = annotate {
            warn!(branch, commit = %outcome.commit, "annotation failed; rolling branch back");
            match outcome.previous_tip {
                Some(prev) => self
                    .git
                    .set_branch(&branch, prev, Some(outcome.commit), "annotation rollback")?,
                None => self.git.delete_branch(&branch)?,
            }
            return Err(e.into());
        }
        info!(
            branch,
            transaction = transaction.id,
            commit = %outcome.commit,
            merged = outcome.merged,
            "replayed onto branch"
        );
        Ok(outcome.commit)
    }

    // -----------------------------------------------------------------------
    // Stored-entry access
    // -----------------------------------------------------------------------

    fn content_tree(
        &self,
        number: u64,
        transaction: u64,
        data_index: &TxIndex,
    ) -> Result<Oid, ConvertError> {
        let log = data_index.get(&number);
        match log.and_then(|l| l.get(&transaction)) {
            Some(record) => Ok(record.tree),
            None => Err(ConvertError::HistoryMisaligned {
                stream: self
                    .branches
                    .get(&number)
                    .cloned()
                    .unwrap_or_else(|| format!("stream {}", number)),
                metadata_tx: transaction,
                content_tx: log
                    .and_then(|l| l.keys().next_back())
                    .copied()
                    .unwrap_or(0),
            }),
        }
    }

    fn load_transaction(&self, record: &LogRecord) -> Result<Transaction, ConvertError> {
        let bytes = self.store.read_file(record.commit, "hist.xml")?;
        let transactions = parse_hist(&String::from_utf8_lossy(&bytes))?;
        transactions
            .into_iter()
            .find(|t| t.id == record.transaction)
            .ok_or_else(|| {
                ConvertError::StoreError(StoreError::Corrupt {
                    key: "hist.xml".to_string(),
                    detail: format!(
                        "entry {} does not contain transaction {}",
                        record.commit, record.transaction
                    ),
                })
            })
    }

    fn load_snapshot(&self, record: &LogRecord) -> Result<StreamSnapshot, ConvertError> {
        let bytes = self.store.read_file(record.commit, "streams.xml")?;
        Ok(parse_streams(&String::from_utf8_lossy(&bytes))?)
    }

    /// The stream listing stored with the latest entry at or before a
    /// transaction, across all tracked streams.
    fn snapshot_at_or_before(
        &self,
        transaction: u64,
        info_index: &TxIndex,
    ) -> Result<Option<StreamSnapshot>, ConvertError> {
        let mut best: Option<LogRecord> = None;
        for log in info_index.values() {
            if let Some((_, record)) = log.range(..=transaction).next_back() {
                if best.map(|b| record.transaction > b.transaction).unwrap_or(true) {
                    best = Some(*record);
                }
            }
        }
        match best {
            Some(record) => Ok(Some(self.load_snapshot(&record)?)),
            None => Ok(None),
        }
    }

    fn read_annotation(&self, commit: Oid) -> Result<Option<CommitAnnotation>, ConvertError> {
        match self.git.read_note(ANNOTATION_NOTES_REF, commit)? {
            Some(text) => Ok(serde_json::from_str(&text).ok()),
            None => Ok(None),
        }
    }
}

/// Order stream numbers so every stream comes after its nearest tracked
/// basis ancestor. Kahn's algorithm; a cycle in the basis relation is fatal.
pub(crate) fn topo_order(
    snapshot: &StreamSnapshot,
    numbers: &[u64],
) -> Result<Vec<u64>, ConvertError> {
    let set: BTreeSet<u64> = numbers.iter().copied().collect();
    let mut indegree: BTreeMap<u64, usize> = set.iter().map(|&n| (n, 0)).collect();
    let mut children: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
    for &number in &set {
        let mut seen = HashSet::new();
        let mut cursor = snapshot.by_number(number);
        while let Some(basis) = cursor.and_then(|s| snapshot.basis_of(s)) {
            if !seen.insert(basis.stream_number) {
                return Err(ConvertError::BasisCycle(basis.name.clone()));
            }
            if set.contains(&basis.stream_number) {
                children.entry(basis.stream_number).or_default().push(number);
                if let Some(degree) = indegree.get_mut(&number) {
                    *degree += 1;
                }
                break;
            }
            cursor = Some(basis);
        }
    }

    let mut ready: BTreeSet<u64> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(&n, _)| n)
        .collect();
    let mut order = Vec::with_capacity(set.len());
    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        order.push(next);
        for child in children.get(&next).into_iter().flatten() {
            if let Some(degree) = indegree.get_mut(child) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*child);
                }
            }
        }
    }
    if order.len() != set.len() {
        let name = set
            .iter()
            .find(|n| !order.contains(n))
            .and_then(|n| snapshot.by_number(*n))
            .map(|s| s.name.clone())
            .unwrap_or_default();
        return Err(ConvertError::BasisCycle(name));
    }
    Ok(order)
}
