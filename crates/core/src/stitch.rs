//! History stitching: the optional finalization pass.
//!
//! Processing records promotions it can prove as merges, but the same
//! promoted content can still surface as separate commits on several
//! branches. Stitching walks every configured branch, groups commits by
//! content tree, and derives a rewrite plan: sibling commits produced by one
//! transaction on an ancestor/descendant stream pair collapse into one
//! (alias), and a later commit whose tree matches an earlier commit on a
//! different stream gains that commit as an extra parent (merge edge).
//!
//! The plan is emitted as data plus a `git replace` script; applying it
//! in-process writes `refs/replace/` refs and moves branch tips. Rewritten
//! parent sets are checked to contain every original parent (modulo alias
//! resolution) before anything is written. Content is never re-materialized
//! here.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use git2::Oid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::accurev::parser::parse_streams;
use crate::errors::{ConvertError, GitError};
use crate::git::{signature_from_parts, GitClient};
use crate::models::CommitAnnotation;
use crate::store::{stream_info_key, StateStore, ANNOTATION_NOTES_REF};

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Drop one commit, replacing every reference to it with the target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AliasEntry {
    pub commit: String,
    pub target: String,
}

/// Re-parent one commit. `parents` is the full replacement parent list;
/// `original_parents` is kept for auditing the superset guarantee.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraftEntry {
    pub commit: String,
    pub original_parents: Vec<String>,
    pub parents: Vec<String>,
}

/// Move a branch whose tip was aliased away.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchMove {
    pub branch: String,
    pub from: String,
    pub to: String,
}

/// The complete rewrite specification produced by one stitching pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StitchPlan {
    pub aliases: Vec<AliasEntry>,
    pub grafts: Vec<GraftEntry>,
    pub branch_moves: Vec<BranchMove>,
}

impl StitchPlan {
    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty() && self.grafts.is_empty() && self.branch_moves.is_empty()
    }

    /// Render the plan as a shell script for an external rewrite mechanism.
    pub fn render_script(&self) -> String {
        let mut lines = vec![
            "#!/bin/sh".to_string(),
            format!(
                "# accugit stitch plan: {} alias(es), {} graft(s), {} branch move(s)",
                self.aliases.len(),
                self.grafts.len(),
                self.branch_moves.len()
            ),
            "set -e".to_string(),
        ];
        for alias in &self.aliases {
            lines.push(format!("git replace -f {} {}", alias.commit, alias.target));
        }
        for graft in &self.grafts {
            lines.push(format!(
                "git replace -f --graft {} {}",
                graft.commit,
                graft.parents.join(" ")
            ));
        }
        for mv in &self.branch_moves {
            lines.push(format!(
                "git update-ref refs/heads/{} {} {}",
                mv.branch, mv.to, mv.from
            ));
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

// ---------------------------------------------------------------------------
// Stitcher
// ---------------------------------------------------------------------------

/// One commit as seen by the stitching pass.
#[derive(Debug, Clone)]
struct CommitFacts {
    id: Oid,
    tree: Oid,
    parents: Vec<Oid>,
    time: i64,
    transaction: u64,
    stream_number: u64,
}

pub struct Stitcher<'a> {
    git: &'a GitClient,
    store: &'a dyn StateStore,
    depot_number: u64,
    /// Stream number to branch name, as recorded by processing.
    branches: &'a BTreeMap<u64, String>,
}

impl<'a> Stitcher<'a> {
    pub fn new(
        git: &'a GitClient,
        store: &'a dyn StateStore,
        depot_number: u64,
        branches: &'a BTreeMap<u64, String>,
    ) -> Self {
        Self {
            git,
            store,
            depot_number,
            branches,
        }
    }

    /// Build the rewrite plan over all configured branches. Read-only.
    #[instrument(skip(self), fields(depot = self.depot_number))]
    pub fn build_plan(&self) -> Result<StitchPlan, ConvertError> {
        let facts = self.collect_commits()?;
        info!(commits = facts.len(), "stitching scan complete");

        // Group by content tree; only multi-member groups matter.
        let mut groups: BTreeMap<Oid, Vec<&CommitFacts>> = BTreeMap::new();
        for fact in facts.values() {
            groups.entry(fact.tree).or_default().push(fact);
        }

        let mut aliases: HashMap<Oid, Oid> = HashMap::new();
        let mut additions: BTreeMap<Oid, Vec<Oid>> = BTreeMap::new();
        for members in groups.values_mut() {
            if members.len() < 2 {
                continue;
            }
            members.sort_by(|a, b| {
                a.time
                    .cmp(&b.time)
                    .then(a.transaction.cmp(&b.transaction))
                    .then(a.id.cmp(&b.id))
            });
            self.stitch_group(members, &mut aliases, &mut additions)?;
        }

        self.assemble_plan(&facts, &aliases, &additions)
    }

    /// Apply a plan in-process: `refs/replace/` refs for aliases and
    /// grafts, compare-and-swap moves for branch tips.
    #[instrument(skip(self, plan))]
    pub fn apply(&self, plan: &StitchPlan) -> Result<(), ConvertError> {
        for alias in &plan.aliases {
            let commit = parse_oid(&alias.commit)?;
            let target = parse_oid(&alias.target)?;
            self.git
                .set_ref(&format!("refs/replace/{}", commit), target, "stitch alias")?;
        }
        for graft in &plan.grafts {
            let commit = parse_oid(&graft.commit)?;
            let detail = self.git.commit_detail(commit)?;
            let author = signature_from_parts(
                &detail.author_name,
                &detail.author_email,
                detail.author_time,
                detail.author_offset_minutes,
            )?;
            let committer = signature_from_parts(
                &detail.committer_name,
                &detail.committer_email,
                detail.committer_time,
                detail.committer_offset_minutes,
            )?;
            let mut parents = Vec::with_capacity(graft.parents.len());
            for parent in &graft.parents {
                parents.push(parse_oid(parent)?);
            }
            let replacement = self.git.commit_from_tree(
                detail.tree,
                &parents,
                &author,
                &committer,
                &detail.message,
            )?;
            self.git.set_ref(
                &format!("refs/replace/{}", commit),
                replacement,
                "stitch graft",
            )?;
        }
        for mv in &plan.branch_moves {
            let from = parse_oid(&mv.from)?;
            let to = parse_oid(&mv.to)?;
            self.git
                .set_branch(&mv.branch, to, Some(from), "stitch branch move")?;
        }
        info!(
            aliases = plan.aliases.len(),
            grafts = plan.grafts.len(),
            branch_moves = plan.branch_moves.len(),
            "stitch plan applied"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scan
    // -----------------------------------------------------------------------

    /// Every commit reachable from a configured branch, with its annotation.
    /// A commit without a readable annotation is fatal here; the recovery
    /// rollback belongs to processing, not to finalization.
    fn collect_commits(&self) -> Result<HashMap<Oid, CommitFacts>, ConvertError> {
        let mut facts = HashMap::new();
        for branch in self.branches.values() {
            if self.git.branch_tip(branch)?.is_none() {
                debug!(branch, "branch absent; skipped");
                continue;
            }
            for commit in self.git.ref_log(&format!("refs/heads/{}", branch))? {
                if facts.contains_key(&commit) {
                    continue;
                }
                let annotation = self.read_annotation(commit)?.ok_or_else(|| {
                    ConvertError::MissingAnnotation {
                        commit: commit.to_string(),
                        branch: branch.clone(),
                    }
                })?;
                let detail = self.git.commit_detail(commit)?;
                facts.insert(
                    commit,
                    CommitFacts {
                        id: commit,
                        tree: detail.tree,
                        parents: detail.parents,
                        time: detail.committer_time,
                        transaction: annotation.transaction_number,
                        stream_number: annotation.stream_number,
                    },
                );
            }
        }
        Ok(facts)
    }

    fn read_annotation(&self, commit: Oid) -> Result<Option<CommitAnnotation>, ConvertError> {
        match self.git.read_note(ANNOTATION_NOTES_REF, commit)? {
            Some(text) => Ok(serde_json::from_str(&text).ok()),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Group analysis
    // -----------------------------------------------------------------------

    /// Decide aliases and merge edges within one identical-tree group.
    /// Siblings of one transaction collapse pairwise wherever their streams
    /// stand in an ancestor/descendant relation, independent of whatever
    /// older commits the group also contains; the surviving members then
    /// follow the merge-edge rule against the group's earliest survivor.
    fn stitch_group(
        &self,
        members: &[&CommitFacts],
        aliases: &mut HashMap<Oid, Oid>,
        additions: &mut BTreeMap<Oid, Vec<Oid>>,
    ) -> Result<(), ConvertError> {
        let mut survivors: Vec<&CommitFacts> = Vec::new();
        let mut start = 0;
        while start < members.len() {
            let run_time = members[start].time;
            let run_tx = members[start].transaction;
            let mut end = start + 1;
            while end < members.len()
                && members[end].time == run_time
                && members[end].transaction == run_tx
            {
                end += 1;
            }
            let mut kept: Vec<&CommitFacts> = vec![members[start]];
            for &member in &members[start + 1..end] {
                let mut aliased = false;
                for slot in kept.iter_mut() {
                    match self.sibling_order(*slot, member)? {
                        Some(Ordering::Less) => {
                            debug!(
                                dropped = %member.id,
                                kept = %slot.id,
                                transaction = run_tx,
                                "sibling aliased onto ancestor stream's commit"
                            );
                            aliases.insert(member.id, slot.id);
                            aliased = true;
                            break;
                        }
                        Some(Ordering::Greater) => {
                            debug!(
                                dropped = %slot.id,
                                kept = %member.id,
                                transaction = run_tx,
                                "sibling aliased onto ancestor stream's commit"
                            );
                            aliases.insert(slot.id, member.id);
                            *slot = member;
                            aliased = true;
                            break;
                        }
                        _ => {}
                    }
                }
                if !aliased {
                    kept.push(member);
                }
            }
            survivors.extend(kept);
            start = end;
        }

        let base = survivors[0];
        for &member in &survivors[1..] {
            if member.time == base.time && member.transaction == base.transaction {
                // Unrelated siblings of the base's own transaction; neither
                // an alias nor a merge edge applies.
                continue;
            }
            if member.stream_number != base.stream_number
                && !member.parents.contains(&base.id)
            {
                debug!(
                    commit = %member.id,
                    extra_parent = %base.id,
                    "later identical-tree commit gains merge edge"
                );
                additions.entry(member.id).or_default().push(base.id);
            }
        }
        Ok(())
    }

    /// `Less` when `a`'s stream is an ancestor of `b`'s at the transaction's
    /// time, `Greater` for the reverse, `None` for unrelated streams (or no
    /// stored snapshot to judge by).
    fn sibling_order(
        &self,
        a: &CommitFacts,
        b: &CommitFacts,
    ) -> Result<Option<Ordering>, ConvertError> {
        let snapshot = match self.snapshot_at(a.stream_number, a.transaction)? {
            Some(snapshot) => snapshot,
            None => match self.snapshot_at(b.stream_number, b.transaction)? {
                Some(snapshot) => snapshot,
                None => {
                    warn!(
                        transaction = a.transaction,
                        "no stored stream listing; sibling pair left alone"
                    );
                    return Ok(None);
                }
            },
        };
        if snapshot.is_ancestor_of(a.stream_number, b.stream_number) {
            Ok(Some(Ordering::Less))
        } else if snapshot.is_ancestor_of(b.stream_number, a.stream_number) {
            Ok(Some(Ordering::Greater))
        } else {
            Ok(None)
        }
    }

    fn snapshot_at(
        &self,
        stream_number: u64,
        transaction: u64,
    ) -> Result<Option<crate::models::StreamSnapshot>, ConvertError> {
        let key = stream_info_key(self.depot_number, stream_number);
        let record = match self.store.entry_at(&key, transaction)? {
            Some(record) => record,
            None => return Ok(None),
        };
        let bytes = self.store.read_file(record.commit, "streams.xml")?;
        Ok(Some(parse_streams(&String::from_utf8_lossy(&bytes))?))
    }

    // -----------------------------------------------------------------------
    // Plan assembly
    // -----------------------------------------------------------------------

    fn assemble_plan(
        &self,
        facts: &HashMap<Oid, CommitFacts>,
        aliases: &HashMap<Oid, Oid>,
        additions: &BTreeMap<Oid, Vec<Oid>>,
    ) -> Result<StitchPlan, ConvertError> {
        let mut plan = StitchPlan::default();

        let mut resolved_aliases: BTreeMap<Oid, Oid> = BTreeMap::new();
        for &commit in aliases.keys() {
            resolved_aliases.insert(commit, resolve_alias(aliases, commit)?);
        }
        for (&commit, &target) in &resolved_aliases {
            plan.aliases.push(AliasEntry {
                commit: commit.to_string(),
                target: target.to_string(),
            });
        }

        // A commit needs a graft when it gains merge edges or when one of
        // its parents was aliased away.
        let mut graft_commits: BTreeSet<Oid> = additions.keys().copied().collect();
        for fact in facts.values() {
            if resolved_aliases.contains_key(&fact.id) {
                continue;
            }
            if fact.parents.iter().any(|p| resolved_aliases.contains_key(p)) {
                graft_commits.insert(fact.id);
            }
        }

        for &commit in &graft_commits {
            if resolved_aliases.contains_key(&commit) {
                // Dropped commits are never re-parented.
                continue;
            }
            let fact = match facts.get(&commit) {
                Some(fact) => fact,
                None => continue,
            };
            let mut parents: Vec<Oid> = Vec::new();
            for &parent in &fact.parents {
                let resolved = resolved_aliases.get(&parent).copied().unwrap_or(parent);
                if !parents.contains(&resolved) {
                    parents.push(resolved);
                }
            }
            for &extra in additions.get(&commit).into_iter().flatten() {
                let resolved = resolved_aliases.get(&extra).copied().unwrap_or(extra);
                if !parents.contains(&resolved) {
                    parents.push(resolved);
                }
            }
            // Superset guarantee, modulo alias resolution.
            for &parent in &fact.parents {
                let resolved = resolved_aliases.get(&parent).copied().unwrap_or(parent);
                if !parents.contains(&resolved) {
                    return Err(ConvertError::ParentDropped {
                        commit: commit.to_string(),
                        parent: parent.to_string(),
                    });
                }
            }
            let original: Vec<Oid> = fact.parents.clone();
            if parents == original {
                continue;
            }
            plan.grafts.push(GraftEntry {
                commit: commit.to_string(),
                original_parents: original.iter().map(|p| p.to_string()).collect(),
                parents: parents.iter().map(|p| p.to_string()).collect(),
            });
        }

        for branch in self.branches.values() {
            if let Some(tip) = self.git.branch_tip(branch)? {
                if let Some(&target) = resolved_aliases.get(&tip) {
                    plan.branch_moves.push(BranchMove {
                        branch: branch.clone(),
                        from: tip.to_string(),
                        to: target.to_string(),
                    });
                }
            }
        }

        info!(
            aliases = plan.aliases.len(),
            grafts = plan.grafts.len(),
            branch_moves = plan.branch_moves.len(),
            "stitch plan assembled"
        );
        Ok(plan)
    }
}

/// Follow an alias chain to its end. A repeated commit on the walk is a
/// cycle and aborts.
fn resolve_alias(aliases: &HashMap<Oid, Oid>, start: Oid) -> Result<Oid, ConvertError> {
    let mut seen = HashSet::new();
    seen.insert(start);
    let mut current = start;
    while let Some(&next) = aliases.get(&current) {
        if !seen.insert(next) {
            return Err(ConvertError::AliasCycle(start.to_string()));
        }
        current = next;
    }
    Ok(current)
}

fn parse_oid(text: &str) -> Result<Oid, ConvertError> {
    Oid::from_str(text)
        .map_err(|e| ConvertError::GitError(GitError::Git2Error(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransactionKind;
    use crate::store::{LogEntry, MemoryStateStore};
    use git2::Signature;

    struct Fixture {
        _dir: tempfile::TempDir,
        git: GitClient,
        store: MemoryStateStore,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let git = GitClient::init_or_open(dir.path()).unwrap();
            Self {
                _dir: dir,
                git,
                store: MemoryStateStore::new(),
            }
        }

        fn sig(&self, time: i64) -> Signature<'static> {
            signature_from_parts("Conv", "conv@example.com", time, 0).unwrap()
        }

        fn tree(&self, files: &[(&str, &str)]) -> Oid {
            let files: Vec<(String, Vec<u8>)> = files
                .iter()
                .map(|(n, c)| (n.to_string(), c.as_bytes().to_vec()))
                .collect();
            self.git.build_tree(&files).unwrap()
        }

        /// One annotated commit, appended to a branch.
        #[allow(clippy::too_many_arguments)]
        fn commit(
            &self,
            branch: &str,
            tree: Oid,
            extra_parent: Option<Oid>,
            time: i64,
            tx: u64,
            stream: u64,
        ) -> Oid {
            let sig = self.sig(time);
            let tip = self.git.branch_tip(branch).unwrap();
            let mut parents: Vec<Oid> = tip.into_iter().collect();
            if let Some(extra) = extra_parent {
                parents.push(extra);
            }
            let commit = self
                .git
                .commit_from_tree(tree, &parents, &sig, &sig, &format!("transaction {}", tx))
                .unwrap();
            self.git.set_branch(branch, commit, tip, "test").unwrap();
            let annotation = CommitAnnotation {
                depot: "Widgets".into(),
                stream: format!("stream_{}", stream),
                stream_number: stream,
                transaction_number: tx,
                transaction_kind: TransactionKind::Promote,
                dst_stream: None,
                dst_stream_number: None,
                src_stream: None,
                src_stream_number: None,
            };
            self.git
                .add_note(
                    ANNOTATION_NOTES_REF,
                    commit,
                    &serde_json::to_string(&annotation).unwrap(),
                    &sig,
                )
                .unwrap();
            commit
        }

        /// Stream listing where 2 ("int") is the basis of 4 ("qa"), stored
        /// as the metadata entry of stream 2 at `tx`.
        fn seed_topology(&self, tx: u64) {
            let streams = r#"<AcResponse Command="show streams" TaskId="0">
<stream depotName="Widgets" streamNumber="1" name="Widgets" type="normal"/>
<stream basis="Widgets" basisStreamNumber="1" depotName="Widgets" streamNumber="2" name="int" type="normal"/>
<stream basis="int" basisStreamNumber="2" depotName="Widgets" streamNumber="4" name="qa" type="normal"/>
</AcResponse>"#;
            self.store
                .append(
                    &stream_info_key(1, 2),
                    LogEntry::from_files(
                        tx,
                        vec![("streams.xml".to_string(), streams.as_bytes().to_vec())],
                        "conv",
                        "conv@example.com",
                        1_325_000_000,
                        0,
                    ),
                )
                .unwrap();
        }

        fn branches(&self, entries: &[(u64, &str)]) -> BTreeMap<u64, String> {
            entries.iter().map(|(n, b)| (*n, b.to_string())).collect()
        }
    }

    #[test]
    fn test_sibling_commits_alias_onto_ancestor() {
        let fx = Fixture::new();
        fx.seed_topology(7);
        let shared = fx.tree(&[("a", "1")]);
        let int_base = fx.commit("int", fx.tree(&[("a", "0")]), None, 100, 2, 2);
        let int_tip = fx.commit("int", shared, None, 200, 7, 2);
        let qa_base = fx.commit("qa", fx.tree(&[("b", "9")]), None, 150, 4, 4);
        // Inheritance commit produced by the same transaction on qa.
        let qa_tip = fx.commit("qa", shared, Some(int_tip), 200, 7, 4);

        let branches = fx.branches(&[(2, "int"), (4, "qa")]);
        let stitcher = Stitcher::new(&fx.git, &fx.store, 1, &branches);
        let plan = stitcher.build_plan().unwrap();

        assert_eq!(plan.aliases.len(), 1);
        assert_eq!(plan.aliases[0].commit, qa_tip.to_string());
        assert_eq!(plan.aliases[0].target, int_tip.to_string());
        // qa's tip moves onto the surviving commit.
        assert_eq!(
            plan.branch_moves,
            vec![BranchMove {
                branch: "qa".into(),
                from: qa_tip.to_string(),
                to: int_tip.to_string(),
            }]
        );
        // No graft touches the unrelated base commits.
        for graft in &plan.grafts {
            assert_ne!(graft.commit, int_base.to_string());
            assert_ne!(graft.commit, qa_base.to_string());
        }
    }

    #[test]
    fn test_sibling_alias_survives_older_identical_tree() {
        // A revert promoted through int lands qa's sibling on content that
        // already exists on an older alpha commit. The siblings must still
        // collapse; only the surviving one gains the merge edge back to
        // the old commit.
        let fx = Fixture::new();
        fx.seed_topology(7);
        let shared = fx.tree(&[("a", "1")]);
        let alpha_tip = fx.commit("alpha", shared, None, 100, 5, 1);
        let int_tip = fx.commit("int", shared, None, 200, 7, 2);
        let qa_base = fx.commit("qa", fx.tree(&[("b", "9")]), None, 150, 4, 4);
        let qa_tip = fx.commit("qa", shared, Some(int_tip), 200, 7, 4);

        let branches = fx.branches(&[(1, "alpha"), (2, "int"), (4, "qa")]);
        let stitcher = Stitcher::new(&fx.git, &fx.store, 1, &branches);
        let plan = stitcher.build_plan().unwrap();

        assert_eq!(plan.aliases.len(), 1);
        assert_eq!(plan.aliases[0].commit, qa_tip.to_string());
        assert_eq!(plan.aliases[0].target, int_tip.to_string());
        let graft = plan
            .grafts
            .iter()
            .find(|g| g.commit == int_tip.to_string())
            .expect("surviving sibling must gain the merge edge");
        assert!(graft.parents.contains(&alpha_tip.to_string()));
        assert!(!plan.grafts.iter().any(|g| g.commit == qa_tip.to_string()));
        assert!(!plan.grafts.iter().any(|g| g.commit == qa_base.to_string()));
        assert_eq!(
            plan.branch_moves,
            vec![BranchMove {
                branch: "qa".into(),
                from: qa_tip.to_string(),
                to: int_tip.to_string(),
            }]
        );
    }

    #[test]
    fn test_aliased_parent_reroutes_children() {
        let fx = Fixture::new();
        fx.seed_topology(7);
        let shared = fx.tree(&[("a", "1")]);
        fx.commit("int", fx.tree(&[("a", "0")]), None, 100, 2, 2);
        fx.commit("qa", fx.tree(&[("b", "9")]), None, 150, 4, 4);
        let int_tip = fx.commit("int", shared, None, 200, 7, 2);
        let qa_sibling = fx.commit("qa", shared, None, 200, 7, 4);
        // A later qa commit keeps the aliased sibling as parent.
        let qa_tip = fx.commit("qa", fx.tree(&[("a", "2")]), None, 300, 9, 4);

        let branches = fx.branches(&[(2, "int"), (4, "qa")]);
        let stitcher = Stitcher::new(&fx.git, &fx.store, 1, &branches);
        let plan = stitcher.build_plan().unwrap();

        assert_eq!(plan.aliases.len(), 1);
        assert_eq!(plan.aliases[0].commit, qa_sibling.to_string());
        let graft = plan
            .grafts
            .iter()
            .find(|g| g.commit == qa_tip.to_string())
            .expect("child of aliased commit must be grafted");
        assert_eq!(graft.original_parents, vec![qa_sibling.to_string()]);
        assert_eq!(graft.parents, vec![int_tip.to_string()]);
        // The tip survives, so no branch move.
        assert!(plan.branch_moves.is_empty());
    }

    #[test]
    fn test_later_identical_tree_gains_merge_edge() {
        let fx = Fixture::new();
        let shared = fx.tree(&[("a", "1")]);
        let a_tip = fx.commit("alpha", shared, None, 100, 5, 1);
        let b_base = fx.commit("beta", fx.tree(&[("a", "0")]), None, 150, 6, 2);
        let b_tip = fx.commit("beta", shared, None, 300, 9, 2);

        let branches = fx.branches(&[(1, "alpha"), (2, "beta")]);
        let stitcher = Stitcher::new(&fx.git, &fx.store, 1, &branches);
        let plan = stitcher.build_plan().unwrap();

        assert!(plan.aliases.is_empty());
        assert_eq!(plan.grafts.len(), 1);
        let graft = &plan.grafts[0];
        assert_eq!(graft.commit, b_tip.to_string());
        assert_eq!(graft.original_parents, vec![b_base.to_string()]);
        // Original parent preserved, merge edge appended.
        assert_eq!(
            graft.parents,
            vec![b_base.to_string(), a_tip.to_string()]
        );
    }

    #[test]
    fn test_existing_merge_edge_is_not_duplicated() {
        let fx = Fixture::new();
        let shared = fx.tree(&[("a", "1")]);
        let a_tip = fx.commit("alpha", shared, None, 100, 5, 1);
        fx.commit("beta", fx.tree(&[("x", "0")]), None, 150, 6, 2);
        // Processing already recorded the merge.
        fx.commit("beta", shared, Some(a_tip), 300, 9, 2);

        let branches = fx.branches(&[(1, "alpha"), (2, "beta")]);
        let stitcher = Stitcher::new(&fx.git, &fx.store, 1, &branches);
        let plan = stitcher.build_plan().unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_same_branch_repeat_is_left_alone() {
        let fx = Fixture::new();
        let shared = fx.tree(&[("a", "1")]);
        fx.commit("alpha", shared, None, 100, 5, 1);
        fx.commit("alpha", fx.tree(&[("a", "2")]), None, 150, 6, 1);
        // Content reverted to the earlier tree on the same stream.
        fx.commit("alpha", shared, None, 300, 9, 1);

        let branches = fx.branches(&[(1, "alpha")]);
        let stitcher = Stitcher::new(&fx.git, &fx.store, 1, &branches);
        assert!(stitcher.build_plan().unwrap().is_empty());
    }

    #[test]
    fn test_unrelated_sibling_streams_left_alone() {
        let fx = Fixture::new();
        fx.seed_topology(7);
        let shared = fx.tree(&[("a", "1")]);
        fx.commit("qa", fx.tree(&[("b", "9")]), None, 150, 4, 4);
        fx.commit("other", fx.tree(&[("c", "3")]), None, 160, 5, 9);
        // Streams 4 and 9: 9 is not in the stored listing at all, so no
        // ancestry can be proven.
        let qa_tip = fx.commit("qa", shared, None, 200, 7, 4);
        let other_tip = fx.commit("other", shared, None, 200, 7, 9);
        assert_ne!(qa_tip, other_tip);

        let branches = fx.branches(&[(4, "qa"), (9, "other")]);
        let stitcher = Stitcher::new(&fx.git, &fx.store, 1, &branches);
        let plan = stitcher.build_plan().unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_missing_annotation_is_fatal() {
        let fx = Fixture::new();
        let sig = fx.sig(100);
        let tree = fx.tree(&[("a", "1")]);
        let commit = fx
            .git
            .commit_from_tree(tree, &[], &sig, &sig, "stray")
            .unwrap();
        fx.git.set_branch("alpha", commit, None, "test").unwrap();

        let branches = fx.branches(&[(1, "alpha")]);
        let stitcher = Stitcher::new(&fx.git, &fx.store, 1, &branches);
        assert!(matches!(
            stitcher.build_plan(),
            Err(ConvertError::MissingAnnotation { .. })
        ));
    }

    #[test]
    fn test_alias_resolution_is_transitive() {
        let a = Oid::from_str("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        let b = Oid::from_str("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb").unwrap();
        let c = Oid::from_str("cccccccccccccccccccccccccccccccccccccccc").unwrap();
        let mut aliases = HashMap::new();
        aliases.insert(a, b);
        aliases.insert(b, c);
        assert_eq!(resolve_alias(&aliases, a).unwrap(), c);
        assert_eq!(resolve_alias(&aliases, b).unwrap(), c);
        assert_eq!(resolve_alias(&aliases, c).unwrap(), c);
    }

    #[test]
    fn test_alias_cycle_aborts() {
        let a = Oid::from_str("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        let b = Oid::from_str("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb").unwrap();
        let mut aliases = HashMap::new();
        aliases.insert(a, b);
        aliases.insert(b, a);
        assert!(matches!(
            resolve_alias(&aliases, a),
            Err(ConvertError::AliasCycle(_))
        ));
    }

    #[test]
    fn test_apply_writes_replace_refs_and_moves_branches() {
        let fx = Fixture::new();
        fx.seed_topology(7);
        let shared = fx.tree(&[("a", "1")]);
        fx.commit("int", fx.tree(&[("a", "0")]), None, 100, 2, 2);
        fx.commit("qa", fx.tree(&[("b", "9")]), None, 150, 4, 4);
        let int_tip = fx.commit("int", shared, None, 200, 7, 2);
        let qa_tip = fx.commit("qa", shared, None, 200, 7, 4);
        assert_ne!(int_tip, qa_tip);

        let branches = fx.branches(&[(2, "int"), (4, "qa")]);
        let stitcher = Stitcher::new(&fx.git, &fx.store, 1, &branches);
        let plan = stitcher.build_plan().unwrap();
        assert_eq!(plan.aliases.len(), 1);
        stitcher.apply(&plan).unwrap();

        assert_eq!(
            fx.git
                .ref_tip(&format!("refs/replace/{}", qa_tip))
                .unwrap(),
            Some(int_tip)
        );
        assert_eq!(fx.git.branch_tip("qa").unwrap(), Some(int_tip));
        assert_eq!(fx.git.branch_tip("int").unwrap(), Some(int_tip));
    }

    #[test]
    fn test_apply_graft_preserves_commit_metadata() {
        let fx = Fixture::new();
        let shared = fx.tree(&[("a", "1")]);
        let a_tip = fx.commit("alpha", shared, None, 100, 5, 1);
        fx.commit("beta", fx.tree(&[("a", "0")]), None, 150, 6, 2);
        let b_tip = fx.commit("beta", shared, None, 300, 9, 2);

        let branches = fx.branches(&[(1, "alpha"), (2, "beta")]);
        let stitcher = Stitcher::new(&fx.git, &fx.store, 1, &branches);
        let plan = stitcher.build_plan().unwrap();
        stitcher.apply(&plan).unwrap();

        let replacement = fx
            .git
            .ref_tip(&format!("refs/replace/{}", b_tip))
            .unwrap()
            .expect("graft must write a replace ref");
        let detail = fx.git.commit_detail(replacement).unwrap();
        let original = fx.git.commit_detail(b_tip).unwrap();
        assert_eq!(detail.tree, original.tree);
        assert_eq!(detail.message, original.message);
        assert_eq!(detail.committer_time, original.committer_time);
        assert_eq!(detail.parents.len(), 2);
        assert_eq!(detail.parents[1], a_tip);
    }

    #[test]
    fn test_script_rendering() {
        let plan = StitchPlan {
            aliases: vec![AliasEntry {
                commit: "aaa".into(),
                target: "bbb".into(),
            }],
            grafts: vec![GraftEntry {
                commit: "ccc".into(),
                original_parents: vec!["ddd".into()],
                parents: vec!["ddd".into(), "bbb".into()],
            }],
            branch_moves: vec![BranchMove {
                branch: "qa".into(),
                from: "aaa".into(),
                to: "bbb".into(),
            }],
        };
        let script = plan.render_script();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("git replace -f aaa bbb"));
        assert!(script.contains("git replace -f --graft ccc ddd bbb"));
        assert!(script.contains("git update-ref refs/heads/qa bbb aaa"));
    }
}
