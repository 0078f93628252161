//! Merge-or-cherry-pick decision for promotions.
//!
//! Every branch commit goes through [`commit_or_merge`]. A provisional
//! single-parent commit of the stored content tree lands on the branch
//! first; if a source tip is given and its tree matches structurally, the
//! promotion carried the source's entire content and the provisional tip is
//! replaced by a two-parent merge of the same tree. Anything else stays a
//! cherry-pick. Whole-tree equality is a conservative approximation: a
//! promotion of a stream's full state reads as a merge, a partial promotion
//! never does.

use git2::{Oid, Signature};
use tracing::{debug, instrument};

use crate::errors::ConvertError;
use crate::git::GitClient;

/// One branch commit to place: the stored content tree plus the promotion
/// source, when the transaction recorded one.
pub struct CommitRequest<'a> {
    pub branch: &'a str,
    pub tree: Oid,
    pub source_tip: Option<Oid>,
    pub author: &'a Signature<'static>,
    pub committer: &'a Signature<'static>,
    pub message: &'a str,
    pub log_message: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub commit: Oid,
    pub previous_tip: Option<Oid>,
    pub merged: bool,
}

/// Commit a content tree on a branch, upgrading to a merge when the tree
/// matches the source tip's tree.
///
/// The provisional tip is replaced in a single compare-and-swap ref move,
/// so an interruption leaves the branch on either the cherry-pick or the
/// merge shape, never in between. Callers annotate the final commit and
/// roll the branch back to `previous_tip` if that annotation fails.
#[instrument(skip(git, request), fields(branch = request.branch))]
pub fn commit_or_merge(
    git: &GitClient,
    request: &CommitRequest<'_>,
) -> Result<MergeOutcome, ConvertError> {
    let previous_tip = git.branch_tip(request.branch)?;
    let single_parents: Vec<Oid> = previous_tip.into_iter().collect();
    let provisional = git.commit_from_tree(
        request.tree,
        &single_parents,
        request.author,
        request.committer,
        request.message,
    )?;
    git.set_branch(request.branch, provisional, previous_tip, request.log_message)?;

    let merge_source = match request.source_tip {
        // A source that already is the branch tip has nothing to merge.
        Some(source) if Some(source) != previous_tip => {
            let source_tree = git.commit_tree_id(source)?;
            if git.trees_identical(request.tree, source_tree)? {
                Some(source)
            } else {
                None
            }
        }
        _ => None,
    };

    let source = match merge_source {
        Some(source) => source,
        None => {
            debug!(commit = %provisional, "cherry-pick commit placed");
            return Ok(MergeOutcome {
                commit: provisional,
                previous_tip,
                merged: false,
            });
        }
    };

    let mut parents = single_parents;
    parents.push(source);
    let merged = git.commit_from_tree(
        request.tree,
        &parents,
        request.author,
        request.committer,
        request.message,
    )?;
    git.set_branch(request.branch, merged, Some(provisional), request.log_message)?;
    debug!(commit = %merged, source = %source, "promotion recorded as merge");
    Ok(MergeOutcome {
        commit: merged,
        previous_tip,
        merged: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::signature_from_parts;

    fn sig() -> Signature<'static> {
        signature_from_parts("Test", "test@example.com", 1_325_000_000, 0).unwrap()
    }

    fn commit_on(
        git: &GitClient,
        branch: &str,
        files: &[(&str, &str)],
        parents: &[Oid],
    ) -> (Oid, Oid) {
        let files: Vec<(String, Vec<u8>)> = files
            .iter()
            .map(|(n, c)| (n.to_string(), c.as_bytes().to_vec()))
            .collect();
        let tree = git.build_tree(&files).unwrap();
        let commit = git
            .commit_from_tree(tree, parents, &sig(), &sig(), "seed")
            .unwrap();
        git.set_branch(branch, commit, parents.first().copied(), "seed")
            .unwrap();
        (commit, tree)
    }

    fn request<'a>(
        branch: &'a str,
        tree: Oid,
        source_tip: Option<Oid>,
        author: &'a Signature<'static>,
    ) -> CommitRequest<'a> {
        CommitRequest {
            branch,
            tree,
            source_tip,
            author,
            committer: author,
            message: "promote",
            log_message: "transaction 5",
        }
    }

    #[test]
    fn test_full_promotion_becomes_merge() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitClient::init_or_open(dir.path()).unwrap();
        let (src_tip, src_tree) = commit_on(&git, "dev", &[("a", "1"), ("b", "2")], &[]);
        let (dst_tip, _) = commit_on(&git, "int", &[("a", "1")], &[]);

        let author = sig();
        let outcome =
            commit_or_merge(&git, &request("int", src_tree, Some(src_tip), &author)).unwrap();
        assert!(outcome.merged);
        assert_eq!(outcome.previous_tip, Some(dst_tip));
        assert_eq!(git.branch_tip("int").unwrap(), Some(outcome.commit));

        let detail = git.commit_detail(outcome.commit).unwrap();
        assert_eq!(detail.parents, vec![dst_tip, src_tip]);
        assert_eq!(detail.tree, src_tree);
    }

    #[test]
    fn test_partial_promotion_stays_cherry_pick() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitClient::init_or_open(dir.path()).unwrap();
        let (src_tip, _) = commit_on(&git, "dev", &[("a", "1"), ("b", "2")], &[]);
        let (dst_tip, _) = commit_on(&git, "int", &[("a", "0")], &[]);

        // Only `b` was promoted; `a` keeps the destination's content.
        let partial = git
            .build_tree(&[
                ("a".to_string(), b"0".to_vec()),
                ("b".to_string(), b"2".to_vec()),
            ])
            .unwrap();
        let author = sig();
        let outcome =
            commit_or_merge(&git, &request("int", partial, Some(src_tip), &author)).unwrap();
        assert!(!outcome.merged);

        let detail = git.commit_detail(outcome.commit).unwrap();
        assert_eq!(detail.parents, vec![dst_tip]);
        assert_eq!(detail.tree, partial);
    }

    #[test]
    fn test_unknown_source_is_plain_commit() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitClient::init_or_open(dir.path()).unwrap();
        let (dst_tip, _) = commit_on(&git, "int", &[("a", "1")], &[]);

        let tree = git.build_tree(&[("a".to_string(), b"2".to_vec())]).unwrap();
        let author = sig();
        let outcome = commit_or_merge(&git, &request("int", tree, None, &author)).unwrap();
        assert!(!outcome.merged);
        assert_eq!(
            git.commit_detail(outcome.commit).unwrap().parents,
            vec![dst_tip]
        );
    }

    #[test]
    fn test_first_commit_adopts_source_parent() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitClient::init_or_open(dir.path()).unwrap();
        let (src_tip, src_tree) = commit_on(&git, "dev", &[("a", "1")], &[]);

        // Branch `qa` does not exist yet; a full promotion seeds it with the
        // source as sole parent.
        let author = sig();
        let outcome =
            commit_or_merge(&git, &request("qa", src_tree, Some(src_tip), &author)).unwrap();
        assert!(outcome.merged);
        assert_eq!(outcome.previous_tip, None);
        assert_eq!(
            git.commit_detail(outcome.commit).unwrap().parents,
            vec![src_tip]
        );
    }

    #[test]
    fn test_source_at_branch_tip_never_merges() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitClient::init_or_open(dir.path()).unwrap();
        let (tip, tree) = commit_on(&git, "int", &[("a", "1")], &[]);

        let author = sig();
        let outcome = commit_or_merge(&git, &request("int", tree, Some(tip), &author)).unwrap();
        assert!(!outcome.merged);
        assert_eq!(
            git.commit_detail(outcome.commit).unwrap().parents,
            vec![tip]
        );
    }
}
