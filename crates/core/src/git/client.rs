//! Local Git repository operations via `git2`.
//!
//! Ref updates that carry conversion invariants go through
//! [`GitClient::update_ref_cas`]: the caller states the tip it expects, the
//! update is compare-and-swap, and the new tip is read back after the write.
//! A write that reports success without moving the visible tip is surfaced
//! as [`GitError::RefUnchanged`] and never retried.

use std::path::{Path, PathBuf};

use git2::{BranchType, Oid, Repository, Signature, Time};
use tracing::{debug, info, instrument};

use crate::errors::GitError;

/// High-level Git client wrapping a `git2::Repository`.
pub struct GitClient {
    repo: Repository,
    repo_path: PathBuf,
}

/// Everything needed to reconstruct a commit with a different parent list.
#[derive(Debug, Clone)]
pub struct CommitDetail {
    pub id: Oid,
    pub tree: Oid,
    pub parents: Vec<Oid>,
    pub author_name: String,
    pub author_email: String,
    pub author_time: i64,
    pub author_offset_minutes: i32,
    pub committer_name: String,
    pub committer_email: String,
    pub committer_time: i64,
    pub committer_offset_minutes: i32,
    pub message: String,
}

/// Rebuild a signature from stored parts.
pub fn signature_from_parts(
    name: &str,
    email: &str,
    time_secs: i64,
    offset_minutes: i32,
) -> Result<Signature<'static>, GitError> {
    Ok(Signature::new(
        name,
        email,
        &Time::new(time_secs, offset_minutes),
    )?)
}

impl GitClient {
    /// Open an existing Git repository at `repo_path`.
    pub fn open<P: AsRef<Path>>(repo_path: P) -> Result<Self, GitError> {
        let path = repo_path.as_ref();
        info!(path = %path.display(), "opening git repository");
        let repo = Repository::open(path)
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    /// Open the repository at `repo_path`, initializing a fresh non-bare
    /// one if the path holds none.
    pub fn init_or_open<P: AsRef<Path>>(repo_path: P) -> Result<Self, GitError> {
        let path = repo_path.as_ref();
        if path.join(".git").exists() {
            return Self::open(path);
        }
        std::fs::create_dir_all(path)?;
        info!(path = %path.display(), "initializing git repository");
        let repo = Repository::init(path)?;
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    fn workdir(&self) -> Result<&Path, GitError> {
        self.repo
            .workdir()
            .ok_or_else(|| GitError::RepositoryNotFound("bare repository has no working tree".into()))
    }

    // -----------------------------------------------------------------------
    // Refs
    // -----------------------------------------------------------------------

    /// Current target of a ref, `None` if the ref does not exist.
    pub fn ref_tip(&self, name: &str) -> Result<Option<Oid>, GitError> {
        match self.repo.find_reference(name) {
            Ok(reference) => Ok(reference.resolve()?.target()),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Compare-and-swap ref update. `expected_old` of `None` means the ref
    /// must not exist yet. The tip is read back after the write.
    #[instrument(skip(self, log_message), fields(name, target = %target))]
    pub fn update_ref_cas(
        &self,
        name: &str,
        target: Oid,
        expected_old: Option<Oid>,
        log_message: &str,
    ) -> Result<(), GitError> {
        match expected_old {
            Some(old) => {
                self.repo
                    .reference_matching(name, target, true, old, log_message)
                    .map_err(|e| {
                        if e.code() == git2::ErrorCode::Modified {
                            GitError::StaleRefUpdate {
                                reference: name.to_string(),
                                detail: e.message().to_string(),
                            }
                        } else {
                            GitError::Git2Error(e)
                        }
                    })?;
            }
            None => {
                self.repo
                    .reference(name, target, false, log_message)
                    .map_err(|e| {
                        if e.code() == git2::ErrorCode::Exists {
                            GitError::StaleRefUpdate {
                                reference: name.to_string(),
                                detail: e.message().to_string(),
                            }
                        } else {
                            GitError::Git2Error(e)
                        }
                    })?;
            }
        }
        if self.ref_tip(name)? != Some(target) {
            return Err(GitError::RefUnchanged {
                reference: name.to_string(),
                target: target.to_string(),
            });
        }
        debug!(name, "ref updated");
        Ok(())
    }

    /// Unconditional ref update (used for replace refs and recovery).
    pub fn set_ref(&self, name: &str, target: Oid, log_message: &str) -> Result<(), GitError> {
        self.repo.reference(name, target, true, log_message)?;
        if self.ref_tip(name)? != Some(target) {
            return Err(GitError::RefUnchanged {
                reference: name.to_string(),
                target: target.to_string(),
            });
        }
        Ok(())
    }

    /// Delete a ref if it exists.
    pub fn delete_ref(&self, name: &str) -> Result<(), GitError> {
        match self.repo.find_reference(name) {
            Ok(mut reference) => {
                reference.delete()?;
                Ok(())
            }
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All refs under a prefix with their targets.
    pub fn list_refs(&self, prefix: &str) -> Result<Vec<(String, Oid)>, GitError> {
        let mut out = Vec::new();
        for reference in self.repo.references_glob(&format!("{}*", prefix))? {
            let reference = reference?;
            if let (Some(name), Some(target)) = (reference.name(), reference.target()) {
                out.push((name.to_string(), target));
            }
        }
        Ok(out)
    }

    /// Write bytes as a blob and point a ref directly at it.
    pub fn write_blob_ref(
        &self,
        name: &str,
        bytes: &[u8],
        log_message: &str,
    ) -> Result<Oid, GitError> {
        let blob = self.repo.blob(bytes)?;
        self.repo.reference(name, blob, true, log_message)?;
        if self.ref_tip(name)? != Some(blob) {
            return Err(GitError::RefUnchanged {
                reference: name.to_string(),
                target: blob.to_string(),
            });
        }
        Ok(blob)
    }

    /// Read the blob a ref points at, `None` if the ref does not exist.
    pub fn read_blob_ref(&self, name: &str) -> Result<Option<Vec<u8>>, GitError> {
        match self.ref_tip(name)? {
            Some(oid) => Ok(Some(self.repo.find_blob(oid)?.content().to_vec())),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    /// Build a flat tree from named blobs.
    pub fn build_tree(&self, files: &[(String, Vec<u8>)]) -> Result<Oid, GitError> {
        let mut builder = self.repo.treebuilder(None)?;
        for (name, bytes) in files {
            let blob = self.repo.blob(bytes)?;
            builder.insert(name, blob, 0o100644)?;
        }
        Ok(builder.write()?)
    }

    /// The empty tree.
    pub fn empty_tree(&self) -> Result<Oid, GitError> {
        Ok(self.repo.treebuilder(None)?.write()?)
    }

    /// Create a commit object from an existing tree. No ref moves; callers
    /// follow with [`update_ref_cas`](Self::update_ref_cas).
    pub fn commit_from_tree(
        &self,
        tree: Oid,
        parents: &[Oid],
        author: &Signature<'_>,
        committer: &Signature<'_>,
        message: &str,
    ) -> Result<Oid, GitError> {
        let tree_obj = self.repo.find_tree(tree)?;
        let mut parent_commits = Vec::with_capacity(parents.len());
        for parent in parents {
            parent_commits.push(self.repo.find_commit(*parent)?);
        }
        let parent_refs: Vec<&git2::Commit> = parent_commits.iter().collect();
        let oid = self
            .repo
            .commit(None, author, committer, message, &tree_obj, &parent_refs)?;
        debug!(sha = %oid, parents = parents.len(), "created commit");
        Ok(oid)
    }

    pub fn commit_tree_id(&self, commit: Oid) -> Result<Oid, GitError> {
        Ok(self.repo.find_commit(commit)?.tree_id())
    }

    /// Structural tree comparison: zero diff deltas means identical.
    pub fn trees_identical(&self, a: Oid, b: Oid) -> Result<bool, GitError> {
        if a == b {
            return Ok(true);
        }
        let tree_a = self.repo.find_tree(a)?;
        let tree_b = self.repo.find_tree(b)?;
        let diff = self
            .repo
            .diff_tree_to_tree(Some(&tree_a), Some(&tree_b), None)?;
        Ok(diff.deltas().len() == 0)
    }

    pub fn commit_detail(&self, commit: Oid) -> Result<CommitDetail, GitError> {
        let commit = self.repo.find_commit(commit)?;
        let author = commit.author();
        let committer = commit.committer();
        Ok(CommitDetail {
            id: commit.id(),
            tree: commit.tree_id(),
            parents: commit.parent_ids().collect(),
            author_name: author.name().unwrap_or("").to_string(),
            author_email: author.email().unwrap_or("").to_string(),
            author_time: author.when().seconds(),
            author_offset_minutes: author.when().offset_minutes(),
            committer_name: committer.name().unwrap_or("").to_string(),
            committer_email: committer.email().unwrap_or("").to_string(),
            committer_time: committer.when().seconds(),
            committer_offset_minutes: committer.when().offset_minutes(),
            message: commit.message().unwrap_or("").to_string(),
        })
    }

    /// Bytes of a named file inside a commit's tree, `None` if absent.
    pub fn file_bytes(&self, commit: Oid, name: &str) -> Result<Option<Vec<u8>>, GitError> {
        let commit = self.repo.find_commit(commit)?;
        let tree = commit.tree()?;
        let entry = match tree.get_path(Path::new(name)) {
            Ok(entry) => entry,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let blob = self.repo.find_blob(entry.id())?;
        Ok(Some(blob.content().to_vec()))
    }

    // -----------------------------------------------------------------------
    // History walks
    // -----------------------------------------------------------------------

    /// All commits reachable from a ref, oldest first.
    pub fn ref_log(&self, name: &str) -> Result<Vec<Oid>, GitError> {
        let tip = self
            .ref_tip(name)?
            .ok_or_else(|| GitError::RefNotFound(name.to_string()))?;
        let mut revwalk = self.repo.revwalk()?;
        revwalk.push(tip)?;
        revwalk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::TIME | git2::Sort::REVERSE)?;
        let mut commits = Vec::new();
        for oid in revwalk {
            commits.push(oid?);
        }
        Ok(commits)
    }

    // -----------------------------------------------------------------------
    // Branches
    // -----------------------------------------------------------------------

    pub fn branch_tip(&self, name: &str) -> Result<Option<Oid>, GitError> {
        self.ref_tip(&format!("refs/heads/{}", name))
    }

    /// Move a branch ref with compare-and-swap semantics; `expected_old` of
    /// `None` creates the branch.
    pub fn set_branch(
        &self,
        name: &str,
        target: Oid,
        expected_old: Option<Oid>,
        log_message: &str,
    ) -> Result<(), GitError> {
        self.update_ref_cas(
            &format!("refs/heads/{}", name),
            target,
            expected_old,
            log_message,
        )
    }

    #[instrument(skip(self))]
    pub fn rename_branch(&self, old: &str, new: &str) -> Result<(), GitError> {
        let mut branch = self.repo.find_branch(old, BranchType::Local)?;
        branch.rename(new, false)?;
        info!(old, new, "renamed branch");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        let mut branch = self.repo.find_branch(name, BranchType::Local)?;
        branch.delete()?;
        info!(name, "deleted branch");
        Ok(())
    }

    /// List all local branch names.
    pub fn list_branches(&self) -> Result<Vec<String>, GitError> {
        let branches = self.repo.branches(Some(BranchType::Local))?;
        let mut names = Vec::new();
        for branch_result in branches {
            let (branch, _) = branch_result?;
            if let Some(name) = branch.name()? {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    // -----------------------------------------------------------------------
    // Notes
    // -----------------------------------------------------------------------

    pub fn add_note(
        &self,
        namespace: &str,
        commit: Oid,
        content: &str,
        signature: &Signature<'_>,
    ) -> Result<(), GitError> {
        self.repo
            .note(signature, signature, Some(namespace), commit, content, true)?;
        Ok(())
    }

    pub fn read_note(&self, namespace: &str, commit: Oid) -> Result<Option<String>, GitError> {
        match self.repo.find_note(Some(namespace), commit) {
            Ok(note) => Ok(note.message().map(|m| m.to_string())),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Working tree
    // -----------------------------------------------------------------------

    /// Force the working tree and index to exactly match a tree, removing
    /// untracked and ignored files.
    #[instrument(skip(self), fields(tree = %tree))]
    pub fn force_checkout_tree(&self, tree: Oid) -> Result<(), GitError> {
        let tree_obj = self.repo.find_tree(tree)?;
        let mut builder = git2::build::CheckoutBuilder::new();
        builder.force().remove_untracked(true).remove_ignored(true);
        self.repo
            .checkout_tree(tree_obj.as_object(), Some(&mut builder))?;
        let mut index = self.repo.index()?;
        index.read_tree(&tree_obj)?;
        index.write()?;
        debug!("working tree synced");
        Ok(())
    }

    /// Whether the working tree differs from a tree at all, untracked and
    /// ignored files included.
    pub fn worktree_differs_from(&self, tree: Oid) -> Result<bool, GitError> {
        let tree_obj = self.repo.find_tree(tree)?;
        let mut opts = git2::DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(true)
            .recurse_ignored_dirs(true);
        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&tree_obj), Some(&mut opts))?;
        Ok(diff.deltas().len() > 0)
    }

    /// Remove everything from the working tree except `.git`.
    pub fn clear_worktree(&self) -> Result<(), GitError> {
        let workdir = self.workdir()?;
        for entry in std::fs::read_dir(workdir)? {
            let entry = entry?;
            if entry.file_name() == ".git" {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        debug!("cleared working tree");
        Ok(())
    }

    /// Remove the named repository-relative paths from the working tree,
    /// ignoring ones that are already gone.
    pub fn remove_paths(&self, paths: &[String]) -> Result<(), GitError> {
        let workdir = self.workdir()?;
        for path in paths {
            let full = workdir.join(path);
            match std::fs::symlink_metadata(&full) {
                Ok(meta) => {
                    if meta.is_dir() {
                        std::fs::remove_dir_all(&full)?;
                    } else {
                        std::fs::remove_file(&full)?;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Delete directories left empty after removals. A directory holding
    /// only an empty `.gitignore` placeholder counts as empty.
    pub fn prune_empty_dirs(&self) -> Result<(), GitError> {
        let workdir = self.workdir()?.to_path_buf();
        prune_dir(&workdir, true)?;
        Ok(())
    }

    /// Drop an empty `.gitignore` into every empty directory so the next
    /// snapshot keeps it.
    pub fn preserve_empty_dirs(&self) -> Result<(), GitError> {
        let workdir = self.workdir()?.to_path_buf();
        placehold_dir(&workdir, true)?;
        Ok(())
    }

    /// Stage the entire working tree (forced, so ignore rules cannot hide
    /// files) and return the resulting tree. Deletions are picked up
    /// because the index is rebuilt from scratch.
    pub fn snapshot_worktree(&self) -> Result<Oid, GitError> {
        let mut index = self.repo.index()?;
        index.clear()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::FORCE, None)?;
        index.write()?;
        Ok(index.write_tree()?)
    }
}

fn prune_dir(dir: &Path, is_root: bool) -> std::io::Result<bool> {
    let mut keep = false;
    let mut placeholder_only = true;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if is_root && name == ".git" {
            keep = true;
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if prune_dir(&path, false)? {
                std::fs::remove_dir_all(&path)?;
            } else {
                keep = true;
                placeholder_only = false;
            }
        } else if name == ".gitignore" && entry.metadata()?.len() == 0 {
            // Placeholder; the directory still counts as empty.
        } else {
            keep = true;
            placeholder_only = false;
        }
    }
    Ok(!is_root && !keep && placeholder_only)
}

fn placehold_dir(dir: &Path, is_root: bool) -> std::io::Result<()> {
    let mut entries = 0usize;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if is_root && entry.file_name() == ".git" {
            continue;
        }
        entries += 1;
        if entry.file_type()?.is_dir() {
            placehold_dir(&entry.path(), false)?;
        }
    }
    if entries == 0 && !is_root {
        std::fs::write(dir.join(".gitignore"), b"")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_repo() -> (tempfile::TempDir, GitClient) {
        let dir = tempfile::tempdir().unwrap();
        let client = GitClient::init_or_open(dir.path()).unwrap();
        (dir, client)
    }

    fn sig() -> Signature<'static> {
        Signature::new("Test", "test@example.com", &Time::new(1_325_000_000, 0)).unwrap()
    }

    #[test]
    fn test_repo_not_found() {
        assert!(matches!(
            GitClient::open("/nonexistent"),
            Err(GitError::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn test_commit_from_tree_and_cas() {
        let (_dir, client) = test_repo();
        let tree = client
            .build_tree(&[("hist.xml".to_string(), b"<x/>".to_vec())])
            .unwrap();
        let first = client
            .commit_from_tree(tree, &[], &sig(), &sig(), "transaction 1")
            .unwrap();
        client
            .update_ref_cas("refs/testing/log", first, None, "create")
            .unwrap();
        assert_eq!(client.ref_tip("refs/testing/log").unwrap(), Some(first));

        let second = client
            .commit_from_tree(tree, &[first], &sig(), &sig(), "transaction 2")
            .unwrap();
        client
            .update_ref_cas("refs/testing/log", second, Some(first), "advance")
            .unwrap();
        assert_eq!(client.ref_tip("refs/testing/log").unwrap(), Some(second));

        // Stale expectation must not move the ref.
        let third = client
            .commit_from_tree(tree, &[second], &sig(), &sig(), "transaction 3")
            .unwrap();
        let err = client
            .update_ref_cas("refs/testing/log", third, Some(first), "stale")
            .unwrap_err();
        assert!(matches!(err, GitError::StaleRefUpdate { .. }));
        assert_eq!(client.ref_tip("refs/testing/log").unwrap(), Some(second));

        // Creation of an existing ref is also stale.
        let err = client
            .update_ref_cas("refs/testing/log", third, None, "recreate")
            .unwrap_err();
        assert!(matches!(err, GitError::StaleRefUpdate { .. }));
    }

    #[test]
    fn test_ref_log_order() {
        let (_dir, client) = test_repo();
        let tree = client.empty_tree().unwrap();
        let a = client
            .commit_from_tree(tree, &[], &sig(), &sig(), "transaction 1")
            .unwrap();
        let b = client
            .commit_from_tree(tree, &[a], &sig(), &sig(), "transaction 4")
            .unwrap();
        client.update_ref_cas("refs/testing/log", a, None, "a").unwrap();
        client
            .update_ref_cas("refs/testing/log", b, Some(a), "b")
            .unwrap();
        assert_eq!(client.ref_log("refs/testing/log").unwrap(), vec![a, b]);
    }

    #[test]
    fn test_blob_ref_round_trip() {
        let (_dir, client) = test_repo();
        assert_eq!(client.read_blob_ref("refs/testing/hwm").unwrap(), None);
        client
            .write_blob_ref("refs/testing/hwm", b"{\"high_water_mark\":7}", "hwm")
            .unwrap();
        assert_eq!(
            client.read_blob_ref("refs/testing/hwm").unwrap().as_deref(),
            Some(b"{\"high_water_mark\":7}".as_slice())
        );
    }

    #[test]
    fn test_notes_round_trip() {
        let (_dir, client) = test_repo();
        let tree = client.empty_tree().unwrap();
        let commit = client
            .commit_from_tree(tree, &[], &sig(), &sig(), "transaction 1")
            .unwrap();
        assert_eq!(client.read_note("refs/notes/testing", commit).unwrap(), None);
        client
            .add_note("refs/notes/testing", commit, "{\"depot\":\"d\"}", &sig())
            .unwrap();
        assert_eq!(
            client.read_note("refs/notes/testing", commit).unwrap().as_deref(),
            Some("{\"depot\":\"d\"}")
        );
    }

    #[test]
    fn test_worktree_sync_and_snapshot() {
        let (dir, client) = test_repo();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "two").unwrap();
        let tree = client.snapshot_worktree().unwrap();
        assert!(!client.worktree_differs_from(tree).unwrap());

        // A stray file makes the comparison fail.
        std::fs::write(dir.path().join("stray.txt"), "x").unwrap();
        assert!(client.worktree_differs_from(tree).unwrap());

        // Forced checkout removes it again.
        client.force_checkout_tree(tree).unwrap();
        assert!(!client.worktree_differs_from(tree).unwrap());
        assert!(!dir.path().join("stray.txt").exists());

        // Deletions show up in the next snapshot.
        std::fs::remove_file(dir.path().join("sub/b.txt")).unwrap();
        std::fs::remove_dir(dir.path().join("sub")).unwrap();
        let tree2 = client.snapshot_worktree().unwrap();
        assert_ne!(tree, tree2);
        let tree2 = client.repo().find_tree(tree2).unwrap();
        assert!(tree2.get_path(Path::new("sub/b.txt")).is_err());
    }

    #[test]
    fn test_empty_dir_placeholders() {
        let (dir, client) = test_repo();
        std::fs::create_dir_all(dir.path().join("keep/empty")).unwrap();
        client.preserve_empty_dirs().unwrap();
        assert!(dir.path().join("keep/empty/.gitignore").exists());
        // Parent directory holds the child, so no placeholder of its own.
        assert!(!dir.path().join("keep/.gitignore").exists());

        // Pruning treats the placeholder-only directory as empty.
        client.prune_empty_dirs().unwrap();
        assert!(!dir.path().join("keep").exists());
    }

    #[test]
    fn test_remove_paths_and_clear() {
        let (dir, client) = test_repo();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "two").unwrap();

        client
            .remove_paths(&["a.txt".to_string(), "missing.txt".to_string()])
            .unwrap();
        assert!(!dir.path().join("a.txt").exists());
        assert!(dir.path().join("sub/b.txt").exists());

        client.clear_worktree().unwrap();
        assert!(!dir.path().join("sub").exists());
        assert!(dir.path().join(".git").exists());
    }

    #[test]
    fn test_branch_cas_and_rename() {
        let (_dir, client) = test_repo();
        let tree = client.empty_tree().unwrap();
        let commit = client
            .commit_from_tree(tree, &[], &sig(), &sig(), "init")
            .unwrap();
        client.set_branch("widgets", commit, None, "create").unwrap();
        assert_eq!(client.branch_tip("widgets").unwrap(), Some(commit));

        client.rename_branch("widgets", "widgets_main").unwrap();
        assert_eq!(client.branch_tip("widgets").unwrap(), None);
        assert_eq!(client.branch_tip("widgets_main").unwrap(), Some(commit));
        assert!(client
            .list_branches()
            .unwrap()
            .contains(&"widgets_main".to_string()));
    }

    #[test]
    fn test_commit_detail_round_trip() {
        let (_dir, client) = test_repo();
        let tree = client
            .build_tree(&[("f.txt".to_string(), b"v".to_vec())])
            .unwrap();
        let author = signature_from_parts("Jane Doe", "jane@example.com", 1_325_000_000, 60).unwrap();
        let commit = client
            .commit_from_tree(tree, &[], &author, &author, "message body")
            .unwrap();
        let detail = client.commit_detail(commit).unwrap();
        assert_eq!(detail.tree, tree);
        assert_eq!(detail.author_name, "Jane Doe");
        assert_eq!(detail.author_offset_minutes, 60);
        assert_eq!(detail.committer_time, 1_325_000_000);
        assert_eq!(detail.message, "message body");
        assert!(detail.parents.is_empty());
    }
}
