//! The commit builder: accepts an editor-drive (`open-root` ...
//! `close-edit`) and assembles it into a Git commit, re-encoding content
//! through the filter chain and reconciling synthesized properties, then
//! advances the tracked ref with compare-and-swap and bounded
//! rebase-and-retry on conflict.
//!
//! Mirrors the three-way-merge technique the teacher's conflict resolver
//! used for sync-engine rebases (`diffy`-based), re-targeted at this
//! system's flat `path -> blob` tree representation instead of a working
//! directory.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::errors::{CommitError, FilterError, GitError};
use crate::filters::{FilterEngine, NoLfsObjects};
use crate::models::{NodeKind, Revision};
use crate::props::PropertySynthesizer;
use crate::repo::Repository;

/// Property names this system derives from `.gitattributes`/`.gitignore`
/// rather than storing directly. A client setting one of these must set it
/// to exactly the value that will be synthesized after its own edit (e.g.
/// it also edited `.gitattributes` to match), or the commit is rejected.
/// Any other property name has no storage at all in this bridge and is
/// always rejected.
const SYNTHESIZED_PROP_NAMES: &[&str] = &[
    "svn:eol-style",
    "svn:mime-type",
    "svn:ignore",
    "svn:inheritable-ignores",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriveState {
    Open,
    Closed,
    Aborted,
}

struct Entry {
    path: String,
    kind: NodeKind,
    is_new: bool,
    copy_from: Option<(String, Revision)>,
    base_rev: Option<Revision>,
    prop_changes: Vec<(String, Option<Vec<u8>>)>,
    base_checksum: Option<String>,
    in_delta: bool,
    delta_chunks: Vec<u8>,
    pending_base: Option<Vec<u8>>,
    final_bytes: Option<Vec<u8>>,
}

impl Entry {
    fn new(path: String, kind: NodeKind, is_new: bool, copy_from: Option<(String, Revision)>) -> Self {
        Self {
            path,
            kind,
            is_new,
            copy_from,
            base_rev: None,
            prop_changes: Vec::new(),
            base_checksum: None,
            in_delta: false,
            delta_chunks: Vec::new(),
            pending_base: None,
            final_bytes: None,
        }
    }
}

/// The outcome of a successfully finalized commit.
#[derive(Debug, Clone)]
pub struct CommitResult {
    pub revision: Revision,
    pub commit_sha: String,
}

/// Drives one commit's editor session against a [`Repository`]. Not `Sync`:
/// a session owns exactly one in-flight `CommitBuilder` at a time.
pub struct CommitBuilder {
    repo: Arc<Repository>,
    base_rev: Revision,
    base_commit_sha: Option<String>,
    base_tree: BTreeMap<String, (String, bool)>,
    tree: BTreeMap<String, (String, bool)>,
    author_name: String,
    author_email: String,
    message: String,
    lock_tokens: HashMap<String, String>,
    entries: HashMap<String, Entry>,
    touched_paths: Vec<String>,
    /// Files closed during this drive, keyed by tree path, awaiting the
    /// final re-encode pass in [`CommitBuilder::finalize`]: `(rawBytes,
    /// executable)`. Deferred because the filter chain a path picks up
    /// depends on `.gitattributes` as it reads at the *final* tree for
    /// this commit, which a sibling edit later in the same drive can still
    /// change (see boundary scenarios 4/5 in the spec).
    pending_encode: HashMap<String, (Vec<u8>, bool)>,
    max_retries: u32,
    state: DriveState,
}

impl CommitBuilder {
    #[instrument(skip(repo, message, lock_tokens))]
    pub fn new(
        repo: Arc<Repository>,
        base_rev: Revision,
        author_name: String,
        author_email: String,
        message: String,
        lock_tokens: HashMap<String, String>,
        max_retries: u32,
    ) -> Result<Self, CommitError> {
        let meta = repo.revindex().lookup_by_rev(base_rev)?;
        let base_tree = match &meta.commit_sha {
            Some(sha) => {
                let tree_sha = repo.git().commit_info(sha)?.tree_sha;
                repo.git().flatten_tree(&tree_sha)?
            }
            None => BTreeMap::new(),
        };

        Ok(Self {
            repo,
            base_rev,
            base_commit_sha: meta.commit_sha,
            tree: base_tree.clone(),
            base_tree,
            author_name,
            author_email,
            message,
            lock_tokens,
            entries: HashMap::new(),
            touched_paths: Vec::new(),
            pending_encode: HashMap::new(),
            max_retries,
            state: DriveState::Open,
        })
    }

    fn ensure_open(&self) -> Result<(), CommitError> {
        if self.state != DriveState::Open {
            return Err(CommitError::IllegalEditorState("editor command", "closed"));
        }
        Ok(())
    }

    fn entry_mut(&mut self, token: &str) -> Result<&mut Entry, CommitError> {
        self.entries
            .get_mut(token)
            .ok_or(CommitError::IllegalEditorState("command", "unknown token"))
    }

    fn entry(&self, token: &str) -> Result<&Entry, CommitError> {
        self.entries
            .get(token)
            .ok_or(CommitError::IllegalEditorState("command", "unknown token"))
    }

    fn parent_path(&self, parent_token: &str) -> Result<String, CommitError> {
        Ok(self.entry(parent_token)?.path.clone())
    }

    fn check_lock(&self, path: &str) -> Result<(), CommitError> {
        self.repo
            .check_lock_token(path, self.lock_tokens.get(path).map(|s| s.as_str()))
    }

    // -- directory structure --------------------------------------------

    pub fn open_root(&mut self, token: &str) -> Result<(), CommitError> {
        self.ensure_open()?;
        self.entries
            .insert(token.to_string(), Entry::new("/".to_string(), NodeKind::Dir, false, None));
        Ok(())
    }

    /// `delete-entry`: removes a file, or a directory and everything under
    /// it, from the working tree.
    pub fn delete_entry(&mut self, parent_token: &str, name: &str) -> Result<(), CommitError> {
        self.ensure_open()?;
        let path = join_path(&self.parent_path(parent_token)?, name);
        let key = tree_key(&path);
        let prefix = format!("{key}/");
        let affected: Vec<String> = self
            .tree
            .keys()
            .filter(|p| **p == key || p.starts_with(&prefix))
            .cloned()
            .collect();
        for p in &affected {
            self.check_lock(&format!("/{p}"))?;
        }
        for p in &affected {
            self.tree.remove(p);
        }
        self.touched_paths.push(path);
        Ok(())
    }

    pub fn add_dir(
        &mut self,
        parent_token: &str,
        name: &str,
        token: &str,
        copy_from: Option<(String, Revision)>,
    ) -> Result<(), CommitError> {
        self.ensure_open()?;
        let path = join_path(&self.parent_path(parent_token)?, name);
        if let Some((from_path, from_rev)) = &copy_from {
            let subtree = self.snapshot_subtree(*from_rev, from_path)?;
            let base = tree_key(&path);
            for (rel, value) in subtree {
                self.tree.insert(format!("{base}/{rel}"), value);
            }
        }
        self.touched_paths.push(path.clone());
        self.entries
            .insert(token.to_string(), Entry::new(path, NodeKind::Dir, true, copy_from));
        Ok(())
    }

    pub fn open_dir(&mut self, parent_token: &str, name: &str, token: &str) -> Result<(), CommitError> {
        self.ensure_open()?;
        let path = join_path(&self.parent_path(parent_token)?, name);
        self.entries
            .insert(token.to_string(), Entry::new(path, NodeKind::Dir, false, None));
        Ok(())
    }

    pub fn change_dir_prop(&mut self, token: &str, name: &str, value: Option<Vec<u8>>) -> Result<(), CommitError> {
        self.ensure_open()?;
        self.entry_mut(token)?.prop_changes.push((name.to_string(), value));
        Ok(())
    }

    pub fn close_dir(&mut self, token: &str) -> Result<(), CommitError> {
        self.ensure_open()?;
        self.entry(token)?;
        Ok(())
    }

    // -- files ------------------------------------------------------------

    pub fn add_file(
        &mut self,
        parent_token: &str,
        name: &str,
        token: &str,
        copy_from: Option<(String, Revision)>,
    ) -> Result<(), CommitError> {
        self.ensure_open()?;
        let path = join_path(&self.parent_path(parent_token)?, name);
        if let Some((from_path, from_rev)) = &copy_from {
            if let Some(blob) = self.snapshot_blob(*from_rev, from_path)? {
                self.tree.insert(tree_key(&path), blob);
            }
        }
        self.touched_paths.push(path.clone());
        self.entries
            .insert(token.to_string(), Entry::new(path, NodeKind::File, true, copy_from));
        Ok(())
    }

    pub fn open_file(&mut self, parent_token: &str, name: &str, token: &str, base_rev: Revision) -> Result<(), CommitError> {
        self.ensure_open()?;
        let path = join_path(&self.parent_path(parent_token)?, name);
        let mut entry = Entry::new(path, NodeKind::File, false, None);
        entry.base_rev = Some(base_rev);
        self.entries.insert(token.to_string(), entry);
        Ok(())
    }

    pub fn apply_text_delta(&mut self, token: &str, base_checksum: Option<String>) -> Result<(), CommitError> {
        self.ensure_open()?;
        let base = self.resolve_base_content(token)?;
        let entry = self.entry_mut(token)?;
        if let Some(expected) = &base_checksum {
            let actual = format!("{:x}", md5::compute(&base));
            if &actual != expected {
                return Err(CommitError::BaseChecksumMismatch {
                    path: entry.path.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        entry.base_checksum = base_checksum;
        entry.in_delta = true;
        entry.delta_chunks.clear();
        entry.pending_base = Some(base);
        Ok(())
    }

    pub fn text_delta_chunk(&mut self, token: &str, chunk: &[u8]) -> Result<(), CommitError> {
        self.ensure_open()?;
        let entry = self.entry_mut(token)?;
        if !entry.in_delta {
            return Err(CommitError::IllegalEditorState("textdelta-chunk", "no applyTextDelta in progress"));
        }
        entry.delta_chunks.extend_from_slice(chunk);
        Ok(())
    }

    pub fn text_delta_end(&mut self, token: &str) -> Result<(), CommitError> {
        self.ensure_open()?;
        let entry = self.entry_mut(token)?;
        let base = entry.pending_base.take().unwrap_or_default();
        let decoded = crate::delta::decode(&base, &entry.delta_chunks).map_err(FilterError::from)?;
        entry.final_bytes = Some(decoded);
        entry.in_delta = false;
        entry.delta_chunks.clear();
        Ok(())
    }

    pub fn change_file_prop(&mut self, token: &str, name: &str, value: Option<Vec<u8>>) -> Result<(), CommitError> {
        self.ensure_open()?;
        self.entry_mut(token)?.prop_changes.push((name.to_string(), value));
        Ok(())
    }

    pub fn close_file(&mut self, token: &str, text_checksum: Option<String>) -> Result<(), CommitError> {
        self.ensure_open()?;
        self.check_lock(&self.entry(token)?.path.clone())?;

        let final_bytes = match self.entry(token)?.final_bytes.clone() {
            Some(b) => b,
            None => self.resolve_unchanged_content(token)?,
        };
        if let Some(expected) = &text_checksum {
            let actual = format!("{:x}", md5::compute(&final_bytes));
            if &actual != expected {
                return Err(CommitError::ResultChecksumMismatch {
                    path: self.entry(token)?.path.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let executable = self
            .entry(token)?
            .prop_changes
            .iter()
            .rev()
            .find(|(n, _)| n == "svn:executable")
            .map(|(_, v)| v.is_some())
            .unwrap_or(false);

        // The filter chain a path picks up depends on `.gitattributes` as
        // it reads once the whole drive has closed -- a sibling edit later
        // in the same drive (or this same commit touching `.gitattributes`
        // itself) can still change it. Stash a provisional identity blob so
        // directory structure and `.gitattributes`/`.gitignore` content are
        // already in `self.tree` for anyone reading them, and defer the
        // real filter encoding to `finalize`'s re-encode pass.
        let path = self.entry(token)?.path.clone();
        let provisional_oid = self.repo.git().write_blob(&final_bytes)?;
        self.tree.insert(tree_key(&path), (provisional_oid, executable));
        self.pending_encode
            .insert(tree_key(&path), (final_bytes, executable));
        Ok(())
    }

    pub fn abort_edit(&mut self) -> Result<(), CommitError> {
        self.state = DriveState::Aborted;
        Ok(())
    }

    /// `close-edit`: validates every property change against what this
    /// system actually persists, then assembles and lands the commit.
    pub fn close_edit(mut self) -> Result<CommitResult, CommitError> {
        self.ensure_open()?;
        self.state = DriveState::Closed;
        self.validate_properties()?;
        self.finalize()
    }

    // -- property reconciliation -------------------------------------------

    fn validate_properties(&self) -> Result<(), CommitError> {
        let tree_sha = self.repo.git().write_tree(&self.tree)?;
        let synth = PropertySynthesizer::new(self.repo.git());
        for entry in self.entries.values() {
            if entry.prop_changes.is_empty() {
                continue;
            }
            let synthesized = synth.synthesize(&tree_sha, &entry.path, entry.kind)?;
            for (name, value) in &entry.prop_changes {
                if SYNTHESIZED_PROP_NAMES.contains(&name.as_str()) {
                    let expected = synthesized.properties.get(name);
                    if value.as_deref() != expected {
                        return Err(CommitError::PropertyConflict {
                            path: entry.path.clone(),
                            detail: format!(
                                "'{name}' is derived from .gitattributes/.gitignore and cannot be set directly to a conflicting value"
                            ),
                        });
                    }
                } else if name != "svn:executable" && value.is_some() {
                    return Err(CommitError::PropertyConflict {
                        path: entry.path.clone(),
                        detail: format!("property '{name}' has no backing store in this bridge"),
                    });
                }
            }
        }
        Ok(())
    }

    // -- content resolution -------------------------------------------------

    fn resolve_base_content(&self, token: &str) -> Result<Vec<u8>, CommitError> {
        let entry = self.entry(token)?;
        if let Some((from_path, from_rev)) = &entry.copy_from {
            Ok(self.repo.fs().read(*from_rev, from_path)?)
        } else if !entry.is_new {
            let rev = entry.base_rev.unwrap_or(self.base_rev);
            Ok(self.repo.fs().read(rev, &entry.path)?)
        } else {
            Ok(Vec::new())
        }
    }

    fn resolve_unchanged_content(&self, token: &str) -> Result<Vec<u8>, CommitError> {
        let entry = self.entry(token)?;
        if let Some((from_path, from_rev)) = &entry.copy_from {
            Ok(self.repo.fs().read(*from_rev, from_path)?)
        } else if !entry.is_new {
            let rev = entry.base_rev.unwrap_or(self.base_rev);
            Ok(self.repo.fs().read(rev, &entry.path)?)
        } else {
            Ok(Vec::new())
        }
    }

    fn snapshot_subtree(&self, rev: Revision, path: &str) -> Result<BTreeMap<String, (String, bool)>, CommitError> {
        let git = self.repo.git();
        let meta = self.repo.revindex().lookup_by_rev(rev)?;
        let Some(commit_sha) = meta.commit_sha else {
            return Ok(BTreeMap::new());
        };
        let tree_sha = git.commit_info(&commit_sha)?.tree_sha;
        let trimmed = path.trim_start_matches('/');
        let Some((oid, is_dir, _)) = git.resolve_path(&tree_sha, trimmed)? else {
            return Ok(BTreeMap::new());
        };
        if !is_dir {
            return Ok(BTreeMap::new());
        }
        Ok(git.flatten_tree(&oid)?)
    }

    fn snapshot_blob(&self, rev: Revision, path: &str) -> Result<Option<(String, bool)>, CommitError> {
        let git = self.repo.git();
        let meta = self.repo.revindex().lookup_by_rev(rev)?;
        let Some(commit_sha) = meta.commit_sha else {
            return Ok(None);
        };
        let tree_sha = git.commit_info(&commit_sha)?.tree_sha;
        let trimmed = path.trim_start_matches('/');
        let Some((oid, is_dir, mode)) = git.resolve_path(&tree_sha, trimmed)? else {
            return Ok(None);
        };
        if is_dir {
            return Ok(None);
        }
        Ok(Some((oid, mode == 0o100755)))
    }

    // -- filter re-encoding ---------------------------------------------------

    /// Re-encodes every closed file's content against the filter chain it
    /// resolves to once the whole drive's tree is known. Deferred out of
    /// `close_file` because that chain depends on `.gitattributes` content
    /// that a sibling edit later in the *same* drive (or this same commit
    /// touching `.gitattributes` itself) can still change -- the result
    /// must not depend on the order the editor happened to close paths in
    /// (spec boundary scenarios 4/5). Stored git blobs for files this drive
    /// never touched are never rewritten: a `.gitattributes` edit changes
    /// how such a file's *existing* bytes are interpreted on the next read,
    /// not the bytes themselves (scenario 1/2) -- that side effect is the
    /// revision index's job when it records changed-paths, not this one's.
    fn reencode_for_final_state(&mut self) -> Result<(), CommitError> {
        let git = self.repo.git();
        let synth = PropertySynthesizer::new(git);
        let engine = FilterEngine::new(&NoLfsObjects);

        // `self.tree` already carries the final directory structure and
        // final `.gitattributes`/`.gitignore` content (attribute files are
        // read directly off the blob, never through a filter chain), so a
        // single tree_sha serves as the synthesis target for every path
        // below, regardless of the order its entry closed in.
        let final_tree_sha = git.write_tree(&self.tree)?;

        for (key, (raw, executable)) in std::mem::take(&mut self.pending_encode) {
            let path = format!("/{key}");
            let synthesized = synth.synthesize(&final_tree_sha, &path, NodeKind::File)?;
            let stored = engine.encode(&synthesized.filter_chain, &raw)?;
            let blob_oid = git.write_blob(&stored)?;
            self.tree.insert(key, (blob_oid, executable));
        }

        Ok(())
    }

    // -- landing the commit --------------------------------------------------

    #[instrument(skip(self))]
    fn finalize(mut self) -> Result<CommitResult, CommitError> {
        self.reencode_for_final_state()?;
        let git = self.repo.git();
        let tracked_ref = self.repo.revindex().tracked_ref().to_string();
        let mut attempt_tree = self.tree;
        let mut parent_sha = self.base_commit_sha;
        let mut retries_left = self.max_retries;

        loop {
            let tree_sha = git.write_tree(&attempt_tree)?;
            let commit_sha = git.write_commit(
                &tree_sha,
                parent_sha.as_deref(),
                &self.author_name,
                &self.author_email,
                &self.message,
            )?;

            match git.compare_and_swap_ref(&tracked_ref, parent_sha.as_deref(), &commit_sha) {
                Ok(()) => {
                    self.repo.refresh()?;
                    let revision = self.repo.revindex().lookup_by_commit(&commit_sha)?;
                    info!(revision, sha = %commit_sha, "commit landed");
                    return Ok(CommitResult { revision, commit_sha });
                }
                Err(GitError::RefChanged { found, .. }) => {
                    if retries_left == 0 {
                        warn!(paths = ?self.touched_paths, "exhausted rebase retries");
                        return Err(CommitError::OutOfDate(self.touched_paths.clone()));
                    }
                    retries_left -= 1;
                    let _ = self.repo.refresh();

                    let new_tip_tree_sha = git.commit_info(&found)?.tree_sha;
                    let new_tip_tree = git.flatten_tree(&new_tip_tree_sha)?;

                    let mut conflicts = Vec::new();
                    let mut rebased = new_tip_tree.clone();
                    for path in &self.touched_paths {
                        rebase_one_path(
                            git,
                            path,
                            &self.base_tree,
                            &attempt_tree,
                            &new_tip_tree,
                            &mut rebased,
                            &mut conflicts,
                        )?;
                    }

                    if !conflicts.is_empty() {
                        return Err(CommitError::OutOfDate(conflicts));
                    }

                    attempt_tree = rebased;
                    parent_sha = Some(found);
                    continue;
                }
                Err(other) => return Err(CommitError::from(other)),
            }
        }
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Normalizes an SVN path (leading-slash, e.g. `/trunk/a.txt`) to the flat
/// tree's key convention (no leading slash, matching [`GitStore::flatten_tree`]
/// and [`GitStore::write_tree`]'s own `trim_start_matches('/')`), so `self.tree`
/// and `base_tree` always agree on how a given file is keyed.
fn tree_key(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

type FlatTree = BTreeMap<String, (String, bool)>;

/// Rebase a single touched path from our attempted tree onto the new tip's
/// tree: carry our edit forward untouched if no one else changed that path,
/// accept no-op if the concurrent writer made the identical change, attempt
/// a textual three-way merge if both sides changed it differently, and flag
/// an unresolved conflict (collected, not raised immediately, so the caller
/// can report every conflicting path at once) otherwise.
fn rebase_one_path(
    git: &crate::git::GitStore,
    path: &str,
    base_tree: &FlatTree,
    ours_tree: &FlatTree,
    theirs_tree: &FlatTree,
    rebased: &mut FlatTree,
    conflicts: &mut Vec<String>,
) -> Result<(), GitError> {
    let key = tree_key(path);
    let base = base_tree.get(&key).cloned();
    let ours = ours_tree.get(&key).cloned();
    let theirs = theirs_tree.get(&key).cloned();

    if theirs == base {
        match ours {
            Some(v) => {
                rebased.insert(key, v);
            }
            None => {
                rebased.remove(&key);
            }
        }
        return Ok(());
    }
    if theirs == ours {
        return Ok(());
    }

    match (&base, &ours, &theirs) {
        (Some((base_oid, _)), Some((ours_oid, ours_exec)), Some((theirs_oid, _))) => {
            let base_bytes = git.read_blob(base_oid)?;
            let ours_bytes = git.read_blob(ours_oid)?;
            let theirs_bytes = git.read_blob(theirs_oid)?;
            match three_way_merge(&base_bytes, &ours_bytes, &theirs_bytes) {
                Some(merged) => {
                    let blob = git.write_blob(&merged)?;
                    rebased.insert(key, (blob, *ours_exec));
                }
                None => conflicts.push(path.to_string()),
            }
        }
        _ => conflicts.push(path.to_string()),
    }
    Ok(())
}

fn three_way_merge(base: &[u8], ours: &[u8], theirs: &[u8]) -> Option<Vec<u8>> {
    let base_s = std::str::from_utf8(base).ok()?;
    let ours_s = std::str::from_utf8(ours).ok()?;
    let theirs_s = std::str::from_utf8(theirs).ok()?;
    diffy::merge(base_s, ours_s, theirs_s).ok().map(String::into_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, AuthMode, DaemonConfig, IdentityConfig, RepositoryConfig};
    use crate::config::AppConfig;
    use std::collections::BTreeMap as StdBTreeMap;

    fn init_repo(repo_dir: &std::path::Path) {
        git2::Repository::init(repo_dir).unwrap();
        let git = crate::git::GitStore::open(repo_dir).unwrap();
        let blob = git.write_blob(b"hello\n").unwrap();
        let mut files = StdBTreeMap::new();
        files.insert("trunk/a.txt".to_string(), (blob, false));
        let tree = git.write_tree(&files).unwrap();
        let commit = git
            .write_commit(&tree, None, "Alice", "alice@example.com", "init")
            .unwrap();
        git.compare_and_swap_ref("refs/heads/master", None, &commit)
            .unwrap();
    }

    fn open_repository() -> (tempfile::TempDir, tempfile::TempDir, Arc<Repository>) {
        let repo_dir = tempfile::tempdir().unwrap();
        let data_dir = tempfile::tempdir().unwrap();
        init_repo(repo_dir.path());

        let cfg = RepositoryConfig {
            name: "demo".to_string(),
            git_path: repo_dir.path().to_path_buf(),
            tracked_ref: "refs/heads/master".to_string(),
            uuid: None,
            properties_override_file: None,
        };
        let repo = Repository::open(&cfg, data_dir.path()).unwrap();
        (repo_dir, data_dir, Arc::new(repo))
    }

    #[allow(dead_code)]
    fn app_config_unused() -> AppConfig {
        AppConfig {
            daemon: DaemonConfig::default(),
            repositories: Vec::new(),
            auth: AuthConfig::default(),
            identity: IdentityConfig::default(),
            resolved_secrets: StdBTreeMap::new().into_iter().collect(),
        }
    }

    #[test]
    fn test_add_file_commits_new_revision() {
        let (_rd, _dd, repo) = open_repository();
        let mut builder = CommitBuilder::new(
            repo.clone(),
            1,
            "bob".to_string(),
            "bob@example.com".to_string(),
            "add file".to_string(),
            HashMap::new(),
            3,
        )
        .unwrap();

        builder.open_root("root").unwrap();
        builder.add_file("root", "new.txt", "f1", None).unwrap();
        builder.apply_text_delta("f1", None).unwrap();
        let delta = crate::delta::encode(b"", b"new content\n");
        builder.text_delta_chunk("f1", &delta).unwrap();
        builder.text_delta_end("f1").unwrap();
        builder.close_file("f1", None).unwrap();
        builder.close_dir("root").unwrap();

        let result = builder.close_edit().unwrap();
        assert_eq!(result.revision, 2);
        assert_eq!(repo.fs().read(2, "/new.txt").unwrap(), b"new content\n");
        // Untouched file from base revision still reads correctly.
        assert_eq!(repo.fs().read(2, "/trunk/a.txt").unwrap(), b"hello\n");
    }

    #[test]
    fn test_delete_entry_removes_path() {
        let (_rd, _dd, repo) = open_repository();
        let mut builder = CommitBuilder::new(
            repo.clone(),
            1,
            "bob".to_string(),
            "bob@example.com".to_string(),
            "delete file".to_string(),
            HashMap::new(),
            3,
        )
        .unwrap();
        builder.open_root("root").unwrap();
        builder.open_dir("root", "trunk", "d1").unwrap();
        builder.delete_entry("d1", "a.txt").unwrap();
        builder.close_dir("d1").unwrap();
        builder.close_dir("root").unwrap();

        let result = builder.close_edit().unwrap();
        assert!(repo.fs().stat(result.revision, "/trunk/a.txt").unwrap().is_none());
    }

    #[test]
    fn test_open_file_modifies_existing_content_in_place() {
        let (_rd, _dd, repo) = open_repository();
        let mut builder = CommitBuilder::new(
            repo.clone(),
            1,
            "bob".to_string(),
            "bob@example.com".to_string(),
            "edit existing file".to_string(),
            HashMap::new(),
            3,
        )
        .unwrap();
        builder.open_root("root").unwrap();
        builder.open_dir("root", "trunk", "d1").unwrap();
        builder.open_file("d1", "a.txt", "f1", 1).unwrap();
        builder.apply_text_delta("f1", None).unwrap();
        let delta = crate::delta::encode(b"hello\n", b"changed\n");
        builder.text_delta_chunk("f1", &delta).unwrap();
        builder.text_delta_end("f1").unwrap();
        builder.close_file("f1", None).unwrap();
        builder.close_dir("d1").unwrap();
        builder.close_dir("root").unwrap();

        let result = builder.close_edit().unwrap();
        // Must read back the new content, not the stale base-tree blob that
        // close_file's edit would otherwise be shadowed by if the editor's
        // leading-slash path and the flattened base tree's key disagreed.
        assert_eq!(repo.fs().read(result.revision, "/trunk/a.txt").unwrap(), b"changed\n");
    }

    #[test]
    fn test_locked_path_without_token_is_denied() {
        let (_rd, _dd, repo) = open_repository();
        repo.lock("/trunk/a.txt", "alice", None, false).unwrap();

        let mut builder = CommitBuilder::new(
            repo.clone(),
            1,
            "bob".to_string(),
            "bob@example.com".to_string(),
            "edit locked file".to_string(),
            HashMap::new(),
            3,
        )
        .unwrap();
        builder.open_root("root").unwrap();
        builder.open_dir("root", "trunk", "d1").unwrap();
        builder.open_file("d1", "a.txt", "f1", 1).unwrap();
        builder.apply_text_delta("f1", None).unwrap();
        let delta = crate::delta::encode(b"hello\n", b"changed\n");
        builder.text_delta_chunk("f1", &delta).unwrap();
        builder.text_delta_end("f1").unwrap();
        let result = builder.close_file("f1", None);
        assert!(matches!(result, Err(CommitError::LockDenied(_))));
    }

    #[test]
    fn test_direct_custom_property_rejected() {
        let (_rd, _dd, repo) = open_repository();
        let mut builder = CommitBuilder::new(
            repo.clone(),
            1,
            "bob".to_string(),
            "bob@example.com".to_string(),
            "set custom prop".to_string(),
            HashMap::new(),
            3,
        )
        .unwrap();
        builder.open_root("root").unwrap();
        builder.open_dir("root", "trunk", "d1").unwrap();
        builder.open_file("d1", "a.txt", "f1", 1).unwrap();
        builder
            .change_file_prop("f1", "myapp:status", Some(b"reviewed".to_vec()))
            .unwrap();
        builder.close_file("f1", None).unwrap();
        builder.close_dir("d1").unwrap();
        builder.close_dir("root").unwrap();

        let result = builder.close_edit();
        assert!(matches!(result, Err(CommitError::PropertyConflict { .. })));
    }

    fn gzip(raw: &[u8]) -> Vec<u8> {
        let engine = FilterEngine::new(&NoLfsObjects);
        let chain = crate::filters::FilterChain::from_names(vec!["gzip".to_string()]);
        engine.encode(&chain, raw).unwrap()
    }

    fn commit_one_file(
        repo: &Arc<Repository>,
        base_rev: Revision,
        path: &str,
        content: &[u8],
        message: &str,
    ) -> CommitResult {
        let mut b = CommitBuilder::new(
            repo.clone(),
            base_rev,
            "bob".to_string(),
            "bob@example.com".to_string(),
            message.to_string(),
            HashMap::new(),
            3,
        )
        .unwrap();
        b.open_root("root").unwrap();
        b.add_file("root", path.trim_start_matches('/'), "f1", None).unwrap();
        b.apply_text_delta("f1", None).unwrap();
        let delta = crate::delta::encode(b"", content);
        b.text_delta_chunk("f1", &delta).unwrap();
        b.text_delta_end("f1").unwrap();
        b.close_file("f1", None).unwrap();
        b.close_dir("root").unwrap();
        b.close_edit().unwrap()
    }

    /// Boundary scenario 1/2: files stored pre-gzipped before any filter is
    /// declared read back as the raw compressed bytes (no filter in
    /// effect). Introducing `/.gitattributes` with `*.z filter=gzip` makes
    /// `/data.z` decompress on read without its own content being touched
    /// by the edit, and that revision's log reports both `/.gitattributes`
    /// and `/data.z` as changed -- the blob for `/data.z` genuinely changes
    /// in git even though the client never opened it.
    #[test]
    fn test_filter_declaration_toggles_existing_file_on_read() {
        let (_rd, _dd, repo) = open_repository();
        let gzipped = gzip(b"CONTENT_FOO");

        let mut b = CommitBuilder::new(
            repo.clone(),
            1,
            "bob".to_string(),
            "bob@example.com".to_string(),
            "add pre-gzipped files".to_string(),
            HashMap::new(),
            3,
        )
        .unwrap();
        b.open_root("root").unwrap();
        b.add_file("root", "data.z", "f1", None).unwrap();
        b.apply_text_delta("f1", None).unwrap();
        let d1 = crate::delta::encode(b"", &gzipped);
        b.text_delta_chunk("f1", &d1).unwrap();
        b.text_delta_end("f1").unwrap();
        b.close_file("f1", None).unwrap();
        b.add_file("root", "data.x", "f2", None).unwrap();
        b.apply_text_delta("f2", None).unwrap();
        let d2 = crate::delta::encode(b"", &gzipped);
        b.text_delta_chunk("f2", &d2).unwrap();
        b.text_delta_end("f2").unwrap();
        b.close_file("f2", None).unwrap();
        b.close_dir("root").unwrap();
        let r2 = b.close_edit().unwrap().revision;

        assert_eq!(repo.fs().read(r2, "/data.z").unwrap(), gzipped);
        assert_eq!(repo.fs().read(r2, "/data.x").unwrap(), gzipped);

        let r3 = commit_one_file(&repo, r2, "/.gitattributes", b"*.z filter=gzip\n", "declare gzip filter")
            .revision;

        assert_eq!(repo.fs().read(r3, "/data.z").unwrap(), b"CONTENT_FOO");
        assert_eq!(repo.fs().read(r3, "/data.x").unwrap(), gzipped);

        let entries = repo.fs().log(&[], r3, r3, 0).unwrap();
        assert_eq!(entries.len(), 1);
        let changed: Vec<&str> = entries[0]
            .changed_paths
            .iter()
            .map(|cp| cp.path.as_str())
            .collect();
        assert!(changed.contains(&"/.gitattributes"));
        assert!(changed.contains(&"/data.z"));
        assert_eq!(changed.len(), 2);

        // Re-pointing the filter at `*.x` instead flips both files back.
        let r4 = commit_one_file(&repo, r3, "/.gitattributes", b"*.x filter=gzip\n", "repoint filter").revision;
        assert_eq!(repo.fs().read(r4, "/data.z").unwrap(), gzipped);
        assert_eq!(repo.fs().read(r4, "/data.x").unwrap(), b"CONTENT_FOO");
    }

    /// Boundary scenario 3: writing raw bytes through an already-declared
    /// filter stores the encoded form and reads back the original bytes.
    #[test]
    fn test_write_through_filter_round_trips() {
        let (_rd, _dd, repo) = open_repository();
        let r2 = commit_one_file(&repo, 1, "/.gitattributes", b"/*.z filter=gzip\n", "declare filter").revision;
        let r3 = commit_one_file(&repo, r2, "/data.z", b"CONTENT_FOO", "add filtered file").revision;

        assert_eq!(repo.fs().read(r3, "/data.z").unwrap(), b"CONTENT_FOO");
        let node = repo.fs().stat(r3, "/data.z").unwrap().unwrap();
        let blob_id = match node {
            crate::models::Node::File { blob_id, .. } => blob_id,
            _ => panic!("expected file"),
        };
        assert_eq!(repo.git().read_blob(&blob_id).unwrap(), gzip(b"CONTENT_FOO"));
    }

    /// Boundary scenario 4/5: whether a commit adds the data file before or
    /// after the `.gitattributes` that filters it, the result is identical
    /// -- the filter chain is resolved against the commit's final tree, not
    /// the order operations happened to close in.
    #[test]
    fn test_mixed_order_commit_filter_toggle_is_order_independent() {
        for file_first in [true, false] {
            let (_rd, _dd, repo) = open_repository();
            let mut b = CommitBuilder::new(
                repo.clone(),
                1,
                "bob".to_string(),
                "bob@example.com".to_string(),
                "add file and attributes together".to_string(),
                HashMap::new(),
                3,
            )
            .unwrap();
            b.open_root("root").unwrap();

            let add_data = |b: &mut CommitBuilder| {
                b.add_file("root", "data.z", "data", None).unwrap();
                b.apply_text_delta("data", None).unwrap();
                let d = crate::delta::encode(b"", b"CONTENT_FOO");
                b.text_delta_chunk("data", &d).unwrap();
                b.text_delta_end("data").unwrap();
                b.close_file("data", None).unwrap();
            };
            let add_attrs = |b: &mut CommitBuilder| {
                b.add_file("root", ".gitattributes", "attrs", None).unwrap();
                b.apply_text_delta("attrs", None).unwrap();
                let d = crate::delta::encode(b"", b"*.z filter=gzip\n");
                b.text_delta_chunk("attrs", &d).unwrap();
                b.text_delta_end("attrs").unwrap();
                b.close_file("attrs", None).unwrap();
            };

            if file_first {
                add_data(&mut b);
                add_attrs(&mut b);
            } else {
                add_attrs(&mut b);
                add_data(&mut b);
            }
            b.close_dir("root").unwrap();
            let result = b.close_edit().unwrap();

            assert_eq!(
                repo.fs().read(result.revision, "/data.z").unwrap(),
                b"CONTENT_FOO",
                "file_first={file_first}"
            );
            let node = repo.fs().stat(result.revision, "/data.z").unwrap().unwrap();
            let blob_id = match node {
                crate::models::Node::File { blob_id, .. } => blob_id,
                _ => panic!("expected file"),
            };
            assert_eq!(
                repo.git().read_blob(&blob_id).unwrap(),
                gzip(b"CONTENT_FOO"),
                "file_first={file_first}"
            );
        }
    }

    /// Boundary scenario 6: copying an unfiltered file onto a filtered
    /// path re-encodes it through the destination's filter chain, and a
    /// variant that applies a delta on top of the copy produces the
    /// delta's result instead.
    #[test]
    fn test_copy_into_filtered_path_reencodes() {
        let (_rd, _dd, repo) = open_repository();
        let r2 = commit_one_file(&repo, 1, "/.gitattributes", b"*.z filter=gzip\n", "declare filter").revision;
        let r3 = commit_one_file(&repo, r2, "/data.txt", b"CONTENT_FOO", "add unfiltered source").revision;

        let mut b = CommitBuilder::new(
            repo.clone(),
            r3,
            "bob".to_string(),
            "bob@example.com".to_string(),
            "copy into filtered path".to_string(),
            HashMap::new(),
            3,
        )
        .unwrap();
        b.open_root("root").unwrap();
        b.add_file("root", "data.z", "f1", Some(("/data.txt".to_string(), r3)))
            .unwrap();
        b.close_file("f1", None).unwrap();
        b.close_dir("root").unwrap();
        let result = b.close_edit().unwrap();

        assert_eq!(repo.fs().read(result.revision, "/data.z").unwrap(), b"CONTENT_FOO");
        let node = repo.fs().stat(result.revision, "/data.z").unwrap().unwrap();
        let blob_id = match node {
            crate::models::Node::File { blob_id, .. } => blob_id,
            _ => panic!("expected file"),
        };
        assert_eq!(repo.git().read_blob(&blob_id).unwrap(), gzip(b"CONTENT_FOO"));

        // Variant: copy with a delta applied on top lands the delta's result.
        let mut b = CommitBuilder::new(
            repo.clone(),
            result.revision,
            "bob".to_string(),
            "bob@example.com".to_string(),
            "copy with delta".to_string(),
            HashMap::new(),
            3,
        )
        .unwrap();
        b.open_root("root").unwrap();
        b.add_file("root", "data2.z", "f2", Some(("/data.txt".to_string(), r3)))
            .unwrap();
        b.apply_text_delta("f2", None).unwrap();
        let d = crate::delta::encode(b"CONTENT_FOO", b"CONTENT_BAR");
        b.text_delta_chunk("f2", &d).unwrap();
        b.text_delta_end("f2").unwrap();
        b.close_file("f2", None).unwrap();
        b.close_dir("root").unwrap();
        let result2 = b.close_edit().unwrap();
        assert_eq!(repo.fs().read(result2.revision, "/data2.z").unwrap(), b"CONTENT_BAR");
    }
}
