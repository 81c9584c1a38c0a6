//! Local Git object store access via `git2`.
//!
//! This is the "Git object store collaborator" from the external interfaces:
//! content-addressed blob/tree/commit read and write, ref read, and a
//! compare-and-swap ref update. Unlike the teacher's `GitClient`, there is no
//! working tree, no remote, and no index: everything goes straight through
//! the object database.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use git2::{FileMode, ObjectType, Oid, Repository, Signature};
use tracing::{debug, info, instrument, warn};

use crate::errors::GitError;
use crate::models::ChangeAction;

/// Notes ref holding best-effort `svn:mergeinfo` content per commit, since
/// Git has no native mergeinfo concept to carry it in.
const MERGEINFO_NOTES_REF: &str = "refs/notes/svnbridge-mergeinfo";

/// Wraps a `git2::Repository` as the content-addressed object store
/// collaborator.
pub struct GitStore {
    repo: Repository,
    repo_path: PathBuf,
}

/// A single commit's metadata, as read from the object store.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub sha: String,
    pub tree_sha: String,
    pub parent_sha: Option<String>,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub date: DateTime<Utc>,
}

/// One entry in a resolved tree listing.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub name: String,
    pub oid: String,
    pub is_dir: bool,
    pub mode: u32,
}

/// A single changed path detected between a commit and its first parent.
#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub path: String,
    pub action: ChangeAction,
    pub copy_from_path: Option<String>,
    pub new_blob_id: Option<String>,
}

impl GitStore {
    /// Open an existing Git repository (bare or not) at `repo_path`.
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

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    // -- reads ------------------------------------------------------------

    /// Read a blob's raw bytes by object id.
    pub fn read_blob(&self, oid_hex: &str) -> Result<Vec<u8>, GitError> {
        let oid = Oid::from_str(oid_hex)?;
        let blob = self.repo.find_blob(oid)?;
        Ok(blob.content().to_vec())
    }

    /// Resolve `ref_name` to the commit it points at, or `None` if it does
    /// not exist yet (e.g. an empty repository).
    pub fn resolve_ref(&self, ref_name: &str) -> Result<Option<String>, GitError> {
        match self.repo.find_reference(ref_name) {
            Ok(r) => Ok(Some(r.peel_to_commit()?.id().to_string())),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a commit's metadata.
    pub fn commit_info(&self, commit_sha: &str) -> Result<CommitInfo, GitError> {
        let oid = Oid::from_str(commit_sha)?;
        let commit = self.repo.find_commit(oid)?;
        let when = commit.author().when();
        let date = Utc
            .timestamp_opt(when.seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(CommitInfo {
            sha: oid.to_string(),
            tree_sha: commit.tree_id().to_string(),
            parent_sha: commit.parent_id(0).ok().map(|p| p.to_string()),
            message: commit.message().unwrap_or("").to_string(),
            author_name: commit.author().name().unwrap_or("").to_string(),
            author_email: commit.author().email().unwrap_or("").to_string(),
            date,
        })
    }

    /// Read the `svn:mergeinfo`-shaped git-note attached to a commit, if any.
    /// Mergeinfo has no Git analogue, so per the bridge's best-effort policy
    /// a note on `refs/notes/svnbridge-mergeinfo` is the only way a commit
    /// carries mergeinfo; absent that note, `get-mergeinfo` answers empty.
    pub fn read_mergeinfo_note(&self, commit_sha: &str) -> Result<Option<String>, GitError> {
        let oid = Oid::from_str(commit_sha)?;
        match self.repo.find_note(Some(MERGEINFO_NOTES_REF), oid) {
            Ok(note) => Ok(note.message().map(|m| m.to_string())),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List the immediate entries of a tree.
    pub fn list_tree(&self, tree_sha: &str) -> Result<Vec<TreeEntry>, GitError> {
        let oid = Oid::from_str(tree_sha)?;
        let tree = self.repo.find_tree(oid)?;
        let mut entries = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            entries.push(TreeEntry {
                name: entry.name().unwrap_or("").to_string(),
                oid: entry.id().to_string(),
                is_dir: entry.kind() == Some(ObjectType::Tree),
                mode: entry.filemode() as u32,
            });
        }
        Ok(entries)
    }

    /// Resolve a slash-delimited path (no leading slash) against a tree,
    /// returning the entry's object id, whether it is a directory, and its
    /// file mode.
    pub fn resolve_path(
        &self,
        tree_sha: &str,
        path: &str,
    ) -> Result<Option<(String, bool, u32)>, GitError> {
        if path.is_empty() {
            return Ok(Some((tree_sha.to_string(), true, FileMode::Tree as u32)));
        }
        let oid = Oid::from_str(tree_sha)?;
        let tree = self.repo.find_tree(oid)?;
        match tree.get_path(Path::new(path)) {
            Ok(entry) => Ok(Some((
                entry.id().to_string(),
                entry.kind() == Some(ObjectType::Tree),
                entry.filemode() as u32,
            ))),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Recursively flatten a tree into a `path -> (blobOid, executable)` map,
    /// the inverse of [`GitStore::write_tree`]. Used by the commit builder to
    /// obtain a mutable working copy of a base or rebased-onto tree.
    pub fn flatten_tree(&self, tree_sha: &str) -> Result<BTreeMap<String, (String, bool)>, GitError> {
        let mut out = BTreeMap::new();
        self.flatten_tree_into(tree_sha, "", &mut out)?;
        Ok(out)
    }

    fn flatten_tree_into(
        &self,
        tree_sha: &str,
        prefix: &str,
        out: &mut BTreeMap<String, (String, bool)>,
    ) -> Result<(), GitError> {
        for entry in self.list_tree(tree_sha)? {
            let path = if prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{prefix}/{}", entry.name)
            };
            if entry.is_dir {
                self.flatten_tree_into(&entry.oid, &path, out)?;
            } else {
                let executable = entry.mode == FileMode::BlobExecutable as u32;
                out.insert(path, (entry.oid, executable));
            }
        }
        Ok(())
    }

    // -- writes -------------------------------------------------------------

    /// Write raw bytes as a new blob, returning its object id.
    pub fn write_blob(&self, bytes: &[u8]) -> Result<String, GitError> {
        let oid = self.repo.blob(bytes)?;
        Ok(oid.to_string())
    }

    /// Build a tree from a flat map of `path -> (blobOid, isExecutable)`,
    /// creating the necessary intermediate tree objects. Empty directories
    /// are never materialized since there is no entry to place them under.
    pub fn write_tree(
        &self,
        files: &BTreeMap<String, (String, bool)>,
    ) -> Result<String, GitError> {
        #[derive(Default)]
        struct DirNode {
            files: BTreeMap<String, (Oid, bool)>,
            dirs: BTreeMap<String, DirNode>,
        }

        let mut root = DirNode::default();
        for (path, (blob_oid, executable)) in files {
            let oid = Oid::from_str(blob_oid)?;
            let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
            let mut node = &mut root;
            for part in &parts[..parts.len() - 1] {
                node = node.dirs.entry(part.to_string()).or_default();
            }
            node.files
                .insert(parts[parts.len() - 1].to_string(), (oid, *executable));
        }

        fn build(repo: &Repository, node: &DirNode) -> Result<Oid, GitError> {
            let mut builder = repo.treebuilder(None)?;
            for (name, (oid, executable)) in &node.files {
                let mode = if *executable {
                    FileMode::BlobExecutable
                } else {
                    FileMode::Blob
                };
                builder.insert(name, *oid, mode.into())?;
            }
            for (name, child) in &node.dirs {
                let child_oid = build(repo, child)?;
                builder.insert(name, child_oid, FileMode::Tree.into())?;
            }
            Ok(builder.write()?)
        }

        let tree_oid = build(&self.repo, &root)?;
        Ok(tree_oid.to_string())
    }

    /// Assemble a commit object (not yet attached to any ref).
    pub fn write_commit(
        &self,
        tree_sha: &str,
        parent_sha: Option<&str>,
        author_name: &str,
        author_email: &str,
        message: &str,
    ) -> Result<String, GitError> {
        let tree_oid = Oid::from_str(tree_sha)?;
        let tree = self.repo.find_tree(tree_oid)?;
        let signature = Signature::now(author_name, author_email)?;
        let parent_commit = parent_sha
            .map(Oid::from_str)
            .transpose()?
            .map(|oid| self.repo.find_commit(oid))
            .transpose()?;
        let parents: Vec<&git2::Commit> = parent_commit.iter().collect();
        let oid = self.repo.commit(
            None, // detached: the caller advances the ref via compare_and_swap_ref
            &signature,
            &signature,
            message,
            &tree,
            &parents,
        )?;
        debug!(sha = %oid, "assembled commit object");
        Ok(oid.to_string())
    }

    /// Atomically advance `ref_name` from `expected` to `new_commit_sha`.
    /// `expected = None` means the ref must not currently exist (first
    /// commit on an empty repository).
    #[instrument(skip(self))]
    pub fn compare_and_swap_ref(
        &self,
        ref_name: &str,
        expected: Option<&str>,
        new_commit_sha: &str,
    ) -> Result<(), GitError> {
        let new_oid = Oid::from_str(new_commit_sha)?;
        let current = self.resolve_ref(ref_name)?;

        if current.as_deref() != expected {
            warn!(
                ref_name,
                expected = expected.unwrap_or("<none>"),
                found = current.as_deref().unwrap_or("<none>"),
                "ref changed concurrently"
            );
            return Err(GitError::RefChanged {
                ref_name: ref_name.to_string(),
                expected: expected.unwrap_or("<none>").to_string(),
                found: current.unwrap_or_else(|| "<none>".to_string()),
            });
        }

        match expected {
            Some(expected_sha) => {
                let expected_oid = Oid::from_str(expected_sha)?;
                self.repo.reference_matching(
                    ref_name,
                    new_oid,
                    true,
                    expected_oid,
                    "svnbridge: commit",
                )?;
            }
            None => {
                self.repo
                    .reference(ref_name, new_oid, false, "svnbridge: commit")?;
            }
        }
        info!(ref_name, sha = new_commit_sha, "ref advanced");
        Ok(())
    }

    /// Walk `ref_name`'s first-parent history from its current tip back to
    /// (but excluding) `until_sha`, returning commit shas oldest-first so
    /// callers can assign revision numbers in order.
    pub fn first_parent_history_since(
        &self,
        ref_name: &str,
        until_sha: Option<&str>,
    ) -> Result<Vec<String>, GitError> {
        let Some(tip) = self.resolve_ref(ref_name)? else {
            return Ok(Vec::new());
        };
        let until_oid = until_sha.map(Oid::from_str).transpose()?;

        let mut shas = Vec::new();
        let mut cursor = Some(Oid::from_str(&tip)?);
        while let Some(oid) = cursor {
            if Some(oid) == until_oid {
                break;
            }
            let commit = self.repo.find_commit(oid)?;
            shas.push(oid.to_string());
            cursor = commit.parent_id(0).ok();
        }
        shas.reverse();
        Ok(shas)
    }

    /// Diff a commit against its first parent (or an empty tree if it is
    /// the root commit), with rename/copy detection at Git's default
    /// similarity threshold.
    pub fn diff_vs_parent(&self, commit_sha: &str) -> Result<Vec<DiffEntry>, GitError> {
        let oid = Oid::from_str(commit_sha)?;
        let commit = self.repo.find_commit(oid)?;
        let new_tree = commit.tree()?;
        let old_tree = commit
            .parent(0)
            .ok()
            .map(|p| p.tree())
            .transpose()?;

        let mut diff =
            self.repo
                .diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), None)?;
        let mut find_opts = git2::DiffFindOptions::new();
        find_opts.renames(true).copies(true);
        diff.find_similar(Some(&mut find_opts))?;

        let mut entries = Vec::new();
        for delta in diff.deltas() {
            let new_path = delta
                .new_file()
                .path()
                .map(|p| format!("/{}", p.display()));
            let old_path = delta
                .old_file()
                .path()
                .map(|p| format!("/{}", p.display()));
            let new_blob = if delta.new_file().id().is_zero() {
                None
            } else {
                Some(delta.new_file().id().to_string())
            };

            match delta.status() {
                git2::Delta::Added => entries.push(DiffEntry {
                    path: new_path.unwrap_or_default(),
                    action: ChangeAction::Added,
                    copy_from_path: None,
                    new_blob_id: new_blob,
                }),
                git2::Delta::Deleted => entries.push(DiffEntry {
                    path: old_path.unwrap_or_default(),
                    action: ChangeAction::Deleted,
                    copy_from_path: None,
                    new_blob_id: None,
                }),
                git2::Delta::Copied | git2::Delta::Renamed => {
                    entries.push(DiffEntry {
                        path: new_path.unwrap_or_default(),
                        action: ChangeAction::Added,
                        copy_from_path: old_path,
                        new_blob_id: new_blob,
                    });
                    if delta.status() == git2::Delta::Renamed {
                        entries.push(DiffEntry {
                            path: old_path_for_rename(&delta),
                            action: ChangeAction::Deleted,
                            copy_from_path: None,
                            new_blob_id: None,
                        });
                    }
                }
                _ => entries.push(DiffEntry {
                    path: new_path.unwrap_or_default(),
                    action: ChangeAction::Modified,
                    copy_from_path: None,
                    new_blob_id: new_blob,
                }),
            }
        }
        Ok(entries)
    }
}

fn old_path_for_rename(delta: &git2::DiffDelta) -> String {
    delta
        .old_file()
        .path()
        .map(|p| format!("/{}", p.display()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn init_repo() -> (tempfile::TempDir, GitStore) {
        let dir = tempfile::tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        let store = GitStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_write_blob_and_read_back() {
        let (_dir, store) = init_repo();
        let oid = store.write_blob(b"hello world").unwrap();
        assert_eq!(store.read_blob(&oid).unwrap(), b"hello world");
    }

    #[test]
    fn test_write_tree_and_resolve_path() {
        let (_dir, store) = init_repo();
        let blob = store.write_blob(b"content").unwrap();
        let mut files = BTreeMap::new();
        files.insert("a/b.txt".to_string(), (blob.clone(), false));
        let tree_sha = store.write_tree(&files).unwrap();

        let (oid, is_dir, _mode) = store.resolve_path(&tree_sha, "a/b.txt").unwrap().unwrap();
        assert_eq!(oid, blob);
        assert!(!is_dir);

        let (_oid, is_dir, _) = store.resolve_path(&tree_sha, "a").unwrap().unwrap();
        assert!(is_dir);

        assert!(store.resolve_path(&tree_sha, "missing").unwrap().is_none());
    }

    #[test]
    fn test_commit_and_cas_ref() {
        let (_dir, store) = init_repo();
        let blob = store.write_blob(b"v1").unwrap();
        let mut files = BTreeMap::new();
        files.insert("f.txt".to_string(), (blob, false));
        let tree_sha = store.write_tree(&files).unwrap();
        let commit_sha = store
            .write_commit(&tree_sha, None, "Test", "test@test.com", "initial")
            .unwrap();

        store
            .compare_and_swap_ref("refs/heads/master", None, &commit_sha)
            .unwrap();
        assert_eq!(
            store.resolve_ref("refs/heads/master").unwrap(),
            Some(commit_sha.clone())
        );

        // A stale CAS must fail.
        let result = store.compare_and_swap_ref("refs/heads/master", None, &commit_sha);
        assert!(matches!(result, Err(GitError::RefChanged { .. })));
    }

    #[test]
    fn test_first_parent_history() {
        let (_dir, store) = init_repo();
        let mut parent: Option<String> = None;
        let mut shas = Vec::new();
        for i in 0..3 {
            let blob = store.write_blob(format!("v{i}").as_bytes()).unwrap();
            let mut files = BTreeMap::new();
            files.insert("f.txt".to_string(), (blob, false));
            let tree_sha = store.write_tree(&files).unwrap();
            let commit_sha = store
                .write_commit(&tree_sha, parent.as_deref(), "T", "t@t.com", &format!("c{i}"))
                .unwrap();
            store
                .compare_and_swap_ref("refs/heads/master", parent.as_deref(), &commit_sha)
                .unwrap();
            shas.push(commit_sha.clone());
            parent = Some(commit_sha);
        }

        let history = store
            .first_parent_history_since("refs/heads/master", None)
            .unwrap();
        assert_eq!(history, shas);

        let partial = store
            .first_parent_history_since("refs/heads/master", Some(&shas[0]))
            .unwrap();
        assert_eq!(partial, &shas[1..]);
    }

    #[test]
    fn test_diff_vs_parent_detects_added_and_modified() {
        let (_dir, store) = init_repo();
        let blob1 = store.write_blob(b"v1").unwrap();
        let mut files = BTreeMap::new();
        files.insert("f.txt".to_string(), (blob1, false));
        let tree1 = store.write_tree(&files).unwrap();
        let c1 = store
            .write_commit(&tree1, None, "T", "t@t.com", "c1")
            .unwrap();

        let diff1 = store.diff_vs_parent(&c1).unwrap();
        assert_eq!(diff1.len(), 1);
        assert_eq!(diff1[0].action, ChangeAction::Added);

        let blob2 = store.write_blob(b"v2").unwrap();
        files.insert("f.txt".to_string(), (blob2, false));
        let tree2 = store.write_tree(&files).unwrap();
        let c2 = store
            .write_commit(&tree2, Some(&c1), "T", "t@t.com", "c2")
            .unwrap();

        let diff2 = store.diff_vs_parent(&c2).unwrap();
        assert_eq!(diff2.len(), 1);
        assert_eq!(diff2[0].action, ChangeAction::Modified);
    }

    #[test]
    fn test_flatten_tree_round_trips_write_tree() {
        let (_dir, store) = init_repo();
        let blob_a = store.write_blob(b"a").unwrap();
        let blob_b = store.write_blob(b"b").unwrap();
        let mut files = BTreeMap::new();
        files.insert("trunk/a.txt".to_string(), (blob_a.clone(), false));
        files.insert("trunk/sub/b.txt".to_string(), (blob_b.clone(), true));
        let tree_sha = store.write_tree(&files).unwrap();

        let flattened = store.flatten_tree(&tree_sha).unwrap();
        assert_eq!(flattened, files);
    }

    #[test]
    fn test_repo_not_found() {
        assert!(matches!(
            GitStore::open("/nonexistent"),
            Err(GitError::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn test_mergeinfo_note_absent_then_present() {
        let (_dir, store) = init_repo();
        let blob = store.write_blob(b"v1").unwrap();
        let mut files = BTreeMap::new();
        files.insert("f.txt".to_string(), (blob, false));
        let tree_sha = store.write_tree(&files).unwrap();
        let commit_sha = store
            .write_commit(&tree_sha, None, "T", "t@t.com", "c1")
            .unwrap();

        assert_eq!(store.read_mergeinfo_note(&commit_sha).unwrap(), None);

        let oid = Oid::from_str(&commit_sha).unwrap();
        let sig = Signature::now("T", "t@t.com").unwrap();
        store
            .repo
            .note(&sig, &sig, Some(MERGEINFO_NOTES_REF), oid, "/branches/foo:1-4\n", false)
            .unwrap();

        assert_eq!(
            store.read_mergeinfo_note(&commit_sha).unwrap(),
            Some("/branches/foo:1-4\n".to_string())
        );
    }
}
