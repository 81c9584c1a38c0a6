//! The revision index: the bijection between SVN revision numbers and Git
//! commit shas on a repository's tracked ref.
//!
//! Revisions are assigned densely and monotonically by walking first-parent
//! history oldest-first from the last indexed commit to the tracked ref's
//! current tip. The assignment itself, and each revision's changed-paths
//! set, is persisted so a restart never renumbers history and `log`/`blame`
//! never have to re-walk Git.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{info, instrument};

use crate::db::queries::RevisionRow;
use crate::db::Database;
use crate::errors::RevIndexError;
use crate::git::GitStore;
use crate::models::{ChangeAction, ChangedPath, NodeKind, Revision};
use crate::props::PropertySynthesizer;

/// A fully resolved revision: its commit, author, message and timestamp.
#[derive(Debug, Clone)]
pub struct RevisionMeta {
    pub rev: Revision,
    pub commit_sha: Option<String>,
    pub author: String,
    pub message: String,
    pub date: DateTime<Utc>,
}

/// Observes new commits on a repository's tracked ref and maintains the
/// persisted rev <-> commit mapping.
pub struct RevisionIndex {
    db: Arc<Database>,
    git: Arc<GitStore>,
    tracked_ref: String,
    repo_name: String,
}

impl RevisionIndex {
    pub fn new(db: Arc<Database>, git: Arc<GitStore>, repo_name: &str, tracked_ref: &str) -> Self {
        Self {
            db,
            git,
            tracked_ref: tracked_ref.to_string(),
            repo_name: repo_name.to_string(),
        }
    }

    /// Walk the tracked ref's first-parent history since the last indexed
    /// commit and assign revision numbers to anything new. Returns the
    /// newly assigned revision numbers, oldest-first.
    #[instrument(skip(self), fields(repo = %self.repo_name))]
    pub fn observe_new_commits(&self) -> Result<Vec<Revision>, RevIndexError> {
        let latest_rev = self.db.latest_revision()?;
        let until_sha = if latest_rev == 0 {
            None
        } else {
            self.db
                .get_revision(latest_rev)?
                .map(|r| r.commit_sha)
        };

        let new_commits = self
            .git
            .first_parent_history_since(&self.tracked_ref, until_sha.as_deref())
            .map_err(|e| RevIndexError::WalkFailed(e.to_string()))?;

        let mut assigned = Vec::with_capacity(new_commits.len());
        let mut next_rev = latest_rev + 1;
        for sha in &new_commits {
            let info = self.git.commit_info(sha)?;
            let diff = self
                .git
                .diff_vs_parent(sha)
                .map_err(|e| RevIndexError::WalkFailed(e.to_string()))?;
            // A copy/rename's source is always read from the immediate
            // parent commit's tree, which is the revision just before this
            // one in a first-parent-only history.
            let copy_source_rev = next_rev.saturating_sub(1) as i64;
            let mut changed: Vec<ChangedPath> = diff
                .into_iter()
                .map(|d| {
                    let copy_from_rev = d.copy_from_path.as_ref().map(|_| copy_source_rev);
                    ChangedPath {
                        path: d.path,
                        action: d.action,
                        copy_from_path: d.copy_from_path,
                        copy_from_rev,
                    }
                })
                .collect();
            changed.extend(self.attribute_side_effect_changes(&info, &changed)?);

            self.db.insert_revision(
                next_rev as i64,
                &info.sha,
                &info.author_name,
                &info.message,
                &info.date.to_rfc3339(),
                &changed,
            )?;
            info!(rev = next_rev, sha = %info.sha, "assigned revision");
            assigned.push(next_rev);
            next_rev += 1;
        }
        Ok(assigned)
    }

    /// A `.gitattributes`/`.gitignore` edit changes how an *untouched*
    /// sibling file's existing bytes are interpreted without touching its
    /// git blob, so the raw tree-diff that finds `changed` never sees it.
    /// SVN clients expect exactly that file to show up in `log`'s
    /// changed-paths anyway (it is, from the client's point of view, a
    /// real content/property change at this revision) -- so once the raw
    /// diff names an attribute-file edit, walk every other file in that
    /// directory's subtree and record any whose synthesized properties or
    /// filter chain differ between the parent commit and this one.
    fn attribute_side_effect_changes(
        &self,
        info: &crate::git::CommitInfo,
        already_changed: &[ChangedPath],
    ) -> Result<Vec<ChangedPath>, RevIndexError> {
        let Some(parent_sha) = &info.parent_sha else {
            return Ok(Vec::new());
        };

        let touched_dirs: Vec<String> = already_changed
            .iter()
            .filter(|c| {
                let base = c.path.rsplit('/').next().unwrap_or(&c.path);
                base == ".gitattributes" || base == ".gitignore"
            })
            .map(|c| {
                c.path
                    .trim_start_matches('/')
                    .rsplit_once('/')
                    .map(|(dir, _)| dir.to_string())
                    .unwrap_or_default()
            })
            .collect();
        if touched_dirs.is_empty() {
            return Ok(Vec::new());
        }

        let already: std::collections::HashSet<&str> =
            already_changed.iter().map(|c| c.path.as_str()).collect();
        let parent_tree_sha = self
            .git
            .commit_info(parent_sha)
            .map_err(|e| RevIndexError::WalkFailed(e.to_string()))?
            .tree_sha;
        let new_files = self
            .git
            .flatten_tree(&info.tree_sha)
            .map_err(|e| RevIndexError::WalkFailed(e.to_string()))?;
        let synth = PropertySynthesizer::new(&self.git);

        let mut out = Vec::new();
        for key in new_files.keys() {
            if key.ends_with(".gitattributes") || key.ends_with(".gitignore") {
                continue;
            }
            if !touched_dirs.iter().any(|dir| under_dir(dir, key)) {
                continue;
            }
            let path = format!("/{key}");
            if already.contains(path.as_str()) {
                continue;
            }
            let (Ok(old), Ok(new)) = (
                synth.synthesize(&parent_tree_sha, &path, NodeKind::File),
                synth.synthesize(&info.tree_sha, &path, NodeKind::File),
            ) else {
                continue;
            };
            if old.filter_chain != new.filter_chain || old.properties != new.properties {
                out.push(ChangedPath {
                    path,
                    action: ChangeAction::Modified,
                    copy_from_path: None,
                    copy_from_rev: None,
                });
            }
        }
        Ok(out)
    }

    /// The ref this index presents as the SVN history, e.g.
    /// `refs/heads/master`. Used by the commit builder to know which ref to
    /// compare-and-swap onto.
    pub fn tracked_ref(&self) -> &str {
        &self.tracked_ref
    }

    /// The highest assigned revision number, or 0 if none observed yet.
    pub fn latest(&self) -> Result<Revision, RevIndexError> {
        Ok(self.db.latest_revision()? as Revision)
    }

    /// Resolve a revision number to its commit and metadata. `rev == 0`
    /// returns the synthesized empty root.
    ///
    /// A miss triggers exactly one re-scan of the tracked ref before
    /// surfacing as [`RevIndexError::RevisionNotFound`]: a commit can land
    /// on the ref between observation passes, and a `stat`/`get-latest-rev`
    /// racing that push must not report a revision absent just because
    /// nothing has observed it yet.
    pub fn lookup_by_rev(&self, rev: Revision) -> Result<RevisionMeta, RevIndexError> {
        if rev == 0 {
            return Ok(self.synthetic_root());
        }
        if let Some(row) = self.db.get_revision(rev as i64)? {
            return Ok(row_to_meta(row));
        }
        self.observe_new_commits()?;
        let row = self
            .db
            .get_revision(rev as i64)?
            .ok_or(RevIndexError::RevisionNotFound(rev))?;
        Ok(row_to_meta(row))
    }

    /// Resolve a commit sha to its assigned revision number.
    pub fn lookup_by_commit(&self, commit_sha: &str) -> Result<Revision, RevIndexError> {
        self.db
            .get_rev_for_commit(commit_sha)?
            .map(|r| r as Revision)
            .ok_or_else(|| RevIndexError::Unindexed(commit_sha.to_string()))
    }

    /// The changed-paths set recorded for a revision.
    pub fn changed_paths(&self, rev: Revision) -> Result<Vec<ChangedPath>, RevIndexError> {
        if rev == 0 {
            return Ok(Vec::new());
        }
        Ok(self.db.get_changed_paths(rev as i64)?)
    }

    /// Revisions in strictly increasing order touching any of `paths` (or
    /// all revisions if `paths` is empty), within `[from_rev, to_rev]`.
    pub fn log(
        &self,
        paths: &[String],
        from_rev: Revision,
        to_rev: Revision,
        limit: u32,
    ) -> Result<Vec<RevisionMeta>, RevIndexError> {
        let rows = self
            .db
            .log_revisions(paths, from_rev as i64, to_rev as i64, limit)?;
        Ok(rows.into_iter().map(row_to_meta).collect())
    }

    fn synthetic_root(&self) -> RevisionMeta {
        let created = self
            .git
            .repo_path()
            .metadata()
            .and_then(|m| m.created())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .and_then(|d| Utc.timestamp_opt(d.as_secs() as i64, 0).single())
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap());
        RevisionMeta {
            rev: 0,
            commit_sha: None,
            author: String::new(),
            message: String::new(),
            date: created,
        }
    }
}

/// Whether tree-key `path` lives under directory `dir` (tree-key form, `""`
/// meaning the repository root, which covers every path).
fn under_dir(dir: &str, path: &str) -> bool {
    dir.is_empty() || path.starts_with(&format!("{dir}/"))
}

fn row_to_meta(row: RevisionRow) -> RevisionMeta {
    let date = DateTime::parse_from_rfc3339(&row.date)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    RevisionMeta {
        rev: row.rev as Revision,
        commit_sha: Some(row.commit_sha),
        author: row.author,
        message: row.message,
        date,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use std::collections::BTreeMap;

    fn setup() -> (tempfile::TempDir, Arc<GitStore>, Arc<Database>) {
        let dir = tempfile::tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        let git = Arc::new(GitStore::open(dir.path()).unwrap());
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        (dir, git, db)
    }

    fn commit(git: &GitStore, parent: Option<&str>, content: &str) -> String {
        let blob = git.write_blob(content.as_bytes()).unwrap();
        let mut files = BTreeMap::new();
        files.insert("trunk/f.txt".to_string(), (blob, false));
        let tree = git.write_tree(&files).unwrap();
        let sha = git
            .write_commit(&tree, parent, "Alice", "alice@example.com", content)
            .unwrap();
        git.compare_and_swap_ref("refs/heads/master", parent, &sha)
            .unwrap();
        sha
    }

    #[test]
    fn test_observe_assigns_dense_revisions() {
        let (_dir, git, db) = setup();
        let c1 = commit(&git, None, "v1");
        let c2 = commit(&git, Some(&c1), "v2");

        let idx = RevisionIndex::new(db, git, "test", "refs/heads/master");
        let assigned = idx.observe_new_commits().unwrap();
        assert_eq!(assigned, vec![1, 2]);
        assert_eq!(idx.latest().unwrap(), 2);
        assert_eq!(idx.lookup_by_commit(&c2).unwrap(), 2);
    }

    #[test]
    fn test_observe_is_idempotent() {
        let (_dir, git, db) = setup();
        commit(&git, None, "v1");
        let idx = RevisionIndex::new(db, git, "test", "refs/heads/master");
        idx.observe_new_commits().unwrap();
        let second = idx.observe_new_commits().unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_revision_zero_is_synthetic() {
        let (_dir, git, db) = setup();
        let idx = RevisionIndex::new(db, git, "test", "refs/heads/master");
        let root = idx.lookup_by_rev(0).unwrap();
        assert_eq!(root.rev, 0);
        assert_eq!(root.author, "");
        assert_eq!(root.message, "");
    }

    #[test]
    fn test_lookup_missing_revision_errors() {
        let (_dir, git, db) = setup();
        let idx = RevisionIndex::new(db, git, "test", "refs/heads/master");
        assert!(matches!(
            idx.lookup_by_rev(5),
            Err(RevIndexError::RevisionNotFound(5))
        ));
    }

    #[test]
    fn test_lookup_by_rev_rescans_on_miss() {
        // A commit can land on the tracked ref without anything having
        // called `observe_new_commits()` yet (pushed directly, or a
        // background refresh hasn't ticked). `lookup_by_rev` must notice
        // and index it itself rather than reporting it absent.
        let (_dir, git, db) = setup();
        let c1 = commit(&git, None, "v1");
        let _c2 = commit(&git, Some(&c1), "v2");

        let idx = RevisionIndex::new(db, git, "test", "refs/heads/master");
        assert_eq!(idx.latest().unwrap(), 0);

        let meta = idx.lookup_by_rev(2).unwrap();
        assert_eq!(meta.rev, 2);
        assert_eq!(idx.latest().unwrap(), 2);
    }

    #[test]
    fn test_changed_paths_recorded() {
        let (_dir, git, db) = setup();
        commit(&git, None, "v1");
        let idx = RevisionIndex::new(db, git, "test", "refs/heads/master");
        idx.observe_new_commits().unwrap();
        let changed = idx.changed_paths(1).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].action, ChangeAction::Added);
        assert_eq!(changed[0].path, "/trunk/f.txt");
    }
}
