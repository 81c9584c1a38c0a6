//! The versioned filesystem: a path-oriented read API unifying the revision
//! index, filter chain, and property synthesizer behind a single
//! `(revision, path)` addressing scheme.

use std::sync::Arc;

use tracing::instrument;

use crate::errors::FsError;
use crate::filters::{FilterChain, FilterEngine, NoLfsObjects};
use crate::git::GitStore;
use crate::models::{
    BlameLine, ChangeAction, ChangedPath, DirectoryEntry, LastChange, LogEntry, Node, NodeKind,
    PropertyMap, Revision,
};
use crate::props::PropertySynthesizer;
use crate::revindex::RevisionIndex;

/// Read-only, snapshot-consistent access to a repository's content at any
/// previously-observed revision.
pub struct VersionedFs {
    git: Arc<GitStore>,
    revindex: Arc<RevisionIndex>,
}

impl VersionedFs {
    pub fn new(git: Arc<GitStore>, revindex: Arc<RevisionIndex>) -> Self {
        Self { git, revindex }
    }

    fn tree_sha_at(&self, rev: Revision) -> Result<Option<String>, FsError> {
        let meta = self.revindex.lookup_by_rev(rev)?;
        let Some(commit_sha) = meta.commit_sha else {
            return Ok(None);
        };
        let info = self.git.commit_info(&commit_sha)?;
        Ok(Some(info.tree_sha))
    }

    /// Resolve `(R, path)` to a node, or `None` if absent.
    #[instrument(skip(self))]
    pub fn stat(&self, rev: Revision, path: &str) -> Result<Option<Node>, FsError> {
        let Some(tree_sha) = self.tree_sha_at(rev)? else {
            return Ok(None);
        };
        let relative = path.trim_start_matches('/');
        let Some((oid, is_dir, _mode)) = self.git.resolve_path(&tree_sha, relative)? else {
            return Ok(None);
        };

        let kind = if is_dir { NodeKind::Dir } else { NodeKind::File };
        let last_change = self.last_change_for(rev, path)?;
        let synth = PropertySynthesizer::new(&self.git);
        let synthesized = synth.synthesize(&tree_sha, path, kind)?;

        if is_dir {
            return Ok(Some(Node::Dir {
                properties: synthesized.properties,
                last_change,
            }));
        }

        let no_lfs = NoLfsObjects;
        let engine = FilterEngine::new(&no_lfs);
        let stored = self.git.read_blob(&oid)?;
        let effective = engine.decode(&synthesized.filter_chain, &stored)?;
        let md5 = format!("{:x}", md5::compute(&effective));

        Ok(Some(Node::File {
            blob_id: oid,
            filter_chain: synthesized.filter_chain.names().to_vec(),
            size: effective.len() as u64,
            md5,
            properties: synthesized.properties,
            last_change,
        }))
    }

    /// List a directory's immediate entries, sorted lexicographically.
    pub fn list(&self, rev: Revision, path: &str) -> Result<Vec<DirectoryEntry>, FsError> {
        let Some(tree_sha) = self.tree_sha_at(rev)? else {
            return Ok(Vec::new());
        };
        let relative = path.trim_start_matches('/');
        let Some((dir_oid, is_dir, _)) = self.git.resolve_path(&tree_sha, relative)? else {
            return Err(FsError::PathNotFound {
                rev,
                path: path.to_string(),
            });
        };
        if !is_dir {
            return Err(FsError::NodeKindMismatch {
                path: path.to_string(),
                expected: "dir",
                found: "file",
            });
        }
        let mut entries = Vec::new();
        for entry in self.git.list_tree(&dir_oid)? {
            let child_path = if path == "/" {
                format!("/{}", entry.name)
            } else {
                format!("{path}/{}", entry.name)
            };
            let last_change = self.last_change_for(rev, &child_path)?;
            entries.push(DirectoryEntry {
                name: entry.name,
                kind: if entry.is_dir { NodeKind::Dir } else { NodeKind::File },
                last_change_rev: last_change.rev,
                last_change_author: last_change.author,
                last_change_date: last_change.date,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Read a file's post-filter (client-visible) bytes.
    pub fn read(&self, rev: Revision, path: &str) -> Result<Vec<u8>, FsError> {
        match self.stat(rev, path)? {
            Some(Node::File { blob_id, filter_chain, .. }) => {
                let no_lfs = NoLfsObjects;
                let engine = FilterEngine::new(&no_lfs);
                let chain = FilterChain::from_names(filter_chain);
                let stored = self.git.read_blob(&blob_id)?;
                Ok(engine.decode(&chain, &stored)?)
            }
            Some(Node::Dir { .. }) => Err(FsError::NodeKindMismatch {
                path: path.to_string(),
                expected: "file",
                found: "dir",
            }),
            None => Err(FsError::PathNotFound {
                rev,
                path: path.to_string(),
            }),
        }
    }

    /// Regular (client-visible) properties of `(R, path)`.
    pub fn properties(&self, rev: Revision, path: &str) -> Result<PropertyMap, FsError> {
        match self.stat(rev, path)? {
            Some(node) => Ok(node.properties().clone()),
            None => Err(FsError::PathNotFound {
                rev,
                path: path.to_string(),
            }),
        }
    }

    /// Log entries touching `paths` (or all revisions if empty), within
    /// `[from_rev, to_rev]`, in strictly increasing revision order.
    pub fn log(
        &self,
        paths: &[String],
        from_rev: Revision,
        to_rev: Revision,
        limit: u32,
    ) -> Result<Vec<LogEntry>, FsError> {
        let metas = self.revindex.log(paths, from_rev, to_rev, limit)?;
        let mut out = Vec::with_capacity(metas.len());
        for meta in metas {
            let changed_paths: Vec<ChangedPath> = self.revindex.changed_paths(meta.rev)?;
            out.push(LogEntry {
                rev: meta.rev,
                author: meta.author,
                message: meta.message,
                date: meta.date,
                changed_paths,
            });
        }
        Ok(out)
    }

    /// The revision, author and date at which `path` was last changed at or
    /// before `rev`, found by scanning the changed-paths sets backward.
    /// Falls back to `rev` itself (with the path's own commit metadata) if
    /// no earlier changed-paths record covers it (e.g. revision 0).
    fn last_change_for(&self, rev: Revision, path: &str) -> Result<LastChange, FsError> {
        let mut cursor = rev;
        loop {
            if cursor == 0 {
                let meta = self.revindex.lookup_by_rev(0)?;
                return Ok(LastChange {
                    rev: 0,
                    author: meta.author,
                    date: meta.date,
                });
            }
            let changed = self.revindex.changed_paths(cursor)?;
            if changed.iter().any(|cp| path_affected(&cp.path, path)) {
                let meta = self.revindex.lookup_by_rev(cursor)?;
                return Ok(LastChange {
                    rev: cursor,
                    author: meta.author,
                    date: meta.date,
                });
            }
            cursor -= 1;
        }
    }

    /// The chain of `(revision, path)` pairs at which `path` (as it existed
    /// at `rev`) was added, modified or copied, newest first, following
    /// renames back through copy history. Stops once a path with no copy
    /// source is reached, or at revision 0. `limit` of 0 means unbounded.
    #[instrument(skip(self))]
    pub fn history(
        &self,
        rev: Revision,
        path: &str,
        limit: u32,
    ) -> Result<Vec<(Revision, String)>, FsError> {
        let mut results = Vec::new();
        let mut cursor = rev;
        let mut current = crate::models::canonicalize_path(path);

        loop {
            if limit > 0 && results.len() as u32 >= limit {
                break;
            }
            if cursor == 0 {
                if self.stat(0, &current)?.is_some() {
                    results.push((0, current));
                }
                break;
            }

            let changed = self.revindex.changed_paths(cursor)?;
            let Some(entry) = changed.iter().find(|cp| cp.path == current) else {
                cursor -= 1;
                continue;
            };

            results.push((cursor, current.clone()));
            match (entry.action, &entry.copy_from_path, entry.copy_from_rev) {
                (ChangeAction::Added, Some(from_path), Some(from_rev)) if (from_rev as u64) < cursor => {
                    current = from_path.clone();
                    cursor = from_rev as u64;
                }
                (ChangeAction::Added, _, _) => break,
                _ => cursor -= 1,
            }
        }
        Ok(results)
    }

    /// Per-line authorship of `path` as it reads at `rev`: for each line,
    /// the revision and author that last touched it. Walks `history`
    /// oldest-first, diffing each successive version's lines against the
    /// accumulated blame so far.
    #[instrument(skip(self))]
    pub fn blame(&self, rev: Revision, path: &str) -> Result<Vec<BlameLine>, FsError> {
        let mut chain = self.history(rev, path, 0)?;
        chain.reverse(); // oldest first

        let mut blame_lines: Vec<BlameLine> = Vec::new();
        for (r, p) in chain {
            let content = match self.stat(r, &p)? {
                Some(Node::File { .. }) => self.read(r, &p)?,
                _ => continue,
            };
            let meta = self.revindex.lookup_by_rev(r)?;
            let text = String::from_utf8_lossy(&content).into_owned();
            let new_lines: Vec<&str> = split_lines(&text);

            let old_lines: Vec<String> = blame_lines
                .iter()
                .map(|b| String::from_utf8_lossy(&b.content).into_owned())
                .collect();

            let ops = lcs_line_diff(&old_lines, &new_lines);
            let mut next = Vec::with_capacity(new_lines.len());
            for op in ops {
                match op {
                    LineOp::Keep(old_idx) => next.push(blame_lines[old_idx].clone()),
                    LineOp::Insert(new_idx) => next.push(BlameLine {
                        line_no: 0,
                        rev: r,
                        author: meta.author.clone(),
                        content: new_lines[new_idx].as_bytes().to_vec(),
                    }),
                }
            }
            blame_lines = next;
        }

        for (i, line) in blame_lines.iter_mut().enumerate() {
            line.line_no = (i + 1) as u64;
        }
        Ok(blame_lines)
    }
}

fn split_lines(text: &str) -> Vec<&str> {
    if text.is_empty() {
        return Vec::new();
    }
    text.lines().collect()
}

enum LineOp {
    Keep(usize),
    Insert(usize),
}

/// Minimal O(n*m) LCS line diff: no ecosystem crate exposes the old/new line
/// alignment blame needs without committing to its own unified-diff text
/// format, so this stays a small hand-rolled dynamic program.
fn lcs_line_diff(old: &[String], new: &[&str]) -> Vec<LineOp> {
    let n = old.len();
    let m = new.len();
    let mut dp = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            dp[i][j] = if old[i] == new[j] {
                dp[i + 1][j + 1] + 1
            } else {
                dp[i + 1][j].max(dp[i][j + 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(m);
    let (mut i, mut j) = (0usize, 0usize);
    while j < m {
        if i < n && old[i] == new[j] {
            ops.push(LineOp::Keep(i));
            i += 1;
            j += 1;
        } else if i < n && dp[i + 1][j] >= dp[i][j + 1] {
            i += 1;
        } else {
            ops.push(LineOp::Insert(j));
            j += 1;
        }
    }
    ops
}

/// Whether a changed-paths entry at `changed_path` affects `query_path`
/// (exact match, or an ancestor directory of it).
fn path_affected(changed_path: &str, query_path: &str) -> bool {
    changed_path == query_path
        || query_path.starts_with(&format!("{changed_path}/"))
        || changed_path.starts_with(&format!("{query_path}/"))
}
