//! Typed query helpers for every table in the svnbridge per-repository
//! database.

use chrono::Utc;
use rusqlite::params;
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::models::ChangedPath;

// ---------------------------------------------------------------------------
// Domain structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `revisions` table.
#[derive(Debug, Clone)]
pub struct RevisionRow {
    pub rev: i64,
    pub commit_sha: String,
    pub author: String,
    pub message: String,
    pub date: String,
}

/// A row from the `locks` table.
#[derive(Debug, Clone)]
pub struct LockRow {
    pub path: String,
    pub token: String,
    pub owner: String,
    pub comment: Option<String>,
    pub created_at: String,
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern, then append
/// `/%` so the pattern matches anything strictly under `path`.
fn like_prefix_pattern(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len() + 2);
    for c in path.chars() {
        if c == '%' || c == '_' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push_str("/%");
    escaped
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- revisions / changed_paths ------------------------------------------

    /// Insert a newly-observed revision and its changed-paths set in one
    /// transaction, so a crash mid-batch never leaves a revision without its
    /// changed-paths (or vice versa).
    pub fn insert_revision(
        &self,
        rev: i64,
        commit_sha: &str,
        author: &str,
        message: &str,
        date: &str,
        changed_paths: &[ChangedPath],
    ) -> Result<(), DatabaseError> {
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO revisions (rev, commit_sha, author, message, date)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![rev, commit_sha, author, message, date],
            )?;
            for cp in changed_paths {
                conn.execute(
                    "INSERT INTO changed_paths (rev, path, action, copy_from_path, copy_from_rev)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        rev,
                        cp.path,
                        cp.action.as_str(),
                        cp.copy_from_path,
                        cp.copy_from_rev,
                    ],
                )?;
            }
            Ok(())
        })?;
        debug!(rev, commit_sha, changed = changed_paths.len(), "indexed revision");
        Ok(())
    }

    /// Look up a revision row by number.
    pub fn get_revision(&self, rev: i64) -> Result<Option<RevisionRow>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT rev, commit_sha, author, message, date FROM revisions WHERE rev = ?1",
        )?;
        let mut rows = stmt.query_map(params![rev], |row| {
            Ok(RevisionRow {
                rev: row.get(0)?,
                commit_sha: row.get(1)?,
                author: row.get(2)?,
                message: row.get(3)?,
                date: row.get(4)?,
            })
        })?;
        match rows.next() {
            Some(Ok(r)) => Ok(Some(r)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Look up a revision number by commit SHA.
    pub fn get_rev_for_commit(&self, commit_sha: &str) -> Result<Option<i64>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT rev FROM revisions WHERE commit_sha = ?1")?;
        let mut rows = stmt.query_map(params![commit_sha], |row| row.get(0))?;
        match rows.next() {
            Some(Ok(rev)) => Ok(Some(rev)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Return the highest assigned revision number, or 0 if none observed
    /// yet.
    pub fn latest_revision(&self) -> Result<i64, DatabaseError> {
        let rev: Option<i64> =
            self.conn()
                .query_row("SELECT MAX(rev) FROM revisions", [], |row| row.get(0))?;
        Ok(rev.unwrap_or(0))
    }

    /// Return the changed-paths set for a revision.
    pub fn get_changed_paths(&self, rev: i64) -> Result<Vec<ChangedPath>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT path, action, copy_from_path, copy_from_rev FROM changed_paths
             WHERE rev = ?1 ORDER BY path",
        )?;
        let entries = stmt
            .query_map(params![rev], |row| {
                let action: String = row.get(1)?;
                Ok(ChangedPath {
                    path: row.get(0)?,
                    action: crate::models::ChangeAction::from_str(&action),
                    copy_from_path: row.get(2)?,
                    copy_from_rev: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Return revisions in strictly increasing `rev` order where at least
    /// one of `paths` appears in the changed-paths set, within
    /// `[from_rev, to_rev]`, bounded by `limit`.
    pub fn log_revisions(
        &self,
        paths: &[String],
        from_rev: i64,
        to_rev: i64,
        limit: u32,
    ) -> Result<Vec<RevisionRow>, DatabaseError> {
        let conn = self.conn();
        if paths.is_empty() {
            let mut stmt = conn.prepare(
                "SELECT rev, commit_sha, author, message, date FROM revisions
                 WHERE rev BETWEEN ?1 AND ?2 ORDER BY rev ASC LIMIT ?3",
            )?;
            let entries = stmt
                .query_map(params![from_rev, to_rev, limit], |row| {
                    Ok(RevisionRow {
                        rev: row.get(0)?,
                        commit_sha: row.get(1)?,
                        author: row.get(2)?,
                        message: row.get(3)?,
                        date: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(entries);
        }

        // A path argument names a file or a directory; a revision whose
        // changed-paths set only touches something *under* a given directory
        // (never the directory entry itself) must still show up, so each
        // path matches both on equality and as a `path/` prefix.
        let conditions = paths
            .iter()
            .map(|_| "(cp.path = ? OR cp.path LIKE ? ESCAPE '\\')")
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT DISTINCT r.rev, r.commit_sha, r.author, r.message, r.date
             FROM revisions r
             JOIN changed_paths cp ON cp.rev = r.rev
             WHERE r.rev BETWEEN ? AND ? AND ({conditions})
             ORDER BY r.rev ASC LIMIT ?"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut bound: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(from_rev), Box::new(to_rev)];
        for p in paths {
            bound.push(Box::new(p.clone()));
            bound.push(Box::new(like_prefix_pattern(p)));
        }
        bound.push(Box::new(limit));
        let refs: Vec<&dyn rusqlite::types::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
        let entries = stmt
            .query_map(refs.as_slice(), |row| {
                Ok(RevisionRow {
                    rev: row.get(0)?,
                    commit_sha: row.get(1)?,
                    author: row.get(2)?,
                    message: row.get(3)?,
                    date: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // -- rev_props ------------------------------------------------------

    /// Set (upsert) a revision property.
    pub fn set_rev_prop(
        &self,
        repo: &str,
        rev: i64,
        name: &str,
        value: &[u8],
    ) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO rev_props (repo, rev, name, value) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(repo, rev, name) DO UPDATE SET value = excluded.value",
            params![repo, rev, name, value],
        )?;
        debug!(repo, rev, name, "set rev_prop");
        Ok(())
    }

    /// Get a single revision property.
    pub fn get_rev_prop(
        &self,
        repo: &str,
        rev: i64,
        name: &str,
    ) -> Result<Option<Vec<u8>>, DatabaseError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT value FROM rev_props WHERE repo = ?1 AND rev = ?2 AND name = ?3")?;
        let mut rows = stmt.query_map(params![repo, rev, name], |row| row.get(0))?;
        match rows.next() {
            Some(Ok(val)) => Ok(Some(val)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// List all revision properties for `(repo, rev)`.
    pub fn list_rev_props(
        &self,
        repo: &str,
        rev: i64,
    ) -> Result<Vec<(String, Vec<u8>)>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT name, value FROM rev_props WHERE repo = ?1 AND rev = ?2 ORDER BY name")?;
        let entries = stmt
            .query_map(params![repo, rev], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // -- locks ----------------------------------------------------------

    /// Create a lock, failing with a unique-constraint error if the path is
    /// already locked.
    pub fn create_lock(
        &self,
        path: &str,
        token: &str,
        owner: &str,
        comment: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO locks (path, token, owner, comment, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![path, token, owner, comment, now],
        )?;
        debug!(path, owner, "created lock");
        Ok(())
    }

    /// Look up a lock by path.
    pub fn get_lock(&self, path: &str) -> Result<Option<LockRow>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT path, token, owner, comment, created_at FROM locks WHERE path = ?1",
        )?;
        let mut rows = stmt.query_map(params![path], |row| {
            Ok(LockRow {
                path: row.get(0)?,
                token: row.get(1)?,
                owner: row.get(2)?,
                comment: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        match rows.next() {
            Some(Ok(l)) => Ok(Some(l)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// List all locks under a path prefix (for `get-locks`).
    pub fn list_locks(&self, path_prefix: &str) -> Result<Vec<LockRow>, DatabaseError> {
        let conn = self.conn();
        let pattern = format!("{path_prefix}%");
        let mut stmt = conn.prepare(
            "SELECT path, token, owner, comment, created_at FROM locks WHERE path LIKE ?1 ORDER BY path",
        )?;
        let entries = stmt
            .query_map(params![pattern], |row| {
                Ok(LockRow {
                    path: row.get(0)?,
                    token: row.get(1)?,
                    owner: row.get(2)?,
                    comment: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Remove a lock by path, verifying the token matches. Returns `false`
    /// if no lock existed at that path.
    pub fn remove_lock(&self, path: &str, token: &str) -> Result<bool, DatabaseError> {
        let changed = self.conn().execute(
            "DELETE FROM locks WHERE path = ?1 AND token = ?2",
            params![path, token],
        )?;
        debug!(path, "removed lock");
        Ok(changed > 0)
    }

    // -- filter_cache -----------------------------------------------------

    /// Look up a cached `(md5, size)` for `(blobSha, chainHash)`.
    pub fn get_filter_cache(
        &self,
        blob_sha: &str,
        chain_hash: &str,
    ) -> Result<Option<(String, i64)>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT md5, size FROM filter_cache WHERE blob_sha = ?1 AND chain_hash = ?2",
        )?;
        let mut rows = stmt.query_map(params![blob_sha, chain_hash], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        match rows.next() {
            Some(Ok(v)) => Ok(Some(v)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Insert or replace a filter-cache entry.
    pub fn set_filter_cache(
        &self,
        blob_sha: &str,
        chain_hash: &str,
        md5: &str,
        size: i64,
    ) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO filter_cache (blob_sha, chain_hash, md5, size) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(blob_sha, chain_hash) DO UPDATE SET md5 = excluded.md5, size = excluded.size",
            params![blob_sha, chain_hash, md5, size],
        )?;
        Ok(())
    }

    // -- repo_meta --------------------------------------------------------

    /// Get a singleton repository fact (e.g. `uuid`).
    pub fn get_repo_meta(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT value FROM repo_meta WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(Ok(val)) => Ok(Some(val)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Set (upsert) a singleton repository fact.
    pub fn set_repo_meta(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO repo_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeAction;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_insert_and_get_revision() {
        let db = setup_db();
        let changed = vec![ChangedPath {
            path: "/trunk/a.txt".into(),
            action: ChangeAction::Added,
            copy_from_path: None,
            copy_from_rev: None,
        }];
        db.insert_revision(1, "abc123", "alice", "initial", "2024-01-01T00:00:00Z", &changed)
            .unwrap();

        let row = db.get_revision(1).unwrap().unwrap();
        assert_eq!(row.commit_sha, "abc123");
        assert_eq!(db.get_rev_for_commit("abc123").unwrap(), Some(1));
        assert_eq!(db.latest_revision().unwrap(), 1);

        let paths = db.get_changed_paths(1).unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].path, "/trunk/a.txt");
    }

    #[test]
    fn test_log_revisions_by_path() {
        let db = setup_db();
        db.insert_revision(
            1,
            "sha1",
            "alice",
            "m1",
            "2024-01-01T00:00:00Z",
            &[ChangedPath {
                path: "/a.txt".into(),
                action: ChangeAction::Added,
                copy_from_path: None,
                copy_from_rev: None,
            }],
        )
        .unwrap();
        db.insert_revision(
            2,
            "sha2",
            "bob",
            "m2",
            "2024-01-02T00:00:00Z",
            &[ChangedPath {
                path: "/b.txt".into(),
                action: ChangeAction::Added,
                copy_from_path: None,
                copy_from_rev: None,
            }],
        )
        .unwrap();

        let log = db.log_revisions(&["/a.txt".to_string()], 0, 2, 10).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].rev, 1);

        let all = db.log_revisions(&[], 0, 2, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].rev, 1, "strictly increasing rev order");
    }

    #[test]
    fn test_log_revisions_by_directory_prefix() {
        let db = setup_db();
        db.insert_revision(
            1,
            "sha1",
            "alice",
            "m1",
            "2024-01-01T00:00:00Z",
            &[ChangedPath {
                path: "/trunk/dir/a.txt".into(),
                action: ChangeAction::Added,
                copy_from_path: None,
                copy_from_rev: None,
            }],
        )
        .unwrap();
        db.insert_revision(
            2,
            "sha2",
            "bob",
            "m2",
            "2024-01-02T00:00:00Z",
            &[ChangedPath {
                path: "/branches/x.txt".into(),
                action: ChangeAction::Added,
                copy_from_path: None,
                copy_from_rev: None,
            }],
        )
        .unwrap();

        // Logging the directory "/trunk" must find revision 1, even though
        // no changed-paths row names "/trunk" itself.
        let log = db.log_revisions(&["/trunk".to_string()], 0, 2, 10).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].rev, 1);
    }

    #[test]
    fn test_rev_props_crud() {
        let db = setup_db();
        db.set_rev_prop("main", 1, "svn:log", b"hello").unwrap();
        assert_eq!(
            db.get_rev_prop("main", 1, "svn:log").unwrap(),
            Some(b"hello".to_vec())
        );
        db.set_rev_prop("main", 1, "svn:log", b"updated").unwrap();
        assert_eq!(
            db.get_rev_prop("main", 1, "svn:log").unwrap(),
            Some(b"updated".to_vec())
        );
        let all = db.list_rev_props("main", 1).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_lock_lifecycle() {
        let db = setup_db();
        db.create_lock("/trunk/a.txt", "tok1", "alice", Some("editing"))
            .unwrap();
        let lock = db.get_lock("/trunk/a.txt").unwrap().unwrap();
        assert_eq!(lock.owner, "alice");

        assert!(db.remove_lock("/trunk/a.txt", "wrong-token").unwrap() == false);
        assert!(db.remove_lock("/trunk/a.txt", "tok1").unwrap());
        assert!(db.get_lock("/trunk/a.txt").unwrap().is_none());
    }

    #[test]
    fn test_list_locks_by_prefix() {
        let db = setup_db();
        db.create_lock("/trunk/a.txt", "t1", "alice", None).unwrap();
        db.create_lock("/trunk/sub/b.txt", "t2", "bob", None).unwrap();
        db.create_lock("/branches/x.txt", "t3", "carol", None).unwrap();

        let locks = db.list_locks("/trunk").unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_filter_cache() {
        let db = setup_db();
        assert!(db.get_filter_cache("blob1", "gzip").unwrap().is_none());
        db.set_filter_cache("blob1", "gzip", "d41d8cd98f00b204e9800998ecf8427e", 1024)
            .unwrap();
        let (md5, size) = db.get_filter_cache("blob1", "gzip").unwrap().unwrap();
        assert_eq!(size, 1024);
        assert_eq!(md5, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_repo_meta() {
        let db = setup_db();
        assert!(db.get_repo_meta("uuid").unwrap().is_none());
        db.set_repo_meta("uuid", "1234-5678").unwrap();
        assert_eq!(db.get_repo_meta("uuid").unwrap().as_deref(), Some("1234-5678"));
    }
}
