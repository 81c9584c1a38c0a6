//! The named-repository registry: binds a configured Git repository to its
//! revision index, metadata database and lock table, and hands the bundle
//! out as a single collaborator the session engine and commit builder share.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::config::{AppConfig, RepositoryConfig};
use crate::db::queries::LockRow;
use crate::db::Database;
use crate::errors::{BridgeError, CommitError, ConfigError, DatabaseError, RevIndexError, SessionError};
use crate::fs::VersionedFs;
use crate::git::GitStore;
use crate::models::{Lock, Revision};
use crate::revindex::RevisionIndex;

/// One configured repository, opened and ready to serve sessions: its Git
/// object store, revision index, per-repository database, and a read view
/// over the two. Shared via `Arc` across every connection that opens it.
pub struct Repository {
    name: String,
    uuid: String,
    git: Arc<GitStore>,
    revindex: Arc<RevisionIndex>,
    db: Arc<Database>,
    fs: VersionedFs,
}

impl Repository {
    /// Open (and catch the revision index up on) a configured repository.
    /// `data_dir` is the daemon's persistent state directory; this
    /// repository's SQLite database lives at `<data_dir>/<name>.sqlite3`.
    pub fn open(cfg: &RepositoryConfig, data_dir: &Path) -> Result<Self, BridgeError> {
        let git = Arc::new(GitStore::open(&cfg.git_path)?);

        std::fs::create_dir_all(data_dir).map_err(ConfigError::IoError)?;
        let db_path = data_dir.join(format!("{}.sqlite3", cfg.name));
        let db = Arc::new(Database::new(&db_path)?);
        db.initialize()?;

        let uuid = match &cfg.uuid {
            Some(u) => u.clone(),
            None => load_or_assign_uuid(&db)?,
        };

        let revindex = Arc::new(RevisionIndex::new(
            db.clone(),
            git.clone(),
            &cfg.name,
            &cfg.tracked_ref,
        ));
        let assigned = revindex.observe_new_commits()?;
        info!(
            repo = %cfg.name,
            new_revisions = assigned.len(),
            uuid = %uuid,
            "repository opened"
        );

        let fs = VersionedFs::new(git.clone(), revindex.clone());

        Ok(Self {
            name: cfg.name.clone(),
            uuid,
            git,
            revindex,
            db,
            fs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn git(&self) -> &Arc<GitStore> {
        &self.git
    }

    pub fn revindex(&self) -> &Arc<RevisionIndex> {
        &self.revindex
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn fs(&self) -> &VersionedFs {
        &self.fs
    }

    /// Re-walk the tracked ref for commits made since the index was last
    /// observed -- by another writer, or by this daemon's own commit
    /// builder advancing the ref.
    pub fn refresh(&self) -> Result<Vec<Revision>, RevIndexError> {
        self.revindex.observe_new_commits()
    }

    // -- locks ---------------------------------------------------------

    /// Acquire a lock on `path`. `steal` bypasses ownership (the `svn lock
    /// --force` case); otherwise an existing lock owned by someone else is
    /// denied.
    pub fn lock(
        &self,
        path: &str,
        owner: &str,
        comment: Option<&str>,
        steal: bool,
    ) -> Result<Lock, CommitError> {
        if let Some(existing) = self.db.get_lock(path)? {
            if !steal && existing.owner != owner {
                return Err(CommitError::LockDenied(path.to_string()));
            }
            self.db.remove_lock(&existing.path, &existing.token)?;
        }
        let token = format!("opaquelocktoken:{}", Uuid::new_v4());
        self.db.create_lock(path, &token, owner, comment)?;
        let row = self
            .db
            .get_lock(path)?
            .expect("lock row just inserted under the same path");
        Ok(row_to_lock(row))
    }

    /// Release a lock. `force` bypasses both token and ownership checks
    /// (the `svn unlock --force` / admin-break-lock case).
    pub fn unlock(&self, path: &str, token: &str, owner: &str, force: bool) -> Result<(), CommitError> {
        let Some(existing) = self.db.get_lock(path)? else {
            return Err(CommitError::LockDenied(path.to_string()));
        };
        if !force && existing.token != token && existing.owner != owner {
            return Err(CommitError::LockDenied(path.to_string()));
        }
        self.db.remove_lock(path, &existing.token)?;
        Ok(())
    }

    /// Fail the commit builder's lock-token check for `path`: `None` if
    /// unlocked or the caller supplied the matching token.
    pub fn check_lock_token(&self, path: &str, supplied_token: Option<&str>) -> Result<(), CommitError> {
        match self.db.get_lock(path)? {
            None => Ok(()),
            Some(lock) if Some(lock.token.as_str()) == supplied_token => Ok(()),
            Some(_) => Err(CommitError::LockDenied(path.to_string())),
        }
    }

    pub fn get_lock(&self, path: &str) -> Result<Option<Lock>, DatabaseError> {
        Ok(self.db.get_lock(path)?.map(row_to_lock))
    }

    pub fn list_locks(&self, path_prefix: &str) -> Result<Vec<Lock>, DatabaseError> {
        Ok(self
            .db
            .list_locks(path_prefix)?
            .into_iter()
            .map(row_to_lock)
            .collect())
    }
}

fn load_or_assign_uuid(db: &Database) -> Result<String, DatabaseError> {
    if let Some(existing) = db.get_repo_meta("uuid")? {
        return Ok(existing);
    }
    let generated = Uuid::new_v4().to_string();
    db.set_repo_meta("uuid", &generated)?;
    Ok(generated)
}

fn row_to_lock(row: LockRow) -> Lock {
    Lock {
        path: row.path,
        token: row.token,
        owner: row.owner,
        comment: row.comment,
        created_at: DateTime::parse_from_rfc3339(&row.created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    }
}

/// A registry of opened repositories, keyed by their configured name, shared
/// by every daemon connection. Repositories are opened eagerly at startup;
/// the session engine's `reparent` and the client's initial URL both resolve
/// through this registry.
pub struct RepositoryRegistry {
    repos: HashMap<String, Arc<Repository>>,
}

impl RepositoryRegistry {
    pub fn open_all(config: &AppConfig) -> Result<Self, BridgeError> {
        let mut repos = HashMap::new();
        for repo_cfg in &config.repositories {
            let repo = Repository::open(repo_cfg, &config.daemon.data_dir)?;
            repos.insert(repo_cfg.name.clone(), Arc::new(repo));
        }
        Ok(Self { repos })
    }

    pub fn get(&self, name: &str) -> Result<Arc<Repository>, SessionError> {
        self.repos
            .get(name)
            .cloned()
            .ok_or_else(|| SessionError::RepositoryNotFound(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.repos.keys().map(|s| s.as_str())
    }

    /// Re-observe new commits across every open repository. Called on a
    /// timer by the daemon so externally-pushed commits (not made through
    /// this server's own commit builder) still advance the revision index.
    pub fn refresh_all(&self) {
        for (name, repo) in &self.repos {
            if let Err(e) = repo.refresh() {
                tracing::warn!(repo = name.as_str(), error = %e, "failed to refresh revision index");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, AuthMode, DaemonConfig, IdentityConfig};

    fn init_bare_repo(dir: &Path) {
        git2::Repository::init(dir).unwrap();
        let git = GitStore::open(dir).unwrap();
        let blob = git.write_blob(b"hello").unwrap();
        let mut files = std::collections::BTreeMap::new();
        files.insert("trunk/a.txt".to_string(), (blob, false));
        let tree = git.write_tree(&files).unwrap();
        let commit = git
            .write_commit(&tree, None, "Alice", "alice@example.com", "init")
            .unwrap();
        git.compare_and_swap_ref("refs/heads/master", None, &commit)
            .unwrap();
    }

    fn test_config(repo_dir: &Path, data_dir: &Path) -> AppConfig {
        AppConfig {
            daemon: DaemonConfig {
                listen: "127.0.0.1:3690".to_string(),
                log_level: "info".to_string(),
                data_dir: data_dir.to_path_buf(),
                idle_timeout_secs: 60,
                editor_timeout_secs: 600,
                max_rebase_retries: 3,
            },
            repositories: vec![RepositoryConfig {
                name: "demo".to_string(),
                git_path: repo_dir.to_path_buf(),
                tracked_ref: "refs/heads/master".to_string(),
                uuid: None,
                properties_override_file: None,
            }],
            auth: AuthConfig {
                mode: AuthMode::Anonymous,
                allow_anonymous_read: true,
                password_file: None,
                ldap_url: None,
                ldap_base_dn: None,
                ldap_bind_dn: None,
                ldap_bind_password_env: None,
                ldap_bind_password: None,
            },
            identity: IdentityConfig {
                mapping_file: None,
                email_domain: None,
                ldap_url: None,
                ldap_base_dn: None,
                ldap_bind_dn: None,
                ldap_bind_password_env: None,
                ldap_bind_password: None,
            },
            resolved_secrets: std::collections::HashMap::new(),
        }
    }

    #[test]
    fn test_open_assigns_uuid_and_indexes_revisions() {
        let repo_dir = tempfile::tempdir().unwrap();
        let data_dir = tempfile::tempdir().unwrap();
        init_bare_repo(repo_dir.path());

        let cfg = test_config(repo_dir.path(), data_dir.path());
        let repo = Repository::open(&cfg.repositories[0], &cfg.daemon.data_dir).unwrap();
        assert!(!repo.uuid().is_empty());
        assert_eq!(repo.revindex().latest().unwrap(), 1);
    }

    #[test]
    fn test_registry_lookup() {
        let repo_dir = tempfile::tempdir().unwrap();
        let data_dir = tempfile::tempdir().unwrap();
        init_bare_repo(repo_dir.path());
        let cfg = test_config(repo_dir.path(), data_dir.path());

        let registry = RepositoryRegistry::open_all(&cfg).unwrap();
        assert!(registry.get("demo").is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(SessionError::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn test_lock_and_unlock() {
        let repo_dir = tempfile::tempdir().unwrap();
        let data_dir = tempfile::tempdir().unwrap();
        init_bare_repo(repo_dir.path());
        let cfg = test_config(repo_dir.path(), data_dir.path());
        let repo = Repository::open(&cfg.repositories[0], &cfg.daemon.data_dir).unwrap();

        let lock = repo.lock("/trunk/a.txt", "alice", Some("editing"), false).unwrap();
        assert_eq!(lock.owner, "alice");

        // Bob can't lock without stealing.
        assert!(repo.lock("/trunk/a.txt", "bob", None, false).is_err());
        // Bob can steal it.
        let stolen = repo.lock("/trunk/a.txt", "bob", None, true).unwrap();
        assert_eq!(stolen.owner, "bob");

        repo.unlock("/trunk/a.txt", &stolen.token, "bob", false).unwrap();
        assert!(repo.get_lock("/trunk/a.txt").unwrap().is_none());
    }
}
