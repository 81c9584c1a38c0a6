//! TOML-based configuration system for svnbridge.
//!
//! All sensitive values (passwords, bind credentials) are stored as `_env`
//! fields that reference environment variable names. The actual secrets are
//! resolved at runtime via [`AppConfig::resolve_env_vars`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon / listener settings.
    pub daemon: DaemonConfig,

    /// Repository registry.
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,

    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Identity mapping settings.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Resolved secrets cache (not serialized).
    #[serde(skip)]
    pub resolved_secrets: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon / listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Address and port to bind the svn:// listener to (default
    /// `0.0.0.0:3690`).
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (per-repository SQLite databases).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Idle read timeout between commands, in seconds (default 60).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Maximum total duration of an in-flight editor session, in seconds
    /// (default 600 = 10 minutes).
    #[serde(default = "default_editor_timeout_secs")]
    pub editor_timeout_secs: u64,

    /// Maximum number of rebase-and-retry attempts on a compare-and-swap
    /// ref update conflict (default 3).
    #[serde(default = "default_max_rebase_retries")]
    pub max_rebase_retries: u32,
}

fn default_listen() -> String {
    "0.0.0.0:3690".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/svnbridge")
}
fn default_idle_timeout_secs() -> u64 {
    60
}
fn default_editor_timeout_secs() -> u64 {
    600
}
fn default_max_rebase_retries() -> u32 {
    3
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            idle_timeout_secs: default_idle_timeout_secs(),
            editor_timeout_secs: default_editor_timeout_secs(),
            max_rebase_retries: default_max_rebase_retries(),
        }
    }
}

// ---------------------------------------------------------------------------
// Repository registry
// ---------------------------------------------------------------------------

/// A single named repository served over svn://.
///
/// The first path segment of a client's `svn://host/<name>/...` URL selects
/// the repository by `name`. A server with exactly one entry named `""` runs
/// in single-repository mode: the whole server is rooted at `/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Repository name, used as the first URL path segment.
    pub name: String,

    /// Path to the bare (or non-bare) Git repository on disk.
    pub git_path: PathBuf,

    /// Ref to present as the SVN history (default `refs/heads/master`).
    #[serde(default = "default_tracked_ref")]
    pub tracked_ref: String,

    /// Optional explicit UUID. If absent, one is derived from the root
    /// commit on first observation, or generated and persisted.
    #[serde(default)]
    pub uuid: Option<String>,

    /// Optional `.gitproperties`-style override file path, relative to the
    /// repository root, for explicit per-path `svn:*` property overrides.
    #[serde(default)]
    pub properties_override_file: Option<String>,
}

fn default_tracked_ref() -> String {
    "refs/heads/master".into()
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Authentication mode offered to connecting clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Only `ANONYMOUS` is offered; every user is the configured anonymous
    /// identity.
    Anonymous,
    /// `CRAM-MD5` against a password file, plus `ANONYMOUS` if
    /// `allow_anonymous_read` is set.
    #[default]
    Simple,
    /// `CRAM-MD5` resolved through the pluggable LDAP-style resolver.
    Ldap,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Authentication mode.
    #[serde(default)]
    pub mode: AuthMode,

    /// Whether anonymous read access is permitted alongside authenticated
    /// write access (irrelevant when `mode = anonymous`).
    #[serde(default)]
    pub allow_anonymous_read: bool,

    /// Path to the CRAM-MD5 password file (`username:password` lines,
    /// bcrypt-hashed at rest), used when `mode = simple`.
    #[serde(default)]
    pub password_file: Option<PathBuf>,

    /// LDAP server URL, used when `mode = ldap`.
    #[serde(default)]
    pub ldap_url: Option<String>,

    /// LDAP search base DN.
    #[serde(default)]
    pub ldap_base_dn: Option<String>,

    /// LDAP bind DN for authenticated queries.
    #[serde(default)]
    pub ldap_bind_dn: Option<String>,

    /// Environment variable holding the LDAP bind password.
    #[serde(default)]
    pub ldap_bind_password_env: Option<String>,

    /// Resolved LDAP bind password.
    #[serde(skip)]
    pub ldap_bind_password: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            allow_anonymous_read: false,
            password_file: None,
            ldap_url: None,
            ldap_base_dn: None,
            ldap_bind_dn: None,
            ldap_bind_password_env: None,
            ldap_bind_password: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identity mapping configuration for translating SVN usernames to/from Git
/// author information.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IdentityConfig {
    /// Path to the TOML identity mapping file.
    #[serde(default)]
    pub mapping_file: Option<PathBuf>,

    /// Default email domain used when constructing emails from SVN usernames
    /// (e.g. `example.com` produces `jdoe@example.com`).
    #[serde(default)]
    pub email_domain: Option<String>,

    /// Optional LDAP server URL for on-the-fly lookups.
    #[serde(default)]
    pub ldap_url: Option<String>,

    /// LDAP search base DN.
    #[serde(default)]
    pub ldap_base_dn: Option<String>,

    /// LDAP bind DN for authenticated queries.
    #[serde(default)]
    pub ldap_bind_dn: Option<String>,

    /// Environment variable holding the LDAP bind password.
    #[serde(default)]
    pub ldap_bind_password_env: Option<String>,

    /// Resolved LDAP bind password.
    #[serde(skip)]
    pub ldap_bind_password: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables and populate the
    /// corresponding resolved fields.
    ///
    /// Fields that reference a missing variable will log a warning but will
    /// **not** fail -- callers can check the `Option` fields and decide what
    /// is required for their execution mode (e.g. `mode = ldap` requires
    /// `ldap_bind_password` to actually resolve).
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        if let Some(ref env_name) = self.auth.ldap_bind_password_env {
            self.auth.ldap_bind_password =
                resolve_optional_env(env_name, "auth.ldap_bind_password_env");
        }

        if let Some(ref env_name) = self.identity.ldap_bind_password_env {
            self.identity.ldap_bind_password =
                resolve_optional_env(env_name, "identity.ldap_bind_password_env");
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repositories.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "repositories".into(),
                detail: "at least one repository must be configured".into(),
            });
        }

        let mut seen_names = std::collections::HashSet::new();
        for repo in &self.repositories {
            if !seen_names.insert(repo.name.clone()) {
                return Err(ConfigError::InvalidValue {
                    field: "repositories[].name".into(),
                    detail: format!("duplicate repository name '{}'", repo.name),
                });
            }
            if repo.git_path.as_os_str().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "repositories[].git_path".into(),
                    detail: format!("repository '{}' has an empty git_path", repo.name),
                });
            }
        }

        if self.daemon.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.idle_timeout_secs".into(),
                detail: "idle timeout must be > 0".into(),
            });
        }
        if self.daemon.editor_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.editor_timeout_secs".into(),
                detail: "editor session timeout must be > 0".into(),
            });
        }

        match self.auth.mode {
            AuthMode::Simple => {
                if self.auth.password_file.is_none() {
                    return Err(ConfigError::InvalidValue {
                        field: "auth.password_file".into(),
                        detail: "auth.mode = \"simple\" requires auth.password_file".into(),
                    });
                }
            }
            AuthMode::Ldap => {
                if self.auth.ldap_url.is_none() {
                    return Err(ConfigError::InvalidValue {
                        field: "auth.ldap_url".into(),
                        detail: "auth.mode = \"ldap\" requires auth.ldap_url".into(),
                    });
                }
            }
            AuthMode::Anonymous => {}
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Find a repository by name, or `None` if not configured.
    pub fn repository(&self, name: &str) -> Option<&RepositoryConfig> {
        self.repositories.iter().find(|r| r.name == name)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[daemon]
listen = "0.0.0.0:3690"
log_level = "debug"
data_dir = "/tmp/svnbridge"
idle_timeout_secs = 30
editor_timeout_secs = 120

[[repositories]]
name = "main"
git_path = "/srv/git/main.git"
tracked_ref = "refs/heads/master"

[[repositories]]
name = "other"
git_path = "/srv/git/other.git"

[auth]
mode = "simple"
password_file = "/etc/svnbridge/passwd"
allow_anonymous_read = true

[identity]
mapping_file = "/etc/svnbridge/authors.toml"
email_domain = "example.com"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.daemon.listen, "0.0.0.0:3690");
        assert_eq!(config.repositories.len(), 2);
        assert_eq!(config.repositories[0].name, "main");
        assert_eq!(config.repositories[1].tracked_ref, "refs/heads/master");
        assert_eq!(config.auth.mode, AuthMode::Simple);
        assert!(config.auth.allow_anonymous_read);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.daemon.log_level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_empty_repositories() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.repositories.clear();
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "repositories"
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.repositories[1].name = "main".into();
        let result = config.validate();
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_requires_password_file_for_simple_auth() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.auth.password_file = None;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "auth.password_file"
        ));
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("TEST_LDAP_PW", "s3cret");

        let toml_str = r#"
[daemon]
[[repositories]]
name = "main"
git_path = "/srv/git/main.git"
[auth]
mode = "ldap"
ldap_url = "ldap://localhost"
ldap_bind_password_env = "TEST_LDAP_PW"
"#;
        let mut config: AppConfig = toml::from_str(toml_str).unwrap();
        config.resolve_env_vars().unwrap();

        assert_eq!(config.auth.ldap_bind_password.as_deref(), Some("s3cret"));

        std::env::remove_var("TEST_LDAP_PW");
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[daemon]
[[repositories]]
name = "main"
git_path = "/srv/git/main.git"
[auth]
mode = "anonymous"
"#;
        let config: AppConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.daemon.listen, "0.0.0.0:3690");
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.idle_timeout_secs, 60);
        assert_eq!(config.daemon.editor_timeout_secs, 600);
        assert_eq!(config.daemon.max_rebase_retries, 3);
        assert_eq!(config.repositories[0].tracked_ref, "refs/heads/master");
    }

    #[test]
    fn test_repository_lookup() {
        let config: AppConfig = toml::from_str(sample_toml()).unwrap();
        assert!(config.repository("main").is_some());
        assert!(config.repository("missing").is_none());
    }
}
