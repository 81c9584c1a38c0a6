//! Comprehensive error types for the svnbridge core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`BridgeError`] enum unifies them all for callers that want a
//! single error type. Session-engine code additionally maps these onto SVN
//! wire error codes (see `session::wire_error`) rather than exposing Rust
//! error strings directly to clients.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    RevIndex(#[from] RevIndexError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Props(#[from] PropsError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

// ---------------------------------------------------------------------------
// Wire codec errors
// ---------------------------------------------------------------------------

/// Errors from the SVN tuple/list/word/number/string wire codec.
///
/// Every variant here is, per the protocol, fatal to the connection: there
/// is no way to resynchronize a byte stream once framing has been violated.
#[derive(Debug, Error)]
pub enum WireError {
    /// Stream ended before a token was fully read.
    #[error("unexpected end of stream while reading {0}")]
    UnexpectedEof(&'static str),

    /// A byte was encountered that cannot start or continue any token.
    #[error("malformed frame: unexpected byte {byte:#04x} at offset {offset}")]
    UnexpectedByte { byte: u8, offset: u64 },

    /// A `number` token was not valid ASCII decimal.
    #[error("malformed frame: invalid number literal '{0}'")]
    InvalidNumber(String),

    /// A length-prefixed `string` declared a length exceeding the configured
    /// safety bound.
    #[error("malformed frame: string length {0} exceeds maximum {1}")]
    StringTooLong(u64, u64),

    /// Nested `list` depth exceeded the configured safety bound.
    #[error("malformed frame: list nesting depth exceeded maximum {0}")]
    ListTooDeep(u32),

    /// The token actually read did not match what the caller expected
    /// (e.g. a `word` was expected but a `list` was found).
    #[error("malformed frame: expected {expected}, found {found}")]
    UnexpectedToken {
        expected: &'static str,
        found: &'static str,
    },

    /// Underlying I/O failure on the socket.
    #[error("wire I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Revision index errors
// ---------------------------------------------------------------------------

/// Errors from the revision index (R ↔ commit mapping).
#[derive(Debug, Error)]
pub enum RevIndexError {
    /// The requested revision has not been assigned.
    #[error("revision {0} not found")]
    RevisionNotFound(u64),

    /// The given commit has not been observed/indexed yet.
    #[error("commit {0} is not indexed")]
    Unindexed(String),

    /// Walking the tracked ref's history failed.
    #[error("failed to walk ref history: {0}")]
    WalkFailed(String),

    /// Underlying Git error while observing new commits.
    #[error("revision index git error: {0}")]
    GitError(#[from] GitError),

    /// Underlying database error while persisting the index.
    #[error("revision index database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Filter chain errors
// ---------------------------------------------------------------------------

/// Errors from the content filter chain (identity / gzip / lfs).
#[derive(Debug, Error)]
pub enum FilterError {
    /// `.gitattributes` referenced a filter name with no known implementation.
    #[error("unknown filter '{0}' referenced in .gitattributes")]
    UnknownFilter(String),

    /// Decoding stored bytes into raw (client-visible) bytes failed.
    #[error("filter '{filter}' failed to decode: {detail}")]
    DecodeFailed { filter: String, detail: String },

    /// Encoding raw bytes into stored bytes failed.
    #[error("filter '{filter}' failed to encode: {detail}")]
    EncodeFailed { filter: String, detail: String },

    /// The path was declared `filter=lfs` but the referenced LFS object is
    /// absent from the blob store. Per the round-trip invariant this must
    /// be a hard error, not a silent fallback to the pointer text.
    #[error("LFS object '{0}' referenced but not present in blob store")]
    LfsObjectMissing(String),

    /// A malformed LFS pointer file could not be parsed.
    #[error("malformed LFS pointer: {0}")]
    MalformedLfsPointer(String),
}

// ---------------------------------------------------------------------------
// Property synthesis errors
// ---------------------------------------------------------------------------

/// Errors from synthesizing SVN properties out of `.gitattributes` /
/// `.gitignore` / `.gitproperties`.
#[derive(Debug, Error)]
pub enum PropsError {
    /// A `.gitattributes`/`.gitignore`/`.gitproperties` blob could not be
    /// read from the object store while walking path prefixes.
    #[error("failed to read {file} at '{path}': {detail}")]
    ReadFailed {
        file: &'static str,
        path: String,
        detail: String,
    },

    /// The optional `.gitproperties`-style override file was malformed.
    #[error("malformed .gitproperties override at '{0}': {1}")]
    MalformedOverrides(String, String),
}

// ---------------------------------------------------------------------------
// Versioned filesystem errors
// ---------------------------------------------------------------------------

/// Errors from path resolution / read operations against the versioned FS.
#[derive(Debug, Error)]
pub enum FsError {
    /// `(rev, path)` does not resolve to any node.
    #[error("path '{path}' not found at revision {rev}")]
    PathNotFound { rev: u64, path: String },

    /// An operation expected a file but found a directory, or vice versa.
    #[error("node kind mismatch at '{path}': expected {expected}, found {found}")]
    NodeKindMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error(transparent)]
    RevIndex(#[from] RevIndexError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Props(#[from] PropsError),

    #[error(transparent)]
    Git(#[from] GitError),
}

// ---------------------------------------------------------------------------
// Commit builder errors
// ---------------------------------------------------------------------------

/// Errors from accepting an editor-drive and assembling a new commit.
#[derive(Debug, Error)]
pub enum CommitError {
    /// An editor operation was sent in a state that does not permit it
    /// (e.g. `applyTextDelta` after `closeFile`).
    #[error("illegal editor state: {0} while in state {1}")]
    IllegalEditorState(&'static str, &'static str),

    /// `applyTextDelta`'s declared base checksum did not match the actual
    /// base content.
    #[error("base checksum mismatch for '{path}': expected {expected}, got {actual}")]
    BaseChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// `textDeltaEnd`'s declared result checksum did not match the
    /// reconstructed content.
    #[error("result checksum mismatch for '{path}': expected {expected}, got {actual}")]
    ResultChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Setting an SVN property that maps to `.gitattributes` semantics
    /// without reconciling `.gitattributes` in the same commit.
    #[error("property conflict on '{path}': {detail}")]
    PropertyConflict { path: String, detail: String },

    /// A path touched by the commit is locked and no matching token was
    /// supplied.
    #[error("path '{0}' is locked")]
    LockDenied(String),

    /// The compare-and-swap ref update lost the race and could not be
    /// resolved by rebase-and-retry.
    #[error("out of date: conflicting paths {0:?}")]
    OutOfDate(Vec<String>),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Props(#[from] PropsError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    RevIndex(#[from] RevIndexError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Report / editor driver errors
// ---------------------------------------------------------------------------

/// Errors from the reporter → editor diff algorithm.
#[derive(Debug, Error)]
pub enum ReportError {
    /// `setPath`/`deletePath` were called after `finishReport`.
    #[error("report already finished")]
    ReportFinished,

    /// `finishReport` was called with no entries reported at all.
    #[error("report has no entries")]
    EmptyReport,

    #[error(transparent)]
    Fs(#[from] FsError),
}

// ---------------------------------------------------------------------------
// Session engine errors
// ---------------------------------------------------------------------------

/// Errors from the per-connection session state machine.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The client requested a protocol version outside the supported range.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(i64),

    /// The client requested a capability the server does not advertise.
    #[error("unsupported capability '{0}'")]
    UnsupportedCapability(String),

    /// Authentication failed (bad credentials, unsupported mechanism, …).
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The command was issued against a path/operation the ACL oracle denies.
    #[error("not authorized: {op} on '{path}'")]
    NotAuthorized { op: String, path: String },

    /// The client went idle (no command) past the configured timeout.
    #[error("session timed out after {0:?} of inactivity")]
    Timeout(std::time::Duration),

    /// An internal error that must never leak host details to the client.
    #[error("internal error")]
    Internal,

    /// `reparent` or the initial URL named a repository the daemon has no
    /// configuration entry for.
    #[error("unknown repository '{0}'")]
    RepositoryNotFound(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    RevIndex(#[from] RevIndexError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

// ---------------------------------------------------------------------------
// Auth / ACL errors
// ---------------------------------------------------------------------------

/// Errors from the authenticator and ACL oracle collaborators.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The requested SASL-style mechanism is not offered by this server.
    #[error("unsupported auth mechanism '{0}'")]
    UnsupportedMechanism(String),

    /// Credentials were rejected.
    #[error("credentials rejected for user '{0}'")]
    Rejected(String),

    /// Anonymous access was attempted but is not configured.
    #[error("anonymous access is not permitted")]
    AnonymousNotPermitted,

    /// The password file could not be loaded.
    #[error("password file error at '{path}': {detail}")]
    PasswordFileError { path: String, detail: String },

    /// The pluggable LDAP-style resolver failed.
    #[error("LDAP auth error: {0}")]
    LdapError(String),
}

// ---------------------------------------------------------------------------
// Git object store errors
// ---------------------------------------------------------------------------

/// Errors from local Git (git2) operations — the object store collaborator.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, tag, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// The compare-and-swap ref update lost a race against a concurrent
    /// writer (before rebase-and-retry is attempted).
    #[error("ref '{ref_name}' changed concurrently: expected {expected}, found {found}")]
    RefChanged {
        ref_name: String,
        expected: String,
        found: String,
    },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error(
        "required environment variable '{var}' is not set (referenced by config field '{field}')"
    )]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Identity errors
// ---------------------------------------------------------------------------

/// Errors from the identity mapping subsystem (SVN username <-> Git author).
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The mapping file could not be loaded.
    #[error("identity mapping file error at '{path}': {detail}")]
    MappingFileError { path: String, detail: String },

    /// No mapping exists for the given SVN user.
    #[error("no git identity mapping for svn user '{0}'")]
    SvnUserNotFound(String),

    /// No mapping exists for the given Git identity.
    #[error("no svn user mapping for git identity '{name} <{email}>'")]
    GitIdentityNotFound { name: String, email: String },

    /// LDAP connection or query error.
    #[error("LDAP error: {0}")]
    LdapError(String),

    /// TOML parse error when reading the mapping file.
    #[error("identity mapping parse error: {0}")]
    ParseError(String),

    /// Generic I/O error.
    #[error("identity I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = RevIndexError::RevisionNotFound(42);
        assert_eq!(err.to_string(), "revision 42 not found");

        let err = GitError::RepositoryNotFound("/tmp/repo".into());
        assert_eq!(err.to_string(), "git repository not found at '/tmp/repo'");

        let err = ConfigError::EnvVarMissing {
            var: "SVNBRIDGE_ADMIN_PASSWORD".into(),
            field: "auth.admin_password_env".into(),
        };
        assert!(err.to_string().contains("SVNBRIDGE_ADMIN_PASSWORD"));

        let err = CommitError::OutOfDate(vec!["/trunk/a.txt".into()]);
        assert!(err.to_string().contains("out of date"));
    }

    #[test]
    fn test_bridge_error_from_subsystem() {
        let rev_err = RevIndexError::RevisionNotFound(1);
        let bridge_err: BridgeError = rev_err.into();
        assert!(matches!(bridge_err, BridgeError::RevIndex(_)));

        let db_err = DatabaseError::NotFound {
            entity: "revision".into(),
            id: "abc".into(),
        };
        let bridge_err: BridgeError = BridgeError::Database(db_err);
        assert!(matches!(bridge_err, BridgeError::Database(_)));
    }

    #[test]
    fn test_fs_error_wraps_subsystems() {
        let filter_err = FilterError::UnknownFilter("rot13".into());
        let fs_err: FsError = filter_err.into();
        assert!(matches!(fs_err, FsError::Filter(_)));
    }
}
