//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `schema_version`
//! user-version pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1. The current schema version is stored in the SQLite
/// `user_version` pragma.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS revisions (
            rev         INTEGER PRIMARY KEY,
            commit_sha  TEXT    NOT NULL UNIQUE,
            author      TEXT    NOT NULL DEFAULT '',
            message     TEXT    NOT NULL DEFAULT '',
            date        TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_revisions_commit_sha ON revisions (commit_sha);

        CREATE TABLE IF NOT EXISTS changed_paths (
            rev             INTEGER NOT NULL,
            path            TEXT    NOT NULL,
            action          TEXT    NOT NULL CHECK (action IN ('added', 'deleted', 'modified', 'replaced')),
            copy_from_path  TEXT,
            copy_from_rev   INTEGER,
            PRIMARY KEY (rev, path)
        );

        CREATE INDEX IF NOT EXISTS idx_changed_paths_path ON changed_paths (path);

        CREATE TABLE IF NOT EXISTS rev_props (
            repo    TEXT    NOT NULL,
            rev     INTEGER NOT NULL,
            name    TEXT    NOT NULL,
            value   BLOB    NOT NULL,
            PRIMARY KEY (repo, rev, name)
        );

        CREATE TABLE IF NOT EXISTS locks (
            path        TEXT PRIMARY KEY,
            token       TEXT NOT NULL UNIQUE,
            owner       TEXT NOT NULL,
            comment     TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS filter_cache (
            blob_sha    TEXT NOT NULL,
            chain_hash  TEXT NOT NULL,
            md5         TEXT NOT NULL,
            size        INTEGER NOT NULL,
            PRIMARY KEY (blob_sha, chain_hash)
        );

        CREATE TABLE IF NOT EXISTS repo_meta (
            key     TEXT PRIMARY KEY,
            value   TEXT NOT NULL
        );
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
