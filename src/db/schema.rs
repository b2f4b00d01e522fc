// src/db/schema.rs

//! Database schema and migrations

use crate::error::Result;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Current schema version recorded in the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;
    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Apply all pending migrations
pub fn migrate(conn: &Connection) -> Result<()> {
    let current = get_schema_version(conn)?;
    if current >= SCHEMA_VERSION {
        debug!("schema up to date at version {current}");
        return Ok(());
    }
    for version in (current + 1)..=SCHEMA_VERSION {
        info!("applying schema migration to version {version}");
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }
    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => unreachable!("unknown migration version {version}"),
    }
}

/// Initial schema
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Installed packages, one row per name
        CREATE TABLE packages (
            name TEXT PRIMARY KEY,
            version TEXT NOT NULL,
            release INTEGER NOT NULL,
            arch TEXT NOT NULL,
            summary TEXT NOT NULL DEFAULT '',
            homepage TEXT,
            license TEXT,
            requires TEXT NOT NULL DEFAULT '[]',
            provides TEXT NOT NULL DEFAULT '[]',
            conflicts TEXT NOT NULL DEFAULT '[]',
            obsoletes TEXT NOT NULL DEFAULT '[]',
            recommends TEXT NOT NULL DEFAULT '[]',
            suggests TEXT NOT NULL DEFAULT '[]',
            blob_name TEXT NOT NULL,
            blob_size INTEGER NOT NULL,
            blob_sha256 TEXT NOT NULL,
            signature TEXT,
            repo_name TEXT NOT NULL,
            repo_priority INTEGER NOT NULL DEFAULT 0,
            install_time INTEGER NOT NULL,
            explicit_install INTEGER NOT NULL DEFAULT 0
        );

        -- File-level manifest of every installed package
        CREATE TABLE files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package TEXT NOT NULL REFERENCES packages(name) ON DELETE CASCADE,
            path TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('file', 'directory', 'symlink')),
            mode INTEGER NOT NULL,
            uid INTEGER NOT NULL DEFAULT 0,
            gid INTEGER NOT NULL DEFAULT 0,
            size INTEGER,
            sha256 TEXT,
            link_target TEXT
        );
        CREATE INDEX idx_files_package ON files(package);
        CREATE INDEX idx_files_path ON files(path);

        -- Transaction history
        CREATE TABLE history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts INTEGER NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN
                ('install', 'upgrade', 'remove', 'rollback', 'abort')),
            package TEXT NOT NULL,
            old_version TEXT,
            new_version TEXT,
            snapshot_id INTEGER
        );
        CREATE INDEX idx_history_ts ON history(ts);

        -- Hold and prefer pins
        CREATE TABLE pins (
            name TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('hold', 'prefer')),
            constraint_expr TEXT,
            PRIMARY KEY (name, kind)
        );

        -- Capability index over installed packages
        CREATE TABLE provides_index (
            capability TEXT NOT NULL,
            version TEXT,
            package TEXT NOT NULL REFERENCES packages(name) ON DELETE CASCADE
        );
        CREATE INDEX idx_provides_capability ON provides_index(capability);

        -- Pre-transaction snapshots
        CREATE TABLE snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts INTEGER NOT NULL,
            tag TEXT,
            archive_path TEXT NOT NULL,
            affected_paths TEXT NOT NULL DEFAULT '[]'
        );
        ",
    )?;
    Ok(())
}
