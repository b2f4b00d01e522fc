// src/db/mod.rs

//! SQLite state database
//!
//! Single-writer, multi-reader store for installed packages, their file
//! manifests, history, pins, the provides index, and snapshot rows. All
//! mutations for one package are wrapped in a single SQLite transaction by
//! the caller so a crash never leaves a half-recorded package.

pub mod models;
pub mod schema;

use crate::config::Config;
use crate::error::Result;
use rusqlite::Connection;
use std::fs;
use std::path::Path;

/// Open (and migrate) the state database for a target root
pub fn open(config: &Config) -> Result<Connection> {
    open_at(&config.db_path())
}

/// Open a database at an explicit path, creating parents as needed
pub fn open_at(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    schema::migrate(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub(crate) fn open_memory() -> Connection {
    let conn = Connection::open_in_memory().expect("in-memory database");
    conn.pragma_update(None, "foreign_keys", "ON").unwrap();
    schema::migrate(&conn).unwrap();
    conn
}
