// src/db/models.rs

//! Typed queries over the state database

use crate::archive::{FileKind, Manifest, ManifestEntry};
use crate::error::{Error, Result};
use crate::universe::{Dependency, InstalledPackage, Origin, PackageRecord, Pins};
use crate::version::{Constraint, Version};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

fn deps_to_json(deps: &[Dependency]) -> String {
    let strings: Vec<String> = deps.iter().map(|d| d.to_string()).collect();
    serde_json::to_string(&strings).expect("string vec serializes")
}

fn deps_from_json(text: &str) -> Result<Vec<Dependency>> {
    let strings: Vec<String> = serde_json::from_str(text)
        .map_err(|e| Error::Config(format!("corrupt dependency list in database: {e}")))?;
    crate::universe::parse_deps(&strings)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<(PackageRecord, i64, bool)> {
    let version: String = row.get("version")?;
    let requires: String = row.get("requires")?;
    let provides: String = row.get("provides")?;
    let conflicts: String = row.get("conflicts")?;
    let obsoletes: String = row.get("obsoletes")?;
    let recommends: String = row.get("recommends")?;
    let suggests: String = row.get("suggests")?;

    let parse = |text: &str, idx: usize| {
        deps_from_json(text).map_err(|_| {
            rusqlite::Error::InvalidColumnType(idx, "deps".into(), rusqlite::types::Type::Text)
        })
    };

    let record = PackageRecord {
        name: row.get("name")?,
        version: Version::parse(&version).map_err(|_| {
            rusqlite::Error::InvalidColumnType(1, "version".into(), rusqlite::types::Type::Text)
        })?,
        release: row.get("release")?,
        arch: row.get("arch")?,
        summary: row.get("summary")?,
        homepage: row.get("homepage")?,
        license: row.get("license")?,
        requires: parse(&requires, 7)?,
        provides: parse(&provides, 8)?,
        conflicts: parse(&conflicts, 9)?,
        obsoletes: parse(&obsoletes, 10)?,
        recommends: parse(&recommends, 11)?,
        suggests: parse(&suggests, 12)?,
        blob_name: row.get("blob_name")?,
        blob_size: row.get::<_, i64>("blob_size")? as u64,
        blob_sha256: row.get("blob_sha256")?,
        signature: row.get("signature")?,
        repo_name: row.get("repo_name")?,
        repo_priority: row.get("repo_priority")?,
        bias: None,
        decay: None,
        origin: Origin::Installed,
    };
    let install_time: i64 = row.get("install_time")?;
    let explicit: bool = row.get::<_, i64>("explicit_install")? != 0;
    Ok((record, install_time, explicit))
}

/// Record (or replace) an installed package with its manifest. The caller
/// wraps this in a SQLite transaction together with the history row.
pub fn upsert_package(
    conn: &Connection,
    pkg: &PackageRecord,
    manifest: &Manifest,
    explicit: bool,
) -> Result<()> {
    conn.execute(
        "REPLACE INTO packages (
            name, version, release, arch, summary, homepage, license,
            requires, provides, conflicts, obsoletes, recommends, suggests,
            blob_name, blob_size, blob_sha256, signature,
            repo_name, repo_priority, install_time, explicit_install
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                  ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
        params![
            pkg.name,
            pkg.version.to_string(),
            pkg.release,
            pkg.arch,
            pkg.summary,
            pkg.homepage,
            pkg.license,
            deps_to_json(&pkg.requires),
            deps_to_json(&pkg.provides),
            deps_to_json(&pkg.conflicts),
            deps_to_json(&pkg.obsoletes),
            deps_to_json(&pkg.recommends),
            deps_to_json(&pkg.suggests),
            pkg.blob_name,
            pkg.blob_size as i64,
            pkg.blob_sha256,
            pkg.signature,
            pkg.repo_name,
            pkg.repo_priority,
            Utc::now().timestamp(),
            explicit as i64,
        ],
    )?;

    conn.execute("DELETE FROM files WHERE package = ?1", params![pkg.name])?;
    {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO files (package, path, kind, mode, uid, gid, size, sha256, link_target)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for entry in manifest {
            let kind = match entry.kind {
                FileKind::File => "file",
                FileKind::Directory => "directory",
                FileKind::Symlink => "symlink",
            };
            stmt.execute(params![
                pkg.name,
                entry.path,
                kind,
                entry.mode,
                entry.uid,
                entry.gid,
                entry.size.map(|s| s as i64),
                entry.sha256,
                entry.link_target,
            ])?;
        }
    }

    conn.execute(
        "DELETE FROM provides_index WHERE package = ?1",
        params![pkg.name],
    )?;
    {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO provides_index (capability, version, package) VALUES (?1, ?2, ?3)",
        )?;
        // The package name itself is a capability
        stmt.execute(params![pkg.name, pkg.version.to_string(), pkg.name])?;
        for p in &pkg.provides {
            let version = p.constraint.as_ref().map(|c| c.version.to_string());
            stmt.execute(params![p.name, version, pkg.name])?;
        }
    }
    Ok(())
}

/// Delete an installed package; files and provides rows cascade
pub fn remove_package(conn: &Connection, name: &str) -> Result<()> {
    conn.execute("DELETE FROM packages WHERE name = ?1", params![name])?;
    Ok(())
}

/// Look up one installed package
pub fn get_package(conn: &Connection, name: &str) -> Result<Option<InstalledPackage>> {
    let row = conn
        .query_row(
            "SELECT * FROM packages WHERE name = ?1",
            params![name],
            record_from_row,
        )
        .optional()?;
    Ok(row.map(|(record, install_time, explicit)| InstalledPackage {
        record,
        install_time,
        explicit,
    }))
}

/// Every installed package, ordered by name
pub fn all_packages(conn: &Connection) -> Result<Vec<InstalledPackage>> {
    let mut stmt = conn.prepare("SELECT * FROM packages ORDER BY name")?;
    let rows = stmt.query_map([], record_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        let (record, install_time, explicit) = row?;
        out.push(InstalledPackage {
            record,
            install_time,
            explicit,
        });
    }
    Ok(out)
}

/// Mark a package as explicitly requested (or not)
pub fn set_explicit(conn: &Connection, name: &str, explicit: bool) -> Result<()> {
    conn.execute(
        "UPDATE packages SET explicit_install = ?2 WHERE name = ?1",
        params![name, explicit as i64],
    )?;
    Ok(())
}

/// Stored manifest of an installed package, in insertion order
pub fn manifest_for(conn: &Connection, name: &str) -> Result<Manifest> {
    let mut stmt = conn.prepare(
        "SELECT path, kind, mode, uid, gid, size, sha256, link_target
         FROM files WHERE package = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![name], |row| {
        let kind: String = row.get("kind")?;
        Ok(ManifestEntry {
            path: row.get("path")?,
            kind: match kind.as_str() {
                "directory" => FileKind::Directory,
                "symlink" => FileKind::Symlink,
                _ => FileKind::File,
            },
            mode: row.get("mode")?,
            uid: row.get("uid")?,
            gid: row.get("gid")?,
            size: row.get::<_, Option<i64>>("size")?.map(|s| s as u64),
            sha256: row.get("sha256")?,
            link_target: row.get("link_target")?,
        })
    })?;
    let mut out = Manifest::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Which installed package owns a path
pub fn owner_of_path(conn: &Connection, path: &str) -> Result<Option<String>> {
    let owner = conn
        .query_row(
            "SELECT package FROM files WHERE path = ?1 LIMIT 1",
            params![path],
            |row| row.get(0),
        )
        .optional()?;
    Ok(owner)
}

/// Installed packages whose requirements the named package satisfies
pub fn reverse_dependencies(conn: &Connection, name: &str) -> Result<Vec<String>> {
    let Some(target) = get_package(conn, name)? else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for pkg in all_packages(conn)? {
        if pkg.record.name == name {
            continue;
        }
        if pkg
            .record
            .requires
            .iter()
            .any(|req| target.record.satisfies(req))
        {
            out.push(pkg.record.name);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// History

/// Kind of a history row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    Install,
    Upgrade,
    Remove,
    Rollback,
    Abort,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Upgrade => "upgrade",
            Self::Remove => "remove",
            Self::Rollback => "rollback",
            Self::Abort => "abort",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "install" => Self::Install,
            "upgrade" => Self::Upgrade,
            "remove" => Self::Remove,
            "rollback" => Self::Rollback,
            _ => Self::Abort,
        }
    }
}

/// One recorded history event
#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub id: i64,
    pub ts: i64,
    pub kind: HistoryKind,
    pub package: String,
    pub old_version: Option<String>,
    pub new_version: Option<String>,
    pub snapshot_id: Option<i64>,
}

/// Append a history row, returning its id
pub fn record_history(
    conn: &Connection,
    kind: HistoryKind,
    package: &str,
    old_version: Option<&str>,
    new_version: Option<&str>,
    snapshot_id: Option<i64>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO history (ts, kind, package, old_version, new_version, snapshot_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            Utc::now().timestamp(),
            kind.as_str(),
            package,
            old_version,
            new_version,
            snapshot_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent history rows, newest first
pub fn history_tail(conn: &Connection, limit: usize) -> Result<Vec<HistoryRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, ts, kind, package, old_version, new_version, snapshot_id
         FROM history ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        let kind: String = row.get("kind")?;
        Ok(HistoryRow {
            id: row.get("id")?,
            ts: row.get("ts")?,
            kind: HistoryKind::parse(&kind),
            package: row.get("package")?,
            old_version: row.get("old_version")?,
            new_version: row.get("new_version")?,
            snapshot_id: row.get("snapshot_id")?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Pins

/// Pins stored in the database
pub fn load_pins(conn: &Connection) -> Result<Pins> {
    let mut pins = Pins::default();
    let mut stmt = conn.prepare("SELECT name, kind, constraint_expr FROM pins")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>("name")?,
            row.get::<_, String>("kind")?,
            row.get::<_, Option<String>>("constraint_expr")?,
        ))
    })?;
    for row in rows {
        let (name, kind, expr) = row?;
        match kind.as_str() {
            "hold" => {
                pins.hold.insert(name);
            }
            "prefer" => {
                if let Some(expr) = expr {
                    pins.prefer.insert(name, Constraint::parse(&expr)?);
                }
            }
            _ => {}
        }
    }
    Ok(pins)
}

pub fn set_hold(conn: &Connection, name: &str) -> Result<()> {
    conn.execute(
        "REPLACE INTO pins (name, kind, constraint_expr) VALUES (?1, 'hold', NULL)",
        params![name],
    )?;
    Ok(())
}

pub fn set_prefer(conn: &Connection, name: &str, constraint: &Constraint) -> Result<()> {
    conn.execute(
        "REPLACE INTO pins (name, kind, constraint_expr) VALUES (?1, 'prefer', ?2)",
        params![name, constraint.to_string()],
    )?;
    Ok(())
}

/// Remove every pin for a name, returning how many rows went away
pub fn remove_pin(conn: &Connection, name: &str) -> Result<usize> {
    let n = conn.execute("DELETE FROM pins WHERE name = ?1", params![name])?;
    Ok(n)
}

// ---------------------------------------------------------------------------
// Snapshots

/// One snapshot row
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub id: i64,
    pub ts: i64,
    pub tag: Option<String>,
    pub archive_path: String,
    pub affected_paths: Vec<String>,
}

/// Insert a snapshot row, returning its monotonically increasing id
pub fn insert_snapshot(
    conn: &Connection,
    tag: Option<&str>,
    archive_path: &str,
    affected_paths: &[String],
) -> Result<i64> {
    conn.execute(
        "INSERT INTO snapshots (ts, tag, archive_path, affected_paths)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            Utc::now().timestamp(),
            tag,
            archive_path,
            serde_json::to_string(affected_paths).expect("string vec serializes"),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<SnapshotRow> {
    let affected: String = row.get("affected_paths")?;
    Ok(SnapshotRow {
        id: row.get("id")?,
        ts: row.get("ts")?,
        tag: row.get("tag")?,
        archive_path: row.get("archive_path")?,
        affected_paths: serde_json::from_str(&affected).unwrap_or_default(),
    })
}

/// All snapshots, oldest first
pub fn list_snapshots(conn: &Connection) -> Result<Vec<SnapshotRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, ts, tag, archive_path, affected_paths FROM snapshots ORDER BY id",
    )?;
    let rows = stmt.query_map([], snapshot_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn get_snapshot(conn: &Connection, id: i64) -> Result<Option<SnapshotRow>> {
    let row = conn
        .query_row(
            "SELECT id, ts, tag, archive_path, affected_paths FROM snapshots WHERE id = ?1",
            params![id],
            snapshot_from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn delete_snapshot(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM snapshots WHERE id = ?1", params![id])?;
    Ok(())
}
