// src/snapshot/mod.rs

//! Pre-transaction snapshots and rollback
//!
//! Before any filesystem mutation the controller collects the union of
//! manifest paths about to be removed or overwritten and archives their
//! current contents into `snapshots/<id>.tar.zst`. Restore deletes the
//! new-side files first and then replays the archive into the target root;
//! restoration itself is never snapshotted.

use crate::config::Config;
use crate::db::models::{self, SnapshotRow};
use crate::error::{Error, Result};
use rusqlite::Connection;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Snapshot creation, restoration, and pruning for one target root
pub struct SnapshotEngine<'a> {
    config: &'a Config,
}

impl<'a> SnapshotEngine<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    fn archive_path(&self, id: i64) -> PathBuf {
        self.config.snapshot_dir().join(format!("{id}.tar.zst"))
    }

    /// Archive the current contents of `affected` (paths relative to the
    /// target root, leading slash) and record the snapshot row. The archive
    /// is test-opened before the snapshot is considered good.
    pub fn create(
        &self,
        conn: &Connection,
        tag: Option<&str>,
        affected: &[String],
    ) -> Result<i64> {
        fs::create_dir_all(self.config.snapshot_dir())?;

        let id = models::insert_snapshot(conn, tag, "", affected)?;
        let archive_path = self.archive_path(id);
        conn.execute(
            "UPDATE snapshots SET archive_path = ?2 WHERE id = ?1",
            rusqlite::params![id, archive_path.to_string_lossy()],
        )?;
        // Flush the WAL so an archived state.db is self-contained
        let _ = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()));

        let out = File::create(&archive_path)
            .map_err(|e| Error::Snapshot(format!("create {}: {e}", archive_path.display())))?;
        let encoder = zstd::Encoder::new(out, 0)
            .map_err(|e| Error::Snapshot(format!("zstd encoder: {e}")))?;
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let mut archived = 0usize;
        for path in affected {
            let rel = path.trim_start_matches('/');
            let source = self.config.root.join(rel);
            if source.symlink_metadata().is_err() {
                continue;
            }
            builder
                .append_path_with_name(&source, rel)
                .map_err(|e| Error::Snapshot(format!("archive {}: {e}", source.display())))?;
            archived += 1;
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| Error::Snapshot(format!("finish tar: {e}")))?;
        encoder
            .finish()
            .map_err(|e| Error::Snapshot(format!("finish zstd: {e}")))?
            .sync_all()
            .map_err(|e| Error::Snapshot(format!("sync: {e}")))?;

        self.test_open(&archive_path)?;

        info!(
            "snapshot {id}: archived {archived} of {} affected paths",
            affected.len()
        );
        Ok(id)
    }

    /// Validate that the snapshot archive opens and its headers parse
    fn test_open(&self, path: &Path) -> Result<()> {
        let file = File::open(path)
            .map_err(|e| Error::Snapshot(format!("reopen {}: {e}", path.display())))?;
        let decoder =
            zstd::Decoder::new(file).map_err(|e| Error::Snapshot(format!("zstd: {e}")))?;
        let mut archive = tar::Archive::new(decoder);
        let mut entries = archive
            .entries()
            .map_err(|e| Error::Snapshot(format!("tar: {e}")))?;
        if let Some(first) = entries.next() {
            first.map_err(|e| Error::Snapshot(format!("corrupt snapshot header: {e}")))?;
        }
        Ok(())
    }

    /// Restore a snapshot: delete the new side of every affected path,
    /// then replay the archived contents.
    pub fn restore(&self, conn: &Connection, id: i64) -> Result<SnapshotRow> {
        let row = models::get_snapshot(conn, id)?
            .ok_or_else(|| Error::Snapshot(format!("snapshot {id} not found")))?;
        self.restore_row(&row)?;
        Ok(row)
    }

    /// Restore from an already-loaded snapshot row. Used when the state
    /// database itself is part of the snapshot and the caller had to close
    /// its connection first.
    pub fn restore_row(&self, row: &SnapshotRow) -> Result<()> {
        let id = row.id;
        for path in &row.affected_paths {
            let target = self.config.root.join(path.trim_start_matches('/'));
            match target.symlink_metadata() {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    fs::remove_file(&target).map_err(|e| {
                        Error::RollbackIncomplete(format!(
                            "cannot clear {}: {e}",
                            target.display()
                        ))
                    })?;
                }
                Err(_) => {}
            }
        }

        let file = File::open(&row.archive_path).map_err(|e| {
            Error::RollbackIncomplete(format!("open snapshot {}: {e}", row.archive_path))
        })?;
        let decoder = zstd::Decoder::new(file)
            .map_err(|e| Error::RollbackIncomplete(format!("zstd: {e}")))?;
        let mut archive = tar::Archive::new(decoder);
        archive.set_preserve_permissions(true);
        archive.set_overwrite(true);
        archive
            .unpack(&self.config.root)
            .map_err(|e| Error::RollbackIncomplete(format!("unpack snapshot {id}: {e}")))?;

        info!("restored snapshot {id} into {}", self.config.root.display());
        Ok(())
    }

    /// Delete oldest snapshots beyond the retention limit
    pub fn prune(&self, conn: &Connection) -> Result<usize> {
        let all = models::list_snapshots(conn)?;
        if all.len() <= self.config.max_snapshots {
            return Ok(0);
        }
        let excess = all.len() - self.config.max_snapshots;
        let mut pruned = 0;
        for row in all.into_iter().take(excess) {
            debug!("pruning snapshot {}", row.id);
            if !row.archive_path.is_empty() {
                if let Err(e) = fs::remove_file(&row.archive_path) {
                    warn!("could not remove {}: {e}", row.archive_path);
                }
            }
            models::delete_snapshot(conn, row.id)?;
            pruned += 1;
        }
        Ok(pruned)
    }

    /// Delete one snapshot and its archive
    pub fn delete(&self, conn: &Connection, id: i64) -> Result<()> {
        let row = models::get_snapshot(conn, id)?
            .ok_or_else(|| Error::Snapshot(format!("snapshot {id} not found")))?;
        if !row.archive_path.is_empty() {
            if let Err(e) = fs::remove_file(&row.archive_path) {
                warn!("could not remove {}: {e}", row.archive_path);
            }
        }
        models::delete_snapshot(conn, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn engine_config(temp: &TempDir) -> Config {
        let mut raw = HashMap::new();
        raw.insert("MAX_SNAPSHOTS".to_string(), "2".to_string());
        Config::from_keys(temp.path().to_path_buf(), &raw).unwrap()
    }

    #[test]
    fn test_create_and_restore_roundtrip() {
        let temp = TempDir::new().unwrap();
        let config = engine_config(&temp);
        let conn = open_memory();
        let engine = SnapshotEngine::new(&config);

        fs::create_dir_all(temp.path().join("usr/bin")).unwrap();
        fs::write(temp.path().join("usr/bin/app"), b"old contents").unwrap();

        let affected = vec!["/usr/bin/app".to_string()];
        let id = engine.create(&conn, Some("pre-upgrade"), &affected).unwrap();

        // Mutate the file as a transaction would
        fs::write(temp.path().join("usr/bin/app"), b"new contents").unwrap();

        let row = engine.restore(&conn, id).unwrap();
        assert_eq!(row.tag.as_deref(), Some("pre-upgrade"));
        assert_eq!(
            fs::read(temp.path().join("usr/bin/app")).unwrap(),
            b"old contents"
        );
    }

    #[test]
    fn test_restore_deletes_new_side_files() {
        let temp = TempDir::new().unwrap();
        let config = engine_config(&temp);
        let conn = open_memory();
        let engine = SnapshotEngine::new(&config);

        // Path did not exist pre-transaction
        let affected = vec!["/usr/bin/fresh".to_string()];
        let id = engine.create(&conn, None, &affected).unwrap();

        fs::create_dir_all(temp.path().join("usr/bin")).unwrap();
        fs::write(temp.path().join("usr/bin/fresh"), b"installed").unwrap();

        engine.restore(&conn, id).unwrap();
        assert!(!temp.path().join("usr/bin/fresh").exists());
    }

    #[test]
    fn test_symlink_preserved() {
        let temp = TempDir::new().unwrap();
        let config = engine_config(&temp);
        let conn = open_memory();
        let engine = SnapshotEngine::new(&config);

        fs::create_dir_all(temp.path().join("usr/bin")).unwrap();
        std::os::unix::fs::symlink("app", temp.path().join("usr/bin/link")).unwrap();

        let affected = vec!["/usr/bin/link".to_string()];
        let id = engine.create(&conn, None, &affected).unwrap();

        fs::remove_file(temp.path().join("usr/bin/link")).unwrap();
        std::os::unix::fs::symlink("other", temp.path().join("usr/bin/link")).unwrap();

        engine.restore(&conn, id).unwrap();
        let target = fs::read_link(temp.path().join("usr/bin/link")).unwrap();
        assert_eq!(target.to_string_lossy(), "app");
    }

    #[test]
    fn test_missing_paths_skipped() {
        let temp = TempDir::new().unwrap();
        let config = engine_config(&temp);
        let conn = open_memory();
        let engine = SnapshotEngine::new(&config);

        let affected = vec!["/does/not/exist".to_string()];
        let id = engine.create(&conn, None, &affected).unwrap();
        // Restoring an empty snapshot is a no-op
        engine.restore(&conn, id).unwrap();
    }

    #[test]
    fn test_prune_oldest_first() {
        let temp = TempDir::new().unwrap();
        let config = engine_config(&temp);
        let conn = open_memory();
        let engine = SnapshotEngine::new(&config);

        fs::write(temp.path().join("file"), b"x").unwrap();
        let affected = vec!["/file".to_string()];
        let a = engine.create(&conn, None, &affected).unwrap();
        let b = engine.create(&conn, None, &affected).unwrap();
        let c = engine.create(&conn, None, &affected).unwrap();

        let pruned = engine.prune(&conn).unwrap();
        assert_eq!(pruned, 1);
        let remaining: Vec<i64> = models::list_snapshots(&conn)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(remaining, vec![b, c]);
        assert!(!Path::new(&engine.archive_path(a)).exists());
    }

    #[test]
    fn test_restore_unknown_id_fails() {
        let temp = TempDir::new().unwrap();
        let config = engine_config(&temp);
        let conn = open_memory();
        let engine = SnapshotEngine::new(&config);
        assert!(engine.restore(&conn, 999).is_err());
    }
}
