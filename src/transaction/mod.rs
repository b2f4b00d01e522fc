// src/transaction/mod.rs

//! Transaction controller: lock, orchestrate, commit, roll back
//!
//! One transaction per target root at a time, enforced by an advisory
//! exclusive lock on `/var/lib/lpm/lock`. The controller walks the state
//! machine
//!
//! ```text
//! IDLE -> LOCKED -> PLANNED -> FETCHED -> SNAPSHOTTED -> PRE_HOOKS_DONE
//!       -> APPLYING -> POST_HOOKS_DONE -> COMMITTED -> IDLE
//! any   -> ABORTING -> ROLLED_BACK -> IDLE
//! ```
//!
//! Blobs are fetched and verified before anything mutates. The snapshot
//! archives every path about to change, including the state database, so
//! both in-process aborts and post-crash rollbacks restore files and DB
//! together. Per-package DB commits are the linearization points: a crash
//! between packages leaves the database consistent with the files already
//! swapped into place, recoverable via `rollback`.

use crate::archive::{self, FileKind, PackageControl};
use crate::blob::{self, BlobStore};
use crate::config::Config;
use crate::db::{self, models};
use crate::db::models::HistoryKind;
use crate::error::{Error, Result};
use crate::hooks::{self, HookEvent, HookManager, HookOperation};
use crate::resolver::plan::{OpKind, Operation, Plan};
use crate::resolver::{Request, Resolver};
use crate::signature;
use crate::snapshot::SnapshotEngine;
use crate::solver::SolverParams;
use crate::universe::{self, Dependency, Origin, PackageRecord, Pins, Universe};
use crate::version::{Constraint, ConstraintOp};
use fs2::FileExt;
use rayon::prelude::*;
use rusqlite::Connection;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Options controlling a transaction run
#[derive(Debug, Clone, Default)]
pub struct TxnOptions {
    /// Plan and print without fetching, snapshotting, or applying
    pub dry_run: bool,
    /// Drop hold pins and protected-set checks
    pub force: bool,
    /// Skip signature verification
    pub no_verify: bool,
    /// Fail immediately instead of waiting for the lock
    pub no_wait: bool,
    /// Cooperative cancellation flag, set by the signal handler
    pub cancel: Option<Arc<AtomicBool>>,
}

impl TxnOptions {
    fn check_cancel(&self, what: &str) -> Result<()> {
        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(Error::Interrupted(what.to_string()));
            }
        }
        Ok(())
    }
}

/// Result of a completed (or dry-run) transaction
#[derive(Debug)]
pub struct Outcome {
    pub plan: Plan,
    pub snapshot_id: Option<i64>,
    /// False for dry runs
    pub committed: bool,
}

/// Advisory exclusive transaction lock holding the owner pid
pub struct TransactionLock {
    file: File,
}

impl TransactionLock {
    /// Acquire the lock, blocking unless `no_wait` is set
    pub fn acquire(config: &Config, no_wait: bool) -> Result<Self> {
        fs::create_dir_all(config.state_dir())?;
        let path = config.lock_path();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(_) if no_wait => {
                let holder = read_holder_pid(&mut file);
                return Err(Error::Locked { holder });
            }
            Err(_) => {
                info!("waiting for transaction lock at {}", path.display());
                file.lock_exclusive()?;
            }
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(Self { file })
    }
}

impl Drop for TransactionLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn read_holder_pid(file: &mut File) -> Option<i32> {
    let mut buf = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut buf).ok()?;
    buf.trim().parse().ok()
}

/// A file that failed verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyProblem {
    Missing,
    SizeMismatch { expected: u64, actual: u64 },
    HashMismatch { expected: String, actual: String },
}

impl std::fmt::Display for VerifyProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::SizeMismatch { expected, actual } => {
                write!(f, "size-mismatch (expected {expected}, got {actual})")
            }
            Self::HashMismatch { expected, actual } => {
                write!(f, "hash-mismatch (expected {expected}, got {actual})")
            }
        }
    }
}

/// One verification finding
#[derive(Debug, Clone)]
pub struct VerifyIssue {
    pub package: String,
    pub path: String,
    pub problem: VerifyProblem,
}

/// The transaction controller for one target root
pub struct TransactionEngine<'a> {
    config: &'a Config,
}

impl<'a> TransactionEngine<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    fn solver_params(&self) -> SolverParams {
        SolverParams {
            var_decay: self.config.vsids_var_decay,
            clause_decay: self.config.vsids_clause_decay,
            max_learnts: self.config.max_learnt_clauses,
        }
    }

    /// Install packages or capabilities from the repositories
    pub fn install(&self, goals: Vec<Dependency>, opts: &TxnOptions) -> Result<Outcome> {
        let force = opts.force;
        self.execute(Vec::new(), opts, move |_| {
            Ok(Request {
                install: goals,
                remove: Vec::new(),
                force,
            })
        })
    }

    /// Install local package archives
    pub fn install_files(&self, files: &[PathBuf], opts: &TxnOptions) -> Result<Outcome> {
        let store = BlobStore::new(self.config)?;
        let mut locals = Vec::new();
        let mut goals = Vec::new();

        for path in files {
            let display_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            let control = archive::read_package_control(&display_name, File::open(path)?)?;

            if !opts.no_verify {
                self.verify_local_signature(&display_name, path, &control)?;
            }

            if !crate::config::arch_compatible(&control.meta.arch, &self.config.arch) {
                return Err(Error::ArchiveFormat {
                    name: display_name,
                    reason: format!(
                        "incompatible architecture {} (host {})",
                        control.meta.arch, self.config.arch
                    ),
                });
            }

            let sha = store.insert_file(path)?;
            let size = fs::metadata(path)?.len();
            let record = control
                .meta
                .clone()
                .into_record(display_name, size, sha, None)?;
            goals.push(Dependency {
                name: record.name.clone(),
                constraint: Some(Constraint::new(ConstraintOp::Eq, record.version.clone())),
            });
            locals.push(record);
        }

        let force = opts.force;
        self.execute(locals, opts, move |_| {
            Ok(Request {
                install: goals,
                remove: Vec::new(),
                force,
            })
        })
    }

    fn verify_local_signature(
        &self,
        name: &str,
        path: &Path,
        control: &PackageControl,
    ) -> Result<()> {
        // A detached .sig beside the file covers the blob bytes; the
        // embedded signature covers the control documents.
        let sidecar = PathBuf::from(format!("{}.sig", path.display()));
        if sidecar.exists() {
            let sig = fs::read_to_string(&sidecar)?;
            let data = fs::read(path)?;
            return signature::verify_detached(name, &data, sig.trim(), &self.config.trust_dir());
        }
        match &control.signature {
            Some(sig) => signature::verify_detached(
                name,
                &control.signed_bytes,
                sig,
                &self.config.trust_dir(),
            ),
            None => {
                warn!("{name}: no signature present, skipping verification");
                Ok(())
            }
        }
    }

    /// Remove installed packages (dependents are cascaded by the solver)
    pub fn remove(&self, names: &[String], opts: &TxnOptions) -> Result<Outcome> {
        let names = names.to_vec();
        let force = opts.force;
        self.execute(Vec::new(), opts, move |_| {
            Ok(Request {
                install: Vec::new(),
                remove: names,
                force,
            })
        })
    }

    /// Upgrade named packages, or everything when `names` is None
    pub fn upgrade(&self, names: Option<&[String]>, opts: &TxnOptions) -> Result<Outcome> {
        let names = names.map(|n| n.to_vec());
        let force = opts.force;
        self.execute(Vec::new(), opts, move |universe: &Universe| {
            let targets: Vec<String> = match names {
                Some(list) => list,
                // A blanket upgrade walks around the protected set instead
                // of failing on it
                None => universe
                    .installed
                    .keys()
                    .filter(|n| force || !universe.protected.contains(*n))
                    .cloned()
                    .collect(),
            };
            let mut goals = Vec::new();
            for name in targets {
                let Some(installed) = universe.installed.get(&name) else {
                    return Err(Error::NoCandidate(name));
                };
                let goal = Dependency {
                    name: name.clone(),
                    constraint: Some(Constraint::new(
                        ConstraintOp::Gt,
                        installed.record.version.clone(),
                    )),
                };
                if universe.satisfiers(&goal).is_empty() {
                    debug!("{name} is already at the newest available version");
                    continue;
                }
                goals.push(goal);
            }
            Ok(Request {
                install: goals,
                remove: Vec::new(),
                force,
            })
        })
    }

    /// Names of installed packages no explicit package depends on
    pub fn orphans(&self) -> Result<Vec<String>> {
        let conn = db::open(self.config)?;
        let installed = models::all_packages(&conn)?;
        Ok(compute_orphans(&installed))
    }

    /// Remove every orphan in one transaction
    pub fn autoremove(&self, opts: &TxnOptions) -> Result<Outcome> {
        let orphans = self.orphans()?;
        if orphans.is_empty() {
            return Ok(Outcome {
                plan: Plan::default(),
                snapshot_id: None,
                committed: !opts.dry_run,
            });
        }
        let force = opts.force;
        self.execute(Vec::new(), opts, move |universe: &Universe| {
            // Protected packages never leave via autoremove
            let remove = orphans
                .into_iter()
                .filter(|n| !universe.protected.contains(n))
                .collect();
            Ok(Request {
                install: Vec::new(),
                remove,
                force,
            })
        })
    }

    /// Restore a snapshot (the latest one by default) and record the
    /// rollback in history.
    pub fn rollback(&self, snapshot_id: Option<i64>, opts: &TxnOptions) -> Result<i64> {
        let _lock = TransactionLock::acquire(self.config, opts.no_wait)?;
        let conn = db::open(self.config)?;

        let row = match snapshot_id {
            Some(id) => models::get_snapshot(&conn, id)?
                .ok_or_else(|| Error::Snapshot(format!("snapshot {id} not found")))?,
            None => models::list_snapshots(&conn)?
                .pop()
                .ok_or_else(|| Error::Snapshot("no snapshots recorded".to_string()))?,
        };
        let id = row.id;

        // The archive carries the pre-transaction state database; close our
        // connection and clear WAL sidecars before the bytes come back.
        drop(conn);
        self.clear_db_sidecars();
        SnapshotEngine::new(self.config).restore_row(&row)?;

        let conn = db::open(self.config)?;
        models::record_history(&conn, HistoryKind::Rollback, "system", None, None, Some(id))?;
        info!("rolled back to snapshot {id}");
        Ok(id)
    }

    /// Check installed files against their recorded manifests. The scan
    /// parallelizes across packages, sized to the core count.
    pub fn verify(&self, package: Option<&str>) -> Result<Vec<VerifyIssue>> {
        let conn = db::open(self.config)?;
        let targets: Vec<(String, crate::archive::Manifest)> = match package {
            Some(name) => {
                models::get_package(&conn, name)?
                    .ok_or_else(|| Error::NoCandidate(name.to_string()))?;
                vec![(name.to_string(), models::manifest_for(&conn, name)?)]
            }
            None => {
                let mut out = Vec::new();
                for pkg in models::all_packages(&conn)? {
                    let manifest = models::manifest_for(&conn, &pkg.record.name)?;
                    out.push((pkg.record.name, manifest));
                }
                out
            }
        };

        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cores)
            .build()
            .map_err(|e| Error::Config(format!("failed to build verify pool: {e}")))?;

        let root = self.config.root.clone();
        let issues: Vec<VerifyIssue> = pool.install(|| {
            targets
                .par_iter()
                .flat_map(|(name, manifest)| {
                    manifest
                        .iter()
                        .filter_map(|entry| {
                            verify_entry(&root, entry).map(|problem| VerifyIssue {
                                package: name.clone(),
                                path: entry.path.clone(),
                                problem,
                            })
                        })
                        .collect::<Vec<_>>()
                })
                .collect()
        });
        Ok(issues)
    }

    // ------------------------------------------------------------------
    // Core pipeline

    fn execute<F>(
        &self,
        locals: Vec<PackageRecord>,
        opts: &TxnOptions,
        make_request: F,
    ) -> Result<Outcome>
    where
        F: FnOnce(&Universe) -> Result<Request>,
    {
        let _lock = TransactionLock::acquire(self.config, opts.no_wait)?;
        self.config.initialize_state()?;
        let mut conn = db::open(self.config)?;

        // The hook set is frozen for the duration of the transaction
        let mut hook_manager = HookManager::load(self.config)?;

        let universe = self.load_universe(&conn, locals)?;
        let request = make_request(&universe)?;

        for name in &request.remove {
            if !universe.installed.contains_key(name) {
                return Err(Error::NoCandidate(name.clone()));
            }
            if !request.force {
                if universe.protected.contains(name) {
                    return Err(Error::ProtectedViolation(name.clone()));
                }
                if universe.pins.hold.contains(name) {
                    return Err(Error::PinViolation(name.clone()));
                }
            }
        }

        let mut resolver = Resolver::new(self.solver_params());
        let model = resolver.solve(&universe, &request)?;
        let plan = crate::resolver::plan::build(&universe, &model);

        if !request.force {
            for op in &plan.operations {
                if universe.protected.contains(&op.record.name) {
                    return Err(Error::ProtectedViolation(op.record.name.clone()));
                }
            }
        }

        if plan.is_empty() {
            debug!("nothing to do");
            if !opts.dry_run {
                // Naming an already-installed dependency promotes it
                for dep in &request.install {
                    for pkg in universe.installed.values() {
                        if pkg.record.satisfies(dep) && !pkg.explicit {
                            models::set_explicit(&conn, &pkg.record.name, true)?;
                        }
                    }
                }
            }
            return Ok(Outcome {
                plan,
                snapshot_id: None,
                committed: !opts.dry_run,
            });
        }
        if opts.dry_run {
            return Ok(Outcome {
                plan,
                snapshot_id: None,
                committed: false,
            });
        }

        // Goals become explicit installs; dependencies stay implicit
        let mut explicit: BTreeSet<String> = BTreeSet::new();
        for dep in &request.install {
            for record in model.selected.values() {
                if record.satisfies(dep) {
                    explicit.insert(record.name.clone());
                }
            }
        }

        // FETCHED: all blobs cached and verified before anything mutates
        let store = BlobStore::new(self.config)?;
        let fetch = plan.fetch_records();
        store.fetch_all(&fetch, universe.repos(), self.config)?;
        if !opts.no_verify {
            for record in &fetch {
                if record.origin == Origin::LocalFile {
                    continue;
                }
                signature::verify_blob(
                    &record.name,
                    &store.path_for(&record.blob_sha256),
                    record.signature.as_deref(),
                    &self.config.trust_dir(),
                )?;
            }
        }
        opts.check_cancel("fetch")?;

        let mut controls: HashMap<String, PackageControl> = HashMap::new();
        for op in &plan.operations {
            if op.kind == OpKind::Remove {
                continue;
            }
            let blob = store.open(&op.record.blob_sha256)?;
            let control = archive::read_package_control(&op.record.name, blob)?;
            controls.insert(op.record.name.clone(), control);
        }

        // SNAPSHOTTED
        let affected = self.affected_paths(&conn, &plan, &controls)?;
        let tag = plan.names().join(",");
        let snapshot_id =
            SnapshotEngine::new(self.config).create(&conn, Some(&tag), &affected)?;

        for op in &plan.operations {
            hook_manager.add_event(hook_event(&conn, op, &controls)?);
        }

        let applied = self.apply(
            &mut conn,
            &plan,
            &controls,
            &store,
            &mut hook_manager,
            snapshot_id,
            &explicit,
            opts,
        );

        match applied {
            Ok(()) => {
                SnapshotEngine::new(self.config).prune(&conn)?;
                info!("transaction committed ({} operations)", plan.operations.len());
                Ok(Outcome {
                    plan,
                    snapshot_id: Some(snapshot_id),
                    committed: true,
                })
            }
            Err(cause) => self.abort(conn, snapshot_id, &plan, cause),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply(
        &self,
        conn: &mut Connection,
        plan: &Plan,
        controls: &HashMap<String, PackageControl>,
        store: &BlobStore,
        hook_manager: &mut HookManager,
        snapshot_id: i64,
        explicit: &BTreeSet<String>,
        opts: &TxnOptions,
    ) -> Result<()> {
        // PRE_HOOKS_DONE
        hook_manager.run_pre()?;

        // APPLYING
        let txn_id = Uuid::new_v4().to_string();
        let staging_root = self.config.staging_dir().join(&txn_id);
        for op in &plan.operations {
            opts.check_cancel(&op.record.name)?;
            match op.kind {
                OpKind::Remove => self.apply_remove(conn, op, snapshot_id)?,
                OpKind::Install | OpKind::Upgrade => {
                    let control = controls
                        .get(&op.record.name)
                        .expect("control read for every install");
                    self.apply_install(
                        conn,
                        op,
                        control,
                        store,
                        &staging_root,
                        snapshot_id,
                        explicit,
                        opts,
                    )?;
                }
            }
        }

        // POST_HOOKS_DONE
        hook_manager.run_post()?;

        let _ = fs::remove_dir_all(&staging_root);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_install(
        &self,
        conn: &mut Connection,
        op: &Operation,
        control: &PackageControl,
        store: &BlobStore,
        staging_root: &Path,
        snapshot_id: i64,
        explicit: &BTreeSet<String>,
        opts: &TxnOptions,
    ) -> Result<()> {
        let name = &op.record.name;
        info!("{}", op.describe());

        let staging = staging_root.join(name);
        let blob = store.open(&op.record.blob_sha256)?;
        let computed =
            archive::extract_payload(name, blob, &staging, self.config.io_buffer_size)?;
        archive::check_manifest(name, &staging, &control.manifest, &computed)?;

        let old_manifest = match &op.previous {
            Some(prev) => Some(models::manifest_for(conn, &prev.name)?),
            None => None,
        };

        // Swap staged entries into the root, files before the DB commit
        for entry in &control.manifest {
            opts.check_cancel(&entry.path)?;
            let rel = entry.path.trim_start_matches('/');
            let target = self.config.root.join(rel);
            match entry.kind {
                FileKind::Directory => {
                    fs::create_dir_all(&target)?;
                }
                FileKind::File => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    move_file_atomic(&staging.join(rel), &target)?;
                }
                FileKind::Symlink => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let link_target = entry.link_target.as_deref().unwrap_or_default();
                    let file_name = target
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let tmp = target.with_file_name(format!(".{file_name}.link"));
                    if tmp.symlink_metadata().is_ok() {
                        fs::remove_file(&tmp)?;
                    }
                    std::os::unix::fs::symlink(link_target, &tmp)?;
                    fs::rename(&tmp, &target)?;
                }
            }
        }

        // Upgrades drop files the new version no longer owns
        if let Some(old) = &old_manifest {
            let new_paths: HashSet<&str> =
                control.manifest.iter().map(|e| e.path.as_str()).collect();
            for entry in old.iter().rev() {
                if new_paths.contains(entry.path.as_str()) {
                    continue;
                }
                let target = self.config.root.join(entry.path.trim_start_matches('/'));
                match entry.kind {
                    FileKind::Directory => {
                        let _ = fs::remove_dir(&target);
                    }
                    _ => {
                        if let Err(e) = fs::remove_file(&target) {
                            if e.kind() != std::io::ErrorKind::NotFound {
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
        }

        // Per-package linearization point
        let previous_explicit = models::get_package(conn, name)?
            .map(|p| p.explicit)
            .unwrap_or(false);
        let explicit_flag = explicit.contains(name) || previous_explicit;
        let kind = match op.kind {
            OpKind::Upgrade => HistoryKind::Upgrade,
            _ => HistoryKind::Install,
        };
        let old_version = op.previous.as_ref().map(|p| p.version.to_string());
        let tx = conn.transaction()?;
        models::upsert_package(&tx, &op.record, &control.manifest, explicit_flag)?;
        models::record_history(
            &tx,
            kind,
            name,
            old_version.as_deref(),
            Some(&op.record.version.to_string()),
            Some(snapshot_id),
        )?;
        tx.commit()?;

        // Legacy per-package scripts, install first, then upgrade
        let mut env = vec![
            ("LPM_PKG".to_string(), name.clone()),
            ("LPM_VERSION".to_string(), op.record.version.to_string()),
            ("LPM_RELEASE".to_string(), op.record.release.to_string()),
            (
                "LPM_ROOT".to_string(),
                self.config.root.to_string_lossy().into_owned(),
            ),
        ];
        if let Some(prev) = &op.previous {
            env.push((
                "LPM_PREVIOUS_VERSION".to_string(),
                prev.version.to_string(),
            ));
            env.push(("LPM_PREVIOUS_RELEASE".to_string(), prev.release.to_string()));
        }
        hooks::run_legacy_scripts(self.config, "post_install.d", &env)?;
        if op.kind == OpKind::Upgrade {
            hooks::run_legacy_scripts(self.config, "post_upgrade.d", &env)?;
        }

        let _ = fs::remove_dir_all(&staging);
        Ok(())
    }

    fn apply_remove(&self, conn: &mut Connection, op: &Operation, snapshot_id: i64) -> Result<()> {
        let name = &op.record.name;
        info!("{}", op.describe());

        let manifest = models::manifest_for(conn, name)?;
        for entry in manifest.iter().rev() {
            let target = self.config.root.join(entry.path.trim_start_matches('/'));
            match entry.kind {
                FileKind::Directory => {
                    // Only directories left empty go away
                    let _ = fs::remove_dir(&target);
                }
                _ => {
                    if let Err(e) = fs::remove_file(&target) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            return Err(e.into());
                        }
                    }
                }
            }
        }

        let old_version = op.record.version.to_string();
        let tx = conn.transaction()?;
        models::remove_package(&tx, name)?;
        models::record_history(
            &tx,
            HistoryKind::Remove,
            name,
            Some(&old_version),
            None,
            Some(snapshot_id),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// ABORTING: restore the pre-transaction snapshot (files and state
    /// database together), record the abort, and surface the cause.
    fn abort(
        &self,
        conn: Connection,
        snapshot_id: i64,
        plan: &Plan,
        cause: Error,
    ) -> Result<Outcome> {
        error!("transaction failed, rolling back: {cause}");
        let row = match models::get_snapshot(&conn, snapshot_id) {
            Ok(Some(row)) => row,
            Ok(None) => {
                return Err(Error::RollbackIncomplete(format!(
                    "snapshot {snapshot_id} vanished; original failure: {cause}"
                )))
            }
            Err(e) => {
                return Err(Error::RollbackIncomplete(format!(
                    "cannot read snapshot {snapshot_id}: {e}; original failure: {cause}"
                )))
            }
        };

        drop(conn);
        self.clear_db_sidecars();
        if let Err(e) = SnapshotEngine::new(self.config).restore_row(&row) {
            return Err(Error::RollbackIncomplete(format!(
                "{e}; original failure: {cause}"
            )));
        }

        match db::open(self.config) {
            Ok(conn) => {
                let names = plan.names().join(",");
                if let Err(e) = models::record_history(
                    &conn,
                    HistoryKind::Abort,
                    &names,
                    None,
                    None,
                    Some(snapshot_id),
                ) {
                    warn!("could not record abort history: {e}");
                }
            }
            Err(e) => warn!("could not reopen database after rollback: {e}"),
        }

        Err(cause)
    }

    /// Paths the transaction will remove or overwrite, plus the state
    /// database itself.
    fn affected_paths(
        &self,
        conn: &Connection,
        plan: &Plan,
        controls: &HashMap<String, PackageControl>,
    ) -> Result<Vec<String>> {
        let mut affected: BTreeSet<String> = BTreeSet::new();
        for op in &plan.operations {
            match op.kind {
                OpKind::Remove => {
                    for entry in models::manifest_for(conn, &op.record.name)? {
                        if entry.kind != FileKind::Directory {
                            affected.insert(entry.path);
                        }
                    }
                }
                OpKind::Install | OpKind::Upgrade => {
                    if let Some(prev) = &op.previous {
                        for entry in models::manifest_for(conn, &prev.name)? {
                            if entry.kind != FileKind::Directory {
                                affected.insert(entry.path);
                            }
                        }
                    }
                    if let Some(control) = controls.get(&op.record.name) {
                        for entry in &control.manifest {
                            if entry.kind != FileKind::Directory {
                                affected.insert(entry.path.clone());
                            }
                        }
                    }
                }
            }
        }
        affected.insert("/var/lib/lpm/state.db".to_string());
        Ok(affected.into_iter().collect())
    }

    fn load_universe(&self, conn: &Connection, locals: Vec<PackageRecord>) -> Result<Universe> {
        let repos = universe::load_repos(&self.config.repos_path())?;
        let mut indexes = Vec::new();
        for repo in &repos {
            indexes.push((repo.clone(), universe::fetch_index(repo, self.config)?));
        }
        let installed = models::all_packages(conn)?;
        let mut pins = models::load_pins(conn)?;
        pins.merge(Pins::load_file(&self.config.pins_path())?);
        let protected = universe::load_protected(&self.config.protected_path())?;
        Universe::load(
            self.config,
            repos,
            indexes,
            locals,
            installed,
            pins,
            protected,
        )
    }

    /// Stale WAL sidecars would shadow a restored database file
    fn clear_db_sidecars(&self) {
        let db = self.config.db_path();
        for suffix in ["-wal", "-shm"] {
            let sidecar = PathBuf::from(format!("{}{suffix}", db.display()));
            let _ = fs::remove_file(sidecar);
        }
    }
}

/// Build the hook event for one operation
fn hook_event(
    conn: &Connection,
    op: &Operation,
    controls: &HashMap<String, PackageControl>,
) -> Result<HookEvent> {
    let (operation, paths) = match op.kind {
        OpKind::Remove => (
            HookOperation::Remove,
            models::manifest_for(conn, &op.record.name)?
                .into_iter()
                .map(|e| e.path)
                .collect(),
        ),
        OpKind::Install | OpKind::Upgrade => {
            let paths = controls
                .get(&op.record.name)
                .map(|c| c.manifest.iter().map(|e| e.path.clone()).collect())
                .unwrap_or_default();
            let operation = if op.kind == OpKind::Upgrade {
                HookOperation::Upgrade
            } else {
                HookOperation::Install
            };
            (operation, paths)
        }
    };
    Ok(HookEvent {
        name: op.record.name.clone(),
        operation,
        version: op.record.version.to_string(),
        release: op.record.release,
        paths,
    })
}

/// Move a file atomically, falling back to copy+fsync+delete across
/// filesystem boundaries.
pub(crate) fn move_file_atomic(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            debug!(
                "cross-filesystem move {} -> {}, copying",
                src.display(),
                dst.display()
            );
            fs::copy(src, dst)?;
            let file = File::open(dst)?;
            file.sync_all()?;
            drop(file);
            if let Some(parent) = dst.parent() {
                if let Ok(dir) = File::open(parent) {
                    // Not all filesystems support directory fsync
                    let _ = dir.sync_all();
                }
            }
            fs::remove_file(src)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Non-explicit packages with no transitive reverse-dependency from any
/// explicit package.
fn compute_orphans(installed: &[crate::universe::InstalledPackage]) -> Vec<String> {
    let mut keep: BTreeSet<&str> = installed
        .iter()
        .filter(|p| p.explicit)
        .map(|p| p.record.name.as_str())
        .collect();

    let mut changed = true;
    while changed {
        changed = false;
        let kept: Vec<&crate::universe::InstalledPackage> = installed
            .iter()
            .filter(|p| keep.contains(p.record.name.as_str()))
            .collect();
        for pkg in kept {
            for req in &pkg.record.requires {
                for provider in installed {
                    if provider.record.satisfies(req)
                        && keep.insert(provider.record.name.as_str())
                    {
                        changed = true;
                    }
                }
            }
        }
    }

    installed
        .iter()
        .filter(|p| !p.explicit && !keep.contains(p.record.name.as_str()))
        .map(|p| p.record.name.clone())
        .collect()
}

fn verify_entry(root: &Path, entry: &crate::archive::ManifestEntry) -> Option<VerifyProblem> {
    let target = root.join(entry.path.trim_start_matches('/'));
    let meta = match target.symlink_metadata() {
        Ok(m) => m,
        Err(_) => return Some(VerifyProblem::Missing),
    };

    match entry.kind {
        FileKind::Directory => {
            if meta.is_dir() {
                None
            } else {
                Some(VerifyProblem::Missing)
            }
        }
        FileKind::Symlink => {
            let expected = entry.sha256.as_deref()?;
            let link = match fs::read_link(&target) {
                Ok(link) => link,
                Err(_) => return Some(VerifyProblem::Missing),
            };
            let link_digest = blob::sha256_bytes(link.to_string_lossy().as_bytes());
            if link_digest == expected {
                return None;
            }
            // Compatibility: the digest may cover the pointed-to payload
            if let Ok(resolved) = fs::canonicalize(&target) {
                if let Ok(payload_digest) = blob::sha256_file(&resolved) {
                    if payload_digest == expected {
                        return None;
                    }
                }
            }
            Some(VerifyProblem::HashMismatch {
                expected: expected.to_string(),
                actual: link_digest,
            })
        }
        FileKind::File => {
            if !meta.is_file() {
                return Some(VerifyProblem::Missing);
            }
            if let Some(expected) = entry.size {
                if meta.len() != expected {
                    return Some(VerifyProblem::SizeMismatch {
                        expected,
                        actual: meta.len(),
                    });
                }
            }
            if let Some(expected) = entry.sha256.as_deref() {
                match blob::sha256_file(&target) {
                    Ok(actual) if actual != expected => {
                        return Some(VerifyProblem::HashMismatch {
                            expected: expected.to_string(),
                            actual,
                        })
                    }
                    Err(_) => return Some(VerifyProblem::Missing),
                    _ => {}
                }
            }
            None
        }
    }
}
