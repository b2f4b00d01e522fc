// src/commands.rs

//! CLI command handlers
//!
//! Thin layer over the library: parse arguments into engine calls, print
//! results, and map outcomes to exit codes.

use crate::{Cli, Commands, PinCommands, SnapshotCommands};
use anyhow::Result;
use chrono::{Local, TimeZone};
use lpm::blob::BlobStore;
use lpm::db::{self, models};
use lpm::resolver::plan::{OpKind, Plan};
use lpm::snapshot::SnapshotEngine;
use lpm::transaction::{TransactionEngine, TransactionLock, TxnOptions};
use lpm::universe::Dependency;
use lpm::version::Constraint;
use lpm::Config;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub fn dispatch(cli: Cli, cancel: Arc<AtomicBool>) -> Result<i32> {
    let config = Config::load(&cli.root)?;

    match cli.command {
        Commands::Install {
            packages,
            dry_run,
            force,
            no_verify,
            no_wait,
        } => {
            let opts = TxnOptions {
                dry_run,
                force,
                no_verify,
                no_wait,
                cancel: Some(cancel),
            };
            install(&config, &packages, &opts)
        }

        Commands::Remove {
            packages,
            dry_run,
            force,
            no_wait,
        } => {
            let opts = TxnOptions {
                dry_run,
                force,
                no_wait,
                cancel: Some(cancel),
                ..Default::default()
            };
            let engine = TransactionEngine::new(&config);
            let outcome = engine.remove(&packages, &opts)?;
            print_plan(&outcome.plan, dry_run);
            Ok(0)
        }

        Commands::Upgrade {
            packages,
            dry_run,
            force,
            no_verify,
            no_wait,
        } => {
            let opts = TxnOptions {
                dry_run,
                force,
                no_verify,
                no_wait,
                cancel: Some(cancel),
            };
            let engine = TransactionEngine::new(&config);
            let names = if packages.is_empty() {
                None
            } else {
                Some(packages.as_slice())
            };
            let outcome = engine.upgrade(names, &opts)?;
            if outcome.plan.is_empty() {
                println!("Nothing to upgrade.");
            } else {
                print_plan(&outcome.plan, dry_run);
            }
            Ok(0)
        }

        Commands::Autoremove { dry_run, no_wait } => {
            let opts = TxnOptions {
                dry_run,
                no_wait,
                cancel: Some(cancel),
                ..Default::default()
            };
            let engine = TransactionEngine::new(&config);
            let outcome = engine.autoremove(&opts)?;
            if dry_run {
                for op in &outcome.plan.operations {
                    println!("{}", op.record.name);
                }
            } else {
                print_plan(&outcome.plan, false);
            }
            Ok(0)
        }

        Commands::Rollback {
            snapshot_id,
            no_wait,
        } => {
            let opts = TxnOptions {
                no_wait,
                cancel: Some(cancel),
                ..Default::default()
            };
            let engine = TransactionEngine::new(&config);
            let id = engine.rollback(snapshot_id, &opts)?;
            println!("Rolled back to snapshot {id}.");
            Ok(0)
        }

        Commands::List => {
            let conn = db::open(&config)?;
            for pkg in models::all_packages(&conn)? {
                let marker = if pkg.explicit { "" } else { " (dependency)" };
                println!("{}{marker}", pkg.record.nvra());
            }
            Ok(0)
        }

        Commands::Info { package } => {
            let conn = db::open(&config)?;
            let Some(pkg) = models::get_package(&conn, &package)? else {
                println!("{package} is not installed.");
                return Ok(1);
            };
            let record = &pkg.record;
            println!("Name     : {}", record.name);
            println!("Version  : {}-{}", record.version, record.release);
            println!("Arch     : {}", record.arch);
            if !record.summary.is_empty() {
                println!("Summary  : {}", record.summary);
            }
            if let Some(homepage) = &record.homepage {
                println!("Homepage : {homepage}");
            }
            if let Some(license) = &record.license {
                println!("License  : {license}");
            }
            println!("Repo     : {}", record.repo_name);
            println!("Explicit : {}", if pkg.explicit { "yes" } else { "no" });
            println!(
                "Installed: {}",
                format_ts(pkg.install_time)
            );
            if !record.requires.is_empty() {
                let reqs: Vec<String> =
                    record.requires.iter().map(|d| d.to_string()).collect();
                println!("Requires : {}", reqs.join(", "));
            }
            if !record.provides.is_empty() {
                let provs: Vec<String> =
                    record.provides.iter().map(|d| d.to_string()).collect();
                println!("Provides : {}", provs.join(", "));
            }
            Ok(0)
        }

        Commands::Files { package } => {
            let conn = db::open(&config)?;
            if models::get_package(&conn, &package)?.is_none() {
                println!("{package} is not installed.");
                return Ok(1);
            }
            for entry in models::manifest_for(&conn, &package)? {
                println!("{}", entry.path);
            }
            Ok(0)
        }

        Commands::Owner { path } => {
            let conn = db::open(&config)?;
            let normalized = if path.starts_with('/') {
                path.clone()
            } else {
                format!("/{path}")
            };
            match models::owner_of_path(&conn, &normalized)? {
                Some(owner) => {
                    println!("{normalized} is owned by {owner}");
                    Ok(0)
                }
                None => {
                    println!("No package owns {normalized}.");
                    Ok(1)
                }
            }
        }

        Commands::Rdepends { package } => {
            let conn = db::open(&config)?;
            if models::get_package(&conn, &package)?.is_none() {
                println!("{package} is not installed.");
                return Ok(1);
            }
            for name in models::reverse_dependencies(&conn, &package)? {
                println!("{name}");
            }
            Ok(0)
        }

        Commands::History { limit } => {
            let conn = db::open(&config)?;
            for row in models::history_tail(&conn, limit)? {
                let versions = match (&row.old_version, &row.new_version) {
                    (Some(old), Some(new)) => format!(" {old} -> {new}"),
                    (None, Some(new)) => format!(" {new}"),
                    (Some(old), None) => format!(" {old}"),
                    (None, None) => String::new(),
                };
                let snapshot = row
                    .snapshot_id
                    .map(|id| format!(" [snapshot {id}]"))
                    .unwrap_or_default();
                println!(
                    "{} {:<9} {}{versions}{snapshot}",
                    format_ts(row.ts),
                    row.kind.as_str(),
                    row.package,
                );
            }
            Ok(0)
        }

        Commands::Verify { package } => {
            let engine = TransactionEngine::new(&config);
            let issues = engine.verify(package.as_deref())?;
            if issues.is_empty() {
                println!("All files verified.");
                Ok(0)
            } else {
                for issue in &issues {
                    println!("{}: {}: {}", issue.package, issue.path, issue.problem);
                }
                println!("{} problem(s) found.", issues.len());
                Ok(3)
            }
        }

        Commands::Snapshot(cmd) => snapshot_command(&config, cmd),

        Commands::Pin(cmd) => pin_command(&config, cmd),

        Commands::Clean => {
            let store = BlobStore::new(&config)?;
            store.evict_all()?;
            println!("Blob cache cleared.");
            Ok(0)
        }
    }
}

fn install(config: &Config, packages: &[String], opts: &TxnOptions) -> Result<i32> {
    let engine = TransactionEngine::new(config);

    // Arguments naming existing files install as local archives
    let (files, names): (Vec<&String>, Vec<&String>) = packages
        .iter()
        .partition(|p| Path::new(p).is_file());

    if !files.is_empty() {
        let paths: Vec<PathBuf> = files.iter().map(PathBuf::from).collect();
        let outcome = engine.install_files(&paths, opts)?;
        print_plan(&outcome.plan, opts.dry_run);
    }

    if !names.is_empty() {
        let goals: Vec<Dependency> = names
            .iter()
            .map(|n| Dependency::parse(n))
            .collect::<lpm::Result<_>>()?;
        let outcome = engine.install(goals, opts)?;
        print_plan(&outcome.plan, opts.dry_run);
    }

    Ok(0)
}

fn snapshot_command(config: &Config, cmd: SnapshotCommands) -> Result<i32> {
    match cmd {
        SnapshotCommands::List => {
            let conn = db::open(config)?;
            for row in models::list_snapshots(&conn)? {
                let tag = row.tag.as_deref().unwrap_or("-");
                println!("{:>4}  {}  {}", row.id, format_ts(row.ts), tag);
            }
            Ok(0)
        }
        SnapshotCommands::Delete { snapshot_id } => {
            let _lock = TransactionLock::acquire(config, false)?;
            let conn = db::open(config)?;
            SnapshotEngine::new(config).delete(&conn, snapshot_id)?;
            println!("Deleted snapshot {snapshot_id}.");
            Ok(0)
        }
        SnapshotCommands::Prune => {
            let _lock = TransactionLock::acquire(config, false)?;
            let conn = db::open(config)?;
            let pruned = SnapshotEngine::new(config).prune(&conn)?;
            println!("Pruned {pruned} snapshot(s).");
            Ok(0)
        }
    }
}

fn pin_command(config: &Config, cmd: PinCommands) -> Result<i32> {
    let conn = db::open(config)?;
    match cmd {
        PinCommands::Hold { package } => {
            models::set_hold(&conn, &package)?;
            println!("Holding {package}.");
            Ok(0)
        }
        PinCommands::Prefer {
            package,
            constraint,
        } => {
            let parsed = Constraint::parse(&constraint)?;
            models::set_prefer(&conn, &package, &parsed)?;
            println!("Preferring {package} {parsed}.");
            Ok(0)
        }
        PinCommands::List => {
            let pins = models::load_pins(&conn)?;
            for name in &pins.hold {
                println!("hold    {name}");
            }
            for (name, constraint) in &pins.prefer {
                println!("prefer  {name} {constraint}");
            }
            Ok(0)
        }
        PinCommands::Remove { package } => {
            let removed = models::remove_pin(&conn, &package)?;
            if removed == 0 {
                println!("No pins for {package}.");
                Ok(1)
            } else {
                println!("Unpinned {package}.");
                Ok(0)
            }
        }
    }
}

fn print_plan(plan: &Plan, dry_run: bool) {
    if plan.is_empty() {
        println!("Nothing to do.");
        return;
    }
    if dry_run {
        println!("Transaction plan (dry run):");
    } else {
        println!("Transaction complete:");
    }
    for op in &plan.operations {
        let note = match op.kind {
            OpKind::Install if !op.replaces.is_empty() => {
                format!(" (replaces {})", op.replaces.join(", "))
            }
            _ => String::new(),
        };
        println!("  {}{note}", op.describe());
    }
}

fn format_ts(ts: i64) -> String {
    Local
        .timestamp_opt(ts, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}
