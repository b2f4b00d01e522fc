// src/main.rs

//! LPM command line entry point

use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

mod commands;

#[derive(Parser)]
#[command(name = "lpm")]
#[command(version)]
#[command(about = "Linux package manager with transactional installs and rollback")]
struct Cli {
    /// Target root directory
    #[arg(long, global = true, default_value = "/")]
    root: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install packages by name, capability, or local archive path
    Install {
        /// Package names, `name OP version` expressions, or `.lpm` files
        #[arg(required = true)]
        packages: Vec<String>,
        /// Show the plan without changing anything
        #[arg(long)]
        dry_run: bool,
        /// Override holds and the protected set
        #[arg(long)]
        force: bool,
        /// Skip signature verification
        #[arg(long)]
        no_verify: bool,
        /// Fail immediately if another transaction holds the lock
        #[arg(long)]
        no_wait: bool,
    },

    /// Remove installed packages
    Remove {
        #[arg(required = true)]
        packages: Vec<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        no_wait: bool,
    },

    /// Upgrade packages (all of them when none are named)
    Upgrade {
        packages: Vec<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        no_verify: bool,
        #[arg(long)]
        no_wait: bool,
    },

    /// Remove packages nothing explicit depends on
    Autoremove {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        no_wait: bool,
    },

    /// Restore a snapshot (the latest one by default)
    Rollback {
        snapshot_id: Option<i64>,
        #[arg(long)]
        no_wait: bool,
    },

    /// List installed packages
    List,

    /// Show details for an installed package
    Info { package: String },

    /// List the files an installed package owns
    Files { package: String },

    /// Show which package owns a path
    Owner { path: String },

    /// Show installed packages that depend on a package
    Rdepends { package: String },

    /// Show recent transaction history
    History {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Check installed files against their manifests
    Verify { package: Option<String> },

    /// Manage snapshots
    #[command(subcommand)]
    Snapshot(SnapshotCommands),

    /// Manage hold and prefer pins
    #[command(subcommand)]
    Pin(PinCommands),

    /// Empty the blob cache
    Clean,
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// List recorded snapshots
    List,
    /// Delete one snapshot
    Delete { snapshot_id: i64 },
    /// Drop snapshots beyond the retention limit
    Prune,
}

#[derive(Subcommand)]
enum PinCommands {
    /// Never upgrade or remove a package without --force
    Hold { package: String },
    /// Bias the solver toward versions matching a constraint
    Prefer {
        package: String,
        /// Constraint such as '~= 3.3' or '< 2.0'
        constraint: String,
    },
    /// List pins
    List,
    /// Drop all pins for a package
    Remove { package: String },
}

static CANCEL: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn handle_signal(_sig: libc::c_int) {
    if let Some(flag) = CANCEL.get() {
        if flag.swap(true, Ordering::SeqCst) {
            // Second signal: give up immediately
            unsafe { libc::_exit(130) };
        }
    }
}

fn install_signal_handlers() -> Arc<AtomicBool> {
    let flag = CANCEL.get_or_init(|| Arc::new(AtomicBool::new(false))).clone();
    let handler = handle_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
    flag
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cancel = install_signal_handlers();
    let cli = Cli::parse();

    let code = match commands::dispatch(cli, cancel) {
        Ok(code) => code,
        Err(e) => {
            let code = e
                .downcast_ref::<lpm::Error>()
                .map(|le| le.exit_code())
                .unwrap_or(1);
            if let Some(lpm::Error::Unsat { core }) = e.downcast_ref::<lpm::Error>() {
                eprintln!("error: no solution, these requirements conflict:");
                for item in core {
                    eprintln!("  - {item}");
                }
                eprintln!("hint: drop one of them (remove a pin, relax the request, or use --force)");
            } else {
                eprintln!("error: {e:#}");
            }
            code
        }
    };
    std::process::exit(code);
}
