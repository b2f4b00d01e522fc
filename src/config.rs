// src/config.rs

//! Configuration loading and filesystem layout
//!
//! All paths the manager touches are derived from the target root in one
//! place so tests can point the whole engine at a temp directory. The conf
//! file is `KEY=VALUE` with `#` comments, mirroring `/etc/lpm/lpm.conf`.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Snapshots retained after prune
pub const DEFAULT_MAX_SNAPSHOTS: usize = 10;

/// Streaming I/O buffer floor and default
pub const IO_BUFFER_FLOOR: usize = 64 * 1024;
pub const DEFAULT_IO_BUFFER_SIZE: usize = 1024 * 1024;

/// Learned-clause cap before the solver starts deleting
pub const DEFAULT_MAX_LEARNT_CLAUSES: usize = 200;

/// Engine configuration: parsed conf keys plus the derived layout
#[derive(Debug, Clone)]
pub struct Config {
    /// Target root the transaction mutates (usually "/")
    pub root: PathBuf,
    /// Host architecture token; `noarch` packages always match
    pub arch: String,
    /// Carried for the build tooling; validated but unused by the core
    pub opt_level: String,
    pub cpu_type: Option<String>,
    pub max_snapshots: usize,
    pub fetch_max_workers: usize,
    pub io_buffer_size: usize,
    pub fetch_connect_timeout: Duration,
    pub fetch_total_timeout: Duration,
    /// No timeout when unset; hooks inherit the subprocess default
    pub hook_timeout: Option<Duration>,
    pub max_learnt_clauses: usize,
    pub vsids_var_decay: f64,
    pub vsids_clause_decay: f64,
    pub allow_lpmbuild_fallback: bool,
}

impl Config {
    /// Load configuration for a target root, applying defaults for
    /// missing keys and clamping out-of-range values.
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let conf_path = root.join("etc/lpm/lpm.conf");
        let raw = if conf_path.exists() {
            parse_conf(&conf_path)?
        } else {
            HashMap::new()
        };
        Self::from_keys(root, &raw)
    }

    /// Build a config from already-parsed keys (used by tests)
    pub fn from_keys(root: PathBuf, raw: &HashMap<String, String>) -> Result<Self> {
        let arch = raw
            .get("ARCH")
            .cloned()
            .unwrap_or_else(detect_machine);

        let opt_level = match raw.get("OPT_LEVEL").map(String::as_str) {
            Some(lvl @ ("-Os" | "-O2" | "-O3" | "-Ofast")) => lvl.to_string(),
            _ => "-O2".to_string(),
        };

        let max_snapshots = parse_uint(raw, "MAX_SNAPSHOTS", DEFAULT_MAX_SNAPSHOTS)?;
        let fetch_max_workers = match raw.get("FETCH_MAX_WORKERS") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|_| Error::Config(format!("FETCH_MAX_WORKERS: invalid integer '{v}'")))?
                .max(1),
            None => default_fetch_workers(),
        };
        let io_buffer_size =
            parse_uint(raw, "IO_BUFFER_SIZE", DEFAULT_IO_BUFFER_SIZE)?.max(IO_BUFFER_FLOOR);
        let max_learnt_clauses =
            parse_uint(raw, "MAX_LEARNT_CLAUSES", DEFAULT_MAX_LEARNT_CLAUSES)?.max(1);

        let fetch_connect_timeout =
            Duration::from_secs(parse_uint(raw, "FETCH_CONNECT_TIMEOUT", 30)? as u64);
        let fetch_total_timeout =
            Duration::from_secs(parse_uint(raw, "FETCH_TOTAL_TIMEOUT", 300)? as u64);
        let hook_timeout = match raw.get("HOOK_TIMEOUT") {
            Some(v) => {
                let secs = v
                    .parse::<u64>()
                    .map_err(|_| Error::Config(format!("HOOK_TIMEOUT: invalid integer '{v}'")))?;
                Some(Duration::from_secs(secs))
            }
            None => None,
        };

        let vsids_var_decay = parse_float(raw, "VSIDS_VAR_DECAY", 0.95)?;
        let vsids_clause_decay = parse_float(raw, "VSIDS_CLAUSE_DECAY", 0.999)?;

        let allow_lpmbuild_fallback = raw
            .get("ALLOW_LPMBUILD_FALLBACK")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        Ok(Self {
            root,
            arch,
            opt_level,
            cpu_type: raw.get("CPU_TYPE").cloned(),
            max_snapshots,
            fetch_max_workers,
            io_buffer_size,
            fetch_connect_timeout,
            fetch_total_timeout,
            hook_timeout,
            max_learnt_clauses,
            vsids_var_decay,
            vsids_clause_decay,
            allow_lpmbuild_fallback,
        })
    }

    // ------------------------------------------------------------------
    // Filesystem layout, all relative to the target root

    pub fn conf_dir(&self) -> PathBuf {
        self.root.join("etc/lpm")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("var/lib/lpm")
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir().join("state.db")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir().join("cache")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.state_dir().join("snapshots")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.state_dir().join("staging")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join("lock")
    }

    pub fn repos_path(&self) -> PathBuf {
        self.conf_dir().join("repos.json")
    }

    pub fn pins_path(&self) -> PathBuf {
        self.conf_dir().join("pins.json")
    }

    pub fn protected_path(&self) -> PathBuf {
        self.conf_dir().join("protected.json")
    }

    pub fn trust_dir(&self) -> PathBuf {
        self.conf_dir().join("trust")
    }

    /// Hook directories in scan order; later entries override earlier ones
    /// by hook name (admin overrides system).
    pub fn hook_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.root.join("usr/share/lpm/hooks"),
            self.conf_dir().join("hooks"),
        ]
    }

    /// Legacy per-package script directory, e.g. `post_install.d`
    pub fn legacy_script_dir(&self, name: &str) -> PathBuf {
        self.root.join("usr/share/lpm/hooks").join(name)
    }

    /// Create the state directories and seed empty config files
    pub fn initialize_state(&self) -> Result<()> {
        for dir in [
            self.state_dir(),
            self.cache_dir(),
            self.snapshot_dir(),
            self.staging_dir(),
            self.conf_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        if !self.repos_path().exists() {
            fs::write(self.repos_path(), "[]\n")?;
        }
        if !self.pins_path().exists() {
            fs::write(self.pins_path(), "{\"hold\": [], \"prefer\": {}}\n")?;
        }
        debug!("initialized state under {}", self.state_dir().display());
        Ok(())
    }
}

/// Parse a `KEY=VALUE` conf file, ignoring blanks and `#` comments
pub fn parse_conf(path: &Path) -> Result<HashMap<String, String>> {
    let text = fs::read_to_string(path)?;
    let mut out = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            out.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(out)
}

fn parse_uint(raw: &HashMap<String, String>, key: &str, default: usize) -> Result<usize> {
    match raw.get(key) {
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| Error::Config(format!("{key}: invalid integer '{v}'"))),
        None => Ok(default),
    }
}

fn parse_float(raw: &HashMap<String, String>, key: &str, default: f64) -> Result<f64> {
    match raw.get(key) {
        Some(v) => v
            .parse::<f64>()
            .map_err(|_| Error::Config(format!("{key}: invalid float '{v}'"))),
        None => Ok(default),
    }
}

/// Download pool default: 2x cores, clamped to [4, 32]
pub fn default_fetch_workers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (2 * cores).clamp(4, 32)
}

/// Host machine token from uname, falling back to the compile target
fn detect_machine() -> String {
    match nix::sys::utsname::uname() {
        Ok(u) => u.machine().to_string_lossy().into_owned(),
        Err(_) => std::env::consts::ARCH.to_string(),
    }
}

/// Architecture compatibility: `noarch` is universal, otherwise exact match
pub fn arch_compatible(pkg_arch: &str, host_arch: &str) -> bool {
    pkg_arch == "noarch" || pkg_arch == host_arch
}
