// src/universe/mod.rs

//! Package catalog: repository indexes, installed records, pins, protected set
//!
//! The universe is rebuilt per transaction from the configured repositories
//! (`repos.json` + each repo's `index.json`), the installed database, and the
//! pin/protected configuration, then queried by the CNF builder. Candidates
//! are indexed by name and by provided capability.

use crate::config::{arch_compatible, Config};
use crate::error::{Error, Result};
use crate::version::{Constraint, Version};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Where a catalog entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Repository,
    Installed,
    LocalFile,
}

/// A dependency expression: bare name or `name OP version`
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    pub name: String,
    pub constraint: Option<Constraint>,
}

impl Dependency {
    pub fn unversioned(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraint: None,
        }
    }

    /// Parse `"zlib >= 1.2"`, `"libssl.so"`, or `"pypi(requests)"`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidDependency("empty dependency".to_string()));
        }
        let mut parts = s.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default().to_string();
        let rest = parts.next().map(str::trim).unwrap_or("");
        let constraint = if rest.is_empty() {
            None
        } else {
            Some(Constraint::parse(rest)?)
        };
        Ok(Self { name, constraint })
    }

    /// True when `version` meets the constraint (or there is none)
    pub fn accepts(&self, version: &Version) -> bool {
        match &self.constraint {
            Some(c) => c.satisfies(version),
            None => true,
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            Some(c) => write!(f, "{} {}", self.name, c),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A catalog entry: one installable (or installed) package artifact
#[derive(Debug, Clone)]
pub struct PackageRecord {
    pub name: String,
    pub version: Version,
    pub release: u32,
    pub arch: String,
    pub summary: String,
    pub homepage: Option<String>,
    pub license: Option<String>,
    pub requires: Vec<Dependency>,
    pub provides: Vec<Dependency>,
    pub conflicts: Vec<Dependency>,
    pub obsoletes: Vec<Dependency>,
    pub recommends: Vec<Dependency>,
    pub suggests: Vec<Dependency>,
    pub blob_name: String,
    pub blob_size: u64,
    pub blob_sha256: String,
    pub signature: Option<String>,
    pub repo_name: String,
    pub repo_priority: i32,
    pub bias: Option<f64>,
    pub decay: Option<f64>,
    pub origin: Origin,
}

impl PackageRecord {
    /// `name-version-release.arch` display form
    pub fn nvra(&self) -> String {
        format!(
            "{}-{}-{}.{}",
            self.name, self.version, self.release, self.arch
        )
    }

    /// True when this record satisfies `req` by name or by a provides entry.
    /// A provides entry carrying its own version is matched on that version,
    /// otherwise on the package version.
    pub fn satisfies(&self, req: &Dependency) -> bool {
        if self.name == req.name && req.accepts(&self.version) {
            return true;
        }
        self.provides.iter().any(|p| {
            if p.name != req.name {
                return false;
            }
            let provided = p
                .constraint
                .as_ref()
                .map(|c| &c.version)
                .unwrap_or(&self.version);
            req.accepts(provided)
        })
    }

    /// True when this record's conflicts/obsoletes clash with `other`
    pub fn conflicts_with(&self, other: &PackageRecord) -> bool {
        self.conflicts
            .iter()
            .chain(self.obsoletes.iter())
            .any(|dep| other.satisfies(dep))
    }
}

/// An installed record: catalog entry plus install-time state
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    pub record: PackageRecord,
    pub install_time: i64,
    pub explicit: bool,
}

/// One configured repository from `repos.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub priority: i32,
}

/// Hold and prefer pins
#[derive(Debug, Clone, Default)]
pub struct Pins {
    pub hold: BTreeSet<String>,
    pub prefer: BTreeMap<String, Constraint>,
}

#[derive(Debug, Default, Deserialize)]
struct PinsFile {
    #[serde(default)]
    hold: Vec<String>,
    #[serde(default)]
    prefer: BTreeMap<String, String>,
}

impl Pins {
    /// Load the `pins.json` overlay; absent file means no pins
    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        let raw: PinsFile = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let mut pins = Self {
            hold: raw.hold.into_iter().collect(),
            prefer: BTreeMap::new(),
        };
        for (name, expr) in raw.prefer {
            pins.prefer.insert(name, Constraint::parse(&expr)?);
        }
        Ok(pins)
    }

    /// Merge another pin set into this one; `other` entries win
    pub fn merge(&mut self, other: Pins) {
        self.hold.extend(other.hold);
        self.prefer.extend(other.prefer);
    }
}

/// Load the protected set from `protected.json`; the manager itself is
/// always protected.
pub fn load_protected(path: &Path) -> Result<BTreeSet<String>> {
    let mut protected: BTreeSet<String> = BTreeSet::new();
    protected.insert("lpm".to_string());
    if path.exists() {
        let text = fs::read_to_string(path)?;
        let names: Vec<String> = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        protected.extend(names);
    }
    Ok(protected)
}

/// Load `repos.json` (missing file means no repositories)
pub fn load_repos(path: &Path) -> Result<Vec<RepoConfig>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}

/// Raw `index.json` entry, converted into a [`PackageRecord`] after parse
#[derive(Debug, Deserialize)]
struct IndexEntry {
    name: String,
    version: String,
    release: u32,
    arch: String,
    #[serde(default)]
    summary: String,
    homepage: Option<String>,
    license: Option<String>,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    provides: Vec<String>,
    #[serde(default)]
    conflicts: Vec<String>,
    #[serde(default)]
    obsoletes: Vec<String>,
    #[serde(default)]
    recommends: Vec<String>,
    #[serde(default)]
    suggests: Vec<String>,
    blob: String,
    size: u64,
    sha256: String,
    signature: Option<String>,
    bias: Option<f64>,
    decay: Option<f64>,
}

pub(crate) fn parse_deps(raw: &[String]) -> Result<Vec<Dependency>> {
    raw.iter().map(|s| Dependency::parse(s)).collect()
}

impl IndexEntry {
    fn into_record(self, repo: &RepoConfig) -> Result<PackageRecord> {
        Ok(PackageRecord {
            version: Version::parse(&self.version)?,
            requires: parse_deps(&self.requires)?,
            provides: parse_deps(&self.provides)?,
            conflicts: parse_deps(&self.conflicts)?,
            obsoletes: parse_deps(&self.obsoletes)?,
            recommends: parse_deps(&self.recommends)?,
            suggests: parse_deps(&self.suggests)?,
            name: self.name,
            release: self.release,
            arch: self.arch,
            summary: self.summary,
            homepage: self.homepage,
            license: self.license,
            blob_name: self.blob,
            blob_size: self.size,
            blob_sha256: self.sha256,
            signature: self.signature,
            repo_name: repo.name.clone(),
            repo_priority: repo.priority,
            bias: self.bias,
            decay: self.decay,
            origin: Origin::Repository,
        })
    }
}

/// The merged, queryable catalog
pub struct Universe {
    /// Candidates per name, sorted newest-first then best-repo-first
    by_name: HashMap<String, Vec<PackageRecord>>,
    /// Capability name -> (package name, candidate index)
    providers: HashMap<String, Vec<(String, usize)>>,
    pub installed: HashMap<String, InstalledPackage>,
    pub pins: Pins,
    pub protected: BTreeSet<String>,
    repos: Vec<RepoConfig>,
}

impl Universe {
    /// Assemble the universe from repository indexes and installed records.
    ///
    /// Malformed index entries are skipped with a warning; an unreadable
    /// index is a `RepoMetadata` error. Architecture-incompatible candidates
    /// are dropped. On identical `(name, version, release)` the repo with
    /// the lower priority number wins.
    pub fn load(
        config: &Config,
        repos: Vec<RepoConfig>,
        indexes: Vec<(RepoConfig, Vec<u8>)>,
        locals: Vec<PackageRecord>,
        installed: Vec<InstalledPackage>,
        pins: Pins,
        protected: BTreeSet<String>,
    ) -> Result<Self> {
        let mut records: Vec<PackageRecord> = locals;

        for (repo, bytes) in indexes {
            let entries: Vec<serde_json::Value> =
                serde_json::from_slice(&bytes).map_err(|e| Error::RepoMetadata {
                    repo: repo.name.clone(),
                    reason: e.to_string(),
                })?;
            let mut skipped = 0usize;
            for value in entries {
                let entry: IndexEntry = match serde_json::from_value(value) {
                    Ok(e) => e,
                    Err(e) => {
                        skipped += 1;
                        warn!("repo {}: skipping malformed entry: {e}", repo.name);
                        continue;
                    }
                };
                let name = entry.name.clone();
                match entry.into_record(&repo) {
                    Ok(record) => {
                        if arch_compatible(&record.arch, &config.arch) {
                            records.push(record);
                        }
                    }
                    Err(e) => {
                        skipped += 1;
                        warn!("repo {}: skipping {name}: {e}", repo.name);
                    }
                }
            }
            if skipped > 0 {
                warn!("repo {}: {skipped} entries skipped", repo.name);
            }
        }

        // Installed records join the candidate set so the solver can keep
        // them when no repo still carries that version.
        for pkg in &installed {
            records.push(pkg.record.clone());
        }

        let mut by_name: HashMap<String, Vec<PackageRecord>> = HashMap::new();
        for record in records {
            let bucket = by_name.entry(record.name.clone()).or_default();
            // Duplicate (name, version, release): prefer the better repo,
            // but never shadow the installed record.
            if let Some(existing) = bucket.iter_mut().find(|r| {
                r.version == record.version
                    && r.release == record.release
                    && r.arch == record.arch
            }) {
                let keep_existing = existing.origin == Origin::Installed
                    || (record.origin != Origin::Installed
                        && existing.repo_priority <= record.repo_priority);
                if !keep_existing {
                    *existing = record;
                }
                continue;
            }
            bucket.push(record);
        }

        for bucket in by_name.values_mut() {
            bucket.sort_by(|a, b| {
                b.version
                    .cmp(&a.version)
                    .then(a.release.cmp(&b.release))
                    .then(a.repo_priority.cmp(&b.repo_priority))
            });
        }

        let mut providers: HashMap<String, Vec<(String, usize)>> = HashMap::new();
        for (name, bucket) in &by_name {
            for (idx, record) in bucket.iter().enumerate() {
                for p in &record.provides {
                    providers
                        .entry(p.name.clone())
                        .or_default()
                        .push((name.clone(), idx));
                }
            }
        }

        let installed = installed
            .into_iter()
            .map(|p| (p.record.name.clone(), p))
            .collect();

        Ok(Self {
            by_name,
            providers,
            installed,
            pins,
            protected,
            repos,
        })
    }

    /// All candidates for a name, newest first
    pub fn candidates(&self, name: &str) -> &[PackageRecord] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterate every candidate in stable name order
    pub fn all_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// All records satisfying a requirement, by name or provides
    pub fn satisfiers(&self, req: &Dependency) -> Vec<&PackageRecord> {
        let mut out: Vec<&PackageRecord> = Vec::new();
        for record in self.candidates(&req.name) {
            if record.satisfies(req) {
                out.push(record);
            }
        }
        if let Some(entries) = self.providers.get(&req.name) {
            for (name, idx) in entries {
                if name == &req.name {
                    continue;
                }
                if let Some(record) = self.by_name.get(name).and_then(|b| b.get(*idx)) {
                    if record.satisfies(req) {
                        out.push(record);
                    }
                }
            }
        }
        out
    }

    pub fn repos(&self) -> &[RepoConfig] {
        &self.repos
    }

    /// Hash of (repo set, installed set, pins); keys the persistent solver
    /// state, which is dropped whenever this changes.
    pub fn catalog_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for repo in &self.repos {
            hasher.update(repo.name.as_bytes());
            hasher.update(repo.url.as_bytes());
            hasher.update(repo.priority.to_le_bytes());
        }
        let mut names: Vec<&String> = self.installed.keys().collect();
        names.sort();
        for name in names {
            let pkg = &self.installed[name];
            hasher.update(pkg.record.nvra().as_bytes());
        }
        for name in &self.pins.hold {
            hasher.update(b"hold");
            hasher.update(name.as_bytes());
        }
        for (name, c) in &self.pins.prefer {
            hasher.update(b"prefer");
            hasher.update(name.as_bytes());
            hasher.update(c.to_string().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Fetch a repository's `index.json`
pub fn fetch_index(repo: &RepoConfig, config: &Config) -> Result<Vec<u8>> {
    let url = format!("{}/index.json", repo.url.trim_end_matches('/'));
    debug!("loading index for repo {} from {url}", repo.name);
    crate::blob::fetch_url_bytes(&url, config).map_err(|e| Error::RepoMetadata {
        repo: repo.name.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    pub(crate) fn test_config() -> Config {
        Config::from_keys(PathBuf::from("/tmp/lpm-test"), &HashMap::new()).unwrap()
    }

    fn repo(name: &str, priority: i32) -> RepoConfig {
        RepoConfig {
            name: name.to_string(),
            url: format!("file:///srv/{name}"),
            priority,
        }
    }

    fn entry(name: &str, version: &str, release: u32) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "version": version,
            "release": release,
            "arch": "noarch",
            "blob": format!("{name}-{version}-{release}.noarch.lpm"),
            "size": 1024,
            "sha256": "00".repeat(32),
        })
    }

    fn universe_from(entries: Vec<(RepoConfig, Vec<serde_json::Value>)>) -> Universe {
        let config = test_config();
        let repos: Vec<RepoConfig> = entries.iter().map(|(r, _)| r.clone()).collect();
        let indexes = entries
            .into_iter()
            .map(|(r, e)| (r, serde_json::to_vec(&e).unwrap()))
            .collect();
        Universe::load(
            &config,
            repos,
            indexes,
            Vec::new(),
            Vec::new(),
            Pins::default(),
            BTreeSet::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_dependency_parse() {
        let d = Dependency::parse("zlib >= 1.2").unwrap();
        assert_eq!(d.name, "zlib");
        assert!(d.accepts(&Version::parse("1.2.13").unwrap()));
        assert!(!d.accepts(&Version::parse("1.1").unwrap()));

        let bare = Dependency::parse("libssl.so").unwrap();
        assert!(bare.constraint.is_none());

        let cap = Dependency::parse("pypi(requests)").unwrap();
        assert_eq!(cap.name, "pypi(requests)");
    }

    #[test]
    fn test_candidates_sorted_newest_first() {
        let u = universe_from(vec![(
            repo("core", 10),
            vec![
                entry("zlib", "1.2.11", 1),
                entry("zlib", "1.2.13", 1),
                entry("zlib", "1.2.13", 2),
            ],
        )]);
        let c = u.candidates("zlib");
        assert_eq!(c.len(), 3);
        assert_eq!(c[0].version, Version::parse("1.2.13").unwrap());
        assert_eq!(c[0].release, 1);
        assert_eq!(c[1].release, 2);
        assert_eq!(c[2].version, Version::parse("1.2.11").unwrap());
    }

    #[test]
    fn test_duplicate_prefers_better_repo() {
        let u = universe_from(vec![
            (repo("extra", 20), vec![entry("tool", "1.0", 1)]),
            (repo("core", 10), vec![entry("tool", "1.0", 1)]),
        ]);
        let c = u.candidates("tool");
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].repo_name, "core");
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let config = test_config();
        let r = repo("core", 10);
        let index = serde_json::json!([
            {"name": "ok", "version": "1.0", "release": 1, "arch": "noarch",
             "blob": "ok.lpm", "size": 1, "sha256": "aa"},
            {"name": "broken"},
        ]);
        let u = Universe::load(
            &config,
            vec![r.clone()],
            vec![(r, serde_json::to_vec(&index).unwrap())],
            Vec::new(),
            Vec::new(),
            Pins::default(),
            BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(u.candidates("ok").len(), 1);
        assert!(u.candidates("broken").is_empty());
    }

    #[test]
    fn test_unreadable_index_is_error() {
        let config = test_config();
        let r = repo("core", 10);
        let err = Universe::load(
            &config,
            vec![r.clone()],
            vec![(r, b"not json".to_vec())],
            Vec::new(),
            Vec::new(),
            Pins::default(),
            BTreeSet::new(),
        );
        assert!(matches!(err, Err(Error::RepoMetadata { .. })));
    }

    #[test]
    fn test_satisfiers_via_provides() {
        let mut e = entry("openssl", "3.0.9", 1);
        e["provides"] = serde_json::json!(["libssl.so", "ssl = 3.0"]);
        let u = universe_from(vec![(repo("core", 10), vec![e])]);

        let by_cap = u.satisfiers(&Dependency::parse("libssl.so").unwrap());
        assert_eq!(by_cap.len(), 1);
        assert_eq!(by_cap[0].name, "openssl");

        let versioned = u.satisfiers(&Dependency::parse("ssl >= 2.5").unwrap());
        assert_eq!(versioned.len(), 1);

        let too_new = u.satisfiers(&Dependency::parse("ssl >= 3.1").unwrap());
        assert!(too_new.is_empty());
    }

    #[test]
    fn test_arch_filter() {
        let config = test_config();
        let r = repo("core", 10);
        let mut foreign = entry("tool", "1.0", 1);
        foreign["arch"] = serde_json::json!("m68k");
        let index = serde_json::json!([foreign]);
        let u = Universe::load(
            &config,
            vec![r.clone()],
            vec![(r, serde_json::to_vec(&index).unwrap())],
            Vec::new(),
            Vec::new(),
            Pins::default(),
            BTreeSet::new(),
        )
        .unwrap();
        assert!(u.candidates("tool").is_empty());
    }

    #[test]
    fn test_catalog_hash_changes_with_pins() {
        let u1 = universe_from(vec![(repo("core", 10), vec![entry("a", "1.0", 1)])]);
        let h1 = u1.catalog_hash();

        let config = test_config();
        let r = repo("core", 10);
        let index = serde_json::to_vec(&vec![entry("a", "1.0", 1)]).unwrap();
        let mut pins = Pins::default();
        pins.hold.insert("a".to_string());
        let u2 = Universe::load(
            &config,
            vec![r.clone()],
            vec![(r, index)],
            Vec::new(),
            Vec::new(),
            pins,
            BTreeSet::new(),
        )
        .unwrap();
        assert_ne!(h1, u2.catalog_hash());
    }

    #[test]
    fn test_conflicts_with() {
        let u = universe_from(vec![(
            repo("core", 10),
            vec![entry("foo", "2.0", 1), entry("oldfoo", "0.9", 1)],
        )]);
        let mut foo = u.candidates("foo")[0].clone();
        foo.obsoletes = vec![Dependency::unversioned("oldfoo")];
        let oldfoo = &u.candidates("oldfoo")[0];
        assert!(foo.conflicts_with(oldfoo));
        assert!(!oldfoo.conflicts_with(&foo));
    }
}
