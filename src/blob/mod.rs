// src/blob/mod.rs

//! Content-addressed blob cache and parallel fetcher
//!
//! Blobs are keyed by the SHA-256 of the compressed artifact and stored at
//! `<cache>/<first-two-hex>/<full-hex>`. Downloads stream into a `.part`
//! file while hashing, then fsync and atomically rename, so a cache entry
//! is either absent or byte-identical to its key. A per-hash lock table
//! keeps concurrent fetches of the same blob single-flight.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::universe::{PackageRecord, RepoConfig};
use dashmap::DashMap;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rayon::prelude::*;
use reqwest::blocking::Client;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Maximum download attempts per blob
const MAX_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff between attempts
const RETRY_DELAY_MS: u64 = 500;

/// Streaming buffer for downloads and hashing
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Content-addressed blob cache
pub struct BlobStore {
    cache_dir: PathBuf,
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl BlobStore {
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_dir(config.cache_dir())
    }

    pub fn with_dir(cache_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            inflight: DashMap::new(),
        })
    }

    /// Cache path for a hash: `<cache>/<xx>/<hash>`
    pub fn path_for(&self, sha256: &str) -> PathBuf {
        if sha256.len() < 2 {
            return self.cache_dir.join(sha256);
        }
        let (prefix, _) = sha256.split_at(2);
        self.cache_dir.join(prefix).join(sha256)
    }

    /// True when the blob is already cached
    pub fn contains(&self, sha256: &str) -> bool {
        self.path_for(sha256).exists()
    }

    /// Fetch every record's blob into the cache, in parallel.
    ///
    /// The pool is sized by `FETCH_MAX_WORKERS`. Transient failures retry
    /// with exponential backoff; the first permanent failure aborts the
    /// whole fetch.
    pub fn fetch_all(
        &self,
        records: &[&PackageRecord],
        repos: &[RepoConfig],
        config: &Config,
    ) -> Result<()> {
        let pending: Vec<&&PackageRecord> = records
            .iter()
            .filter(|r| !self.contains(&r.blob_sha256))
            .collect();
        if pending.is_empty() {
            debug!("all blobs already cached");
            return Ok(());
        }

        let total: u64 = pending.iter().map(|r| r.blob_size).sum();
        info!(
            "fetching {} blobs ({:.1} MiB)",
            pending.len(),
            total as f64 / 1048576.0
        );

        let client = Client::builder()
            .connect_timeout(config.fetch_connect_timeout)
            .timeout(config.fetch_total_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        let progress = MultiProgress::new();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.fetch_max_workers.min(pending.len()).max(1))
            .build()
            .map_err(|e| Error::Config(format!("failed to build fetch pool: {e}")))?;

        pool.install(|| {
            pending
                .par_iter()
                .map(|record| {
                    let bar = progress.add(download_bar(record));
                    let result = self.fetch_one(record, repos, &client, &bar);
                    match &result {
                        Ok(()) => bar.finish_with_message("done"),
                        Err(e) => bar.abandon_with_message(e.to_string()),
                    }
                    result
                })
                .collect::<Result<Vec<()>>>()
        })?;
        Ok(())
    }

    /// Fetch a single blob, retrying transient failures
    fn fetch_one(
        &self,
        record: &PackageRecord,
        repos: &[RepoConfig],
        client: &Client,
        bar: &ProgressBar,
    ) -> Result<()> {
        let hash = &record.blob_sha256;
        let guard = self
            .inflight
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = guard.lock().unwrap_or_else(|e| e.into_inner());

        if self.contains(hash) {
            return Ok(());
        }

        let repo = repos
            .iter()
            .find(|r| r.name == record.repo_name)
            .ok_or_else(|| Error::FetchNetwork {
                url: record.blob_name.clone(),
                reason: format!("unknown repository '{}'", record.repo_name),
            })?;
        let url = format!(
            "{}/{}",
            repo.url.trim_end_matches('/'),
            record.blob_name
        );

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_download(record, &url, client, bar) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    let delay = RETRY_DELAY_MS * (1 << (attempt - 1));
                    warn!(
                        "fetch attempt {attempt} for {} failed ({e}), retrying in {delay}ms",
                        record.blob_name
                    );
                    std::thread::sleep(Duration::from_millis(delay));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One download attempt: stream, hash, verify, atomically publish
    fn try_download(
        &self,
        record: &PackageRecord,
        url: &str,
        client: &Client,
        bar: &ProgressBar,
    ) -> Result<()> {
        let final_path = self.path_for(&record.blob_sha256);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let part_path = final_path.with_extension("part");

        let mut out = File::create(&part_path)?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;

        let copy_result: Result<()> = if let Some(path) = file_url_path(url) {
            let mut src = File::open(&path).map_err(|e| Error::FetchNetwork {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            stream_copy(&mut src, &mut out, &mut hasher, &mut written, bar)
        } else {
            let response = client.get(url).send().map_err(|e| classify_reqwest(url, e))?;
            let status = response.status();
            if !status.is_success() {
                let _ = fs::remove_file(&part_path);
                return Err(Error::FetchNetwork {
                    url: url.to_string(),
                    reason: format!("HTTP {status}"),
                });
            }
            let mut response = response;
            stream_copy(&mut response, &mut out, &mut hasher, &mut written, bar)
        };

        if let Err(e) = copy_result {
            let _ = fs::remove_file(&part_path);
            return Err(e);
        }

        let actual = format!("{:x}", hasher.finalize());
        if actual != record.blob_sha256 {
            let _ = fs::remove_file(&part_path);
            return Err(Error::FetchChecksum {
                name: record.blob_name.clone(),
                expected: record.blob_sha256.clone(),
                actual,
            });
        }

        out.sync_all()?;
        drop(out);
        fs::rename(&part_path, &final_path)?;
        debug!("cached {} ({} bytes)", record.blob_sha256, written);
        Ok(())
    }

    /// Hash a local file and copy it into the cache, returning its key
    pub fn insert_file(&self, path: &Path) -> Result<String> {
        let hash = sha256_file(path)?;
        let dest = self.path_for(&hash);
        if dest.exists() {
            return Ok(hash);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let part = dest.with_extension("part");
        fs::copy(path, &part)?;
        let f = File::open(&part)?;
        f.sync_all()?;
        fs::rename(&part, &dest)?;
        Ok(hash)
    }

    /// Open a cached blob for reading
    pub fn open(&self, sha256: &str) -> Result<File> {
        let path = self.path_for(sha256);
        File::open(&path).map_err(|e| Error::ArchiveIo { path, source: e })
    }

    /// Remove everything under the cache (the `clean` command)
    pub fn evict_all(&self) -> Result<()> {
        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        info!("blob cache cleared");
        Ok(())
    }
}

fn classify_reqwest(url: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::FetchTimeout(url.to_string())
    } else {
        Error::FetchNetwork {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }
}

fn stream_copy(
    src: &mut dyn Read,
    out: &mut File,
    hasher: &mut Sha256,
    written: &mut u64,
    bar: &ProgressBar,
) -> Result<()> {
    let mut buffer = [0u8; STREAM_BUFFER_SIZE];
    loop {
        let n = src.read(&mut buffer).map_err(|e| Error::FetchNetwork {
            url: "<stream>".to_string(),
            reason: e.to_string(),
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        out.write_all(&buffer[..n])?;
        *written += n as u64;
        bar.set_position(*written);
    }
    Ok(())
}

fn download_bar(record: &PackageRecord) -> ProgressBar {
    let bar = ProgressBar::new(record.blob_size);
    bar.set_style(
        ProgressStyle::with_template("{msg:30!} {bar:30} {bytes}/{total_bytes}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_message(record.blob_name.clone());
    bar
}

/// Local path behind a `file://` URL, if any
fn file_url_path(url: &str) -> Option<PathBuf> {
    url.strip_prefix("file://").map(PathBuf::from)
}

/// Streaming SHA-256 of a file
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; STREAM_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 of a byte slice
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Fetch a URL into memory; `file://` URLs read straight from disk.
/// Used for repository indexes and trust material, not blobs.
pub fn fetch_url_bytes(url: &str, config: &Config) -> Result<Vec<u8>> {
    if let Some(path) = file_url_path(url) {
        return fs::read(&path).map_err(|e| Error::FetchNetwork {
            url: url.to_string(),
            reason: e.to_string(),
        });
    }
    let client = Client::builder()
        .connect_timeout(config.fetch_connect_timeout)
        .timeout(config.fetch_total_timeout)
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
    let response = client.get(url).send().map_err(|e| classify_reqwest(url, e))?;
    if !response.status().is_success() {
        return Err(Error::FetchNetwork {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }
    response
        .bytes()
        .map(|b| b.to_vec())
        .map_err(|e| classify_reqwest(url, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::universe::Origin;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn config(root: &Path) -> Config {
        Config::from_keys(root.to_path_buf(), &HashMap::new()).unwrap()
    }

    fn record_for(blob: &Path, repo_name: &str) -> PackageRecord {
        PackageRecord {
            name: "pkg".to_string(),
            version: crate::version::Version::parse("1.0").unwrap(),
            release: 1,
            arch: "noarch".to_string(),
            summary: String::new(),
            homepage: None,
            license: None,
            requires: Vec::new(),
            provides: Vec::new(),
            conflicts: Vec::new(),
            obsoletes: Vec::new(),
            recommends: Vec::new(),
            suggests: Vec::new(),
            blob_name: blob.file_name().unwrap().to_string_lossy().into_owned(),
            blob_size: fs::metadata(blob).map(|m| m.len()).unwrap_or(0),
            blob_sha256: sha256_file(blob).unwrap(),
            signature: None,
            repo_name: repo_name.to_string(),
            repo_priority: 10,
            bias: None,
            decay: None,
            origin: Origin::Repository,
        }
    }

    #[test]
    fn test_path_layout() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::with_dir(temp.path().join("cache")).unwrap();
        let path = store.path_for("abcdef");
        assert!(path.ends_with("ab/abcdef"));
    }

    #[test]
    fn test_fetch_from_file_repo() {
        let temp = TempDir::new().unwrap();
        let repo_dir = temp.path().join("repo");
        fs::create_dir_all(&repo_dir).unwrap();
        let blob = repo_dir.join("pkg-1.0-1.noarch.lpm");
        fs::write(&blob, b"blob contents").unwrap();

        let record = record_for(&blob, "core");
        let repos = vec![RepoConfig {
            name: "core".to_string(),
            url: format!("file://{}", repo_dir.display()),
            priority: 10,
        }];
        let store = BlobStore::with_dir(temp.path().join("cache")).unwrap();
        let cfg = config(temp.path());

        store.fetch_all(&[&record], &repos, &cfg).unwrap();
        assert!(store.contains(&record.blob_sha256));
        let cached = fs::read(store.path_for(&record.blob_sha256)).unwrap();
        assert_eq!(cached, b"blob contents");

        // Second fetch is a no-op
        store.fetch_all(&[&record], &repos, &cfg).unwrap();
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let temp = TempDir::new().unwrap();
        let repo_dir = temp.path().join("repo");
        fs::create_dir_all(&repo_dir).unwrap();
        let blob = repo_dir.join("pkg-1.0-1.noarch.lpm");
        fs::write(&blob, b"blob contents").unwrap();

        let mut record = record_for(&blob, "core");
        record.blob_sha256 = "11".repeat(32);
        let repos = vec![RepoConfig {
            name: "core".to_string(),
            url: format!("file://{}", repo_dir.display()),
            priority: 10,
        }];
        let store = BlobStore::with_dir(temp.path().join("cache")).unwrap();
        let err = store
            .fetch_all(&[&record], &repos, &config(temp.path()))
            .unwrap_err();
        assert!(matches!(err, Error::FetchChecksum { .. }));
        assert!(!store.contains(&record.blob_sha256));
        // No .part residue
        assert!(!store
            .path_for(&record.blob_sha256)
            .with_extension("part")
            .exists());
    }

    #[test]
    fn test_insert_file_and_open() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::with_dir(temp.path().join("cache")).unwrap();
        let source = temp.path().join("local.lpm");
        fs::write(&source, b"local package").unwrap();

        let hash = store.insert_file(&source).unwrap();
        assert!(store.contains(&hash));
        let mut content = Vec::new();
        store.open(&hash).unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content, b"local package");
    }

    #[test]
    fn test_evict_all() {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::with_dir(temp.path().join("cache")).unwrap();
        let source = temp.path().join("local.lpm");
        fs::write(&source, b"x").unwrap();
        let hash = store.insert_file(&source).unwrap();
        assert!(store.contains(&hash));
        store.evict_all().unwrap();
        assert!(!store.contains(&hash));
    }

    #[test]
    fn test_sha256_helpers_agree() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("data");
        fs::write(&file, b"hello").unwrap();
        assert_eq!(sha256_file(&file).unwrap(), sha256_bytes(b"hello"));
        assert_eq!(
            sha256_bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_fetch_url_bytes_file_scheme() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("index.json");
        fs::write(&file, b"[]").unwrap();
        let cfg = config(temp.path());
        let bytes = fetch_url_bytes(&format!("file://{}", file.display()), &cfg).unwrap();
        assert_eq!(bytes, b"[]");
    }
}
