// src/archive/mod.rs

//! Package archive pipeline: streaming extraction and manifest capture
//!
//! A package blob is a zstd-compressed tarball holding `.lpm/metadata.json`,
//! `.lpm/manifest.json`, an optional `.lpm/signature`, and the payload tree
//! at target-root-relative paths. Extraction streams through the
//! decompressor into the tar reader, writing into a per-package staging
//! directory while hashing file contents, and refuses entries that would
//! escape the staging root.
//!
//! Small files below the configured I/O buffer size take an in-memory
//! read-then-write path; larger files stream chunk-wise.

use crate::blob::sha256_bytes;
use crate::error::{Error, Result};
use crate::universe::{Origin, PackageRecord};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Reserved directory inside the archive for package control files
const CONTROL_DIR: &str = ".lpm";

/// Kind of a manifest entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

/// One recorded file of an installed package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Absolute path relative to the target root, e.g. `/usr/bin/app`
    pub path: String,
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Symlink target string
    #[serde(rename = "link", skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

/// Ordered list of entries a package owns
pub type Manifest = Vec<ManifestEntry>;

/// Package control metadata from `.lpm/metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMeta {
    pub name: String,
    pub version: String,
    pub release: u32,
    pub arch: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub obsoletes: Vec<String>,
    #[serde(default)]
    pub recommends: Vec<String>,
    #[serde(default)]
    pub suggests: Vec<String>,
}

impl PackageMeta {
    /// Turn control metadata into a catalog record for a local file
    pub fn into_record(
        self,
        blob_name: String,
        blob_size: u64,
        blob_sha256: String,
        signature: Option<String>,
    ) -> Result<PackageRecord> {
        Ok(PackageRecord {
            version: Version::parse(&self.version)?,
            requires: crate::universe::parse_deps(&self.requires)?,
            provides: crate::universe::parse_deps(&self.provides)?,
            conflicts: crate::universe::parse_deps(&self.conflicts)?,
            obsoletes: crate::universe::parse_deps(&self.obsoletes)?,
            recommends: crate::universe::parse_deps(&self.recommends)?,
            suggests: crate::universe::parse_deps(&self.suggests)?,
            name: self.name,
            release: self.release,
            arch: self.arch,
            summary: self.summary,
            homepage: self.homepage,
            license: self.license,
            blob_name,
            blob_size,
            blob_sha256,
            signature,
            repo_name: "local".to_string(),
            repo_priority: 0,
            bias: None,
            decay: None,
            origin: Origin::LocalFile,
        })
    }
}

/// Control files read from an archive without extracting the payload
#[derive(Debug)]
pub struct PackageControl {
    pub meta: PackageMeta,
    pub manifest: Manifest,
    pub signature: Option<String>,
    /// Exact bytes of the control documents, in signing order
    /// (metadata then manifest), for embedded-signature verification
    pub signed_bytes: Vec<u8>,
}

/// zstd magic bytes, checked before touching the decompressor
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Ensure a reader starts with the zstd magic, returning the full stream
fn check_magic(name: &str, mut reader: impl Read) -> Result<impl Read> {
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|_| Error::ArchiveFormat {
            name: name.to_string(),
            reason: "archive shorter than zstd magic".to_string(),
        })?;
    if magic != ZSTD_MAGIC {
        return Err(Error::ArchiveFormat {
            name: name.to_string(),
            reason: "not a zstd archive (bad magic)".to_string(),
        });
    }
    Ok(std::io::Cursor::new(magic).chain(reader))
}

/// Read `.lpm/metadata.json`, `.lpm/manifest.json`, and `.lpm/signature`
/// from a blob stream.
pub fn read_package_control(name: &str, reader: impl Read) -> Result<PackageControl> {
    let reader = check_magic(name, reader)?;
    let decoder = zstd::Decoder::new(reader).map_err(|e| Error::ArchiveFormat {
        name: name.to_string(),
        reason: format!("zstd: {e}"),
    })?;
    let mut archive = tar::Archive::new(decoder);

    let mut meta: Option<PackageMeta> = None;
    let mut manifest: Option<Manifest> = None;
    let mut signature: Option<String> = None;
    let mut meta_bytes: Vec<u8> = Vec::new();
    let mut manifest_bytes: Vec<u8> = Vec::new();

    for entry in archive.entries().map_err(|e| tar_err(name, e))? {
        let mut entry = entry.map_err(|e| tar_err(name, e))?;
        let path = entry.path().map_err(|e| tar_err(name, e))?.into_owned();
        let rel = normalize_entry_path(name, &path)?;
        let Some(control_name) = rel.strip_prefix(&format!("{CONTROL_DIR}/")).map(String::from)
        else {
            continue;
        };
        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|e| tar_err(name, e))?;
        match control_name.as_str() {
            "metadata.json" => {
                meta = Some(serde_json::from_slice(&content).map_err(|e| {
                    Error::ArchiveFormat {
                        name: name.to_string(),
                        reason: format!("metadata.json: {e}"),
                    }
                })?);
                meta_bytes = content;
            }
            "manifest.json" => {
                manifest = Some(serde_json::from_slice(&content).map_err(|e| {
                    Error::ArchiveFormat {
                        name: name.to_string(),
                        reason: format!("manifest.json: {e}"),
                    }
                })?);
                manifest_bytes = content;
            }
            "signature" => {
                signature = Some(String::from_utf8_lossy(&content).trim().to_string());
            }
            other => debug!("{name}: ignoring control file {other}"),
        }
        if meta.is_some() && manifest.is_some() && signature.is_some() {
            break;
        }
    }

    let meta = meta.ok_or_else(|| Error::ArchiveFormat {
        name: name.to_string(),
        reason: "missing .lpm/metadata.json".to_string(),
    })?;
    let manifest = manifest.ok_or_else(|| Error::ArchiveFormat {
        name: name.to_string(),
        reason: "missing .lpm/manifest.json".to_string(),
    })?;
    let mut signed_bytes = meta_bytes;
    signed_bytes.extend_from_slice(&manifest_bytes);
    Ok(PackageControl {
        meta,
        manifest,
        signature,
        signed_bytes,
    })
}

/// Stream-extract the payload into `staging`, returning the computed
/// manifest in archive order.
pub fn extract_payload(
    name: &str,
    reader: impl Read,
    staging: &Path,
    io_buffer_size: usize,
) -> Result<Manifest> {
    fs::create_dir_all(staging)?;
    let reader = check_magic(name, reader)?;
    let decoder = zstd::Decoder::new(reader).map_err(|e| Error::ArchiveFormat {
        name: name.to_string(),
        reason: format!("zstd: {e}"),
    })?;
    let mut archive = tar::Archive::new(decoder);

    let mut manifest = Manifest::new();

    for entry in archive.entries().map_err(|e| tar_err(name, e))? {
        let mut entry = entry.map_err(|e| tar_err(name, e))?;
        let path = entry.path().map_err(|e| tar_err(name, e))?.into_owned();
        let rel = normalize_entry_path(name, &path)?;
        if rel.is_empty() || rel == CONTROL_DIR || rel.starts_with(&format!("{CONTROL_DIR}/")) {
            continue;
        }

        let dest = staging.join(&rel);
        ensure_no_symlink_parents(staging, &rel)?;

        let header = entry.header();
        let mode = header.mode().map_err(|e| tar_err(name, e))? & 0o7777;
        let uid = header.uid().map_err(|e| tar_err(name, e))? as u32;
        let gid = header.gid().map_err(|e| tar_err(name, e))? as u32;

        match header.entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&dest).map_err(|e| archive_io(&dest, e))?;
                set_mode(&dest, mode)?;
                manifest.push(ManifestEntry {
                    path: format!("/{rel}"),
                    kind: FileKind::Directory,
                    mode,
                    uid,
                    gid,
                    size: None,
                    sha256: None,
                    link_target: None,
                });
            }
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| tar_err(name, e))?
                    .ok_or_else(|| Error::ArchiveFormat {
                        name: name.to_string(),
                        reason: format!("symlink {rel} has no target"),
                    })?
                    .to_string_lossy()
                    .into_owned();
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).map_err(|e| archive_io(parent, e))?;
                }
                if dest.symlink_metadata().is_ok() {
                    fs::remove_file(&dest).map_err(|e| archive_io(&dest, e))?;
                }
                std::os::unix::fs::symlink(&target, &dest).map_err(|e| archive_io(&dest, e))?;
                if let Err(e) = std::os::unix::fs::lchown(&dest, Some(uid), Some(gid)) {
                    debug!("lchown {} skipped: {e}", dest.display());
                }
                manifest.push(ManifestEntry {
                    path: format!("/{rel}"),
                    kind: FileKind::Symlink,
                    mode: 0o777,
                    uid,
                    gid,
                    size: None,
                    sha256: Some(sha256_bytes(target.as_bytes())),
                    link_target: Some(target),
                });
            }
            tar::EntryType::Regular => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).map_err(|e| archive_io(parent, e))?;
                }
                let size = entry.size();
                let digest = if (size as usize) < io_buffer_size {
                    // Small file: one read, one write
                    let mut content = Vec::with_capacity(size as usize);
                    entry
                        .read_to_end(&mut content)
                        .map_err(|e| tar_err(name, e))?;
                    fs::write(&dest, &content).map_err(|e| archive_io(&dest, e))?;
                    sha256_bytes(&content)
                } else {
                    let mut out = File::create(&dest).map_err(|e| archive_io(&dest, e))?;
                    let mut hasher = Sha256::new();
                    let mut buffer = vec![0u8; io_buffer_size];
                    loop {
                        let n = entry.read(&mut buffer).map_err(|e| tar_err(name, e))?;
                        if n == 0 {
                            break;
                        }
                        hasher.update(&buffer[..n]);
                        out.write_all(&buffer[..n]).map_err(|e| archive_io(&dest, e))?;
                    }
                    format!("{:x}", hasher.finalize())
                };
                set_mode(&dest, mode)?;
                set_owner(&dest, uid, gid);
                manifest.push(ManifestEntry {
                    path: format!("/{rel}"),
                    kind: FileKind::File,
                    mode,
                    uid,
                    gid,
                    size: Some(size),
                    sha256: Some(digest),
                    link_target: None,
                });
            }
            other => {
                warn!("{name}: skipping unsupported entry type {other:?} at {rel}");
            }
        }
    }

    Ok(manifest)
}

/// Compare the manifest computed during extraction against the one the
/// archive declares. Symlink digests accept either the link-string digest
/// or the digest of the pointed-to payload inside staging.
pub fn check_manifest(
    name: &str,
    staging: &Path,
    declared: &Manifest,
    computed: &Manifest,
) -> Result<()> {
    for want in declared {
        let got = computed
            .iter()
            .find(|e| e.path == want.path)
            .ok_or_else(|| Error::ArchiveFormat {
                name: name.to_string(),
                reason: format!("manifest names missing entry {}", want.path),
            })?;
        if want.kind != got.kind {
            return Err(Error::ArchiveFormat {
                name: name.to_string(),
                reason: format!(
                    "{}: kind mismatch ({:?} declared, {:?} extracted)",
                    want.path, want.kind, got.kind
                ),
            });
        }
        if let (Some(want_size), Some(got_size)) = (want.size, got.size) {
            if want_size != got_size {
                return Err(Error::ArchiveFormat {
                    name: name.to_string(),
                    reason: format!(
                        "{}: size mismatch ({want_size} declared, {got_size} extracted)",
                        want.path
                    ),
                });
            }
        }
        if let Some(want_hash) = &want.sha256 {
            let matches = match got.kind {
                FileKind::Symlink => {
                    got.sha256.as_deref() == Some(want_hash.as_str())
                        || symlink_payload_hash(staging, got)
                            .map(|h| &h == want_hash)
                            .unwrap_or(false)
                }
                _ => got.sha256.as_deref() == Some(want_hash.as_str()),
            };
            if !matches {
                return Err(Error::ArchiveFormat {
                    name: name.to_string(),
                    reason: format!(
                        "{}: digest mismatch (declared {want_hash}, extracted {})",
                        want.path,
                        got.sha256.as_deref().unwrap_or("none")
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Digest of the file a staged symlink points at, when it resolves inside
/// the staging root.
fn symlink_payload_hash(staging: &Path, entry: &ManifestEntry) -> Option<String> {
    let target = entry.link_target.as_deref()?;
    let link_path = staging.join(entry.path.trim_start_matches('/'));
    let candidate = if let Some(rel) = target.strip_prefix('/') {
        staging.join(rel)
    } else {
        link_path.parent()?.join(target)
    };
    let resolved = candidate.canonicalize().ok()?;
    let staging = staging.canonicalize().ok()?;
    if !resolved.starts_with(&staging) || !resolved.is_file() {
        return None;
    }
    crate::blob::sha256_file(&resolved).ok()
}

/// Normalize and validate an archive entry path: relative, no `..`,
/// no absolute components.
fn normalize_entry_path(name: &str, path: &Path) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(p) => {
                parts.push(p.to_str().ok_or_else(|| Error::ArchiveFormat {
                    name: name.to_string(),
                    reason: format!("non-UTF8 path {path:?}"),
                })?)
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathEscape(path.display().to_string()));
            }
        }
    }
    Ok(parts.join("/"))
}

/// Refuse to write through a symlinked ancestor inside staging
fn ensure_no_symlink_parents(staging: &Path, rel: &str) -> Result<()> {
    let mut current = staging.to_path_buf();
    let parts: Vec<&str> = rel.split('/').collect();
    for part in &parts[..parts.len().saturating_sub(1)] {
        current = current.join(part);
        if let Ok(meta) = current.symlink_metadata() {
            if meta.file_type().is_symlink() {
                return Err(Error::PathEscape(format!(
                    "{rel} crosses symlink at {}",
                    current.display()
                )));
            }
        }
    }
    Ok(())
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| archive_io(path, e))
}

/// Ownership is preserved when running as root; otherwise the attempt is
/// ignored so non-root test extraction works.
fn set_owner(path: &Path, uid: u32, gid: u32) {
    if let Err(e) = std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
        debug!("chown {} to {uid}:{gid} skipped: {e}", path.display());
    }
}

fn tar_err(name: &str, e: std::io::Error) -> Error {
    Error::ArchiveFormat {
        name: name.to_string(),
        reason: format!("tar: {e}"),
    }
}

fn archive_io(path: &Path, source: std::io::Error) -> Error {
    Error::ArchiveIo {
        path: path.to_path_buf(),
        source,
    }
}

/// Build a package archive from a payload tree. Produces the same layout
/// `extract_payload` consumes; the returned manifest is what was embedded.
pub fn build_package(
    payload_root: &Path,
    meta: &PackageMeta,
    output: &Path,
    signing_key: Option<&[u8; 32]>,
) -> Result<Manifest> {
    let mut manifest = Manifest::new();
    let mut files: Vec<(String, PathBuf)> = Vec::new();

    for entry in WalkDir::new(payload_root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::ArchiveFormat {
            name: output.display().to_string(),
            reason: format!("walk: {e}"),
        })?;
        let rel = entry
            .path()
            .strip_prefix(payload_root)
            .expect("walkdir stays under root")
            .to_string_lossy()
            .into_owned();
        let meta_fs = entry
            .path()
            .symlink_metadata()
            .map_err(|e| archive_io(entry.path(), e))?;
        use std::os::unix::fs::MetadataExt;
        let mode = meta_fs.mode() & 0o7777;
        if meta_fs.file_type().is_symlink() {
            let target = fs::read_link(entry.path())
                .map_err(|e| archive_io(entry.path(), e))?
                .to_string_lossy()
                .into_owned();
            manifest.push(ManifestEntry {
                path: format!("/{rel}"),
                kind: FileKind::Symlink,
                mode: 0o777,
                uid: meta_fs.uid(),
                gid: meta_fs.gid(),
                size: None,
                sha256: Some(sha256_bytes(target.as_bytes())),
                link_target: Some(target),
            });
            files.push((rel, entry.path().to_path_buf()));
        } else if meta_fs.is_dir() {
            manifest.push(ManifestEntry {
                path: format!("/{rel}"),
                kind: FileKind::Directory,
                mode,
                uid: meta_fs.uid(),
                gid: meta_fs.gid(),
                size: None,
                sha256: None,
                link_target: None,
            });
            files.push((rel, entry.path().to_path_buf()));
        } else {
            manifest.push(ManifestEntry {
                path: format!("/{rel}"),
                kind: FileKind::File,
                mode,
                uid: meta_fs.uid(),
                gid: meta_fs.gid(),
                size: Some(meta_fs.len()),
                sha256: Some(crate::blob::sha256_file(entry.path())?),
                link_target: None,
            });
            files.push((rel, entry.path().to_path_buf()));
        }
    }

    let out_file = File::create(output).map_err(|e| archive_io(output, e))?;
    let encoder = zstd::Encoder::new(out_file, 0).map_err(|e| Error::ArchiveFormat {
        name: output.display().to_string(),
        reason: format!("zstd: {e}"),
    })?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let meta_json = serde_json::to_vec_pretty(meta).map_err(|e| Error::ArchiveFormat {
        name: output.display().to_string(),
        reason: e.to_string(),
    })?;
    let manifest_json =
        serde_json::to_vec_pretty(&manifest).map_err(|e| Error::ArchiveFormat {
            name: output.display().to_string(),
            reason: e.to_string(),
        })?;

    append_control(&mut builder, "metadata.json", &meta_json)?;
    append_control(&mut builder, "manifest.json", &manifest_json)?;
    if let Some(key) = signing_key {
        // The embedded signature covers the control metadata and manifest
        let mut signed = meta_json.clone();
        signed.extend_from_slice(&manifest_json);
        let sig = crate::signature::sign_detached(key, &signed);
        append_control(&mut builder, "signature", sig.as_bytes())?;
    }

    for (rel, path) in files {
        builder
            .append_path_with_name(&path, &rel)
            .map_err(|e| archive_io(&path, e))?;
    }

    let encoder = builder.into_inner().map_err(|e| archive_io(output, e))?;
    encoder.finish().map_err(|e| archive_io(output, e))?;
    debug!("built package archive {}", output.display());
    Ok(manifest)
}

fn append_control<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    content: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, format!("{CONTROL_DIR}/{name}"), content)
        .map_err(|e| Error::ArchiveFormat {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(name: &str) -> PackageMeta {
        PackageMeta {
            name: name.to_string(),
            version: "1.0".to_string(),
            release: 1,
            arch: "noarch".to_string(),
            summary: "test package".to_string(),
            homepage: None,
            license: None,
            requires: Vec::new(),
            provides: Vec::new(),
            conflicts: Vec::new(),
            obsoletes: Vec::new(),
            recommends: Vec::new(),
            suggests: Vec::new(),
        }
    }

    fn build_sample(temp: &TempDir) -> PathBuf {
        let payload = temp.path().join("payload");
        fs::create_dir_all(payload.join("usr/bin")).unwrap();
        fs::write(payload.join("usr/bin/app"), b"#!/bin/sh\necho app\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(
            payload.join("usr/bin/app"),
            fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        std::os::unix::fs::symlink("app", payload.join("usr/bin/app-link")).unwrap();

        let out = temp.path().join("app-1.0-1.noarch.lpm");
        build_package(&payload, &meta("app"), &out, None).unwrap();
        out
    }

    #[test]
    fn test_roundtrip_manifest_matches() {
        let temp = TempDir::new().unwrap();
        let blob = build_sample(&temp);

        let control = read_package_control("app", File::open(&blob).unwrap()).unwrap();
        assert_eq!(control.meta.name, "app");
        assert!(control.signature.is_none());

        let staging = temp.path().join("staging");
        let computed = extract_payload(
            "app",
            File::open(&blob).unwrap(),
            &staging,
            crate::config::DEFAULT_IO_BUFFER_SIZE,
        )
        .unwrap();

        check_manifest("app", &staging, &control.manifest, &computed).unwrap();

        let app = computed
            .iter()
            .find(|e| e.path == "/usr/bin/app")
            .expect("app in manifest");
        assert_eq!(app.kind, FileKind::File);
        assert_eq!(app.mode, 0o755);
        assert_eq!(app.size, Some(19));
        assert!(staging.join("usr/bin/app").exists());

        let link = computed
            .iter()
            .find(|e| e.path == "/usr/bin/app-link")
            .expect("link in manifest");
        assert_eq!(link.kind, FileKind::Symlink);
        assert_eq!(link.link_target.as_deref(), Some("app"));
        assert_eq!(link.sha256.as_deref(), Some(sha256_bytes(b"app").as_str()));
    }

    #[test]
    fn test_large_file_streams() {
        let temp = TempDir::new().unwrap();
        let payload = temp.path().join("payload");
        fs::create_dir_all(&payload).unwrap();
        // Larger than the floor buffer forces the streaming path
        let big = vec![0xabu8; crate::config::IO_BUFFER_FLOOR + 1];
        fs::write(payload.join("big.bin"), &big).unwrap();
        let out = temp.path().join("big-1.0-1.noarch.lpm");
        build_package(&payload, &meta("big"), &out, None).unwrap();

        let staging = temp.path().join("staging");
        let manifest = extract_payload(
            "big",
            File::open(&out).unwrap(),
            &staging,
            crate::config::IO_BUFFER_FLOOR,
        )
        .unwrap();
        let entry = &manifest[0];
        assert_eq!(entry.size, Some(big.len() as u64));
        assert_eq!(entry.sha256.as_deref(), Some(sha256_bytes(&big).as_str()));
        assert_eq!(fs::read(staging.join("big.bin")).unwrap(), big);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let temp = TempDir::new().unwrap();
        let bogus = temp.path().join("bogus.lpm");
        fs::write(&bogus, b"definitely not zstd").unwrap();
        let err = read_package_control("bogus", File::open(&bogus).unwrap()).unwrap_err();
        assert!(matches!(err, Error::ArchiveFormat { .. }));
    }

    #[test]
    fn test_path_escape_rejected() {
        let temp = TempDir::new().unwrap();
        // Hand-build an archive with a traversal entry
        let out = temp.path().join("evil.lpm");
        let encoder = zstd::Encoder::new(File::create(&out).unwrap(), 0).unwrap();
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        let content = b"owned";
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "../escape.txt", content.as_slice())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let staging = temp.path().join("staging");
        let err = extract_payload(
            "evil",
            File::open(&out).unwrap(),
            &staging,
            crate::config::DEFAULT_IO_BUFFER_SIZE,
        )
        .unwrap_err();
        assert!(matches!(err, Error::PathEscape(_)));
        assert!(!temp.path().join("escape.txt").exists());
    }

    #[test]
    fn test_check_manifest_detects_mismatch() {
        let temp = TempDir::new().unwrap();
        let blob = build_sample(&temp);
        let control = read_package_control("app", File::open(&blob).unwrap()).unwrap();
        let staging = temp.path().join("staging");
        let computed = extract_payload(
            "app",
            File::open(&blob).unwrap(),
            &staging,
            crate::config::DEFAULT_IO_BUFFER_SIZE,
        )
        .unwrap();

        let mut tampered = control.manifest.clone();
        for entry in &mut tampered {
            if entry.kind == FileKind::File {
                entry.sha256 = Some("00".repeat(32));
            }
        }
        let err = check_manifest("app", &staging, &tampered, &computed).unwrap_err();
        assert!(matches!(err, Error::ArchiveFormat { .. }));
    }

    #[test]
    fn test_signature_embedded_when_key_given() {
        let temp = TempDir::new().unwrap();
        let payload = temp.path().join("payload");
        fs::create_dir_all(&payload).unwrap();
        fs::write(payload.join("file"), b"data").unwrap();
        let out = temp.path().join("signed-1.0-1.noarch.lpm");
        let key = [3u8; 32];
        build_package(&payload, &meta("signed"), &out, Some(&key)).unwrap();

        let control = read_package_control("signed", File::open(&out).unwrap()).unwrap();
        assert!(control.signature.is_some());
    }

    #[test]
    fn test_meta_into_record() {
        let record = meta("app")
            .into_record("app.lpm".into(), 42, "ab".repeat(32), None)
            .unwrap();
        assert_eq!(record.name, "app");
        assert_eq!(record.origin, Origin::LocalFile);
        assert_eq!(record.repo_name, "local");
    }
}
