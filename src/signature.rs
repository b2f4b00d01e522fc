// src/signature.rs

//! Detached Ed25519 signature verification
//!
//! Repository records carry a base64 signature over the blob bytes; local
//! packages may ship one embedded in the archive. Trust anchors are base64
//! Ed25519 public keys, one per file, under `/etc/lpm/trust/`. A signature
//! is accepted when any trusted key validates it.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Load every trusted public key from the trust directory
fn load_trusted_keys(trust_dir: &Path) -> Result<Vec<(String, VerifyingKey)>> {
    let mut keys = Vec::new();
    if !trust_dir.is_dir() {
        return Ok(keys);
    }
    let mut entries: Vec<_> = fs::read_dir(trust_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    entries.sort();
    for path in entries {
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let text = fs::read_to_string(&path)?;
        match parse_public_key(text.trim()) {
            Ok(key) => keys.push((label, key)),
            Err(e) => warn!("ignoring unreadable trust key {label}: {e}"),
        }
    }
    Ok(keys)
}

fn parse_public_key(b64: &str) -> Result<VerifyingKey> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|e| Error::Config(format!("invalid base64 public key: {e}")))?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Config(format!("public key must be 32 bytes, got {}", bytes.len())))?;
    VerifyingKey::from_bytes(&arr).map_err(|e| Error::Config(format!("invalid public key: {e}")))
}

/// Verify a detached base64 signature over `data` against the trust dir
pub fn verify_detached(name: &str, data: &[u8], sig_b64: &str, trust_dir: &Path) -> Result<()> {
    let sig_bytes = BASE64.decode(sig_b64.trim()).map_err(|e| Error::Signature {
        name: name.to_string(),
        reason: format!("invalid base64 signature: {e}"),
    })?;
    let sig_arr: [u8; 64] = sig_bytes.as_slice().try_into().map_err(|_| Error::Signature {
        name: name.to_string(),
        reason: format!("signature must be 64 bytes, got {}", sig_bytes.len()),
    })?;
    let signature = Signature::from_bytes(&sig_arr);

    let keys = load_trusted_keys(trust_dir)?;
    if keys.is_empty() {
        return Err(Error::Signature {
            name: name.to_string(),
            reason: format!("no trusted keys in {}", trust_dir.display()),
        });
    }
    for (label, key) in &keys {
        if key.verify(data, &signature).is_ok() {
            debug!("signature for {name} validated by key {label}");
            return Ok(());
        }
    }
    Err(Error::Signature {
        name: name.to_string(),
        reason: "no trusted key validates the signature".to_string(),
    })
}

/// Verify a blob file against its record signature. Unsigned records pass
/// with a warning; a present signature must validate.
pub fn verify_blob(
    name: &str,
    blob_path: &Path,
    signature: Option<&str>,
    trust_dir: &Path,
) -> Result<()> {
    match signature {
        Some(sig) => {
            let data = fs::read(blob_path)?;
            verify_detached(name, &data, sig, trust_dir)
        }
        None => {
            warn!("{name}: no signature present, skipping verification");
            Ok(())
        }
    }
}

/// Sign bytes with a raw Ed25519 private key, returning base64.
/// Used by the publishing tooling and the test fixtures.
pub fn sign_detached(key_bytes: &[u8; 32], data: &[u8]) -> String {
    let key = SigningKey::from_bytes(key_bytes);
    BASE64.encode(key.sign(data).to_bytes())
}

/// Base64 public key for a raw private key
pub fn public_key_base64(key_bytes: &[u8; 32]) -> String {
    let key = SigningKey::from_bytes(key_bytes);
    BASE64.encode(key.verifying_key().to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY: [u8; 32] = [7u8; 32];

    fn trust_dir_with_key(key: &[u8; 32]) -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("core.pub"), public_key_base64(key)).unwrap();
        temp
    }

    #[test]
    fn test_roundtrip_verifies() {
        let trust = trust_dir_with_key(&KEY);
        let sig = sign_detached(&KEY, b"payload");
        verify_detached("pkg", b"payload", &sig, trust.path()).unwrap();
    }

    #[test]
    fn test_wrong_payload_rejected() {
        let trust = trust_dir_with_key(&KEY);
        let sig = sign_detached(&KEY, b"payload");
        let err = verify_detached("pkg", b"tampered", &sig, trust.path()).unwrap_err();
        assert!(matches!(err, Error::Signature { .. }));
    }

    #[test]
    fn test_untrusted_key_rejected() {
        let trust = trust_dir_with_key(&KEY);
        let other: [u8; 32] = [9u8; 32];
        let sig = sign_detached(&other, b"payload");
        let err = verify_detached("pkg", b"payload", &sig, trust.path()).unwrap_err();
        assert!(matches!(err, Error::Signature { .. }));
    }

    #[test]
    fn test_empty_trust_dir_rejected() {
        let temp = TempDir::new().unwrap();
        let sig = sign_detached(&KEY, b"payload");
        let err = verify_detached("pkg", b"payload", &sig, temp.path()).unwrap_err();
        assert!(matches!(err, Error::Signature { .. }));
    }

    #[test]
    fn test_garbage_signature_rejected() {
        let trust = trust_dir_with_key(&KEY);
        let err = verify_detached("pkg", b"payload", "!!!", trust.path()).unwrap_err();
        assert!(matches!(err, Error::Signature { .. }));
    }

    #[test]
    fn test_unsigned_blob_passes() {
        let temp = TempDir::new().unwrap();
        let blob = temp.path().join("blob");
        fs::write(&blob, b"data").unwrap();
        verify_blob("pkg", &blob, None, temp.path()).unwrap();
    }

    #[test]
    fn test_signed_blob_roundtrip() {
        let trust = trust_dir_with_key(&KEY);
        let blob = trust.path().join("blob.lpm");
        fs::write(&blob, b"blob bytes").unwrap();
        let sig = sign_detached(&KEY, b"blob bytes");
        verify_blob("pkg", &blob, Some(&sig), trust.path()).unwrap();
    }
}
