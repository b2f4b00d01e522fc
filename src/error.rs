// src/error.rs

//! Error taxonomy for the package manager
//!
//! Every fallible operation in the crate returns [`Result`]. The transaction
//! controller maps errors to process exit codes at the CLI boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type covering configuration, resolution, fetch, archive,
/// database, snapshot, hook, and lock failures.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Repository index could not be loaded or parsed
    #[error("repository metadata error ({repo}): {reason}")]
    RepoMetadata { repo: String, reason: String },

    /// Unparseable version string
    #[error("invalid version: {0}")]
    InvalidVersion(String),

    /// Unparseable dependency expression
    #[error("invalid dependency expression: {0}")]
    InvalidDependency(String),

    /// The request set has no model; `core` names the assumptions that
    /// cannot jointly hold
    #[error("no solution: conflicting requirements: {}", core.join(", "))]
    Unsat { core: Vec<String> },

    /// A request matched more than one package where exactly one was required
    #[error("ambiguous request {}: candidates {}", .0, .1.join(", "))]
    Ambiguous(String, Vec<String>),

    /// No candidate satisfies a requested package
    #[error("no package satisfies '{0}'")]
    NoCandidate(String),

    /// An operation would violate a hold pin without --force
    #[error("package '{0}' is held; use --force to override")]
    PinViolation(String),

    /// An operation would remove a protected package without --force
    #[error("package '{0}' is protected; use --force to override")]
    ProtectedViolation(String),

    /// Transient or permanent download failure
    #[error("fetch failed for {url}: {reason}")]
    FetchNetwork { url: String, reason: String },

    /// Downloaded bytes do not match the expected digest
    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    FetchChecksum {
        name: String,
        expected: String,
        actual: String,
    },

    /// Download exceeded the configured deadline
    #[error("fetch timed out for {0}")]
    FetchTimeout(String),

    /// Signature missing, malformed, or not validated by any trusted key
    #[error("signature verification failed for {name}: {reason}")]
    Signature { name: String, reason: String },

    /// Archive is not a valid zstd tarball or violates the package format
    #[error("archive format error in {name}: {reason}")]
    ArchiveFormat { name: String, reason: String },

    /// Archive entry would escape the extraction root
    #[error("archive entry escapes extraction root: {0}")]
    PathEscape(String),

    /// I/O failure inside the archive pipeline
    #[error("archive I/O error at {path}: {source}")]
    ArchiveIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// State database failure
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Snapshot creation, validation, or restoration failure
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// Invalid `.hook` file
    #[error("hook parse error in {path}: {reason}")]
    HookParse { path: PathBuf, reason: String },

    /// Hook `Depends` graph contains a cycle
    #[error("cyclic hook dependencies: {}", .0.join(", "))]
    HookCycle(Vec<String>),

    /// Hook or legacy script exited nonzero with AbortOnFail
    #[error("hook '{name}' failed: {reason}")]
    HookExec { name: String, reason: String },

    /// Another transaction holds the lock and --no-wait was given
    #[error("transaction lock is held{}", holder.map(|p| format!(" (pid {p})")).unwrap_or_default())]
    Locked { holder: Option<i32> },

    /// Graceful cancellation via SIGINT/SIGTERM
    #[error("interrupted during {0}")]
    Interrupted(String),

    /// Rollback itself failed; the target root needs manual attention
    #[error("rollback incomplete: {0}")]
    RollbackIncomplete(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias using the crate error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map an error to the CLI exit code contract:
    /// 0 success, 1 generic, 2 unsatisfiable, 3 signature/verification,
    /// 4 protected/pin violation, 5 lock contention, 130 interrupted.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Unsat { .. } | Error::Ambiguous(..) | Error::NoCandidate(_) => 2,
            Error::Signature { .. } | Error::FetchChecksum { .. } => 3,
            Error::PinViolation(_) | Error::ProtectedViolation(_) => 4,
            Error::Locked { .. } => 5,
            Error::Interrupted(_) => 130,
            _ => 1,
        }
    }

    /// True for errors worth retrying at the fetch layer. Client-side HTTP
    /// status failures (4xx) will not improve with retries.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::FetchTimeout(_) => true,
            Error::FetchNetwork { reason, .. } => !reason.starts_with("HTTP 4"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            Error::Unsat {
                core: vec!["hold(bar)".into()]
            }
            .exit_code(),
            2
        );
        assert_eq!(
            Error::Signature {
                name: "app".into(),
                reason: "bad".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(Error::PinViolation("bar".into()).exit_code(), 4);
        assert_eq!(Error::ProtectedViolation("base".into()).exit_code(), 4);
        assert_eq!(Error::Locked { holder: Some(42) }.exit_code(), 5);
        assert_eq!(Error::Interrupted("fetch".into()).exit_code(), 130);
        assert_eq!(Error::Config("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::FetchTimeout("u".into()).is_transient());
        assert!(Error::FetchNetwork {
            url: "u".into(),
            reason: "connect".into()
        }
        .is_transient());
        assert!(Error::FetchNetwork {
            url: "u".into(),
            reason: "HTTP 503 Service Unavailable".into()
        }
        .is_transient());
        assert!(!Error::FetchNetwork {
            url: "u".into(),
            reason: "HTTP 404 Not Found".into()
        }
        .is_transient());
        assert!(!Error::FetchChecksum {
            name: "a".into(),
            expected: "x".into(),
            actual: "y".into()
        }
        .is_transient());
    }

    #[test]
    fn test_lock_message_includes_pid() {
        let e = Error::Locked { holder: Some(1234) };
        assert!(e.to_string().contains("1234"));
        let e = Error::Locked { holder: None };
        assert!(!e.to_string().contains("pid"));
    }
}
