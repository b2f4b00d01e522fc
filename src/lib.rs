// src/lib.rs

//! LPM package manager
//!
//! Core transaction engine for a Linux distribution package manager:
//!
//! - Dependency resolution as a CDCL SAT problem with incremental reuse,
//!   VSIDS scoring, phase saving, pins/holds, provides/conflicts/obsoletes,
//!   and per-repository bias
//! - Transactional install/remove/upgrade with blob fetching, signature
//!   verification, pre-transaction snapshots, manifest-driven placement,
//!   hook execution, rollback, and crash recovery
//! - Persistent state: installed-package database, content-addressed blob
//!   cache, manifests, snapshots, history, pins, and the transaction lock
//! - ALPM-style `.hook` dispatch plus legacy per-package script directories

pub mod archive;
pub mod blob;
pub mod config;
pub mod db;
mod error;
pub mod hooks;
pub mod resolver;
pub mod signature;
pub mod snapshot;
pub mod solver;
pub mod transaction;
pub mod universe;
pub mod version;

pub use config::Config;
pub use error::{Error, Result};
pub use resolver::{Model, Request, Resolver};
pub use transaction::{Outcome, TransactionEngine, TransactionLock, TxnOptions};
pub use universe::{Dependency, InstalledPackage, PackageRecord, Universe};
pub use version::{Constraint, Version};
