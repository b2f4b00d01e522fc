// src/version/mod.rs

//! Version parsing, ordering, and constraint satisfaction
//!
//! Versions are dotted sequences of numeric or alphabetic components
//! (`1.2.13`, `2.0.rc1`). Ordering is component-wise: numeric components
//! compare as integers, alphabetic ones lexically, and a numeric component
//! outranks an alphabetic one at the same position. Missing components
//! compare as 0 (numeric) or the empty string (alphabetic), so `1.2` and
//! `1.2.0` are equal while `1.2 < 1.2.1`.
//!
//! Constraints use the operators `= ~= > >= < <= !=`, where `~=` means
//! "compatible release": at least the given version, without leaving the
//! prefix formed by all but its last component.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// One dot-separated version component
#[derive(Debug, Clone, PartialEq, Eq)]
enum Component {
    Num(u64),
    Alpha(String),
}

impl Component {
    fn cmp_component(&self, other: &Component) -> Ordering {
        match (self, other) {
            (Component::Num(a), Component::Num(b)) => a.cmp(b),
            (Component::Alpha(a), Component::Alpha(b)) => a.cmp(b),
            // Numeric outranks alphabetic at the same position
            (Component::Num(_), Component::Alpha(_)) => Ordering::Greater,
            (Component::Alpha(_), Component::Num(_)) => Ordering::Less,
        }
    }

    /// Neutral value a missing component compares as
    fn padding(&self) -> Component {
        match self {
            Component::Num(_) => Component::Num(0),
            Component::Alpha(_) => Component::Alpha(String::new()),
        }
    }
}

/// A parsed package version
#[derive(Debug, Clone, Eq)]
pub struct Version {
    components: Vec<Component>,
    original: String,
}

impl Version {
    /// Parse a dotted version string
    ///
    /// Each component must be non-empty ASCII alphanumeric; all-digit
    /// components are numeric, anything else is alphabetic.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidVersion("empty version".to_string()));
        }
        let mut components = Vec::new();
        for part in s.split('.') {
            if part.is_empty() {
                return Err(Error::InvalidVersion(format!("empty component in '{s}'")));
            }
            if !part.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(Error::InvalidVersion(format!(
                    "invalid character in component '{part}' of '{s}'"
                )));
            }
            if part.chars().all(|c| c.is_ascii_digit()) {
                let n = part
                    .parse::<u64>()
                    .map_err(|_| Error::InvalidVersion(format!("numeric overflow in '{s}'")))?;
                components.push(Component::Num(n));
            } else {
                components.push(Component::Alpha(part.to_string()));
            }
        }
        Ok(Self {
            components,
            original: s.to_string(),
        })
    }

    /// Compare two versions component-wise
    pub fn compare(&self, other: &Version) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let ord = match (self.components.get(i), other.components.get(i)) {
                (Some(a), Some(b)) => a.cmp_component(b),
                (Some(a), None) => a.cmp_component(&a.padding()),
                (None, Some(b)) => b.padding().cmp_component(b),
                (None, None) => Ordering::Equal,
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// True when this version shares the leading components of `other`
    /// (all but the last), the `~=` prefix condition.
    fn shares_prefix(&self, other: &Version) -> bool {
        let prefix_len = other.components.len().saturating_sub(1);
        for i in 0..prefix_len {
            let matches = match (self.components.get(i), other.components.get(i)) {
                (Some(a), Some(b)) => a.cmp_component(b) == Ordering::Equal,
                (None, Some(b)) => b.padding().cmp_component(b) == Ordering::Equal,
                _ => false,
            };
            if !matches {
                return false;
            }
        }
        true
    }

    /// Component view with trailing zero/empty padding trimmed, so Hash
    /// agrees with the padded equality.
    fn trimmed(&self) -> &[Component] {
        let mut end = self.components.len();
        while end > 0 {
            match &self.components[end - 1] {
                Component::Num(0) => end -= 1,
                Component::Alpha(s) if s.is_empty() => end -= 1,
                _ => break,
            }
        }
        &self.components[..end]
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Version::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for c in self.trimmed() {
            match c {
                Component::Num(n) => {
                    0u8.hash(state);
                    n.hash(state);
                }
                Component::Alpha(s) => {
                    1u8.hash(state);
                    s.hash(state);
                }
            }
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Constraint operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Eq,
    Compatible,
    Gt,
    Ge,
    Lt,
    Le,
    Ne,
}

impl ConstraintOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Compatible => "~=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Ne => "!=",
        }
    }
}

/// A version constraint: operator plus bound
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub op: ConstraintOp,
    pub version: Version,
}

impl Constraint {
    pub fn new(op: ConstraintOp, version: Version) -> Self {
        Self { op, version }
    }

    /// Parse `"OP version"`, e.g. `">= 1.2"` or `"~=2.4.1"`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (op, rest) = if let Some(rest) = s.strip_prefix(">=") {
            (ConstraintOp::Ge, rest)
        } else if let Some(rest) = s.strip_prefix("<=") {
            (ConstraintOp::Le, rest)
        } else if let Some(rest) = s.strip_prefix("!=") {
            (ConstraintOp::Ne, rest)
        } else if let Some(rest) = s.strip_prefix("~=") {
            (ConstraintOp::Compatible, rest)
        } else if let Some(rest) = s.strip_prefix('>') {
            (ConstraintOp::Gt, rest)
        } else if let Some(rest) = s.strip_prefix('<') {
            (ConstraintOp::Lt, rest)
        } else if let Some(rest) = s.strip_prefix('=') {
            (ConstraintOp::Eq, rest)
        } else {
            return Err(Error::InvalidDependency(format!(
                "missing operator in constraint '{s}'"
            )));
        };
        Ok(Self::new(op, Version::parse(rest)?))
    }

    /// Check whether `version` satisfies this constraint
    pub fn satisfies(&self, version: &Version) -> bool {
        match self.op {
            ConstraintOp::Eq => version == &self.version,
            ConstraintOp::Ne => version != &self.version,
            ConstraintOp::Gt => version > &self.version,
            ConstraintOp::Ge => version >= &self.version,
            ConstraintOp::Lt => version < &self.version,
            ConstraintOp::Le => version <= &self.version,
            ConstraintOp::Compatible => {
                version >= &self.version && version.shares_prefix(&self.version)
            }
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op.as_str(), self.version)
    }
}
