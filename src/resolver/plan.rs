// src/resolver/plan.rs

//! Model to ordered operation plan
//!
//! Diffs a satisfying model against the installed set, classifies the
//! operations, and orders them topologically on `requires` (dependencies
//! install first, dependents remove first). Ties break by name. A cycle,
//! which optional recommends edges can legally introduce, is broken by
//! dropping its weakest edge: the one whose endpoints' combined repository
//! priority is least preferred, with a lexicographic tie-break.

use super::Model;
use crate::universe::{PackageRecord, Universe};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Kind of planned operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Install,
    Upgrade,
    Remove,
}

/// One step of the plan
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OpKind,
    /// Target record (new version for install/upgrade, the installed
    /// record for remove)
    pub record: PackageRecord,
    /// Old installed record on upgrade
    pub previous: Option<PackageRecord>,
    /// Names of obsoleted packages this operation replaces
    pub replaces: Vec<String>,
}

impl Operation {
    pub fn describe(&self) -> String {
        match self.kind {
            OpKind::Install => format!("install {}", self.record.nvra()),
            OpKind::Upgrade => format!(
                "upgrade {} ({} -> {}-{})",
                self.record.name,
                self.previous
                    .as_ref()
                    .map(|p| format!("{}-{}", p.version, p.release))
                    .unwrap_or_default(),
                self.record.version,
                self.record.release,
            ),
            OpKind::Remove => format!("remove {}", self.record.nvra()),
        }
    }
}

/// An ordered transaction plan
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub operations: Vec<Operation>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Records whose blobs must be fetched before applying
    pub fn fetch_records(&self) -> Vec<&PackageRecord> {
        self.operations
            .iter()
            .filter(|op| op.kind != OpKind::Remove)
            .map(|op| &op.record)
            .collect()
    }

    /// Names touched by this plan, for hook matching
    pub fn names(&self) -> Vec<&str> {
        self.operations
            .iter()
            .map(|op| op.record.name.as_str())
            .collect()
    }
}

/// Build the ordered plan for a model
pub fn build(universe: &Universe, model: &Model) -> Plan {
    let mut ops: BTreeMap<String, Operation> = BTreeMap::new();

    let mut names: BTreeSet<&str> = model.selected.keys().map(String::as_str).collect();
    names.extend(universe.installed.keys().map(String::as_str));

    for name in names {
        let selected = model.selected.get(name);
        let installed = universe.installed.get(name);
        match (selected, installed) {
            (Some(new), None) => {
                ops.insert(
                    name.to_string(),
                    Operation {
                        kind: OpKind::Install,
                        record: new.clone(),
                        previous: None,
                        replaces: Vec::new(),
                    },
                );
            }
            (Some(new), Some(old)) => {
                if new.nvra() != old.record.nvra() {
                    ops.insert(
                        name.to_string(),
                        Operation {
                            kind: OpKind::Upgrade,
                            record: new.clone(),
                            previous: Some(old.record.clone()),
                            replaces: Vec::new(),
                        },
                    );
                }
                // Same artifact selected: nothing to do
            }
            (None, Some(old)) => {
                ops.insert(
                    name.to_string(),
                    Operation {
                        kind: OpKind::Remove,
                        record: old.record.clone(),
                        previous: None,
                        replaces: Vec::new(),
                    },
                );
            }
            (None, None) => {}
        }
    }

    // Attach obsoleted removals to their replacement
    let removed: Vec<(String, PackageRecord)> = ops
        .values()
        .filter(|op| op.kind == OpKind::Remove)
        .map(|op| (op.record.name.clone(), op.record.clone()))
        .collect();
    for (removed_name, removed_record) in &removed {
        let replacement = ops
            .values_mut()
            .filter(|op| op.kind != OpKind::Remove)
            .find(|op| {
                op.record
                    .obsoletes
                    .iter()
                    .any(|dep| removed_record.satisfies(dep))
            });
        if let Some(op) = replacement {
            op.replaces.push(removed_name.clone());
        }
    }

    order_operations(ops)
}

/// Edge meaning `from` must be applied before `to`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Edge {
    from: String,
    to: String,
    /// Combined repo priority of the endpoints; larger is weaker
    weight: i64,
}

fn order_operations(ops: BTreeMap<String, Operation>) -> Plan {
    let mut edges: Vec<Edge> = Vec::new();
    let weight = |a: &Operation, b: &Operation| -> i64 {
        a.record.repo_priority as i64 + b.record.repo_priority as i64
    };

    for op in ops.values() {
        match op.kind {
            OpKind::Install | OpKind::Upgrade => {
                // Dependencies (and optional recommends) first
                for dep in op.record.requires.iter().chain(op.record.recommends.iter()) {
                    for other in ops.values() {
                        if other.record.name == op.record.name || other.kind == OpKind::Remove {
                            continue;
                        }
                        if other.record.satisfies(dep) {
                            edges.push(Edge {
                                from: other.record.name.clone(),
                                to: op.record.name.clone(),
                                weight: weight(other, op),
                            });
                        }
                    }
                }
                // A replacement lands before the packages it obsoletes leave
                for replaced in &op.replaces {
                    edges.push(Edge {
                        from: op.record.name.clone(),
                        to: replaced.clone(),
                        weight: weight(op, &ops[replaced]),
                    });
                }
            }
            OpKind::Remove => {
                // Dependents are removed before their dependencies
                for dep in &op.record.requires {
                    for other in ops.values() {
                        if other.record.name == op.record.name || other.kind != OpKind::Remove {
                            continue;
                        }
                        if other.record.satisfies(dep) {
                            edges.push(Edge {
                                from: op.record.name.clone(),
                                to: other.record.name.clone(),
                                weight: weight(op, other),
                            });
                        }
                    }
                }
            }
        }
    }
    edges.sort_by(|a, b| a.from.cmp(&b.from).then(a.to.cmp(&b.to)));
    edges.dedup();

    // Kahn's algorithm; the ready set is ordered by name so ties are stable
    let mut indegree: BTreeMap<&str, usize> = ops.keys().map(|k| (k.as_str(), 0)).collect();
    for e in &edges {
        *indegree.get_mut(e.to.as_str()).expect("edge endpoints in ops") += 1;
    }
    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&n, _)| n)
        .collect();
    let mut placed: Vec<String> = Vec::new();
    let mut live_edges = edges;

    while placed.len() < ops.len() {
        if let Some(&name) = ready.iter().next() {
            ready.remove(name);
            placed.push(name.to_string());
            let mut remaining = Vec::with_capacity(live_edges.len());
            for e in live_edges.drain(..) {
                if e.from == name {
                    let d = indegree.get_mut(e.to.as_str()).expect("known node");
                    *d -= 1;
                    if *d == 0 && !placed.iter().any(|p| p == &e.to) {
                        ready.insert(
                            ops.keys()
                                .find(|k| k.as_str() == e.to)
                                .expect("known node")
                                .as_str(),
                        );
                    }
                } else {
                    remaining.push(e);
                }
            }
            live_edges = remaining;
        } else {
            // Cycle: drop the weakest remaining edge and continue
            let weakest = live_edges
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.weight
                        .cmp(&b.weight)
                        .then(a.from.cmp(&b.from))
                        .then(a.to.cmp(&b.to))
                })
                .map(|(i, _)| i)
                .expect("cycle implies remaining edges");
            let edge = live_edges.remove(weakest);
            debug!(
                "breaking dependency cycle: dropping edge {} -> {}",
                edge.from, edge.to
            );
            let d = indegree.get_mut(edge.to.as_str()).expect("known node");
            *d -= 1;
            if *d == 0 && !placed.iter().any(|p| p == &edge.to) {
                ready.insert(
                    ops.keys()
                        .find(|k| k.as_str() == edge.to)
                        .expect("known node")
                        .as_str(),
                );
            }
        }
    }

    let mut ops = ops;
    let operations = placed
        .iter()
        .map(|name| ops.remove(name).expect("each op placed once"))
        .collect();
    Plan { operations }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::universe::{Dependency, InstalledPackage, Origin, Pins, RepoConfig, Universe};
    use std::collections::{BTreeSet as StdBTreeSet, HashMap};
    use std::path::PathBuf;

    fn record(name: &str, version: &str, priority: i32) -> PackageRecord {
        PackageRecord {
            name: name.to_string(),
            version: crate::version::Version::parse(version).unwrap(),
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
            blob_name: format!("{name}-{version}-1.noarch.lpm"),
            blob_size: 0,
            blob_sha256: "00".repeat(32),
            signature: None,
            repo_name: "core".to_string(),
            repo_priority: priority,
            bias: None,
            decay: None,
            origin: Origin::Repository,
        }
    }

    fn universe_of(installed: Vec<PackageRecord>) -> Universe {
        let config =
            Config::from_keys(PathBuf::from("/tmp/lpm-test"), &HashMap::new()).unwrap();
        let installed = installed
            .into_iter()
            .map(|mut r| {
                r.origin = Origin::Installed;
                InstalledPackage {
                    record: r,
                    install_time: 0,
                    explicit: true,
                }
            })
            .collect();
        Universe::load(
            &config,
            vec![RepoConfig {
                name: "core".to_string(),
                url: "file:///srv/core".to_string(),
                priority: 10,
            }],
            Vec::new(),
            Vec::new(),
            installed,
            Pins::default(),
            StdBTreeSet::new(),
        )
        .unwrap()
    }

    fn model_of(records: Vec<PackageRecord>) -> Model {
        Model {
            selected: records.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }

    #[test]
    fn test_dependency_installed_first() {
        let mut app = record("app", "1.0", 10);
        app.requires = vec![Dependency::parse("libz >= 1.2").unwrap()];
        let libz = record("libz", "1.2.13", 10);

        let plan = build(&universe_of(vec![]), &model_of(vec![app, libz]));
        let names: Vec<&str> = plan.names();
        assert_eq!(names, vec!["libz", "app"]);
        assert!(plan
            .operations
            .iter()
            .all(|op| op.kind == OpKind::Install));
    }

    #[test]
    fn test_idempotent_noop() {
        let libz = record("libz", "1.2.13", 10);
        let plan = build(&universe_of(vec![libz.clone()]), &model_of(vec![libz]));
        assert!(plan.is_empty());
    }

    #[test]
    fn test_upgrade_classification() {
        let old = record("foo", "1.0", 10);
        let new = record("foo", "2.0", 10);
        let plan = build(&universe_of(vec![old]), &model_of(vec![new]));
        assert_eq!(plan.operations.len(), 1);
        let op = &plan.operations[0];
        assert_eq!(op.kind, OpKind::Upgrade);
        assert_eq!(
            op.previous.as_ref().unwrap().version.to_string(),
            "1.0"
        );
    }

    #[test]
    fn test_removal_orders_dependents_first() {
        let libz = record("libz", "1.2.13", 10);
        let mut app = record("app", "1.0", 10);
        app.requires = vec![Dependency::parse("libz").unwrap()];

        let plan = build(&universe_of(vec![libz, app]), &model_of(vec![]));
        let names: Vec<&str> = plan.names();
        assert_eq!(names, vec!["app", "libz"]);
        assert!(plan.operations.iter().all(|op| op.kind == OpKind::Remove));
    }

    #[test]
    fn test_obsoleted_attached_as_replacement() {
        let oldfoo = record("oldfoo", "0.9", 10);
        let mut foo = record("foo", "2.0", 10);
        foo.obsoletes = vec![Dependency::parse("oldfoo").unwrap()];

        let plan = build(&universe_of(vec![oldfoo]), &model_of(vec![foo]));
        let names: Vec<&str> = plan.names();
        assert_eq!(names, vec!["foo", "oldfoo"]);
        let install = &plan.operations[0];
        assert_eq!(install.kind, OpKind::Install);
        assert_eq!(install.replaces, vec!["oldfoo".to_string()]);
        assert_eq!(plan.operations[1].kind, OpKind::Remove);
    }

    #[test]
    fn test_tie_break_by_name() {
        let a = record("alpha", "1.0", 10);
        let b = record("beta", "1.0", 10);
        let plan = build(&universe_of(vec![]), &model_of(vec![b, a]));
        assert_eq!(plan.names(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_cycle_broken_deterministically() {
        // Mutual recommends form a cycle; the edge touching the less
        // preferred repo is dropped, so the better-repo package goes first.
        let mut a = record("aaa", "1.0", 10);
        a.recommends = vec![Dependency::parse("bbb").unwrap()];
        let mut b = record("bbb", "1.0", 50);
        b.recommends = vec![Dependency::parse("aaa").unwrap()];

        let plan = build(&universe_of(vec![]), &model_of(vec![a, b]));
        assert_eq!(plan.operations.len(), 2);
        assert_eq!(plan.names(), vec!["aaa", "bbb"]);
    }

    #[test]
    fn test_fetch_records_excludes_removals() {
        let libz = record("libz", "1.2.13", 10);
        let app = record("app", "1.0", 10);
        let plan = build(&universe_of(vec![libz]), &model_of(vec![app]));
        let fetch: Vec<String> = plan
            .fetch_records()
            .iter()
            .map(|r| r.name.clone())
            .collect();
        assert_eq!(fetch, vec!["app".to_string()]);
    }
}
