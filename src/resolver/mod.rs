// src/resolver/mod.rs

//! Dependency resolution: catalog to CNF, solve, model extraction
//!
//! Every installable candidate becomes a boolean variable, created in the
//! stable order (name, descending version, ascending release, ascending
//! repo priority) so the solver's activity tie-breaking prefers
//! newest-from-best-repo on first branching. Encoding:
//!
//! - at-most-one candidate per name (pairwise negative clauses)
//! - `x -> (y1 | ... | yn)` for every requirement, enumerated via name or
//!   provides; capabilities never get their own variables
//! - pairwise conflict clauses for `conflicts` and `obsoletes`
//! - each user request gets a selector variable `g` with `(!g | c1 | ...)`,
//!   assumed true, so UNSAT cores can name the request
//! - holds are assumptions on the installed candidate; existing installs are
//!   soft assumptions, retracted and re-solved when a core names them
//! - preferred versions and repository bias feed initial VSIDS activity,
//!   never clauses, so dispreferred candidates stay reachable
//!
//! A satisfying assignment may set variables the request never pulled in;
//! the model is trimmed to the requires-closure of the request and the
//! surviving installs before planning.
//!
//! Solver state persists across solves while the catalog hash is unchanged.

pub mod plan;

use crate::error::{Error, Result};
use crate::solver::{var_of, CdclSolver, Cnf, Lit, SatOutcome, SolverParams, Var};
use crate::universe::{Dependency, PackageRecord, Universe};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Activity bonus for candidates matching a `prefer` pin
const PREFER_BIAS: f64 = 1.0;

/// A resolved model: the chosen candidate per package name
#[derive(Debug)]
pub struct Model {
    pub selected: HashMap<String, PackageRecord>,
}

/// What the caller wants this solve to achieve
#[derive(Debug, Default)]
pub struct Request {
    /// Packages (or capabilities) that must be present
    pub install: Vec<Dependency>,
    /// Installed packages that must be absent
    pub remove: Vec<String>,
    /// Drop hold pins
    pub force: bool,
}

struct SolverState {
    catalog_hash: String,
    solver: CdclSolver,
    /// Interned request selector variables, keyed by request text
    selectors: HashMap<String, Var>,
}

/// Resolver with persistent solver state for incremental reuse
pub struct Resolver {
    params: SolverParams,
    state: Option<SolverState>,
}

impl Resolver {
    pub fn new(params: SolverParams) -> Self {
        Self {
            params,
            state: None,
        }
    }

    /// Solve a request against the universe, returning the chosen model.
    pub fn solve(&mut self, universe: &Universe, request: &Request) -> Result<Model> {
        let hash = universe.catalog_hash();
        let reusable = self
            .state
            .as_ref()
            .map(|s| s.catalog_hash == hash)
            .unwrap_or(false);
        if !reusable {
            debug!("catalog changed, rebuilding solver state");
            self.state = Some(self.build_state(universe, hash)?);
        }
        let state = self.state.as_mut().expect("state just built");

        // Assumption labels for core reporting, rebuilt per solve
        let mut labels: HashMap<Var, String> = HashMap::new();
        let mut assumptions: Vec<Lit> = Vec::new();
        let mut active_selectors: HashSet<Var> = HashSet::new();

        for dep in &request.install {
            let candidates: Vec<Lit> = universe
                .satisfiers(dep)
                .iter()
                .filter_map(|r| state.solver.cnf.lookup(&r.nvra()))
                .map(|v| v as Lit)
                .collect();
            if candidates.is_empty() {
                return Err(Error::NoCandidate(dep.to_string()));
            }
            let key = dep.to_string();
            let selector = match state.selectors.get(&key) {
                Some(&v) => v,
                None => {
                    let v = state.solver.cnf.new_var(&format!("request:{key}"));
                    let mut clause = vec![-(v as Lit)];
                    clause.extend(candidates);
                    state.solver.cnf.add_clause(clause, false, 0);
                    state.selectors.insert(key.clone(), v);
                    v
                }
            };
            labels.insert(selector, format!("requested({key})"));
            active_selectors.insert(selector);
            assumptions.push(selector as Lit);
        }
        // Selectors from earlier solves stay off
        for &v in state.selectors.values() {
            if !active_selectors.contains(&v) {
                assumptions.push(-(v as Lit));
            }
        }

        if !request.force {
            for name in &universe.pins.hold {
                if let Some(pkg) = universe.installed.get(name) {
                    if let Some(v) = state.solver.cnf.lookup(&pkg.record.nvra()) {
                        labels.insert(v, format!("hold({name})"));
                        assumptions.push(v as Lit);
                    }
                }
            }
        }

        // Absence means no candidate of that name at all, so a removal
        // cannot be answered with a silent downgrade.
        for name in &request.remove {
            for record in universe.candidates(name) {
                if let Some(v) = state.solver.cnf.lookup(&record.nvra()) {
                    labels.insert(v, format!("remove({name})"));
                    assumptions.push(-(v as Lit));
                }
            }
        }

        // Soft assumptions: keep what is installed, retract on demand
        let mut soft: HashMap<Var, String> = HashMap::new();
        for (name, pkg) in &universe.installed {
            if request.remove.contains(name) {
                continue;
            }
            if let Some(v) = state.solver.cnf.lookup(&pkg.record.nvra()) {
                soft.insert(v, format!("installed({name})"));
            }
        }

        loop {
            let mut attempt = assumptions.clone();
            attempt.extend(soft.keys().map(|&v| v as Lit));
            match state.solver.solve(&attempt) {
                SatOutcome::Sat(model) => {
                    return Ok(extract_model(
                        universe,
                        &state.solver.cnf,
                        &model,
                        &request.install,
                    ));
                }
                SatOutcome::Unsat(core) => {
                    let retractable: Vec<Var> = core
                        .iter()
                        .map(|&l| var_of(l))
                        .filter(|v| soft.contains_key(v))
                        .collect();
                    if retractable.is_empty() {
                        let names = describe_core(&core, &labels, &state.solver.cnf);
                        return Err(Error::Unsat { core: names });
                    }
                    for v in retractable {
                        debug!("retracting soft assumption {}", soft[&v]);
                        soft.remove(&v);
                    }
                }
            }
        }
    }

    /// Encode the universe into a fresh solver
    fn build_state(&self, universe: &Universe, catalog_hash: String) -> Result<SolverState> {
        let mut cnf = Cnf::new();
        let mut prefer_true: HashSet<Var> = HashSet::new();
        let mut biases: Vec<(Var, f64)> = Vec::new();
        let mut decays: Vec<(Var, f64)> = Vec::new();

        // Stable variable order
        for name in universe.all_names() {
            for record in universe.candidates(name) {
                let v = cnf.new_var(&record.nvra());
                let installed = universe
                    .installed
                    .get(name)
                    .map(|p| p.record.nvra() == record.nvra())
                    .unwrap_or(false);
                if installed {
                    prefer_true.insert(v);
                }
                let mut bias = record.bias.unwrap_or(0.0);
                if let Some(c) = universe.pins.prefer.get(name) {
                    if c.satisfies(&record.version) {
                        bias += PREFER_BIAS;
                    }
                }
                if bias != 0.0 {
                    biases.push((v, bias));
                }
                if let Some(d) = record.decay {
                    decays.push((v, d));
                }
            }
        }

        for name in universe.all_names() {
            let bucket = universe.candidates(name);
            let vars: Vec<Var> = bucket
                .iter()
                .map(|r| cnf.lookup(&r.nvra()).expect("candidate var interned"))
                .collect();

            // At most one candidate per name
            for i in 0..vars.len() {
                for j in (i + 1)..vars.len() {
                    cnf.add_clause(vec![-(vars[i] as Lit), -(vars[j] as Lit)], false, 0);
                }
            }

            for (record, &x) in bucket.iter().zip(&vars) {
                // Requirements: x -> (y1 | ... | yn)
                for req in &record.requires {
                    let mut clause = vec![-(x as Lit)];
                    let mut self_satisfied = false;
                    for provider in universe.satisfiers(req) {
                        if provider.nvra() == record.nvra() {
                            self_satisfied = true;
                            break;
                        }
                        if let Some(y) = cnf.lookup(&provider.nvra()) {
                            clause.push(y as Lit);
                        }
                    }
                    if self_satisfied {
                        continue;
                    }
                    // A bare (!x) means nothing satisfies the requirement
                    // and x is uninstallable
                    cnf.add_clause(clause, false, 0);
                }

                // Conflicts and obsoletes: pairwise exclusion
                for dep in record.conflicts.iter().chain(record.obsoletes.iter()) {
                    for target in universe.satisfiers(dep) {
                        if target.name == record.name {
                            continue;
                        }
                        if let Some(y) = cnf.lookup(&target.nvra()) {
                            cnf.add_clause(vec![-(x as Lit), -(y as Lit)], false, 0);
                        }
                    }
                }
            }
        }

        let mut solver = CdclSolver::new(cnf, self.params.clone());
        solver.set_polarity(prefer_true, HashSet::new());
        for (v, bias) in biases {
            solver.add_bias(v, bias);
        }
        for (v, d) in decays {
            solver.set_decay_override(v, d);
        }

        Ok(SolverState {
            catalog_hash,
            solver,
            selectors: HashMap::new(),
        })
    }
}

/// Read the assignment back into records and trim it to the closure of the
/// request plus surviving installs.
fn extract_model(
    universe: &Universe,
    cnf: &Cnf,
    model: &[bool],
    goals: &[Dependency],
) -> Model {
    let mut assigned: HashMap<String, PackageRecord> = HashMap::new();
    for name in universe.all_names() {
        for record in universe.candidates(name) {
            if let Some(v) = cnf.lookup(&record.nvra()) {
                if model[v as usize] {
                    assigned.insert(name.to_string(), record.clone());
                    break;
                }
            }
        }
    }

    // Roots: satisfied goals plus installed names the model kept
    let mut worklist: Vec<String> = Vec::new();
    let mut needed: HashSet<String> = HashSet::new();
    for dep in goals {
        for record in assigned.values() {
            if record.satisfies(dep) {
                if needed.insert(record.name.clone()) {
                    worklist.push(record.name.clone());
                }
            }
        }
    }
    for name in universe.installed.keys() {
        if assigned.contains_key(name) && needed.insert(name.clone()) {
            worklist.push(name.clone());
        }
    }

    // Requires-closure through the model's chosen providers
    while let Some(name) = worklist.pop() {
        let record = assigned[&name].clone();
        for req in &record.requires {
            let mut providers: Vec<&PackageRecord> = assigned
                .values()
                .filter(|r| r.satisfies(req))
                .collect();
            providers.sort_by(|a, b| a.name.cmp(&b.name));
            if let Some(provider) = providers.first() {
                if needed.insert(provider.name.clone()) {
                    worklist.push(provider.name.clone());
                }
            }
        }
    }

    assigned.retain(|name, _| needed.contains(name));
    Model { selected: assigned }
}

fn describe_core(core: &[Lit], labels: &HashMap<Var, String>, cnf: &Cnf) -> Vec<String> {
    let mut out: Vec<String> = core
        .iter()
        .map(|&l| {
            let v = var_of(l);
            labels
                .get(&v)
                .cloned()
                .unwrap_or_else(|| cnf.var_name(v).to_string())
        })
        .collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::universe::{Pins, RepoConfig};
    use std::collections::{BTreeSet, HashMap as StdHashMap};
    use std::path::PathBuf;

    fn config() -> Config {
        Config::from_keys(PathBuf::from("/tmp/lpm-test"), &StdHashMap::new()).unwrap()
    }

    fn repo() -> RepoConfig {
        RepoConfig {
            name: "core".to_string(),
            url: "file:///srv/core".to_string(),
            priority: 10,
        }
    }

    fn entry(
        name: &str,
        version: &str,
        release: u32,
        requires: &[&str],
        extra: &[(&str, serde_json::Value)],
    ) -> serde_json::Value {
        let mut v = serde_json::json!({
            "name": name,
            "version": version,
            "release": release,
            "arch": "noarch",
            "requires": requires,
            "blob": format!("{name}-{version}-{release}.noarch.lpm"),
            "size": 10,
            "sha256": "00".repeat(32),
        });
        for (k, val) in extra {
            v[k] = val.clone();
        }
        v
    }

    fn universe(entries: Vec<serde_json::Value>) -> Universe {
        universe_with(entries, Vec::new(), Pins::default())
    }

    fn universe_with(
        entries: Vec<serde_json::Value>,
        installed: Vec<crate::universe::InstalledPackage>,
        pins: Pins,
    ) -> Universe {
        let r = repo();
        Universe::load(
            &config(),
            vec![r.clone()],
            vec![(r, serde_json::to_vec(&entries).unwrap())],
            Vec::new(),
            installed,
            pins,
            BTreeSet::new(),
        )
        .unwrap()
    }

    fn installed(record: &PackageRecord) -> crate::universe::InstalledPackage {
        let mut record = record.clone();
        record.origin = crate::universe::Origin::Installed;
        crate::universe::InstalledPackage {
            record,
            install_time: 0,
            explicit: true,
        }
    }

    fn install_request(spec: &str) -> Request {
        Request {
            install: vec![Dependency::parse(spec).unwrap()],
            remove: Vec::new(),
            force: false,
        }
    }

    #[test]
    fn test_install_pulls_dependency() {
        let u = universe(vec![
            entry("libz", "1.2.13", 1, &[], &[]),
            entry("app", "1.0", 1, &["libz >= 1.2"], &[]),
        ]);
        let mut resolver = Resolver::new(SolverParams::default());
        let model = resolver.solve(&u, &install_request("app")).unwrap();
        assert!(model.selected.contains_key("app"));
        assert!(model.selected.contains_key("libz"));
    }

    #[test]
    fn test_model_is_trimmed_to_request() {
        let u = universe(vec![
            entry("app", "1.0", 1, &[], &[]),
            entry("bystander", "1.0", 1, &[], &[]),
        ]);
        let mut resolver = Resolver::new(SolverParams::default());
        let model = resolver.solve(&u, &install_request("app")).unwrap();
        assert!(model.selected.contains_key("app"));
        assert!(!model.selected.contains_key("bystander"));
    }

    #[test]
    fn test_newest_version_selected() {
        let u = universe(vec![
            entry("tool", "1.0", 1, &[], &[]),
            entry("tool", "2.0", 1, &[], &[]),
        ]);
        let mut resolver = Resolver::new(SolverParams::default());
        let model = resolver.solve(&u, &install_request("tool")).unwrap();
        assert_eq!(model.selected["tool"].version.to_string(), "2.0");
    }

    #[test]
    fn test_constraint_narrows_selection() {
        let u = universe(vec![
            entry("tool", "1.0", 1, &[], &[]),
            entry("tool", "2.0", 1, &[], &[]),
        ]);
        let mut resolver = Resolver::new(SolverParams::default());
        let model = resolver.solve(&u, &install_request("tool < 2.0")).unwrap();
        assert_eq!(model.selected["tool"].version.to_string(), "1.0");
    }

    #[test]
    fn test_requirement_via_provides() {
        let u = universe(vec![
            entry(
                "openssl",
                "3.0",
                1,
                &[],
                &[("provides", serde_json::json!(["libssl.so"]))],
            ),
            entry("curl", "8.0", 1, &["libssl.so"], &[]),
        ]);
        let mut resolver = Resolver::new(SolverParams::default());
        let model = resolver.solve(&u, &install_request("curl")).unwrap();
        assert!(model.selected.contains_key("openssl"));
    }

    #[test]
    fn test_no_candidate() {
        let u = universe(vec![entry("tool", "1.0", 1, &[], &[])]);
        let mut resolver = Resolver::new(SolverParams::default());
        let err = resolver.solve(&u, &install_request("ghost")).unwrap_err();
        assert!(matches!(err, Error::NoCandidate(_)));
    }

    #[test]
    fn test_unsatisfiable_requirement_is_unsat() {
        let u = universe(vec![entry("app", "1.0", 1, &["libmissing"], &[])]);
        let mut resolver = Resolver::new(SolverParams::default());
        let err = resolver.solve(&u, &install_request("app")).unwrap_err();
        match err {
            Error::Unsat { core } => {
                assert!(core.iter().any(|c| c.contains("requested(app)")), "{core:?}");
            }
            other => panic!("expected Unsat, got {other:?}"),
        }
    }

    #[test]
    fn test_hold_blocks_upgrade_with_core() {
        let entries = vec![
            entry("bar", "1.0", 1, &[], &[]),
            entry("bar", "2.0", 1, &[], &[]),
        ];
        let u0 = universe(entries.clone());
        let current = u0.candidates("bar").last().unwrap().clone();
        assert_eq!(current.version.to_string(), "1.0");

        let mut pins = Pins::default();
        pins.hold.insert("bar".to_string());
        let u = universe_with(entries, vec![installed(&current)], pins);

        let mut resolver = Resolver::new(SolverParams::default());
        let err = resolver
            .solve(&u, &install_request("bar > 1.0"))
            .unwrap_err();
        match err {
            Error::Unsat { core } => {
                assert!(core.iter().any(|c| c.contains("hold(bar)")), "{core:?}");
                assert!(
                    core.iter().any(|c| c.contains("requested(bar > 1.0)")),
                    "{core:?}"
                );
            }
            other => panic!("expected Unsat, got {other:?}"),
        }
    }

    #[test]
    fn test_force_drops_hold() {
        let entries = vec![
            entry("bar", "1.0", 1, &[], &[]),
            entry("bar", "2.0", 1, &[], &[]),
        ];
        let u0 = universe(entries.clone());
        let current = u0.candidates("bar").last().unwrap().clone();
        let mut pins = Pins::default();
        pins.hold.insert("bar".to_string());
        let u = universe_with(entries, vec![installed(&current)], pins);

        let mut resolver = Resolver::new(SolverParams::default());
        let request = Request {
            install: vec![Dependency::parse("bar > 1.0").unwrap()],
            remove: Vec::new(),
            force: true,
        };
        let model = resolver.solve(&u, &request).unwrap();
        assert_eq!(model.selected["bar"].version.to_string(), "2.0");
    }

    #[test]
    fn test_upgrade_retracts_installed_assumption() {
        let entries = vec![
            entry("foo", "1.0", 1, &[], &[]),
            entry("foo", "2.0", 1, &[], &[]),
        ];
        let u0 = universe(entries.clone());
        let current = u0.candidates("foo").last().unwrap().clone();
        let u = universe_with(entries, vec![installed(&current)], Pins::default());

        let mut resolver = Resolver::new(SolverParams::default());
        let model = resolver.solve(&u, &install_request("foo > 1.0")).unwrap();
        assert_eq!(model.selected["foo"].version.to_string(), "2.0");
    }

    #[test]
    fn test_obsoletes_removes_old_package() {
        let entries = vec![
            entry("oldfoo", "0.9", 1, &[], &[]),
            entry(
                "foo",
                "2.0",
                1,
                &[],
                &[("obsoletes", serde_json::json!(["oldfoo"]))],
            ),
        ];
        let u0 = universe(entries.clone());
        let oldfoo = u0.candidates("oldfoo")[0].clone();
        let u = universe_with(entries, vec![installed(&oldfoo)], Pins::default());

        let mut resolver = Resolver::new(SolverParams::default());
        let model = resolver.solve(&u, &install_request("foo")).unwrap();
        assert!(model.selected.contains_key("foo"));
        assert!(!model.selected.contains_key("oldfoo"));
    }

    #[test]
    fn test_conflicts_exclude_joint_install() {
        let u = universe(vec![
            entry(
                "mta-a",
                "1.0",
                1,
                &[],
                &[("conflicts", serde_json::json!(["mta-b"]))],
            ),
            entry("mta-b", "1.0", 1, &[], &[]),
        ]);
        let mut resolver = Resolver::new(SolverParams::default());
        let request = Request {
            install: vec![
                Dependency::parse("mta-a").unwrap(),
                Dependency::parse("mta-b").unwrap(),
            ],
            remove: Vec::new(),
            force: false,
        };
        let err = resolver.solve(&u, &request).unwrap_err();
        assert!(matches!(err, Error::Unsat { .. }));
    }

    #[test]
    fn test_remove_cascades_to_dependents() {
        let entries = vec![
            entry("libz", "1.2", 1, &[], &[]),
            entry("app", "1.0", 1, &["libz"], &[]),
        ];
        let u0 = universe(entries.clone());
        let libz = u0.candidates("libz")[0].clone();
        let app = u0.candidates("app")[0].clone();
        let u = universe_with(
            entries,
            vec![installed(&libz), installed(&app)],
            Pins::default(),
        );

        let mut resolver = Resolver::new(SolverParams::default());
        let request = Request {
            install: Vec::new(),
            remove: vec!["libz".to_string()],
            force: false,
        };
        let model = resolver.solve(&u, &request).unwrap();
        assert!(!model.selected.contains_key("libz"));
        assert!(!model.selected.contains_key("app"));
    }

    #[test]
    fn test_remove_does_not_downgrade() {
        // Two repo versions exist; removal must not pick the other one
        let entries = vec![
            entry("libz", "1.2.11", 1, &[], &[]),
            entry("libz", "1.2.13", 1, &[], &[]),
        ];
        let u0 = universe(entries.clone());
        let current = u0.candidates("libz")[0].clone();
        let u = universe_with(entries, vec![installed(&current)], Pins::default());

        let mut resolver = Resolver::new(SolverParams::default());
        let request = Request {
            install: Vec::new(),
            remove: vec!["libz".to_string()],
            force: false,
        };
        let model = resolver.solve(&u, &request).unwrap();
        assert!(!model.selected.contains_key("libz"));
    }

    #[test]
    fn test_prefer_pin_biases_choice() {
        let entries = vec![
            entry("tool", "3.3.1", 1, &[], &[]),
            entry("tool", "3.4.0", 1, &[], &[]),
        ];
        let mut pins = Pins::default();
        pins.prefer.insert(
            "tool".to_string(),
            crate::version::Constraint::parse("~= 3.3").unwrap(),
        );
        let u = universe_with(entries, Vec::new(), pins);
        let mut resolver = Resolver::new(SolverParams::default());
        let model = resolver.solve(&u, &install_request("tool")).unwrap();
        assert_eq!(model.selected["tool"].version.to_string(), "3.3.1");
    }

    #[test]
    fn test_prefer_pin_yields_when_infeasible() {
        // The preferred version conflicts with the request; the pin is a
        // bias, not a clause, so the other version must win.
        let entries = vec![
            entry("tool", "3.3.1", 1, &[], &[]),
            entry("tool", "3.4.0", 1, &[], &[]),
        ];
        let mut pins = Pins::default();
        pins.prefer.insert(
            "tool".to_string(),
            crate::version::Constraint::parse("~= 3.3").unwrap(),
        );
        let u = universe_with(entries, Vec::new(), pins);
        let mut resolver = Resolver::new(SolverParams::default());
        let model = resolver
            .solve(&u, &install_request("tool >= 3.4"))
            .unwrap();
        assert_eq!(model.selected["tool"].version.to_string(), "3.4.0");
    }

    #[test]
    fn test_incremental_reuse_same_catalog() {
        let u = universe(vec![
            entry("a", "1.0", 1, &[], &[]),
            entry("b", "1.0", 1, &[], &[]),
        ]);
        let mut resolver = Resolver::new(SolverParams::default());
        let m1 = resolver.solve(&u, &install_request("a")).unwrap();
        assert!(m1.selected.contains_key("a"));
        assert!(!m1.selected.contains_key("b"));
        // Second solve reuses state; the stale selector for "a" must not
        // leak into this model
        let m2 = resolver.solve(&u, &install_request("b")).unwrap();
        assert!(m2.selected.contains_key("b"));
        assert!(!m2.selected.contains_key("a"));
    }
}
