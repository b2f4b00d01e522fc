// src/solver/cdcl.rs

//! Conflict-driven clause learning solver
//!
//! Classical CDCL over the [`Cnf`] clause store:
//!
//! - two-watched-literal unit propagation
//! - VSIDS variable activities with configurable decay, plus per-variable
//!   decay overrides and additive initial bias for repository preferences
//! - phase saving, with explicit polarity preferences for fresh variables
//! - learned-clause deletion ranked by (LBD, activity) above a growing cap
//! - Luby restarts with unit 32
//! - assumption literals; on UNSAT the reported core is traced back from
//!   the conflict to the assumptions and pinned unit clauses involved
//!
//! Activities, saved phases, and learned clauses survive between `solve`
//! calls on the same instance.

use super::cnf::{var_of, Cnf, Lit, Var};
use super::SatOutcome;
use std::collections::{HashMap, HashSet, VecDeque};

/// Tunables, sourced from configuration
#[derive(Debug, Clone)]
pub struct SolverParams {
    pub var_decay: f64,
    pub clause_decay: f64,
    pub max_learnts: usize,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            var_decay: 0.95,
            clause_decay: 0.999,
            max_learnts: 200,
        }
    }
}

/// Restart pacing unit for the Luby sequence
const RESTART_UNIT: u64 = 32;

/// i-th element of the Luby sequence (1, 1, 2, 1, 1, 2, 4, ...)
fn luby(i: u64) -> u64 {
    let mut k = 1u32;
    while (1u64 << k) - 1 < i {
        k += 1;
    }
    if i == (1u64 << k) - 1 {
        return 1u64 << (k - 1);
    }
    luby(i - (1u64 << (k - 1)) + 1)
}

/// Per-solve search state; persistent pieces live on the solver itself
struct Search {
    /// Assignment per variable, index 0 unused
    assigns: Vec<Option<bool>>,
    levels: Vec<usize>,
    reason: Vec<Option<usize>>,
    trail: Vec<Lit>,
    trail_lim: Vec<usize>,
    queue: VecDeque<Lit>,
}

impl Search {
    fn new(nvars: usize) -> Self {
        Self {
            assigns: vec![None; nvars + 1],
            levels: vec![0; nvars + 1],
            reason: vec![None; nvars + 1],
            trail: Vec::new(),
            trail_lim: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    #[inline]
    fn value(&self, lit: Lit) -> Option<bool> {
        self.assigns[var_of(lit) as usize].map(|v| if lit > 0 { v } else { !v })
    }

    #[inline]
    fn level(&self) -> usize {
        self.trail_lim.len()
    }
}

fn enqueue(s: &mut Search, saved_phase: &mut [Option<bool>], lit: Lit, reason: Option<usize>) {
    let v = var_of(lit) as usize;
    if s.assigns[v].is_some() {
        return;
    }
    let val = lit > 0;
    s.assigns[v] = Some(val);
    saved_phase[v - 1] = Some(val);
    s.levels[v] = s.level();
    s.reason[v] = reason;
    s.trail.push(lit);
    s.queue.push_back(lit);
}

fn backtrack(s: &mut Search, level: usize) {
    while s.level() > level {
        let start = s.trail_lim.pop().expect("trail limit underflow");
        while s.trail.len() > start {
            let lit = s.trail.pop().expect("trail underflow");
            let v = var_of(lit) as usize;
            s.assigns[v] = None;
            s.reason[v] = None;
            s.levels[v] = 0;
        }
        s.queue.clear();
    }
}

/// The CDCL solver instance
pub struct CdclSolver {
    pub cnf: Cnf,
    params: SolverParams,
    var_activity: Vec<f64>,
    saved_phase: Vec<Option<bool>>,
    prefer_true: HashSet<Var>,
    prefer_false: HashSet<Var>,
    decay_override: HashMap<Var, f64>,
    var_inc: f64,
    cla_inc: f64,
    /// Growing learned-clause cap
    max_learnts: usize,
}

impl CdclSolver {
    pub fn new(cnf: Cnf, params: SolverParams) -> Self {
        let nvars = cnf.num_vars();
        let max_learnts = params.max_learnts;
        Self {
            cnf,
            params,
            var_activity: vec![0.0; nvars],
            saved_phase: vec![None; nvars],
            prefer_true: HashSet::new(),
            prefer_false: HashSet::new(),
            decay_override: HashMap::new(),
            var_inc: 1.0,
            cla_inc: 1.0,
            max_learnts,
        }
    }

    /// Default polarity when a variable has no saved phase
    pub fn set_polarity(&mut self, prefer_true: HashSet<Var>, prefer_false: HashSet<Var>) {
        self.prefer_true = prefer_true;
        self.prefer_false = prefer_false;
    }

    /// Additive initial VSIDS bias for a variable
    pub fn add_bias(&mut self, v: Var, amount: f64) {
        self.ensure_var_arrays();
        self.var_activity[(v - 1) as usize] += amount;
    }

    /// Per-variable activity decay override
    pub fn set_decay_override(&mut self, v: Var, factor: f64) {
        self.decay_override.insert(v, factor);
    }

    fn ensure_var_arrays(&mut self) {
        let nvars = self.cnf.num_vars();
        if self.var_activity.len() < nvars {
            self.var_activity.resize(nvars, 0.0);
            self.saved_phase.resize(nvars, None);
        }
    }

    fn bump_var(&mut self, v: Var) {
        let idx = (v - 1) as usize;
        self.var_activity[idx] += self.var_inc;
        if self.var_activity[idx] > 1e100 {
            for a in &mut self.var_activity {
                *a *= 1e-100;
            }
            self.var_inc *= 1e-100;
        }
    }

    fn decay_var_activity(&mut self) {
        self.var_inc /= self.params.var_decay;
        for (i, a) in self.var_activity.iter_mut().enumerate() {
            let factor = self
                .decay_override
                .get(&((i + 1) as Var))
                .copied()
                .unwrap_or(self.params.var_decay);
            *a *= factor;
        }
    }

    fn bump_clause(&mut self, ci: usize) {
        self.cnf.activity[ci] += self.cla_inc;
    }

    fn decay_clause_activity(&mut self) {
        self.cla_inc /= self.params.clause_decay;
    }

    /// Solve under the given assumption literals.
    pub fn solve(&mut self, assumptions: &[Lit]) -> SatOutcome {
        self.ensure_var_arrays();
        let nvars = self.cnf.num_vars();
        let mut s = Search::new(nvars);

        // Seed unit clauses
        for i in 0..self.cnf.clauses.len() {
            if self.cnf.clauses[i].len() == 1 {
                let lit = self.cnf.clauses[i][0];
                if s.value(lit) == Some(false) {
                    let mut core = self.expand_core(vec![lit], &s);
                    if !core.contains(&lit) {
                        core.push(lit);
                    }
                    return SatOutcome::Unsat(core);
                }
                enqueue(&mut s, &mut self.saved_phase, lit, Some(i));
            }
        }

        // Assumptions sit below the first decision level so restarts
        // never retract them.
        for &lit in assumptions {
            match s.value(lit) {
                Some(false) => {
                    let mut core = self.expand_core(vec![lit], &s);
                    if !core.contains(&lit) {
                        core.push(lit);
                    }
                    return SatOutcome::Unsat(core);
                }
                Some(true) => {}
                None => enqueue(&mut s, &mut self.saved_phase, lit, None),
            }
        }

        let mut conflicts = 0u64;
        let mut restart_count = 1u64;
        let mut restart_limit = luby(restart_count) * RESTART_UNIT;

        loop {
            if let Some(confl) = self.propagate(&mut s) {
                conflicts += 1;
                if s.level() == 0 {
                    let start = self.cnf.clauses[confl].clone();
                    return SatOutcome::Unsat(self.expand_core(start, &s));
                }
                let (learnt, back_lvl, lbd) = self.analyze(confl, &s);
                let ci = self.cnf.add_clause(learnt.clone(), true, lbd);
                self.bump_clause(ci);
                backtrack(&mut s, back_lvl);
                enqueue(&mut s, &mut self.saved_phase, learnt[0], Some(ci));
                self.decay_clause_activity();
                self.decay_var_activity();
                if self.cnf.learnts.len() > self.max_learnts {
                    self.reduce_db(&s);
                }
                if conflicts >= restart_limit {
                    restart_count += 1;
                    restart_limit = luby(restart_count) * RESTART_UNIT;
                    backtrack(&mut s, 0);
                }
            } else {
                match self.pick_branch_var(&s) {
                    None => {
                        let model = (0..=nvars)
                            .map(|v| s.assigns[v].unwrap_or(false))
                            .collect();
                        return SatOutcome::Sat(model);
                    }
                    Some(v) => {
                        s.trail_lim.push(s.trail.len());
                        let lit = match self.saved_phase[(v - 1) as usize] {
                            Some(true) => v as Lit,
                            Some(false) => -(v as Lit),
                            None => {
                                if self.prefer_false.contains(&v) && !self.prefer_true.contains(&v)
                                {
                                    -(v as Lit)
                                } else {
                                    v as Lit
                                }
                            }
                        };
                        enqueue(&mut s, &mut self.saved_phase, lit, None);
                    }
                }
            }
        }
    }

    /// Unit propagation over the watch lists
    fn propagate(&mut self, s: &mut Search) -> Option<usize> {
        while let Some(lit) = s.queue.pop_front() {
            let watching: Vec<usize> = self
                .cnf
                .watch_list
                .get(&-lit)
                .map(|w| w.to_vec())
                .unwrap_or_default();
            for ci in watching {
                if !self.cnf.is_live(ci) {
                    continue;
                }
                let (w1, w2) = self.cnf.watchers[ci];
                let (other, first) = if w1 == -lit { (w2, true) } else { (w1, false) };
                if s.value(other) == Some(true) {
                    continue;
                }
                let mut found = false;
                for k in 0..self.cnf.clauses[ci].len() {
                    let new_lit = self.cnf.clauses[ci][k];
                    if new_lit == other || new_lit == -lit {
                        continue;
                    }
                    if s.value(new_lit) != Some(false) {
                        self.cnf.watchers[ci] =
                            if first { (new_lit, other) } else { (other, new_lit) };
                        if let Some(list) = self.cnf.watch_list.get_mut(&-lit) {
                            list.retain(|&x| x != ci);
                        }
                        self.cnf.watch_list.entry(new_lit).or_default().push(ci);
                        found = true;
                        break;
                    }
                }
                if !found {
                    if s.value(other) == Some(false) {
                        return Some(ci);
                    }
                    enqueue(s, &mut self.saved_phase, other, Some(ci));
                }
            }
        }
        None
    }

    /// First-UIP conflict analysis. Returns the learnt clause with the
    /// asserting literal first, the backjump level, and the clause LBD.
    fn analyze(&mut self, conflict_idx: usize, s: &Search) -> (Vec<Lit>, usize, usize) {
        self.bump_clause(conflict_idx);
        for k in 0..self.cnf.clauses[conflict_idx].len() {
            let lit = self.cnf.clauses[conflict_idx][k];
            self.bump_var(var_of(lit));
        }

        let mut seen: HashSet<Var> = HashSet::new();
        let mut tail: Vec<Lit> = Vec::new();
        let mut counter = 0i64;
        let mut clause: Vec<Lit> = self.cnf.clauses[conflict_idx].clone();
        let mut i = s.trail.len();
        let asserting;

        loop {
            for &lit in &clause {
                let v = var_of(lit);
                self.bump_var(v);
                let lvl = s.levels[v as usize];
                // Root-level literals forced by unit clauses resolve away;
                // assumption literals (no reason) must stay in the learnt
                // clause or it would not survive a later solve that drops
                // the assumption.
                let assumption = lvl == 0 && s.reason[v as usize].is_none();
                if !seen.contains(&v) && (lvl > 0 || assumption) {
                    seen.insert(v);
                    if lvl == s.level() {
                        counter += 1;
                    } else {
                        tail.push(lit);
                    }
                }
            }

            let lit = loop {
                i -= 1;
                let l = s.trail[i];
                if seen.contains(&var_of(l)) {
                    break l;
                }
            };
            let v = var_of(lit);
            let reason_idx = s.reason[v as usize];
            if let Some(ci) = reason_idx {
                self.bump_clause(ci);
                for k in 0..self.cnf.clauses[ci].len() {
                    let l = self.cnf.clauses[ci][k];
                    self.bump_var(var_of(l));
                }
                clause = self.cnf.clauses[ci]
                    .iter()
                    .copied()
                    .filter(|&l| var_of(l) != v)
                    .collect();
            } else {
                clause = Vec::new();
            }
            counter -= 1;
            if counter <= 0 {
                asserting = -lit;
                break;
            }
        }

        let mut learnt = Vec::with_capacity(tail.len() + 1);
        learnt.push(asserting);
        learnt.extend(tail);
        for &lit in &learnt {
            self.bump_var(var_of(lit));
        }

        let back_lvl = learnt[1..]
            .iter()
            .map(|&l| s.levels[var_of(l) as usize])
            .max()
            .unwrap_or(0);
        let lbd = learnt
            .iter()
            .map(|&l| s.levels[var_of(l) as usize])
            .collect::<HashSet<_>>()
            .len();
        (learnt, back_lvl, lbd)
    }

    /// Drop the low-ranked half of learned clauses and grow the cap.
    /// Reason clauses and binaries are kept.
    fn reduce_db(&mut self, s: &Search) {
        let mut learnts: Vec<usize> = self
            .cnf
            .learnts
            .iter()
            .copied()
            .filter(|&i| self.cnf.is_live(i))
            .collect();
        if learnts.len() <= self.max_learnts {
            return;
        }
        learnts.sort_by(|&a, &b| {
            self.cnf.lbd[a].cmp(&self.cnf.lbd[b]).then(
                self.cnf.activity[b]
                    .partial_cmp(&self.cnf.activity[a])
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        let reasons: HashSet<usize> = s.reason.iter().flatten().copied().collect();
        let keep = learnts.len() / 2;
        for &idx in &learnts[keep..] {
            if !reasons.contains(&idx) && self.cnf.clauses[idx].len() > 2 {
                self.cnf.remove_clause(idx);
            }
        }
        self.max_learnts += self.max_learnts / 10 + 1;
    }

    /// Unassigned variable of maximum activity; ties go to the lowest
    /// index, which is the builder's stable candidate order.
    fn pick_branch_var(&self, s: &Search) -> Option<Var> {
        let mut best: Option<(Var, f64)> = None;
        for v in 1..=self.cnf.num_vars() as Var {
            if s.assigns[v as usize].is_some() {
                continue;
            }
            let act = self.var_activity[(v - 1) as usize];
            match best {
                Some((_, best_act)) if act <= best_act => {}
                _ => best = Some((v, act)),
            }
        }
        best.map(|(v, _)| v)
    }

    /// Resolve a level-0 conflict back to its roots: literals whose only
    /// support is an assumption or a pinned unit clause.
    fn expand_core(&self, mut core: Vec<Lit>, s: &Search) -> Vec<Lit> {
        let mut changed = true;
        while changed {
            changed = false;
            for lit in core.clone() {
                let v = var_of(lit);
                if let Some(rsn) = s.reason[v as usize] {
                    if self.cnf.clauses[rsn].len() > 1 {
                        core.retain(|&l| l != lit);
                        for &l in &self.cnf.clauses[rsn] {
                            if var_of(l) != v && !core.contains(&l) {
                                core.push(l);
                            }
                        }
                        changed = true;
                    }
                }
            }
        }
        core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cnf(nvars: usize, clauses: &[&[Lit]]) -> Cnf {
        let mut cnf = Cnf::new();
        for i in 1..=nvars {
            cnf.new_var(&format!("v{i}"));
        }
        for clause in clauses {
            cnf.add_clause(clause.to_vec(), false, 0);
        }
        cnf
    }

    fn model_satisfies(model: &[bool], clauses: &[&[Lit]]) -> bool {
        clauses.iter().all(|clause| {
            clause
                .iter()
                .any(|&l| if l > 0 { model[l as usize] } else { !model[-l as usize] })
        })
    }

    #[test]
    fn test_luby_sequence() {
        let expected = [1u64, 1, 2, 1, 1, 2, 4, 1, 1, 2, 1, 1, 2, 4, 8];
        for (i, &e) in expected.iter().enumerate() {
            assert_eq!(luby(i as u64 + 1), e, "luby({})", i + 1);
        }
    }

    #[test]
    fn test_trivial_sat() {
        let clauses: &[&[Lit]] = &[&[1, 2], &[-1, 2]];
        let mut solver = CdclSolver::new(make_cnf(2, clauses), SolverParams::default());
        match solver.solve(&[]) {
            SatOutcome::Sat(model) => assert!(model_satisfies(&model, clauses)),
            SatOutcome::Unsat(_) => panic!("expected SAT"),
        }
    }

    #[test]
    fn test_trivial_unsat() {
        let clauses: &[&[Lit]] = &[&[1], &[-1]];
        let mut solver = CdclSolver::new(make_cnf(1, clauses), SolverParams::default());
        assert!(!solver.solve(&[]).is_sat());
    }

    #[test]
    fn test_unsat_via_propagation() {
        // (a) (-a | b) (-b) is unsatisfiable through two propagations
        let clauses: &[&[Lit]] = &[&[1], &[-1, 2], &[-2]];
        let mut solver = CdclSolver::new(make_cnf(2, clauses), SolverParams::default());
        assert!(!solver.solve(&[]).is_sat());
    }

    #[test]
    fn test_assumption_forces_value() {
        let clauses: &[&[Lit]] = &[&[1, 2]];
        let mut solver = CdclSolver::new(make_cnf(2, clauses), SolverParams::default());
        match solver.solve(&[-1]) {
            SatOutcome::Sat(model) => {
                assert!(!model[1]);
                assert!(model[2]);
            }
            SatOutcome::Unsat(_) => panic!("expected SAT"),
        }
    }

    #[test]
    fn test_assumption_core() {
        // x pinned true by clause; assuming -x must fail and name x
        let clauses: &[&[Lit]] = &[&[1]];
        let mut solver = CdclSolver::new(make_cnf(1, clauses), SolverParams::default());
        match solver.solve(&[-1]) {
            SatOutcome::Unsat(core) => {
                assert!(core.iter().any(|&l| var_of(l) == 1));
            }
            SatOutcome::Sat(_) => panic!("expected UNSAT"),
        }
    }

    #[test]
    fn test_conflicting_assumptions() {
        let clauses: &[&[Lit]] = &[&[1, 2]];
        let mut solver = CdclSolver::new(make_cnf(2, clauses), SolverParams::default());
        match solver.solve(&[1, -1]) {
            SatOutcome::Unsat(core) => assert!(core.iter().any(|&l| var_of(l) == 1)),
            SatOutcome::Sat(_) => panic!("expected UNSAT"),
        }
    }

    #[test]
    fn test_phase_saving_keeps_polarity() {
        let clauses: &[&[Lit]] = &[&[1, 2]];
        let mut solver = CdclSolver::new(make_cnf(2, clauses), SolverParams::default());
        let first = match solver.solve(&[1]) {
            SatOutcome::Sat(m) => m,
            _ => panic!("expected SAT"),
        };
        assert!(first[1]);
        // Without the assumption, the saved phase keeps v1 true
        let second = match solver.solve(&[]) {
            SatOutcome::Sat(m) => m,
            _ => panic!("expected SAT"),
        };
        assert!(second[1]);
    }

    #[test]
    fn test_polarity_preference() {
        let clauses: &[&[Lit]] = &[&[1, 2]];
        let mut solver = CdclSolver::new(make_cnf(2, clauses), SolverParams::default());
        solver.set_polarity(HashSet::new(), HashSet::from([1, 2]));
        solver.add_bias(1, 1.0);
        match solver.solve(&[]) {
            SatOutcome::Sat(model) => {
                // v1 branched first (bias) but preferred false, forcing v2
                assert!(!model[1]);
                assert!(model[2]);
            }
            _ => panic!("expected SAT"),
        }
    }

    #[test]
    fn test_bias_steers_first_branch() {
        // Both vars free; the biased one is decided first and, with no
        // polarity preference, assigned true.
        let clauses: &[&[Lit]] = &[&[-1, -2]];
        let mut solver = CdclSolver::new(make_cnf(2, clauses), SolverParams::default());
        solver.add_bias(2, 5.0);
        match solver.solve(&[]) {
            SatOutcome::Sat(model) => {
                assert!(model[2]);
                assert!(!model[1]);
            }
            _ => panic!("expected SAT"),
        }
    }

    #[test]
    fn test_pigeonhole_unsat() {
        // 3 pigeons, 2 holes: forces real conflict analysis
        // var(p, h) for p in 0..3, h in 0..2
        let v = |p: Lit, h: Lit| p * 2 + h + 1;
        let mut clauses: Vec<Vec<Lit>> = Vec::new();
        for p in 0..3 {
            clauses.push(vec![v(p, 0), v(p, 1)]);
        }
        for h in 0..2 {
            for p1 in 0..3 {
                for p2 in (p1 + 1)..3 {
                    clauses.push(vec![-v(p1, h), -v(p2, h)]);
                }
            }
        }
        let refs: Vec<&[Lit]> = clauses.iter().map(Vec::as_slice).collect();
        let mut solver = CdclSolver::new(make_cnf(6, &refs), SolverParams::default());
        assert!(!solver.solve(&[]).is_sat());
    }

    #[test]
    fn test_random_cnfs_against_brute_force() {
        // Deterministic LCG in place of a property-testing framework
        let mut state = 0x2545f491_4f6cdd1du64;
        let mut next = move |bound: u64| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) % bound
        };

        for _ in 0..300 {
            let nvars = 1 + next(4) as usize;
            let nclauses = next(7) as usize;
            let mut clauses: Vec<Vec<Lit>> = Vec::new();
            for _ in 0..nclauses {
                let len = 1 + next(3) as usize;
                let mut clause = Vec::new();
                for _ in 0..len {
                    let v = 1 + next(nvars as u64) as Lit;
                    clause.push(if next(2) == 0 { v } else { -v });
                }
                clauses.push(clause);
            }

            let brute = (0..(1u32 << nvars)).any(|bits| {
                clauses.iter().all(|clause| {
                    clause.iter().any(|&l| {
                        let val = bits >> (l.unsigned_abs() - 1) & 1 == 1;
                        if l > 0 {
                            val
                        } else {
                            !val
                        }
                    })
                })
            });

            let refs: Vec<&[Lit]> = clauses.iter().map(Vec::as_slice).collect();
            let mut solver = CdclSolver::new(make_cnf(nvars, &refs), SolverParams::default());
            match solver.solve(&[]) {
                SatOutcome::Sat(model) => {
                    assert!(brute, "solver found model for UNSAT formula {clauses:?}");
                    assert!(
                        model_satisfies(&model, &refs),
                        "model violates formula {clauses:?}"
                    );
                }
                SatOutcome::Unsat(_) => {
                    assert!(!brute, "solver reported UNSAT for SAT formula {clauses:?}");
                }
            }
        }
    }

    #[test]
    fn test_incremental_reuse_after_adding_clauses() {
        let clauses: &[&[Lit]] = &[&[1, 2]];
        let mut solver = CdclSolver::new(make_cnf(2, clauses), SolverParams::default());
        assert!(solver.solve(&[]).is_sat());

        // Add a constraint and a new variable; arrays must grow
        let v3 = solver.cnf.new_var("v3");
        solver.cnf.add_clause(vec![-1], false, 0);
        solver.cnf.add_clause(vec![v3 as Lit], false, 0);
        match solver.solve(&[]) {
            SatOutcome::Sat(model) => {
                assert!(!model[1]);
                assert!(model[2]);
                assert!(model[3]);
            }
            _ => panic!("expected SAT"),
        }
    }
}
