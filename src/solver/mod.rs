// src/solver/mod.rs

//! Boolean satisfiability engine used by the dependency resolver
//!
//! [`Cnf`] holds the clause database with two-watched-literal indexes;
//! [`CdclSolver`] runs conflict-driven clause learning over it. The solver
//! performs no I/O and owns no state beyond its own instance, so the
//! resolver can keep one alive across solves for incremental reuse.

mod cdcl;
mod cnf;

pub use cdcl::{CdclSolver, SolverParams};
pub use cnf::{var_of, Cnf, Lit, Var};

/// Outcome of a solve: a total assignment, or the assumptions that cannot
/// jointly hold.
#[derive(Debug, Clone)]
pub enum SatOutcome {
    /// Total assignment indexed by variable (index 0 unused)
    Sat(Vec<bool>),
    /// Literals forming the unsatisfiable subset of assumptions and
    /// pinned units
    Unsat(Vec<Lit>),
}

impl SatOutcome {
    pub fn is_sat(&self) -> bool {
        matches!(self, SatOutcome::Sat(_))
    }
}
