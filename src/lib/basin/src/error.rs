use thiserror::Error;

use crate::GEOMETRIC_LOOP_NON_CONVERGENCE_EXIT_STATUS;

/// Errors surfaced by the simulation core. Geometric-loop non-convergence is
/// deliberately not in this list: it is a warning, the driver still writes
/// the present-day properties and the ThicknessError map.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// Missing snapshots, zero active segments, inconsistent layer input.
    #[error("inconsistent input: {0}")]
    InputInconsistency(String),

    /// Newton exceeded its iteration cap without converging, or a NaN
    /// appeared in the residual, update or solution.
    #[error("{equation} calculation has diverged: {reason}")]
    Diverged {
        equation: &'static str,
        reason: DivergenceReason,
    },

    /// Grid construction or vector/matrix allocation with inconsistent
    /// preallocation information.
    #[error("grid error: {0}")]
    Grid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DivergenceReason {
    /// The linear solver failed even after the fallback retries.
    LinearSolver {
        exit_condition: &'static str,
        attempts: usize,
        iterations: usize,
    },
    /// A NaN appeared after a successful linear solve.
    NanDetected,
    /// The nonlinear iteration cap was reached without convergence.
    IterationCap { iterations: usize },
}

impl std::fmt::Display for DivergenceReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DivergenceReason::LinearSolver {
                exit_condition,
                attempts,
                iterations,
            } => write!(
                f,
                "linear solver exit condition {exit_condition} after {attempts} attempts and {iterations} iterations"
            ),
            DivergenceReason::NanDetected => write!(f, "solution contains a NaN"),
            DivergenceReason::IterationCap { iterations } => {
                write!(f, "no convergence after {iterations} nonlinear iterations")
            }
        }
    }
}

/// Outcome of a completed run. `geometry_has_converged == false` maps to the
/// distinguished process exit status.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub geometry_has_converged: bool,
    pub geometric_iterations: usize,
    pub time_steps: usize,
    /// Global maximum relative thickness error after each geometric
    /// iteration.
    pub thickness_errors: Vec<f64>,
}

impl RunSummary {
    pub fn exit_status(&self) -> i32 {
        if self.geometry_has_converged {
            0
        } else {
            GEOMETRIC_LOOP_NON_CONVERGENCE_EXIT_STATUS
        }
    }
}
