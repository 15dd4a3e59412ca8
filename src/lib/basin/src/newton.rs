//! Newton-with-reused-Jacobian nonlinear solver wrapper.
//!
//! One state machine serves the pressure and the temperature equations:
//! assemble (recomputing the Jacobian only when the reuse policy says so),
//! linear solve with the fallback policy on failure, damped update with
//! the adaptive theta schedule, then the relative/absolute convergence
//! test with a minimum of three iterations. The linear temperature variant
//! runs the same machine for exactly one iteration.

use nalgebra::DVector;

use crate::error::DivergenceReason;
use crate::output::LineSink;
use crate::prealloc::Jacobian;
use crate::solver::{self, FallbackPolicy, LinearSolverConfig};

pub const MINIMUM_NONLINEAR_ITERATIONS: usize = 3;

/// The problem-specific part of a nonlinear solve. `assemble` writes the
/// residual (and the Jacobian when requested) for the stored state;
/// `store_solution` pushes the iterate back into the layer state and
/// recomputes the dependent properties the next assembly reads.
pub trait NonlinearSystem {
    fn equation_name(&self) -> &'static str;
    fn initial_solution(&self) -> DVector<f64>;
    fn assemble(
        &mut self,
        jacobian: Option<&mut Jacobian>,
        residual: &mut DVector<f64>,
        solution: &DVector<f64>,
    );
    fn store_solution(&mut self, solution: &DVector<f64>);
}

/// When to recompute the Jacobian: always on the first three iterations,
/// then every `reuse_count`-th, and always when reuse is disallowed.
#[derive(Clone, Copy, Debug)]
pub struct JacobianReusePolicy {
    pub allow_reuse: bool,
    pub reuse_count: usize,
}

impl JacobianReusePolicy {
    pub fn should_recompute(&self, iteration_count: usize) -> bool {
        if !self.allow_reuse {
            return true;
        }
        iteration_count <= 3 || iteration_count % self.reuse_count.max(1) == 0
    }
}

#[derive(Clone, Copy, Debug)]
pub struct NewtonConfig {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub reuse: JacobianReusePolicy,
    pub linear: LinearSolverConfig,
    /// Run exactly one iteration with theta = -1: the linear variant.
    pub linear_variant: bool,
}

#[derive(Clone, Debug)]
pub struct NewtonReport {
    pub iterations: usize,
    pub converged: bool,
    pub hit_iteration_cap: bool,
    pub diverged: Option<DivergenceReason>,
    pub solution_norm: f64,
    pub residual_norm: f64,
    pub linear_iterations: usize,
}

/// The theta schedule of the damped update `u <- u + theta * delta`
/// (theta kept negative). Exposed for the controller tests.
pub fn next_theta(total_iterations: usize, theta: f64, residual_grew: bool) -> f64 {
    if total_iterations == 0 {
        // Not too big a jump on the very first update; helps layers with
        // high deposition rates.
        -0.5
    } else if total_iterations <= 2 {
        -1.0
    } else if residual_grew {
        (0.5 * theta).min(-0.1)
    } else {
        (-1.0f64).max(theta - 0.05)
    }
}

/// Drive one nonlinear solve over the preallocated Jacobian.
pub fn solve_nonlinear(
    system: &mut dyn NonlinearSystem,
    jacobian: &mut Jacobian,
    config: &NewtonConfig,
    sink: &mut dyn LineSink,
) -> NewtonReport {
    let name = system.equation_name();
    let mut u = system.initial_solution();
    let n = u.len();
    let mut residual = DVector::<f64>::zeros(n);

    let mut linear_config = config.linear;
    let mut theta = 0.0f64;
    let mut residual_length = 1.0f64;
    let mut previous_residual_length;

    let mut iterations = 0usize;
    let mut total_iterations = 0usize;
    let mut total_linear_iterations = 0usize;
    let mut converged = false;
    let mut hit_iteration_cap = false;
    let mut diverged: Option<DivergenceReason> = None;
    let mut solution_length = u.norm();

    while !converged && diverged.is_none() {
        residual.fill(0.0);
        if config.reuse.should_recompute(iterations + 1) {
            jacobian.zero_entries();
            system.assemble(Some(jacobian), &mut residual, &u);
        } else {
            system.assemble(None, &mut residual, &u);
        }

        let mut result = solver::solve(
            jacobian.matrix(),
            &residual,
            &DVector::zeros(n),
            &linear_config,
        );
        total_linear_iterations += result.iterations;

        if !result.reason.is_converged() {
            sink.line(&format!(
                " MeSsAgE WARNING The {name} solver exit condition was: {}. Retrying with another linear solver. ",
                result.reason.name()
            ));
            let mut fallback = FallbackPolicy::default();
            while !result.reason.is_converged() && fallback.escalate(&mut linear_config) {
                result = solver::solve(
                    jacobian.matrix(),
                    &residual,
                    &DVector::zeros(n),
                    &linear_config,
                );
                total_linear_iterations += result.iterations;
            }
            if !result.reason.is_converged() {
                sink.line(&format!(
                    " MeSsAgE ERROR {name} solver exit condition was: {} ",
                    result.reason.name()
                ));
                sink.line(&format!(
                    " MeSsAgE ERROR the linear solver could not converge to a solution after {} attempts and {} iterations. ",
                    fallback.attempts(),
                    total_linear_iterations
                ));
                diverged = Some(DivergenceReason::LinearSolver {
                    exit_condition: result.reason.name(),
                    attempts: fallback.attempts(),
                    iterations: total_linear_iterations,
                });
                break;
            }
        }
        let delta = result.solution;

        previous_residual_length = residual_length;
        residual_length = residual.norm();
        theta = if config.linear_variant {
            -1.0
        } else {
            next_theta(
                total_iterations,
                theta,
                previous_residual_length < residual_length,
            )
        };

        // u_{n+1} = u_n + theta * (J^-1 r); theta is negative.
        u += theta * &delta;
        system.store_solution(&u);

        solution_length = u.norm();
        let update_length = delta.norm();

        if solution_length.is_nan() || update_length.is_nan() || residual_length.is_nan() {
            sink.line(&format!(" MeSsAgE ERROR {name} solution contains a NaN. "));
            diverged = Some(DivergenceReason::NanDetected);
            break;
        }

        iterations += 1;
        total_iterations += 1;

        tracing::debug!(
            equation = name,
            iteration = total_iterations,
            residual = residual_length,
            update = update_length,
            theta = theta.abs(),
            "newton iteration"
        );

        if config.linear_variant {
            converged = true;
            break;
        }

        converged = if solution_length > 1.0 {
            update_length / solution_length < config.tolerance
        } else {
            update_length < config.tolerance
        };
        // At least the minimum number of iterations must run; the cap
        // always terminates (the time-step controller reacts to it).
        converged = converged && iterations >= MINIMUM_NONLINEAR_ITERATIONS;
        if iterations >= config.max_iterations {
            converged = true;
            hit_iteration_cap = true;
        }
    }

    NewtonReport {
        iterations,
        converged: converged && diverged.is_none(),
        hit_iteration_cap,
        diverged,
        solution_norm: solution_length,
        residual_norm: residual_length,
        linear_iterations: total_linear_iterations,
    }
}
