//! Linear solvers for the Newton inner solve: Jacobi-preconditioned
//! conjugate gradients as the default, GMRES(restart) as the fallback, and
//! the escalation policy that promotes a failing solve to GMRES with
//! growing restart and iteration budgets.

use nalgebra::DVector;
use sprs::CsMat;

use crate::GMRES_RESTART_VALUE;

/// Printable exit conditions, mirroring the convergence reasons of the
/// underlying solver library the production code consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvergedReason {
    ConvergedRtol,
    ConvergedAtol,
    DivergedMaxIts,
    DivergedNan,
    DivergedBreakdown,
}

impl ConvergedReason {
    pub fn is_converged(self) -> bool {
        matches!(
            self,
            ConvergedReason::ConvergedRtol | ConvergedReason::ConvergedAtol
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ConvergedReason::ConvergedRtol => "CONVERGED_RTOL",
            ConvergedReason::ConvergedAtol => "CONVERGED_ATOL",
            ConvergedReason::DivergedMaxIts => "DIVERGED_MAX_ITS",
            ConvergedReason::DivergedNan => "DIVERGED_NANORINF",
            ConvergedReason::DivergedBreakdown => "DIVERGED_BREAKDOWN",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KrylovMethod {
    ConjugateGradient,
    Gmres,
}

#[derive(Clone, Copy, Debug)]
pub struct LinearSolverConfig {
    pub method: KrylovMethod,
    pub tolerance: f64,
    pub max_iterations: usize,
    pub gmres_restart: usize,
}

impl LinearSolverConfig {
    pub fn new(tolerance: f64) -> Self {
        LinearSolverConfig {
            method: KrylovMethod::ConjugateGradient,
            tolerance,
            max_iterations: DEFAULT_MAX_LINEAR_ITERATIONS,
            gmres_restart: 30,
        }
    }
}

pub struct LinearSolveResult {
    pub solution: DVector<f64>,
    pub reason: ConvergedReason,
    pub iterations: usize,
}

pub const DEFAULT_MAX_LINEAR_ITERATIONS: usize = 1000;
pub const GMRES_RESTART_INCREMENT: usize = 60;
pub const MAXIMUM_LINEAR_SOLVE_ATTEMPTS: usize = 6;

// --- Helper: sparse matrix-vector multiply ---
fn cs_mat_mul_vec(a: &CsMat<f64>, x: &DVector<f64>) -> DVector<f64> {
    let n = a.rows();
    let mut y = DVector::<f64>::zeros(n);
    for (row, vec) in a.outer_iterator().enumerate() {
        let mut sum = 0.0;
        for (&col, &val) in vec.indices().iter().zip(vec.data().iter()) {
            sum += val * x[col];
        }
        y[row] = sum;
    }
    y
}

/// Inverse diagonal of the matrix, the Jacobi preconditioner.
fn inverse_diagonal(a: &CsMat<f64>) -> DVector<f64> {
    let n = a.rows();
    let mut diag_inv = DVector::<f64>::from_element(n, 1.0);
    for (row, vec) in a.outer_iterator().enumerate() {
        for (&col, &val) in vec.indices().iter().zip(vec.data().iter()) {
            if col == row && val.abs() > f64::EPSILON {
                diag_inv[row] = 1.0 / val;
            }
        }
    }
    diag_inv
}

/// Solve with the configured method.
pub fn solve(
    a: &CsMat<f64>,
    b: &DVector<f64>,
    x0: &DVector<f64>,
    config: &LinearSolverConfig,
) -> LinearSolveResult {
    match config.method {
        KrylovMethod::ConjugateGradient => {
            solve_pcg_with_guess(a, b, x0, config.tolerance, config.max_iterations)
        }
        KrylovMethod::Gmres => solve_gmres(
            a,
            b,
            x0,
            config.tolerance,
            config.max_iterations,
            config.gmres_restart.max(1),
        ),
    }
}

// PCG solver with initial guess and Jacobi preconditioner.
pub fn solve_pcg_with_guess(
    a: &CsMat<f64>,
    b: &DVector<f64>,
    x0: &DVector<f64>,
    tolerance: f64,
    max_iter: usize,
) -> LinearSolveResult {
    let n = b.len();
    let m_inv_diag = inverse_diagonal(a);
    let mut x = x0.clone();
    let mut r = b - &cs_mat_mul_vec(a, &x);
    let mut z = DVector::<f64>::zeros(n);
    for i in 0..n {
        z[i] = r[i] * m_inv_diag[i];
    }
    let mut p = z.clone();
    let mut r_dot_z = r.dot(&z);
    let r0_norm = r.norm();
    if r0_norm == 0.0 {
        return LinearSolveResult {
            solution: x,
            reason: ConvergedReason::ConvergedAtol,
            iterations: 0,
        };
    }

    let mut reason = ConvergedReason::DivergedMaxIts;
    let mut iter_count = 0;
    for it in 0..max_iter {
        iter_count = it + 1;
        if r.norm() / r0_norm < tolerance {
            reason = ConvergedReason::ConvergedRtol;
            break;
        }
        let q = cs_mat_mul_vec(a, &p);
        let p_dot_q = p.dot(&q);
        if !p_dot_q.is_finite() {
            reason = ConvergedReason::DivergedNan;
            break;
        }
        if p_dot_q.abs() < f64::EPSILON {
            reason = ConvergedReason::DivergedBreakdown;
            break;
        }
        let alpha = r_dot_z / p_dot_q;
        x += alpha * p.clone();
        let r_new = r - alpha * q;
        let mut z_new = DVector::<f64>::zeros(n);
        for i in 0..n {
            z_new[i] = r_new[i] * m_inv_diag[i];
        }
        let r_new_dot_z_new = r_new.dot(&z_new);
        let beta = if r_dot_z.abs() < f64::EPSILON {
            0.0
        } else {
            r_new_dot_z_new / r_dot_z
        };
        p = z_new.clone() + beta * p;
        r = r_new;
        r_dot_z = r_new_dot_z_new;
    }
    if reason == ConvergedReason::DivergedMaxIts && r.norm() / r0_norm < tolerance {
        reason = ConvergedReason::ConvergedRtol;
    }
    LinearSolveResult {
        solution: x,
        reason,
        iterations: iter_count,
    }
}

/// Restarted GMRES with left Jacobi preconditioning and Givens rotations.
pub fn solve_gmres(
    a: &CsMat<f64>,
    b: &DVector<f64>,
    x0: &DVector<f64>,
    tolerance: f64,
    max_iter: usize,
    restart: usize,
) -> LinearSolveResult {
    let n = b.len();
    let m_inv = inverse_diagonal(a);
    let precondition = |v: &DVector<f64>| -> DVector<f64> {
        DVector::from_fn(n, |i, _| v[i] * m_inv[i])
    };

    let mut x = x0.clone();
    let r0 = precondition(&(b - &cs_mat_mul_vec(a, &x)));
    let r0_norm = r0.norm();
    if r0_norm == 0.0 {
        return LinearSolveResult {
            solution: x,
            reason: ConvergedReason::ConvergedAtol,
            iterations: 0,
        };
    }

    let mut total_iterations = 0usize;
    loop {
        let mut r = precondition(&(b - &cs_mat_mul_vec(a, &x)));
        let beta = r.norm();
        if !beta.is_finite() {
            return LinearSolveResult {
                solution: x,
                reason: ConvergedReason::DivergedNan,
                iterations: total_iterations,
            };
        }
        if beta / r0_norm < tolerance {
            return LinearSolveResult {
                solution: x,
                reason: ConvergedReason::ConvergedRtol,
                iterations: total_iterations,
            };
        }
        r /= beta;

        let m = restart;
        let mut basis: Vec<DVector<f64>> = Vec::with_capacity(m + 1);
        basis.push(r);
        let mut h = vec![vec![0.0f64; m]; m + 1];
        let mut cs = vec![0.0f64; m];
        let mut sn = vec![0.0f64; m];
        let mut g = vec![0.0f64; m + 1];
        g[0] = beta;

        let mut inner_size = 0usize;
        let mut converged_inner = false;
        for jj in 0..m {
            if total_iterations >= max_iter {
                break;
            }
            total_iterations += 1;
            inner_size = jj + 1;

            let mut w = precondition(&cs_mat_mul_vec(a, &basis[jj]));
            // Modified Gram-Schmidt.
            for (row, v) in basis.iter().enumerate().take(jj + 1) {
                let coeff = w.dot(v);
                h[row][jj] = coeff;
                w -= coeff * v;
            }
            let w_norm = w.norm();
            h[jj + 1][jj] = w_norm;
            if !w_norm.is_finite() {
                return LinearSolveResult {
                    solution: x,
                    reason: ConvergedReason::DivergedNan,
                    iterations: total_iterations,
                };
            }

            // Apply accumulated Givens rotations to the new column.
            for row in 0..jj {
                let temp = cs[row] * h[row][jj] + sn[row] * h[row + 1][jj];
                h[row + 1][jj] = -sn[row] * h[row][jj] + cs[row] * h[row + 1][jj];
                h[row][jj] = temp;
            }
            let denom = (h[jj][jj] * h[jj][jj] + h[jj + 1][jj] * h[jj + 1][jj]).sqrt();
            if denom < f64::EPSILON {
                converged_inner = true;
                break;
            }
            cs[jj] = h[jj][jj] / denom;
            sn[jj] = h[jj + 1][jj] / denom;
            h[jj][jj] = denom;
            h[jj + 1][jj] = 0.0;
            g[jj + 1] = -sn[jj] * g[jj];
            g[jj] *= cs[jj];

            if g[jj + 1].abs() / r0_norm < tolerance {
                converged_inner = true;
                break;
            }
            if w_norm < f64::EPSILON {
                converged_inner = true;
                break;
            }
            basis.push(w / w_norm);
        }

        if inner_size > 0 {
            // Back-substitute the least-squares system and update x.
            let mut y = vec![0.0f64; inner_size];
            for row in (0..inner_size).rev() {
                let mut sum = g[row];
                for col in (row + 1)..inner_size {
                    sum -= h[row][col] * y[col];
                }
                y[row] = if h[row][row].abs() > f64::EPSILON {
                    sum / h[row][row]
                } else {
                    0.0
                };
            }
            for (col, &coeff) in y.iter().enumerate() {
                x += coeff * &basis[col];
            }
        }

        if converged_inner {
            let residual = precondition(&(b - &cs_mat_mul_vec(a, &x)));
            if residual.norm() / r0_norm < tolerance * 10.0 {
                return LinearSolveResult {
                    solution: x,
                    reason: ConvergedReason::ConvergedRtol,
                    iterations: total_iterations,
                };
            }
        }
        if total_iterations >= max_iter {
            let residual = precondition(&(b - &cs_mat_mul_vec(a, &x)));
            let reason = if residual.norm() / r0_norm < tolerance {
                ConvergedReason::ConvergedRtol
            } else {
                ConvergedReason::DivergedMaxIts
            };
            return LinearSolveResult {
                solution: x,
                reason,
                iterations: total_iterations,
            };
        }
    }
}

/// Escalation policy when the linear solve fails inside a Newton
/// iteration: first switch to GMRES with at least the default restart and
/// iteration budgets; on every further failure grow the restart by a fixed
/// increment and the iteration budget by half, up to the attempt cap.
#[derive(Debug)]
pub struct FallbackPolicy {
    changed_solver: bool,
    attempts: usize,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        FallbackPolicy {
            changed_solver: false,
            attempts: 1,
        }
    }
}

impl FallbackPolicy {
    /// Mutate the config for the next retry. Returns false once the
    /// attempt cap is exhausted.
    pub fn escalate(&mut self, config: &mut LinearSolverConfig) -> bool {
        if self.attempts > MAXIMUM_LINEAR_SOLVE_ATTEMPTS {
            return false;
        }
        if !self.changed_solver {
            if config.method != KrylovMethod::Gmres {
                config.method = KrylovMethod::Gmres;
            }
            config.gmres_restart = config.gmres_restart.max(GMRES_RESTART_VALUE);
            config.max_iterations = config.max_iterations.max(DEFAULT_MAX_LINEAR_ITERATIONS);
            self.changed_solver = true;
        } else {
            config.gmres_restart += GMRES_RESTART_INCREMENT;
            config.max_iterations = (3 * config.max_iterations) / 2;
        }
        self.attempts += 1;
        true
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprs::TriMat;

    fn laplacian_1d(n: usize) -> CsMat<f64> {
        let mut tri = TriMat::new((n, n));
        for i in 0..n {
            tri.add_triplet(i, i, 2.0);
            if i > 0 {
                tri.add_triplet(i, i - 1, -1.0);
            }
            if i + 1 < n {
                tri.add_triplet(i, i + 1, -1.0);
            }
        }
        tri.to_csr()
    }

    #[test]
    fn pcg_solves_a_laplacian() {
        let a = laplacian_1d(20);
        let expected = DVector::from_fn(20, |i, _| (i as f64 * 0.3).sin());
        let b = {
            let mut y = DVector::zeros(20);
            for (row, vec) in a.outer_iterator().enumerate() {
                for (&col, &val) in vec.indices().iter().zip(vec.data().iter()) {
                    y[row] += val * expected[col];
                }
            }
            y
        };
        let result = solve_pcg_with_guess(&a, &b, &DVector::zeros(20), 1.0e-10, 200);
        assert!(result.reason.is_converged());
        assert!((result.solution - expected).norm() < 1.0e-6);
    }

    #[test]
    fn gmres_solves_a_nonsymmetric_system() {
        let n = 15;
        let mut tri = TriMat::new((n, n));
        for i in 0..n {
            tri.add_triplet(i, i, 4.0);
            if i > 0 {
                tri.add_triplet(i, i - 1, -1.5);
            }
            if i + 1 < n {
                tri.add_triplet(i, i + 1, -0.5);
            }
        }
        let a: CsMat<f64> = tri.to_csr();
        let expected = DVector::from_fn(n, |i, _| 1.0 + i as f64);
        let b = cs_mat_mul_vec(&a, &expected);
        let result = solve_gmres(&a, &b, &DVector::zeros(n), 1.0e-10, 500, 10);
        assert!(result.reason.is_converged(), "reason: {:?}", result.reason);
        assert!((result.solution - expected).norm() < 1.0e-6);
    }

    #[test]
    fn pcg_reports_max_iterations_on_a_tiny_budget() {
        let a = laplacian_1d(50);
        let b = DVector::from_element(50, 1.0);
        let result = solve_pcg_with_guess(&a, &b, &DVector::zeros(50), 1.0e-14, 2);
        assert_eq!(result.reason, ConvergedReason::DivergedMaxIts);
    }

    #[test]
    fn fallback_policy_switches_to_gmres_then_grows_budgets() {
        let mut config = LinearSolverConfig::new(1.0e-8);
        let mut policy = FallbackPolicy::default();

        assert!(policy.escalate(&mut config));
        assert_eq!(config.method, KrylovMethod::Gmres);
        assert_eq!(config.gmres_restart, GMRES_RESTART_VALUE);
        assert_eq!(config.max_iterations, DEFAULT_MAX_LINEAR_ITERATIONS);

        assert!(policy.escalate(&mut config));
        assert_eq!(config.gmres_restart, GMRES_RESTART_VALUE + GMRES_RESTART_INCREMENT);
        assert_eq!(config.max_iterations, 1500);

        let mut exhausted = 0;
        while policy.escalate(&mut config) {
            exhausted += 1;
            assert!(exhausted < 20);
        }
        assert_eq!(policy.attempts(), MAXIMUM_LINEAR_SOLVE_ATTEMPTS + 1);
    }

    #[test]
    fn fallback_keeps_larger_existing_budgets() {
        let mut config = LinearSolverConfig::new(1.0e-8);
        config.gmres_restart = 200;
        config.max_iterations = 5000;
        let mut policy = FallbackPolicy::default();
        policy.escalate(&mut config);
        assert_eq!(config.gmres_restart, 200);
        assert_eq!(config.max_iterations, 5000);
    }
}
