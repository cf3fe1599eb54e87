//! A small Levenberg-Marquardt-style damped Gauss-Newton solver with an
//! optional Cauchy robust loss.
//!
//! This generalizes the normal-equations solve `slam::SlamProcessor::optimize`
//! already uses for pose-graph optimization (`H·dx = -b` via `nalgebra`'s
//! `lu()`, diagonal damping) to per-iteration IRLS reweighting under a
//! robust loss. The rest of `spline_localizer` only ever sees `solve`; no
//! caller reaches into the residual/Jacobian bookkeeping below.

use nalgebra::{DMatrix, DVector};

/// Cauchy robust loss with scale `f_scale`, applied to squared residuals.
///
/// Returns `(rho, rho_prime)`: the loss value and its derivative with
/// respect to `s = r^2`, which is what an IRLS reweighting needs.
fn cauchy_loss(s: f64, f_scale: f64) -> (f64, f64) {
    let c2 = f_scale * f_scale;
    let rho = c2 * (1.0 + s / c2).ln();
    let rho_prime = 1.0 / (1.0 + s / c2);
    (rho, rho_prime)
}

#[derive(Debug, Clone, Copy)]
pub struct NllsOptions {
    pub f_scale: f64,
    pub ftol: f64,
    pub max_iterations: usize,
    pub initial_damping: f64,
}

impl Default for NllsOptions {
    fn default() -> Self {
        Self {
            f_scale: 1.5,
            ftol: 1e-5,
            max_iterations: 10,
            initial_damping: 1e-3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NllsResult {
    pub x: Vec<f64>,
    pub cost: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Solve `min_x sum_i rho(r_i(x)^2)` via damped Gauss-Newton.
///
/// `residual_fn` returns the raw (unweighted) residual vector at `x`;
/// `jacobian_fn` returns its Jacobian (rows match residuals, columns
/// match `x`'s dimension) at the same point.
pub fn solve<F, J>(residual_fn: F, jacobian_fn: J, x0: &[f64], opts: NllsOptions) -> NllsResult
where
    F: Fn(&[f64]) -> Vec<f64>,
    J: Fn(&[f64]) -> Vec<Vec<f64>>,
{
    let n = x0.len();
    let mut x = x0.to_vec();
    let mut lambda = opts.initial_damping;

    let weighted_cost = |r: &[f64]| -> f64 {
        r.iter().map(|&ri| cauchy_loss(ri * ri, opts.f_scale).0).sum()
    };

    let mut cost = weighted_cost(&residual_fn(&x));
    let mut converged = false;
    let mut iterations = 0;

    for _ in 0..opts.max_iterations {
        iterations += 1;

        let r = residual_fn(&x);
        let jac = jacobian_fn(&x);
        let m = r.len();
        if m == 0 {
            break;
        }

        let weights: Vec<f64> = r
            .iter()
            .map(|&ri| cauchy_loss(ri * ri, opts.f_scale).1)
            .collect();

        let mut h = DMatrix::<f64>::zeros(n, n);
        let mut b = DVector::<f64>::zeros(n);
        for i in 0..m {
            let w = weights[i];
            let row = &jac[i];
            for a in 0..n {
                b[a] += w * row[a] * r[i];
                for c in 0..n {
                    h[(a, c)] += w * row[a] * row[c];
                }
            }
        }

        let mut accepted = false;
        for _ in 0..5 {
            let mut h_damped = h.clone();
            for d in 0..n {
                h_damped[(d, d)] += lambda * h_damped[(d, d)].max(1e-12);
            }

            let dx = match h_damped.clone().lu().solve(&(-&b)) {
                Some(dx) => dx,
                None => {
                    lambda *= 10.0;
                    continue;
                }
            };

            let candidate: Vec<f64> = x.iter().zip(dx.iter()).map(|(&xi, &di)| xi + di).collect();
            if candidate.iter().any(|v| !v.is_finite()) {
                lambda *= 10.0;
                continue;
            }

            let candidate_cost = weighted_cost(&residual_fn(&candidate));
            if candidate_cost.is_finite() && candidate_cost <= cost {
                let rel_decrease = if cost.abs() > 1e-12 {
                    (cost - candidate_cost) / cost.abs()
                } else {
                    0.0
                };
                x = candidate;
                cost = candidate_cost;
                lambda = (lambda * 0.5).max(1e-12);
                accepted = true;
                if rel_decrease.abs() < opts.ftol {
                    converged = true;
                }
                break;
            } else {
                lambda *= 10.0;
            }
        }

        if !accepted || converged {
            break;
        }
    }

    NllsResult {
        x,
        cost,
        iterations,
        converged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn solves_simple_quadratic_bowl() {
        // Minimize (x - 3)^2 + (y + 2)^2 via a 2-residual least-squares form.
        let residual = |x: &[f64]| vec![x[0] - 3.0, x[1] + 2.0];
        let jacobian = |_x: &[f64]| vec![vec![1.0, 0.0], vec![0.0, 1.0]];

        let result = solve(residual, jacobian, &[0.0, 0.0], NllsOptions::default());
        assert_relative_eq!(result.x[0], 3.0, epsilon = 1e-3);
        assert_relative_eq!(result.x[1], -2.0, epsilon = 1e-3);
    }
}
