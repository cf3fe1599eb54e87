//! Residual/Jacobian construction for one scan against a `SplineMap`.

use nalgebra::{Point2, Vector2};
use spline_map::SplineMap;

/// Local-frame hit points plus the map they are scored against.
///
/// Bundles exactly what `nlls::solve`'s `residual_fn`/`jacobian_fn`
/// closures need so `SplineLocalizer::update` can hand them off without
/// reaching into the math itself.
pub struct ScanCost<'a> {
    map: &'a SplineMap,
    local_hits: &'a [Point2<f64>],
}

impl<'a> ScanCost<'a> {
    pub fn new(map: &'a SplineMap, local_hits: &'a [Point2<f64>]) -> Self {
        Self { map, local_hits }
    }

    fn world_hits(&self, q: &[f64]) -> Vec<Point2<f64>> {
        let (x, y, theta) = (q[0], q[1], q[2]);
        let (s, c) = theta.sin_cos();
        self.local_hits
            .iter()
            .map(|p| Point2::new(c * p.x - s * p.y + x, s * p.x + c * p.y + y))
            .collect()
    }

    /// `r_i(q) = 1 - s_i / LMAX` per §4.2.2.
    pub fn residual(&self, q: &[f64], lmax: f64) -> Vec<f64> {
        let world = self.world_hits(q);
        self.map
            .evaluate(&world)
            .into_iter()
            .map(|s| 1.0 - s / lmax)
            .collect()
    }

    /// Analytic Jacobian rows: `dr/dx = -g.x`, `dr/dy = -g.y`,
    /// `dr/dtheta = -g . (R'(theta) p)`, the textbook derivative of
    /// `r = 1 - s/LMAX` (§4.2.2).
    ///
    /// §9.2 notes the source omits this leading minus sign; this crate
    /// keeps it, because `nlls::solve` below forms the standard
    /// Gauss-Newton normal equations `dx = -(J^T J)^-1 J^T r`, which are
    /// linear (not quadratic) in `J`'s sign — an unsigned Jacobian would
    /// silently reverse every computed descent step instead of
    /// cancelling out. Residual and Jacobian are implemented together
    /// here so the two cannot drift apart.
    pub fn jacobian(&self, q: &[f64], lmax: f64) -> Vec<Vec<f64>> {
        let theta = q[2];
        let (s, c) = theta.sin_cos();
        let world = self.world_hits(q);
        let grads = self.map.gradient(&world);

        self.local_hits
            .iter()
            .zip(grads.iter())
            .map(|(p, g)| {
                let g = g / lmax;
                // R'(theta) = [[-sin, -cos], [cos, -sin]]
                let rp_p = Vector2::new(-s * p.x - c * p.y, c * p.x - s * p.y);
                let dtheta = rp_p.dot(&g);
                vec![-g.x, -g.y, -dtheta]
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spline_map::{SplineMap, SplineMapConfig};
    use types::Pose;

    #[test]
    fn jacobian_matches_finite_difference_of_residual() {
        let config = SplineMapConfig::default();
        let mut map = SplineMap::new(config);
        let n = 360;
        let ranges = vec![1.0_f32; n];
        map.update(Pose::default(), &ranges).unwrap();

        let local_hits = vec![Point2::new(0.9, 0.05), Point2::new(0.2, -0.9)];
        let cost = ScanCost::new(&map, &local_hits);
        let lmax = 100.0;

        let q0 = [0.01, -0.02, 0.03];
        let jac = cost.jacobian(&q0, lmax);

        let h = 1e-6;
        for dim in 0..3 {
            let mut q_plus = q0;
            let mut q_minus = q0;
            q_plus[dim] += h;
            q_minus[dim] -= h;
            let r_plus = cost.residual(&q_plus, lmax);
            let r_minus = cost.residual(&q_minus, lmax);
            for i in 0..local_hits.len() {
                let fd = (r_plus[i] - r_minus[i]) / (2.0 * h);
                assert!(
                    (fd - jac[i][dim]).abs() < 1e-3,
                    "dim {} hit {}: fd={} analytic={}",
                    dim,
                    i,
                    fd,
                    jac[i][dim]
                );
            }
        }
    }
}
