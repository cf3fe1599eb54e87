//! Nonlinear least-squares scan-matching localization against a
//! [`spline_map::SplineMap`] occupancy field.
//!
//! `SplineLocalizer` owns the current pose estimate and nothing else; the
//! map itself is shared (read-mostly) state behind an `Arc<RwLock<_>>` so
//! a caller can run mapping and localization against the same field
//! without this crate taking an opinion on threading beyond "one
//! optimization pass holds one read lock."

use std::sync::{Arc, RwLock};

use nalgebra::Point2;
use thiserror::Error;
use tracing::{debug, warn};
use types::Pose;

use spline_map::SplineMap;

mod cost;
mod nlls;

use cost::ScanCost;
use nlls::{NllsOptions, NllsResult};

#[derive(Error, Debug)]
pub enum SplineLocalizerError {
    #[error("ranges length {got} does not match the configured bearing count {expected}")]
    InvalidScan { expected: usize, got: usize },
    #[error("world point ({x}, {y}) falls outside the control grid")]
    OutOfGrid { x: f64, y: f64 },
    #[error("solver failed to reach a finite pose estimate")]
    DegenerateOptimization,
}

/// Construction parameters for `SplineLocalizer`.
#[derive(Debug, Clone)]
pub struct SplineLocalizerConfig {
    pub min_angle: f32,
    pub max_angle: f32,
    pub angle_increment: f32,
    pub range_min: f32,
    pub range_max: f32,
    pub logodd_max_occupied: f64,
    /// Maximum solver iterations per optimization pass.
    pub nb_iteration_max: usize,
    /// Reserved: not used by the current cost formulation.
    pub det_hinv_threshold: f64,
    /// Reserved: not used by the current cost formulation.
    pub alpha: f64,
}

impl Default for SplineLocalizerConfig {
    fn default() -> Self {
        Self {
            min_angle: 0.0,
            max_angle: 2.0 * std::f32::consts::PI - std::f32::consts::PI / 180.0,
            angle_increment: std::f32::consts::PI / 180.0,
            range_min: 0.12,
            range_max: 3.6,
            logodd_max_occupied: 100.0,
            nb_iteration_max: 10,
            det_hinv_threshold: 1e-9,
            alpha: 0.5,
        }
    }
}

/// Yaw perturbations tried when odometry is flagged unreliable (§4.2.4).
/// The duplicate `-3*PI/2` entry is preserved from the reference source.
const YAW_CANDIDATES: [f64; 7] = [
    0.0,
    std::f64::consts::FRAC_PI_4,
    -std::f64::consts::FRAC_PI_4,
    std::f64::consts::FRAC_PI_2,
    -std::f64::consts::FRAC_PI_2,
    -1.5 * std::f64::consts::PI,
    -1.5 * std::f64::consts::PI,
];

pub struct SplineLocalizer {
    map: Arc<RwLock<SplineMap>>,
    config: SplineLocalizerConfig,
    angles: Vec<f64>,
    pose: Pose,
}

impl SplineLocalizer {
    pub fn new(map: Arc<RwLock<SplineMap>>, config: SplineLocalizerConfig) -> Self {
        let angles = arange(
            config.min_angle as f64,
            config.max_angle as f64,
            config.angle_increment as f64,
        );
        Self {
            map,
            config,
            angles,
            pose: Pose::default(),
        }
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    /// Run the multi-start scan-match update described in §4.2.4.
    pub fn update(
        &mut self,
        ranges: &[f32],
        pose_hint: Option<Pose>,
        unreliable_odometry: bool,
    ) -> Result<Pose, SplineLocalizerError> {
        if ranges.len() != self.angles.len() {
            return Err(SplineLocalizerError::InvalidScan {
                expected: self.angles.len(),
                got: ranges.len(),
            });
        }

        let hint = pose_hint.unwrap_or(self.pose);
        let local_hits = self.local_hits(ranges);

        let map = self
            .map
            .read()
            .expect("spline map lock poisoned");

        let coarse_opts = NllsOptions {
            ftol: 1e-2,
            max_iterations: self.config.nb_iteration_max,
            ..NllsOptions::default()
        };
        let fine_opts = NllsOptions {
            ftol: 1e-5,
            max_iterations: self.config.nb_iteration_max,
            ..NllsOptions::default()
        };

        let candidates: &[f64] = if unreliable_odometry {
            &YAW_CANDIDATES
        } else {
            &YAW_CANDIDATES[..1]
        };

        let mut best: Option<(Vec<f64>, NllsResult)> = None;
        for &dyaw in candidates {
            let x0 = [hint.x, hint.y, hint.theta + dyaw];
            let result = self.run_pass(&map, &local_hits, &x0, coarse_opts);
            let replace = best.as_ref().map(|(_, b)| result.cost < b.1.cost).unwrap_or(true);
            if replace {
                best = Some((x0.to_vec(), result));
            }
        }
        let (_, best_result) = best.expect("yaw candidate list is never empty");

        let self_x0 = [self.pose.x, self.pose.y, self.pose.theta];
        let self_result = self.run_pass(&map, &local_hits, &self_x0, coarse_opts);

        let (seed, coarse_cost) = if best_result.cost < self_result.cost {
            (best_result.x.clone(), best_result.cost)
        } else {
            (self_result.x.clone(), self_result.cost)
        };

        let refined = self.run_pass(&map, &local_hits, &seed, fine_opts);

        debug!(
            cost = refined.cost,
            coarse_cost,
            iterations = refined.iterations,
            converged = refined.converged,
            "scan match finished"
        );

        if refined.x.iter().all(|v| v.is_finite()) {
            self.pose = Pose {
                x: refined.x[0],
                y: refined.x[1],
                theta: refined.x[2],
            };
        } else {
            warn!("scan match produced a non-finite pose, keeping previous estimate");
        }

        Ok(self.pose)
    }

    fn run_pass(
        &self,
        map: &SplineMap,
        local_hits: &[Point2<f64>],
        x0: &[f64; 3],
        opts: NllsOptions,
    ) -> NllsResult {
        let cost = ScanCost::new(map, local_hits);
        let lmax = self.config.logodd_max_occupied;
        nlls::solve(
            |q| cost.residual(q, lmax),
            |q| cost.jacobian(q, lmax),
            x0,
            opts,
        )
    }

    fn local_hits(&self, ranges: &[f32]) -> Vec<Point2<f64>> {
        ranges
            .iter()
            .zip(&self.angles)
            .filter_map(|(&r, &angle)| {
                let r = r as f64;
                if r >= self.config.range_min as f64 && r < self.config.range_max as f64 {
                    Some(Point2::new(r * angle.cos(), r * angle.sin()))
                } else {
                    None
                }
            })
            .collect()
    }
}

fn arange(start: f64, stop: f64, step: f64) -> Vec<f64> {
    let mut values = Vec::new();
    let mut x = start;
    while x < stop {
        values.push(x);
        x += step;
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use spline_map::SplineMapConfig;
    use std::f64::consts::PI;

    fn build_map_with_wall() -> Arc<RwLock<SplineMap>> {
        let config = SplineMapConfig::default();
        let mut map = SplineMap::new(config);
        let ranges = vec![1.0_f32; 360];
        map.update(Pose::default(), &ranges).unwrap();
        Arc::new(RwLock::new(map))
    }

    /// Ranges seen by a robot at the center of an axis-aligned rectangular
    /// room (half-extents `hx`, `hy`), heading `robot_theta`, on `n` bearings
    /// evenly spaced around the full circle. A non-square rectangle means a
    /// 90-degree yaw error yields a genuinely different scan, not just a
    /// different label on the same one.
    fn rectangular_room_ranges(n: usize, hx: f64, hy: f64, robot_theta: f64) -> Vec<f32> {
        (0..n)
            .map(|i| {
                let angle = robot_theta + i as f64 * 2.0 * PI / n as f64;
                let (s, c) = angle.sin_cos();
                let tx = if c.abs() > 1e-9 { hx / c.abs() } else { f64::INFINITY };
                let ty = if s.abs() > 1e-9 { hy / s.abs() } else { f64::INFINITY };
                tx.min(ty) as f32
            })
            .collect()
    }

    #[test]
    fn s2_recovers_identity_pose() {
        let map = build_map_with_wall();
        let mut localizer = SplineLocalizer::new(map, SplineLocalizerConfig::default());

        let ranges = vec![1.0_f32; 360];
        let pose = localizer
            .update(&ranges, Some(Pose::default()), false)
            .unwrap();

        assert!(pose.x.abs() < 0.01, "x={}", pose.x);
        assert!(pose.y.abs() < 0.01, "y={}", pose.y);
        assert!(pose.theta.abs() < (0.5_f64).to_radians(), "theta={}", pose.theta);
    }

    #[test]
    fn s3_recovers_small_translation() {
        let config = SplineMapConfig::default();
        let mut map = SplineMap::new(config);
        let ranges = vec![1.0_f32; 360];
        // Wall observed from pose (0.2, 0, 0): the wall sits at world x=1.2.
        map.update(Pose { x: 0.2, y: 0.0, theta: 0.0 }, &ranges).unwrap();
        let map = Arc::new(RwLock::new(map));

        let mut localizer = SplineLocalizer::new(map, SplineLocalizerConfig::default());
        let pose = localizer
            .update(&ranges, Some(Pose::default()), false)
            .unwrap();

        assert!((pose.x - 0.2).abs() < 0.02, "x={}", pose.x);
    }

    #[test]
    fn s4_yaw_ambiguity_escape() {
        // A non-square rectangular room so a 90-degree yaw error is a
        // genuinely distinguishable (not merely relabeled) scan.
        let config = SplineMapConfig::default();
        let mut map = SplineMap::new(config);
        let true_theta = PI / 2.0;
        let ranges = rectangular_room_ranges(360, 1.5, 1.0, true_theta);
        map.update(Pose { x: 0.0, y: 0.0, theta: true_theta }, &ranges)
            .unwrap();
        let map = Arc::new(RwLock::new(map));

        let mut localizer = SplineLocalizer::new(map, SplineLocalizerConfig::default());
        // Hint claims heading 0 (odometry drifted by a quarter turn);
        // unreliable_odometry=true should let the PI/2 yaw candidate win.
        let pose = localizer
            .update(&ranges, Some(Pose::default()), true)
            .unwrap();

        let mut dtheta = (pose.theta - true_theta).rem_euclid(2.0 * PI);
        if dtheta > PI {
            dtheta -= 2.0 * PI;
        }
        assert!(
            dtheta.abs() < 2.0_f64.to_radians(),
            "theta={} true={}",
            pose.theta,
            true_theta
        );
    }

    #[test]
    fn invalid_scan_length_is_rejected() {
        let map = build_map_with_wall();
        let mut localizer = SplineLocalizer::new(map, SplineLocalizerConfig::default());
        let err = localizer.update(&[1.0; 10], None, false).unwrap_err();
        assert!(matches!(err, SplineLocalizerError::InvalidScan { .. }));
    }
}
