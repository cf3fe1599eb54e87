//! Cubic tensor-product B-spline basis over a uniform 2D knot grid.
//!
//! Every world point is supported by exactly 16 control points (a 4x4
//! tensor product of the 1D cubic B-spline's 4-wide support). This module
//! computes those 16 basis weights, their spatial derivatives, and the
//! flat control-grid indices they land on, without ever allocating.

/// Degree of the B-spline along each axis.
pub const DEGREE: usize = 3;
/// Number of control points supporting a point along one axis.
pub const AXIS_SUPPORT: usize = DEGREE + 1;
/// Number of control points supporting a point in 2D (4x4 tensor product).
pub const TENSOR_SUPPORT: usize = AXIS_SUPPORT * AXIS_SUPPORT;

/// Grid cell count along one axis for a given metric extent.
pub fn axis_grid_size(extent: f64, knot_space: f64) -> usize {
    (extent / knot_space).ceil() as usize + DEGREE
}

/// Origin index along one axis: `ceil((G - degree) / 2) + degree - 1`.
///
/// Both `spline_map` and `spline_localizer` must derive grid coordinates
/// through this exact formula; it fixes where world `(0,0)` lands in grid
/// index space and the fractional knot offset depends on it.
pub fn axis_origin(axis_size: usize) -> i32 {
    let reduced = axis_size as i64 - DEGREE as i64;
    let half = (reduced as f64 / 2.0).ceil() as i64;
    (half + DEGREE as i64 - 1) as i32
}

struct AxisBasis {
    indices: [i32; AXIS_SUPPORT],
    values: [f64; AXIS_SUPPORT],
    derivatives: [f64; AXIS_SUPPORT],
}

fn axis_basis(tau: f64, knot_space: f64, origin: i32) -> AxisBasis {
    let mu = (-(-tau / knot_space).ceil()) as i32 + origin;
    let t = (tau / knot_space + origin as f64).rem_euclid(1.0);

    let t3 = t + 3.0;
    let t2 = t + 2.0;
    let t1 = t + 1.0;

    let values = [
        (-t3.powi(3) + 12.0 * t3.powi(2) - 48.0 * t3 + 64.0) / 6.0,
        (3.0 * t2.powi(3) - 24.0 * t2.powi(2) + 60.0 * t2 - 44.0) / 6.0,
        (-3.0 * t1.powi(3) + 12.0 * t1.powi(2) - 12.0 * t1 + 4.0) / 6.0,
        t.powi(3) / 6.0,
    ];

    let inv_knot = 1.0 / knot_space;
    let derivatives = [
        (-3.0 * t3.powi(2) + 24.0 * t3 - 48.0) / 6.0 * inv_knot,
        (9.0 * t2.powi(2) - 48.0 * t2 + 60.0) / 6.0 * inv_knot,
        (-9.0 * t1.powi(2) + 24.0 * t1 - 12.0) / 6.0 * inv_knot,
        3.0 * t.powi(2) / 6.0 * inv_knot,
    ];

    AxisBasis {
        indices: [mu - 3, mu - 2, mu - 1, mu],
        values,
        derivatives,
    }
}

fn clamp_axis(idx: i32, size: usize) -> usize {
    idx.clamp(0, size as i32 - 1) as usize
}

/// The 16-point sparse tensor basis (and its spatial derivatives) and flat
/// control indices supporting one world point.
pub struct SparseTensor {
    pub indices: [usize; TENSOR_SUPPORT],
    pub basis: [f64; TENSOR_SUPPORT],
    pub dbasis_dx: [f64; TENSOR_SUPPORT],
    pub dbasis_dy: [f64; TENSOR_SUPPORT],
}

/// Compute the sparse tensor basis for world point `(x, y)`.
///
/// `grid_size` bounds the flat index: an axis index outside `[0, size)`
/// is clamped rather than panicking (see `SplineMapError::OutOfGrid`) —
/// the caller is responsible for sizing the grid to its operating area.
pub fn sparse_tensor(
    x: f64,
    y: f64,
    knot_space: f64,
    origin: (i32, i32),
    grid_size: (usize, usize),
) -> SparseTensor {
    let bx = axis_basis(x, knot_space, origin.0);
    let by = axis_basis(y, knot_space, origin.1);

    let mut indices = [0usize; TENSOR_SUPPORT];
    let mut basis = [0.0; TENSOR_SUPPORT];
    let mut dbasis_dx = [0.0; TENSOR_SUPPORT];
    let mut dbasis_dy = [0.0; TENSOR_SUPPORT];

    for i in 0..AXIS_SUPPORT {
        let cy = clamp_axis(by.indices[i], grid_size.1);
        for j in 0..AXIS_SUPPORT {
            let cx = clamp_axis(bx.indices[j], grid_size.0);
            let k = i * AXIS_SUPPORT + j;
            indices[k] = cy * grid_size.0 + cx;
            basis[k] = by.values[i] * bx.values[j];
            dbasis_dx[k] = by.values[i] * bx.derivatives[j];
            dbasis_dy[k] = by.derivatives[i] * bx.values[j];
        }
    }

    SparseTensor {
        indices,
        basis,
        dbasis_dx,
        dbasis_dy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn partition_of_unity() {
        let grid_size = (200, 200);
        let origin = (100, 100);
        for &(x, y) in &[(0.0, 0.0), (1.234, -2.5), (4.999, 4.999), (-3.0, 3.3)] {
            let t = sparse_tensor(x, y, 0.05, origin, grid_size);
            let sum: f64 = t.basis.iter().sum();
            assert_relative_eq!(sum, 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn basis_nonnegative_in_span() {
        let grid_size = (200, 200);
        let origin = (100, 100);
        let t = sparse_tensor(0.123, -0.456, 0.05, origin, grid_size);
        for &b in &t.basis {
            assert!(b >= -1e-12);
        }
    }

    #[test]
    fn axis_origin_matches_reference_formula() {
        // grid_size 203 for a 10m map at 0.05 knot spacing (ceil(10/0.05) + 3)
        assert_eq!(axis_grid_size(10.0, 0.05), 203);
        assert_eq!(axis_origin(203), 102);
    }
}
