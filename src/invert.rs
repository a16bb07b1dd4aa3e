//! Displacement field inversion.
//!
//! The forward distortion model is self-referential: the correction that
//! undoes a displacement `d` must be evaluated at the distorted location,
//! so `c` has to satisfy `c(x + d(x)) = -d(x)`. There is no closed form
//! for general smooth fields; instead the correction is found by
//! fixed-point iteration, seeded with the naive negation `c0 = -d` and
//! refined with `c_{n+1}(x) = -d(x + c_n(x))`, sampling `d` at fractional
//! coordinates by linear interpolation along the encoding axis.

use ndarray::Array3;

use crate::displacement::DisplacementField;
use crate::enums::PhaseEncodingDirection;
use crate::error::CorrectionError;

/// Tuning knobs for the fixed-point solve.
#[derive(Clone, Copy, Debug)]
pub struct InversionOptions {
    /// Convergence threshold on the max absolute iterate change, in voxels.
    pub tolerance: f64,
    /// Hard cap on fixed-point iterations.
    pub max_iterations: usize,
    /// Also compute the per-voxel Jacobian determinant `1 + dc/dx` along
    /// the encoding axis, for intensity-preserving resampling.
    pub compute_jacobian: bool,
}

impl Default for InversionOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-3,
            max_iterations: 50,
            compute_jacobian: false,
        }
    }
}

/// Outcome of one frame's fixed-point solve.
///
/// Non-convergence is not fatal; the best available iterate is still
/// returned and `converged` is false.
#[derive(Clone, Debug)]
pub struct InversionReport {
    pub converged: bool,
    pub iterations: usize,
    /// Max absolute iterate change at the last iteration, in voxels.
    pub residual: f64,
    /// Max absolute iterate change per iteration, in voxels.
    pub residual_history: Vec<f64>,
}

/// Correction field plus solve diagnostics.
#[derive(Clone, Debug)]
pub struct Inversion {
    pub correction: DisplacementField,
    pub report: InversionReport,
    pub jacobian: Option<Array3<f64>>,
}

/// Invert a forward displacement field along `direction`.
///
/// Returns a correction field `c` (mm, same axis) such that for every
/// voxel `x`, `x + d(x) + c(x + d(x))` is `x` to within the tolerance,
/// where all quantities are taken along the encoding axis.
pub fn invert_displacement_field(
    field: &DisplacementField,
    direction: PhaseEncodingDirection,
    options: &InversionOptions,
) -> Result<Inversion, CorrectionError> {
    if field.direction.axis != direction.axis {
        return Err(CorrectionError::InvalidParameter(format!(
            "displacement field is defined along axis {} but inversion \
             was requested along axis {}",
            field.direction.axis, direction.axis
        )));
    }

    let axis = field.direction.axis.index();
    let inv_voxel = 1.0 / field.voxel_size;

    // Work in voxel units so the tolerance is grid-relative.
    let d = field.data.mapv(|mm| mm * inv_voxel);
    let mut c = d.mapv(|v| -v);
    let mut next = Array3::zeros(d.dim());

    let mut converged = false;
    let mut iterations = 0;
    let mut residual = 0.0;
    let mut residual_history = Vec::with_capacity(options.max_iterations);

    for _ in 0..options.max_iterations {
        let mut max_delta: f64 = 0.0;
        for ((i, j, k), out) in next.indexed_iter_mut() {
            let index = [i, j, k];
            let current = c[index];
            let pos = index[axis] as f64 + current;
            let updated = -sample_along_axis(&d, index, axis, pos);
            max_delta = max_delta.max((updated - current).abs());
            *out = updated;
        }
        std::mem::swap(&mut c, &mut next);

        iterations += 1;
        residual = max_delta;
        residual_history.push(max_delta);
        if max_delta < options.tolerance {
            converged = true;
            break;
        }
    }

    let jacobian = if options.compute_jacobian {
        Some(jacobian_along_axis(&c, axis))
    } else {
        None
    };

    let correction = DisplacementField {
        data: c.mapv(|v| v * field.voxel_size),
        direction: field.direction,
        voxel_size: field.voxel_size,
    };

    Ok(Inversion {
        correction,
        report: InversionReport {
            converged,
            iterations,
            residual,
            residual_history,
        },
        jacobian,
    })
}

/// Sample `d` at a fractional coordinate `pos` along `axis`, holding the
/// other two indices of `index` fixed. Coordinates outside the grid clamp
/// to the nearest voxel (nearest-neighbor extension at the boundary).
fn sample_along_axis(d: &Array3<f64>, mut index: [usize; 3], axis: usize, pos: f64) -> f64 {
    let len = d.shape()[axis];
    let pos = pos.clamp(0.0, (len - 1) as f64);
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(len - 1);
    let frac = pos - lo as f64;

    index[axis] = lo;
    let v0 = d[index];
    index[axis] = hi;
    let v1 = d[index];
    v0 + (v1 - v0) * frac
}

/// Jacobian determinant of the corrected mapping along one axis:
/// `1 + dc/dx` by central differences, one-sided at the edges. Input and
/// output are in voxel units.
fn jacobian_along_axis(c: &Array3<f64>, axis: usize) -> Array3<f64> {
    let len = c.shape()[axis];
    let mut jacobian = Array3::zeros(c.dim());
    for ((i, j, k), out) in jacobian.indexed_iter_mut() {
        let index = [i, j, k];
        let pos = index[axis];
        let (lo, hi) = (pos.saturating_sub(1), (pos + 1).min(len - 1));
        let mut a = index;
        a[axis] = lo;
        let mut b = index;
        b[axis] = hi;
        let span = (hi - lo).max(1) as f64;
        *out = 1.0 + (c[b] - c[a]) / span;
    }
    jacobian
}
