//! Multi-echo field map estimation.
//!
//! Per voxel, the phase samples across echoes are unwrapped temporally
//! (each successive difference is wrapped into (-pi, pi]) and a
//! magnitude-weighted least-squares line of phase against echo time is
//! fitted. The slope divided by 2*pi is the local field offset in Hz.
//!
//! Voxels with no magnitude signal, or with degenerate weighted spread in
//! echo time, are assigned 0 Hz so the estimate stays deterministic and
//! magnitude-weighted as the pipeline requires.

use std::f64::consts::PI;

use ndarray::{Array3, Array4, ArrayView3, Axis};
use rayon::prelude::*;

use crate::error::CorrectionError;
use crate::volume::Volume;

const TWO_PI: f64 = 2.0 * PI;

/// Wrap an angle into (-pi, pi].
#[inline]
fn wrap_to_pi(angle: f64) -> f64 {
    let mut a = angle % TWO_PI;
    if a > PI {
        a -= TWO_PI;
    } else if a <= -PI {
        a += TWO_PI;
    }
    a
}

/// Estimate one field map frame per retained temporal frame.
///
/// `phase` and `magnitude` must already be sorted ascending by echo time
/// and share geometry; `echo_times` are in seconds. The returned volume
/// reuses the input affine.
pub fn estimate_field_maps(
    phase: &[Volume],
    magnitude: &[Volume],
    echo_times: &[f64],
    frame_limit: Option<usize>,
) -> Result<Volume, CorrectionError> {
    if phase.len() != magnitude.len() || phase.len() != echo_times.len() {
        return Err(CorrectionError::InvalidParameter(format!(
            "phase, magnitude and echo time counts differ ({}, {}, {})",
            phase.len(),
            magnitude.len(),
            echo_times.len()
        )));
    }
    if phase.len() < 2 {
        return Err(CorrectionError::InvalidParameter(
            "field map estimation needs at least two echoes".into(),
        ));
    }

    let first = &phase[0];
    let (nx, ny, nz) = first.spatial_shape();
    let nt = phase
        .iter()
        .chain(magnitude.iter())
        .map(Volume::num_frames)
        .min()
        .unwrap_or(0);
    let nt = match frame_limit {
        Some(0) => {
            return Err(CorrectionError::InvalidParameter(
                "frame limit must be positive".into(),
            ));
        }
        Some(limit) => nt.min(limit),
        None => nt,
    };

    let frames: Vec<Array3<f64>> = (0..nt)
        .into_par_iter()
        .map(|t| {
            let phase_frames: Vec<ArrayView3<'_, f64>> =
                phase.iter().map(|v| v.frame(t)).collect();
            let mag_frames: Vec<ArrayView3<'_, f64>> =
                magnitude.iter().map(|v| v.frame(t)).collect();
            estimate_frame(&phase_frames, &mag_frames, echo_times)
        })
        .collect();

    let mut data = Array4::zeros((nx, ny, nz, nt));
    for (t, frame) in frames.iter().enumerate() {
        data.index_axis_mut(Axis(3), t).assign(frame);
    }
    Ok(Volume::new(data, *first.affine()))
}

/// Field map for a single temporal frame, in Hz.
pub(crate) fn estimate_frame(
    phase: &[ArrayView3<'_, f64>],
    magnitude: &[ArrayView3<'_, f64>],
    echo_times: &[f64],
) -> Array3<f64> {
    let n_echoes = echo_times.len();
    let dim = phase[0].dim();
    let mut field = Array3::zeros(dim);
    let mut unwrapped = vec![0.0; n_echoes];

    for ((i, j, k), out) in field.indexed_iter_mut() {
        unwrapped[0] = phase[0][[i, j, k]];
        for e in 1..n_echoes {
            let delta = wrap_to_pi(phase[e][[i, j, k]] - phase[e - 1][[i, j, k]]);
            unwrapped[e] = unwrapped[e - 1] + delta;
        }

        let mut weight_sum = 0.0;
        let mut te_mean = 0.0;
        let mut ph_mean = 0.0;
        for e in 0..n_echoes {
            let w = magnitude[e][[i, j, k]].max(0.0);
            weight_sum += w;
            te_mean += w * echo_times[e];
            ph_mean += w * unwrapped[e];
        }
        if weight_sum <= 0.0 {
            continue;
        }
        te_mean /= weight_sum;
        ph_mean /= weight_sum;

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for e in 0..n_echoes {
            let w = magnitude[e][[i, j, k]].max(0.0);
            let dt = echo_times[e] - te_mean;
            numerator += w * dt * (unwrapped[e] - ph_mean);
            denominator += w * dt * dt;
        }
        if denominator > f64::EPSILON {
            *out = numerator / denominator / TWO_PI;
        }
    }

    field
}
