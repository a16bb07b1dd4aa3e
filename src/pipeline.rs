//! End-to-end correction pipeline.
//!
//! Sequences geometry validation, field map estimation, displacement map
//! construction and displacement inversion, and packages the results as
//! labeled volumes sharing the input geometry. Temporal frames are
//! independent and are processed on the rayon pool, each frame's chain
//! owned by one worker, joined into pre-allocated index-addressed output
//! arrays.

use log::{debug, warn};
use ndarray::{Array3, Array4, Axis};
use rayon::prelude::*;

use crate::displacement::field_map_to_displacement;
use crate::enums::PhaseEncodingDirection;
use crate::error::CorrectionError;
use crate::fieldmap;
use crate::invert::{InversionOptions, InversionReport, invert_displacement_field};
use crate::volume::{Volume, validate_geometry};

/// Options for one correction run.
#[derive(Clone, Copy, Debug, Default)]
pub struct CorrectionOptions {
    /// Restrict a 4D series to its first K temporal frames.
    pub frame_limit: Option<usize>,
    pub inversion: InversionOptions,
}

/// Field map, correction map and per-frame solve diagnostics.
#[derive(Debug)]
pub struct CorrectionResult {
    /// Field inhomogeneity in Hz, one frame per retained input frame.
    pub field_map: Volume,
    /// Correction displacement in mm along the encoding axis.
    pub correction_map: Volume,
    /// Jacobian determinant along the encoding axis, if requested.
    pub jacobian_map: Option<Volume>,
    /// One report per frame, in frame order.
    pub reports: Vec<InversionReport>,
}

impl CorrectionResult {
    /// Frame indices whose inversion stopped at the iteration cap.
    pub fn non_converged_frames(&self) -> Vec<usize> {
        self.reports
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.converged)
            .map(|(t, _)| t)
            .collect()
    }
}

struct FrameOutput {
    field: Array3<f64>,
    correction: Array3<f64>,
    jacobian: Option<Array3<f64>>,
    report: InversionReport,
}

/// Estimate field maps from a multi-echo series and derive the correction
/// maps that undo the resulting geometric distortion.
///
/// `echo_times` are in seconds and need not be sorted; volumes are
/// permuted in lockstep with their echo time. `effective_echo_spacing` is
/// in seconds. All validation happens before any numerical work; any
/// component failure propagates unchanged. Per-frame non-convergence of
/// the inversion is reported, not raised.
pub fn estimate_and_correct(
    phase: &[Volume],
    magnitude: &[Volume],
    echo_times: &[f64],
    effective_echo_spacing: f64,
    direction: PhaseEncodingDirection,
    options: &CorrectionOptions,
) -> Result<CorrectionResult, CorrectionError> {
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
            "at least two echoes are required".into(),
        ));
    }
    if echo_times.iter().any(|te| !te.is_finite()) {
        return Err(CorrectionError::InvalidParameter(
            "echo times must be finite".into(),
        ));
    }
    if !effective_echo_spacing.is_finite() || effective_echo_spacing <= 0.0 {
        return Err(CorrectionError::InvalidParameter(format!(
            "effective echo spacing must be positive, got {effective_echo_spacing}"
        )));
    }
    if options.frame_limit == Some(0) {
        return Err(CorrectionError::InvalidParameter(
            "frame limit must be positive".into(),
        ));
    }

    let combined: Vec<&Volume> = phase.iter().chain(magnitude.iter()).collect();
    validate_geometry(&combined)?;

    let nt_input = phase[0].num_frames();
    if combined.iter().any(|v| v.num_frames() != nt_input) {
        return Err(CorrectionError::InvalidParameter(
            "echo volumes disagree on frame count".into(),
        ));
    }

    // Sort the series ascending by echo time, volumes in lockstep.
    let mut order: Vec<usize> = (0..echo_times.len()).collect();
    order.sort_by(|&a, &b| echo_times[a].total_cmp(&echo_times[b]));
    let sorted_tes: Vec<f64> = order.iter().map(|&e| echo_times[e]).collect();
    if sorted_tes.windows(2).any(|w| w[0] == w[1]) {
        return Err(CorrectionError::InvalidParameter(
            "echo times must be strictly distinct".into(),
        ));
    }
    let sorted_phase: Vec<&Volume> = order.iter().map(|&e| &phase[e]).collect();
    let sorted_mag: Vec<&Volume> = order.iter().map(|&e| &magnitude[e]).collect();

    let (nx, ny, nz) = phase[0].spatial_shape();
    let nt = options
        .frame_limit
        .map_or(nt_input, |limit| nt_input.min(limit));
    let voxel_size = phase[0].voxel_size(direction.axis);
    debug!(
        "correcting {nt} frame(s) of {nx}x{ny}x{nz} along {direction} \
         (echo spacing {effective_echo_spacing} s, voxel {voxel_size} mm)"
    );

    let frames: Result<Vec<FrameOutput>, CorrectionError> = (0..nt)
        .into_par_iter()
        .map(|t| {
            let phase_frames: Vec<_> = sorted_phase.iter().map(|v| v.frame(t)).collect();
            let mag_frames: Vec<_> = sorted_mag.iter().map(|v| v.frame(t)).collect();
            let field = fieldmap::estimate_frame(&phase_frames, &mag_frames, &sorted_tes);

            let displacement = field_map_to_displacement(
                field.view(),
                effective_echo_spacing,
                direction,
                voxel_size,
            )?;
            let inversion =
                invert_displacement_field(&displacement, direction, &options.inversion)?;

            Ok(FrameOutput {
                field,
                correction: inversion.correction.data,
                jacobian: inversion.jacobian,
                report: inversion.report,
            })
        })
        .collect();
    let frames = frames?;

    let mut field_map = Array4::zeros((nx, ny, nz, nt));
    let mut correction_map = Array4::zeros((nx, ny, nz, nt));
    let mut jacobian_map = options
        .inversion
        .compute_jacobian
        .then(|| Array4::zeros((nx, ny, nz, nt)));
    let mut reports = Vec::with_capacity(nt);

    for (t, frame) in frames.into_iter().enumerate() {
        field_map.index_axis_mut(Axis(3), t).assign(&frame.field);
        correction_map
            .index_axis_mut(Axis(3), t)
            .assign(&frame.correction);
        if let (Some(map), Some(jacobian)) = (jacobian_map.as_mut(), frame.jacobian.as_ref()) {
            map.index_axis_mut(Axis(3), t).assign(jacobian);
        }
        if !frame.report.converged {
            warn!(
                "frame {t}: displacement inversion stopped after {} iterations \
                 with residual {:.2e} voxels above tolerance {:.2e}",
                frame.report.iterations, frame.report.residual, options.inversion.tolerance
            );
        }
        reports.push(frame.report);
    }

    let affine = *phase[0].affine();
    Ok(CorrectionResult {
        field_map: Volume::new(field_map, affine),
        correction_map: Volume::new(correction_map, affine),
        jacobian_map: jacobian_map.map(|data| Volume::new(data, affine)),
        reports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Affine;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;
    use std::f64::consts::TAU;

    fn direction(token: &str) -> PhaseEncodingDirection {
        token.parse().unwrap()
    }

    /// Phase/magnitude series that encode a spatially constant field.
    fn constant_series(
        field_hz: f64,
        echo_times: &[f64],
        dim: (usize, usize, usize),
        affine: Affine,
    ) -> (Vec<Volume>, Vec<Volume>) {
        let phase = echo_times
            .iter()
            .map(|&te| {
                let raw = TAU * field_hz * te;
                let wrapped = raw.sin().atan2(raw.cos());
                Volume::from_3d(Array3::from_elem(dim, wrapped), affine)
            })
            .collect();
        let magnitude = echo_times
            .iter()
            .map(|_| Volume::from_3d(Array3::ones(dim), affine))
            .collect();
        (phase, magnitude)
    }

    #[test]
    fn constant_ten_hz_end_to_end() {
        // 10 Hz * 0.0005 s * 2 mm => 0.01 mm forward, -0.01 mm correction
        let affine = Affine::scaled(2.0, 2.0, 2.0);
        let echo_times = [0.005, 0.010, 0.015];
        let (phase, magnitude) = constant_series(10.0, &echo_times, (32, 32, 32), affine);

        let result = estimate_and_correct(
            &phase,
            &magnitude,
            &echo_times,
            0.0005,
            direction("j"),
            &CorrectionOptions::default(),
        )
        .unwrap();

        assert_abs_diff_eq!(result.field_map.frame(0)[[16, 16, 16]], 10.0, epsilon = 1e-6);
        assert_abs_diff_eq!(
            result.correction_map.frame(0)[[16, 16, 16]],
            -0.01,
            epsilon = 1e-8
        );
        assert!(result.reports[0].converged);
        assert_eq!(result.reports[0].iterations, 1);
        assert!(result.non_converged_frames().is_empty());
    }

    #[test]
    fn unsorted_echo_times_are_permuted_in_lockstep() {
        let affine = Affine::identity();
        let echo_times = [0.015, 0.005, 0.010];
        let (phase, magnitude) = constant_series(10.0, &echo_times, (4, 4, 4), affine);
        let result = estimate_and_correct(
            &phase,
            &magnitude,
            &echo_times,
            0.0005,
            direction("j"),
            &CorrectionOptions::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(result.field_map.frame(0)[[1, 1, 1]], 10.0, epsilon = 1e-6);
    }

    #[test]
    fn series_length_mismatch_is_rejected() {
        let affine = Affine::identity();
        let echo_times = [0.005, 0.010];
        let (phase, mut magnitude) = constant_series(5.0, &echo_times, (4, 4, 4), affine);
        magnitude.pop();
        assert!(matches!(
            estimate_and_correct(
                &phase,
                &magnitude,
                &echo_times,
                0.0005,
                direction("j"),
                &CorrectionOptions::default(),
            ),
            Err(CorrectionError::InvalidParameter(_))
        ));
    }

    #[test]
    fn duplicate_echo_times_are_rejected() {
        let affine = Affine::identity();
        let echo_times = [0.005, 0.005];
        let (phase, magnitude) = constant_series(5.0, &echo_times, (4, 4, 4), affine);
        assert!(matches!(
            estimate_and_correct(
                &phase,
                &magnitude,
                &echo_times,
                0.0005,
                direction("j"),
                &CorrectionOptions::default(),
            ),
            Err(CorrectionError::InvalidParameter(_))
        ));
    }

    #[test]
    fn geometry_mismatch_fails_before_computation() {
        let echo_times = [0.005, 0.010];
        let (phase, mut magnitude) =
            constant_series(5.0, &echo_times, (4, 4, 4), Affine::identity());
        let mut shifted = Affine::identity();
        shifted.0[0][3] = 3.0;
        magnitude[1] = Volume::from_3d(Array3::ones((4, 4, 4)), shifted);
        assert!(matches!(
            estimate_and_correct(
                &phase,
                &magnitude,
                &echo_times,
                0.0005,
                direction("j"),
                &CorrectionOptions::default(),
            ),
            Err(CorrectionError::GeometryMismatch { .. })
        ));
    }

    #[test]
    fn zero_frame_limit_is_rejected() {
        let echo_times = [0.005, 0.010];
        let (phase, magnitude) =
            constant_series(5.0, &echo_times, (4, 4, 4), Affine::identity());
        let options = CorrectionOptions {
            frame_limit: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            estimate_and_correct(
                &phase,
                &magnitude,
                &echo_times,
                0.0005,
                direction("j"),
                &options,
            ),
            Err(CorrectionError::InvalidParameter(_))
        ));
    }

    #[test]
    fn polarity_flip_negates_correction() {
        let affine = Affine::scaled(2.0, 2.0, 2.0);
        let echo_times = [0.005, 0.010];
        let (phase, magnitude) = constant_series(10.0, &echo_times, (8, 8, 8), affine);
        let forward = estimate_and_correct(
            &phase,
            &magnitude,
            &echo_times,
            0.0005,
            direction("j"),
            &CorrectionOptions::default(),
        )
        .unwrap();
        let reverse = estimate_and_correct(
            &phase,
            &magnitude,
            &echo_times,
            0.0005,
            direction("j-"),
            &CorrectionOptions::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(
            forward.correction_map.frame(0)[[4, 4, 4]],
            -reverse.correction_map.frame(0)[[4, 4, 4]],
            epsilon = 1e-10
        );
    }

    #[test]
    fn jacobian_volume_is_emitted_on_request() {
        let echo_times = [0.005, 0.010];
        let (phase, magnitude) =
            constant_series(10.0, &echo_times, (4, 4, 4), Affine::identity());
        let options = CorrectionOptions {
            inversion: InversionOptions {
                compute_jacobian: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let result = estimate_and_correct(
            &phase,
            &magnitude,
            &echo_times,
            0.0005,
            direction("j"),
            &options,
        )
        .unwrap();
        let jacobian = result.jacobian_map.unwrap();
        assert_abs_diff_eq!(jacobian.frame(0)[[2, 2, 2]], 1.0, epsilon = 1e-9);
    }
}
