//! Conversion of field maps (Hz) into forward displacement fields (mm).

use ndarray::{Array3, ArrayView3};

use crate::enums::PhaseEncodingDirection;
use crate::error::CorrectionError;

/// Scalar displacement along a single encoding axis, in mm.
///
/// A positive value at a voxel means the true signal at that voxel was
/// observed shifted by that distance along the axis. The field carries the
/// voxel size along its axis so the inverter can move between physical and
/// grid units.
#[derive(Clone, Debug)]
pub struct DisplacementField {
    pub data: Array3<f64>,
    pub direction: PhaseEncodingDirection,
    pub voxel_size: f64,
}

/// Convert one field map frame into a forward displacement field.
///
/// Displacement in voxels is `field_hz * effective_echo_spacing_s`;
/// multiplying by the voxel extent along the encoding axis yields mm, and
/// a negative polarity flips the sign. All other axes are undistorted, so
/// the result stays a scalar field tagged with its axis.
pub fn field_map_to_displacement(
    field_map: ArrayView3<'_, f64>,
    effective_echo_spacing: f64,
    direction: PhaseEncodingDirection,
    voxel_size: f64,
) -> Result<DisplacementField, CorrectionError> {
    if !effective_echo_spacing.is_finite() || effective_echo_spacing <= 0.0 {
        return Err(CorrectionError::InvalidParameter(format!(
            "effective echo spacing must be positive, got {effective_echo_spacing}"
        )));
    }
    if !voxel_size.is_finite() || voxel_size <= 0.0 {
        return Err(CorrectionError::InvalidParameter(format!(
            "voxel size along axis {} must be positive, got {voxel_size}",
            direction.axis
        )));
    }

    let scale = effective_echo_spacing * voxel_size * direction.polarity.sign();
    let mut data = field_map.to_owned();
    data.par_mapv_inplace(|hz| hz * scale);

    Ok(DisplacementField {
        data,
        direction,
        voxel_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    fn direction(token: &str) -> PhaseEncodingDirection {
        token.parse().unwrap()
    }

    #[test]
    fn constant_field_scales_to_expected_mm() {
        // 10 Hz * 0.0005 s * 2 mm = 0.01 mm
        let field = Array3::from_elem((8, 8, 8), 10.0);
        let d =
            field_map_to_displacement(field.view(), 0.0005, direction("j"), 2.0).unwrap();
        assert_abs_diff_eq!(d.data[[3, 3, 3]], 0.01, epsilon = 1e-12);
    }

    #[test]
    fn negative_polarity_negates_everywhere() {
        let field = Array3::from_shape_fn((6, 6, 6), |(i, j, k)| (i + 2 * j + 3 * k) as f64);
        let fwd = field_map_to_displacement(field.view(), 0.0005, direction("j"), 2.0).unwrap();
        let rev =
            field_map_to_displacement(field.view(), 0.0005, direction("j-"), 2.0).unwrap();
        for (a, b) in fwd.data.iter().zip(rev.data.iter()) {
            assert_abs_diff_eq!(*a, -*b, epsilon = 1e-12);
        }
    }

    #[test]
    fn zero_field_maps_to_zero_displacement() {
        let field = Array3::zeros((4, 4, 4));
        let d = field_map_to_displacement(field.view(), 0.0005, direction("i"), 1.5).unwrap();
        assert!(d.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn non_positive_echo_spacing_is_rejected() {
        let field = Array3::zeros((2, 2, 2));
        for ees in [0.0, -0.0005, f64::NAN] {
            assert!(matches!(
                field_map_to_displacement(field.view(), ees, direction("j"), 2.0),
                Err(CorrectionError::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn non_positive_voxel_size_is_rejected() {
        let field = Array3::zeros((2, 2, 2));
        assert!(matches!(
            field_map_to_displacement(field.view(), 0.0005, direction("j"), 0.0),
            Err(CorrectionError::InvalidParameter(_))
        ));
    }
}
