use ndarray::{Array3, Array4, ArrayView3, Axis, s};

use crate::enums::EncodingAxis;
use crate::error::CorrectionError;

/// Element-wise tolerance when comparing affines across an echo series.
pub const AFFINE_TOLERANCE: f64 = 1e-5;

/// Voxel-to-physical-space transform (4x4, row major).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Affine(pub [[f64; 4]; 4]);

impl Affine {
    pub fn identity() -> Self {
        Self::scaled(1.0, 1.0, 1.0)
    }

    /// Axis-aligned affine with the given voxel sizes and zero origin.
    pub fn scaled(vx: f64, vy: f64, vz: f64) -> Self {
        Affine([
            [vx, 0.0, 0.0, 0.0],
            [0.0, vy, 0.0, 0.0],
            [0.0, 0.0, vz, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// Element-wise comparison within `tolerance`.
    pub fn approx_eq(&self, other: &Affine, tolerance: f64) -> bool {
        self.0
            .iter()
            .flatten()
            .zip(other.0.iter().flatten())
            .all(|(a, b)| (a - b).abs() <= tolerance)
    }

    /// Physical extent (mm) of one voxel along the given grid axis,
    /// taken as the norm of the corresponding affine column.
    pub fn voxel_size(&self, axis: EncodingAxis) -> f64 {
        let a = axis.index();
        let col = [self.0[0][a], self.0[1][a], self.0[2][a]];
        (col[0] * col[0] + col[1] * col[1] + col[2] * col[2]).sqrt()
    }
}

/// A labeled volume: real-valued samples on a voxel grid plus the affine
/// mapping grid indices to physical space.
///
/// Data is always stored 4D as `(nx, ny, nz, nt)`; 3D inputs are promoted
/// to a single temporal frame at construction.
#[derive(Clone, Debug)]
pub struct Volume {
    data: Array4<f64>,
    affine: Affine,
}

impl Volume {
    pub fn new(data: Array4<f64>, affine: Affine) -> Self {
        Self { data, affine }
    }

    /// Promote a 3D array to a single-frame volume.
    pub fn from_3d(data: Array3<f64>, affine: Affine) -> Self {
        Self {
            data: data.insert_axis(Axis(3)),
            affine,
        }
    }

    pub fn data(&self) -> &Array4<f64> {
        &self.data
    }

    pub fn affine(&self) -> &Affine {
        &self.affine
    }

    /// Shape of the first three (spatial) dimensions.
    pub fn spatial_shape(&self) -> (usize, usize, usize) {
        let (nx, ny, nz, _) = self.data.dim();
        (nx, ny, nz)
    }

    pub fn num_frames(&self) -> usize {
        self.data.dim().3
    }

    /// View of one temporal frame.
    pub fn frame(&self, t: usize) -> ArrayView3<'_, f64> {
        self.data.index_axis(Axis(3), t)
    }

    /// Voxel extent (mm) along the given grid axis.
    pub fn voxel_size(&self, axis: EncodingAxis) -> f64 {
        self.affine.voxel_size(axis)
    }

    /// Keep only the first `keep` temporal frames.
    pub fn truncate_frames(&mut self, keep: usize) {
        let nt = self.num_frames();
        if keep < nt {
            self.data = self.data.slice(s![.., .., .., ..keep]).to_owned();
        }
    }
}

/// Check that every pair of volumes shares an affine (within
/// [`AFFINE_TOLERANCE`]) and a spatial shape.
///
/// Pairwise O(n²) over the echo count, which is small in practice.
pub fn validate_geometry(volumes: &[&Volume]) -> Result<(), CorrectionError> {
    for (first, a) in volumes.iter().enumerate() {
        for (offset, b) in volumes[first + 1..].iter().enumerate() {
            let second = first + 1 + offset;
            if !a.affine.approx_eq(&b.affine, AFFINE_TOLERANCE) {
                return Err(CorrectionError::GeometryMismatch {
                    first,
                    second,
                    detail: "affine transforms differ".into(),
                });
            }
            if a.spatial_shape() != b.spatial_shape() {
                return Err(CorrectionError::GeometryMismatch {
                    first,
                    second,
                    detail: format!(
                        "spatial shapes differ ({:?} vs {:?})",
                        a.spatial_shape(),
                        b.spatial_shape()
                    ),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn volume(affine: Affine) -> Volume {
        Volume::from_3d(Array3::zeros((4, 4, 4)), affine)
    }

    #[test]
    fn identical_geometry_passes() {
        let a = volume(Affine::scaled(2.0, 2.0, 2.0));
        let b = volume(Affine::scaled(2.0, 2.0, 2.0));
        assert!(validate_geometry(&[&a, &b]).is_ok());
    }

    #[test]
    fn translation_mismatch_is_rejected() {
        let a = volume(Affine::identity());
        let mut shifted = Affine::identity();
        shifted.0[1][3] = 1.5;
        let b = volume(shifted);
        match validate_geometry(&[&a, &b]) {
            Err(CorrectionError::GeometryMismatch { first, second, .. }) => {
                assert_eq!((first, second), (0, 1));
            }
            other => panic!("expected geometry mismatch, got {other:?}"),
        }
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let a = volume(Affine::identity());
        let b = Volume::from_3d(Array3::zeros((4, 5, 4)), Affine::identity());
        assert!(matches!(
            validate_geometry(&[&a, &b]),
            Err(CorrectionError::GeometryMismatch { .. })
        ));
    }

    #[test]
    fn voxel_size_uses_column_norm() {
        // 2mm voxels along j with a 45 degree in-plane rotation
        let c = std::f64::consts::FRAC_1_SQRT_2 * 2.0;
        let affine = Affine([
            [c, -c, 0.0, 0.0],
            [c, c, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]);
        assert!((affine.voxel_size(crate::enums::EncodingAxis::J) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn truncate_frames_keeps_prefix() {
        let data = Array4::from_shape_fn((2, 2, 2, 5), |(_, _, _, t)| t as f64);
        let mut v = Volume::new(data, Affine::identity());
        v.truncate_frames(3);
        assert_eq!(v.num_frames(), 3);
        assert_eq!(v.frame(2)[[0, 0, 0]], 2.0);
    }
}
