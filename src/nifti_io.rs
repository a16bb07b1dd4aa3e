//! NIfTI reading and writing of labeled volumes.
//!
//! Reads 3D or 4D `.nii`/`.nii.gz` files into [`Volume`]s, preferring the
//! header's sform for the affine and falling back to the pixdim scaling,
//! and writes result volumes back with the shared input affine.

use std::path::Path;

use ndarray::{Axis, Ix3, Ix4};
use nifti::volume::ndarray::IntoNdArray;
use nifti::writer::WriterOptions;
use nifti::{NiftiHeader, NiftiObject, ReaderOptions};
use thiserror::Error;

use crate::volume::{Affine, Volume};

#[derive(Debug, Error)]
pub enum VolumeIoError {
    #[error("failed to read '{path}': {source}")]
    Read {
        path: String,
        source: nifti::NiftiError,
    },

    #[error("failed to write '{path}': {source}")]
    Write {
        path: String,
        source: nifti::NiftiError,
    },

    #[error("'{path}' is {ndim}D, expected a 3D or 4D volume")]
    UnsupportedDimensionality { path: String, ndim: usize },
}

/// Read a 3D or 4D NIfTI file into a volume; 3D data becomes one frame.
pub fn read_volume(path: &Path) -> Result<Volume, VolumeIoError> {
    let read_err = |source| VolumeIoError::Read {
        path: path.display().to_string(),
        source,
    };
    let object = ReaderOptions::new().read_file(path).map_err(read_err)?;
    let affine = affine_from_header(object.header());
    let array = object.into_volume().into_ndarray::<f64>().map_err(read_err)?;

    let ndim = array.ndim();
    match ndim {
        3 => {
            let data = array
                .into_dimensionality::<Ix3>()
                .map_err(|_| VolumeIoError::UnsupportedDimensionality {
                    path: path.display().to_string(),
                    ndim,
                })?;
            Ok(Volume::from_3d(data, affine))
        }
        4 => {
            let data = array
                .into_dimensionality::<Ix4>()
                .map_err(|_| VolumeIoError::UnsupportedDimensionality {
                    path: path.display().to_string(),
                    ndim,
                })?;
            Ok(Volume::new(data, affine))
        }
        _ => Err(VolumeIoError::UnsupportedDimensionality {
            path: path.display().to_string(),
            ndim,
        }),
    }
}

/// Write a volume as `.nii` or `.nii.gz` (chosen by extension).
/// Single-frame volumes are written 3D.
pub fn write_volume(path: &Path, volume: &Volume) -> Result<(), VolumeIoError> {
    let header = header_for(volume);
    let options = WriterOptions::new(path).reference_header(&header);
    let result = if volume.num_frames() == 1 {
        options.write_nifti(&volume.data().index_axis(Axis(3), 0))
    } else {
        options.write_nifti(volume.data())
    };
    result.map_err(|source| VolumeIoError::Write {
        path: path.display().to_string(),
        source,
    })
}

/// Affine from the header: sform when set, pixdim scaling otherwise.
fn affine_from_header(header: &NiftiHeader) -> Affine {
    if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        let mut affine = [[0.0; 4]; 4];
        for (r, row) in rows.iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                affine[r][c] = v as f64;
            }
        }
        affine[3] = [0.0, 0.0, 0.0, 1.0];
        Affine(affine)
    } else {
        Affine::scaled(
            header.pixdim[1] as f64,
            header.pixdim[2] as f64,
            header.pixdim[3] as f64,
        )
    }
}

fn header_for(volume: &Volume) -> NiftiHeader {
    let a = volume.affine().0;
    let mut pixdim = [1.0f32; 8];
    pixdim[1] = volume.voxel_size(crate::enums::EncodingAxis::I) as f32;
    pixdim[2] = volume.voxel_size(crate::enums::EncodingAxis::J) as f32;
    pixdim[3] = volume.voxel_size(crate::enums::EncodingAxis::K) as f32;

    let row = |r: usize| [a[r][0] as f32, a[r][1] as f32, a[r][2] as f32, a[r][3] as f32];
    NiftiHeader {
        pixdim,
        sform_code: 1,
        srow_x: row(0),
        srow_y: row(1),
        srow_z: row(2),
        ..Default::default()
    }
}
