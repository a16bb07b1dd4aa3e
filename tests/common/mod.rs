//! Shared builders for synthetic multi-echo series.

use std::f64::consts::TAU;

use ndarray::Array3;
use unwarp::volume::{Affine, Volume};

/// Wrap an angle into [-pi, pi] the way a scanner phase image would.
pub fn wrap(angle: f64) -> f64 {
    angle.sin().atan2(angle.cos())
}

/// Phase and magnitude series encoding the given per-voxel field (Hz).
pub fn series_from_field(
    field_hz: &Array3<f64>,
    echo_times: &[f64],
    affine: Affine,
) -> (Vec<Volume>, Vec<Volume>) {
    let phase: Vec<Volume> = echo_times
        .iter()
        .map(|&te| {
            let wrapped = field_hz.mapv(|hz| wrap(TAU * hz * te));
            Volume::from_3d(wrapped, affine)
        })
        .collect();
    let magnitude: Vec<Volume> = echo_times
        .iter()
        .map(|_| Volume::from_3d(Array3::ones(field_hz.dim()), affine))
        .collect();
    (phase, magnitude)
}
