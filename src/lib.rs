//! # unwarp
//!
//! Field-map based geometric distortion correction for multi-echo MRI
//! volumes.
//!
//! Magnetic-field inhomogeneity shifts signal along the phase encoding
//! axis of echo-planar acquisitions. Given phase and magnitude volumes at
//! several echo times this crate:
//!  - estimates a voxel-wise field map in Hz (temporal phase unwrapping +
//!    magnitude-weighted regression against echo time),
//!  - converts it into a displacement field in mm along the declared
//!    phase encoding axis and polarity,
//!  - inverts the displacement field by fixed-point iteration, yielding a
//!    correction map that resamples distorted data back into correct
//!    space.
//!
//! Temporal frames of 4D series are independent and are processed in
//! parallel using rayon. Inversion that does not reach tolerance within
//! the iteration cap degrades gracefully: the best iterate is returned
//! together with a per-frame [`invert::InversionReport`].
//!
//! # Examples
//!
//! ```no_run
//! use unwarp::nifti_io::read_volume;
//! use unwarp::pipeline::{CorrectionOptions, estimate_and_correct};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let phase = vec![
//!     read_volume("echo1_ph.nii.gz".as_ref())?,
//!     read_volume("echo2_ph.nii.gz".as_ref())?,
//! ];
//! let magnitude = vec![
//!     read_volume("echo1_mag.nii.gz".as_ref())?,
//!     read_volume("echo2_mag.nii.gz".as_ref())?,
//! ];
//! let result = estimate_and_correct(
//!     &phase,
//!     &magnitude,
//!     &[0.0149, 0.0390],
//!     0.0005,
//!     "j-".parse()?,
//!     &CorrectionOptions::default(),
//! )?;
//! println!("non-converged frames: {:?}", result.non_converged_frames());
//! # Ok(())
//! # }
//! ```

pub mod displacement;
pub mod enums;
pub mod error;
pub mod fieldmap;
pub mod invert;
pub mod metadata;
pub mod nifti_io;
pub mod pipeline;
pub mod volume;
