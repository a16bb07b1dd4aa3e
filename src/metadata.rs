//! BIDS-style JSON sidecar metadata.
//!
//! Each echo carries a sidecar with at least `EchoTime`; the first echo's
//! sidecar additionally supplies `TotalReadoutTime` and
//! `PhaseEncodingDirection` for the whole acquisition.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::error::CorrectionError;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to read sidecar '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse sidecar '{path}': {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },

    #[error("sidecar '{path}' is missing required field '{field}'")]
    MissingField { path: String, field: &'static str },
}

/// The sidecar fields this pipeline consumes. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SidecarMetadata {
    /// Echo time in seconds.
    pub echo_time: f64,
    /// Total readout time in seconds (first echo's sidecar).
    #[serde(default)]
    pub total_readout_time: Option<f64>,
    /// One of `i`, `j`, `k`, `x`, `y`, `z` with optional trailing `-`.
    #[serde(default)]
    pub phase_encoding_direction: Option<String>,
}

/// Load and parse one sidecar file.
pub fn load_sidecar(path: &Path) -> Result<SidecarMetadata, MetadataError> {
    let text = fs::read_to_string(path).map_err(|source| MetadataError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| MetadataError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// Per-phase-encode-line time increment, derived from the total readout
/// time and the number of phase encode lines along the encoding axis.
pub fn effective_echo_spacing(
    total_readout_time: f64,
    phase_encode_lines: usize,
) -> Result<f64, CorrectionError> {
    if phase_encode_lines < 2 {
        return Err(CorrectionError::InvalidParameter(format!(
            "need at least two phase encode lines, got {phase_encode_lines}"
        )));
    }
    if !total_readout_time.is_finite() || total_readout_time <= 0.0 {
        return Err(CorrectionError::InvalidParameter(format!(
            "total readout time must be positive, got {total_readout_time}"
        )));
    }
    Ok(total_readout_time / (phase_encode_lines - 1) as f64)
}

/// Normalize echo times to seconds.
///
/// Sidecars store seconds, but tooling sometimes hands over milliseconds.
/// MRI echo times never reach 0.5 s, so any value above that is taken to
/// be ms. Mixed units within one series are not supported.
pub fn echo_times_in_seconds(echo_times: &[f64]) -> Vec<f64> {
    let looks_like_ms = echo_times.iter().any(|&te| te > 0.5);
    if looks_like_ms {
        echo_times.iter().map(|te| te / 1000.0).collect()
    } else {
        echo_times.to_vec()
    }
}
