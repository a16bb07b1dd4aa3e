use std::fmt;
use std::str::FromStr;

use crate::error::CorrectionError;

/// Spatial axis of the voxel grid along which phase encoding was performed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodingAxis {
    I,
    J,
    K,
}

impl EncodingAxis {
    /// Array axis index (0, 1 or 2) this encoding axis selects.
    pub fn index(self) -> usize {
        match self {
            EncodingAxis::I => 0,
            EncodingAxis::J => 1,
            EncodingAxis::K => 2,
        }
    }
}

impl fmt::Display for EncodingAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingAxis::I => write!(f, "i"),
            EncodingAxis::J => write!(f, "j"),
            EncodingAxis::K => write!(f, "k"),
        }
    }
}

/// Readout direction along the encoding axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    pub fn sign(self) -> f64 {
        match self {
            Polarity::Positive => 1.0,
            Polarity::Negative => -1.0,
        }
    }
}

/// Phase encoding axis and polarity, e.g. `j` or `j-`.
///
/// Parsed from the BIDS `PhaseEncodingDirection` tokens
/// (`i`, `j`, `k` or `x`, `y`, `z`, each with an optional trailing `-`).
/// Internally the six tokens are a closed pair of enums; strings only
/// exist at this parsing boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhaseEncodingDirection {
    pub axis: EncodingAxis,
    pub polarity: Polarity,
}

impl PhaseEncodingDirection {
    pub fn new(axis: EncodingAxis, polarity: Polarity) -> Self {
        Self { axis, polarity }
    }

    /// Same axis, opposite polarity.
    pub fn reversed(self) -> Self {
        let polarity = match self.polarity {
            Polarity::Positive => Polarity::Negative,
            Polarity::Negative => Polarity::Positive,
        };
        Self { polarity, ..self }
    }
}

impl FromStr for PhaseEncodingDirection {
    type Err = CorrectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (axis_token, polarity) = match s.strip_suffix('-') {
            Some(rest) => (rest, Polarity::Negative),
            None => (s, Polarity::Positive),
        };
        let axis = match axis_token {
            "i" | "x" => EncodingAxis::I,
            "j" | "y" => EncodingAxis::J,
            "k" | "z" => EncodingAxis::K,
            _ => {
                return Err(CorrectionError::InvalidParameter(format!(
                    "unrecognized phase encoding direction '{s}' \
                     (expected i, j, k, x, y or z with optional trailing '-')"
                )));
            }
        };
        Ok(Self { axis, polarity })
    }
}

impl fmt::Display for PhaseEncodingDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.polarity {
            Polarity::Positive => write!(f, "{}", self.axis),
            Polarity::Negative => write!(f, "{}-", self.axis),
        }
    }
}
