//! Backlash measurement outcome.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Validity of a backlash measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MeasurementResult {
    /// Estimate is usable as a compensation seed.
    #[default]
    Valid,
    /// Too few North samples, or backlash large against total North travel.
    TooFewNorth,
    /// Never saw two consecutive qualifying South moves.
    TooFewSouth,
    /// Estimate implies an implausible negative rate product.
    Sanity,
    /// North clearing never completed.
    BacklashNotCleared,
}

impl fmt::Display for MeasurementResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Valid => "measurement valid",
            Self::TooFewNorth => "too few north moves",
            Self::TooFewSouth => "too few south moves",
            Self::Sanity => "failed sanity check",
            Self::BacklashNotCleared => "backlash not cleared",
        })
    }
}
