//! Error taxonomy of the guiding core.
//!
//! Calibration and measurement failures end the whole run; move failures
//! during normal guiding are reported per step and guiding continues.

use thiserror::Error;

use crate::guide::direction::GuideAxis;
use crate::guide::measurement::MeasurementResult;
use crate::store::StoreError;

/// Why an axis pulse was not executed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoveFailure {
    /// Transport or driver error.
    #[error("guide pulse failed: {0}")]
    Failed(String),

    /// Mount is slewing; pulses are refused.
    #[error("mount is slewing")]
    Slewing,

    /// Adaptive-optics travel limit reached.
    #[error("AO limit reached")]
    AoLimitReached,
}

impl MoveFailure {
    /// Slewing and AO-limit abort the rest of a guide step.
    #[inline]
    pub const fn stops_step(&self) -> bool {
        matches!(self, Self::Slewing | Self::AoLimitReached)
    }
}

/// Errors raised by the guiding core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GuideError {
    /// Offset vector is not finite.
    #[error("invalid vector")]
    InvalidVector,

    /// A calibration leg did not move the star enough.
    #[error("{axis} calibration failed: {reason}")]
    CalibrationFailed { axis: GuideAxis, reason: String },

    /// North backlash clearing did not complete.
    #[error("backlash clearing failed: star did not move enough")]
    BacklashNotCleared,

    /// Backlash measurement produced no usable result.
    #[error("backlash measurement invalid: {kind}")]
    MeasurementInvalid { kind: MeasurementResult },

    /// The mount refused or failed a pulse.
    #[error("move error: {cause}")]
    MoveError { cause: MoveFailure },

    #[error("mount not connected")]
    NotConnected,

    #[error("mount not calibrated")]
    NotCalibrated,

    /// Non-manual move while guiding output is disabled.
    #[error("guiding disabled")]
    GuidingDisabled,

    /// The profile store rejected a calibration write.
    #[error("profile store: {0}")]
    Persist(#[from] StoreError),
}

impl From<MoveFailure> for GuideError {
    fn from(cause: MoveFailure) -> Self {
        Self::MoveError { cause }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let e = GuideError::CalibrationFailed {
            axis: GuideAxis::Ra,
            reason: "star did not move enough".into(),
        };
        assert_eq!(e.to_string(), "RA calibration failed: star did not move enough");

        let e: GuideError = MoveFailure::Slewing.into();
        assert_eq!(e.to_string(), "move error: mount is slewing");

        let e = GuideError::MeasurementInvalid {
            kind: MeasurementResult::TooFewSouth,
        };
        assert!(e.to_string().contains("too few south"));

        let e: GuideError = StoreError::Io("disk full".into()).into();
        assert_eq!(e.to_string(), "profile store: store I/O error: disk full");
    }

    #[test]
    fn step_stopping_failures() {
        assert!(MoveFailure::Slewing.stops_step());
        assert!(MoveFailure::AoLimitReached.stops_step());
        assert!(!MoveFailure::Failed("io".into()).stops_step());
    }
}
