//! Calibration snapshot and diagnostics.
//!
//! A [`Calibration`] is produced once per successful calibration run and is
//! replaced as a whole by the next one. [`CalibrationDetails`] carries the raw
//! step vectors and the sanity-check verdict for review.

use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;
use std::fmt;

use crate::consts::RATE_UNCALIBRATED;
use crate::geometry::{Point, norm_angle};
use crate::guide::direction::{GuideParity, PierSide};

// ─── Calibration ────────────────────────────────────────────────────

/// Geometric and rate relationship between camera pixels and mount axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Camera angle of the RA axis [rad], normalized to (-π, π].
    pub x_angle: f64,
    /// Camera angle of the Dec axis [rad], normalized to (-π, π].
    pub y_angle: f64,
    /// RA rate [px/ms].
    pub x_rate: f64,
    /// Dec rate [px/ms], or [`RATE_UNCALIBRATED`].
    pub y_rate: f64,
    /// Camera binning at calibration time.
    pub binning: u16,
    /// Declination at calibration time [rad], `None` when unknown.
    pub declination: Option<f64>,
    pub pier_side: PierSide,
    pub ra_guide_parity: GuideParity,
    pub dec_guide_parity: GuideParity,
    /// Rotator position at calibration time [deg], `None` when no rotator.
    pub rotator_angle: Option<f64>,
    /// Calibration time [ms since epoch].
    pub timestamp: Option<u64>,
    pub is_valid: bool,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            x_angle: 0.0,
            y_angle: 0.0,
            x_rate: 1.0,
            y_rate: 1.0,
            binning: 1,
            declination: None,
            pier_side: PierSide::Unknown,
            ra_guide_parity: GuideParity::Unknown,
            dec_guide_parity: GuideParity::Unknown,
            rotator_angle: None,
            timestamp: None,
            is_valid: false,
        }
    }
}

impl Calibration {
    /// True when the Dec leg was measured.
    #[inline]
    pub fn has_dec_calibration(&self) -> bool {
        self.y_rate != RATE_UNCALIBRATED
    }

    /// Angle of the Dec axis relative to the RA axis, offset by π/2.
    ///
    /// 0 or π for orthogonal axes, depending on Dec handedness.
    #[inline]
    pub fn y_angle_error(&self) -> f64 {
        norm_angle(self.x_angle - self.y_angle + FRAC_PI_2)
    }

    /// Orthogonality error [deg], 0 for perfectly perpendicular axes.
    pub fn ortho_error_degrees(&self) -> f64 {
        (norm_angle(self.x_angle - self.y_angle).abs() - FRAC_PI_2)
            .abs()
            .to_degrees()
    }
}

// ─── Sanity Issues ──────────────────────────────────────────────────

/// Outcome of the post-calibration sanity check, in order of precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CalibrationIssue {
    #[default]
    None,
    /// Too few steps on either leg.
    Steps,
    /// RA/Dec axes far from perpendicular.
    Angle,
    /// Dec rate changed a lot against the previous calibration.
    Different,
    /// RA/Dec rate ratio disagrees with cos(declination).
    Rates,
}

impl CalibrationIssue {
    /// Stable name used by the profile store.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Steps => "steps",
            Self::Angle => "angle",
            Self::Different => "different",
            Self::Rates => "rates",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "steps" => Self::Steps,
            "angle" => Self::Angle,
            "different" => Self::Different,
            "rates" => Self::Rates,
            _ => Self::None,
        }
    }

    /// User-facing advisory text.
    pub const fn advisory(&self) -> &'static str {
        match self {
            Self::None => "Calibration passed sanity checks",
            Self::Steps => {
                "Advisory: Calibration completed but few guide steps were used, so accuracy is questionable"
            }
            Self::Angle => {
                "Advisory: Calibration completed but RA/Dec axis angles are questionable and guiding may be impaired"
            }
            Self::Different => {
                "Advisory: This calibration is substantially different from the previous one - have you changed configurations?"
            }
            Self::Rates => {
                "Advisory: Calibration completed but RA and Dec rates vary by an unexpected amount (often caused by large Dec backlash)"
            }
        }
    }
}

impl fmt::Display for CalibrationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Details ────────────────────────────────────────────────────────

/// Diagnostic record of a calibration run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationDetails {
    pub focal_length: f64,
    /// Image scale [arc-sec/px].
    pub image_scale: f64,
    /// RA guide speed reported by the mount [deg/s], `None` when unavailable.
    pub ra_guide_speed: Option<f64>,
    /// Dec guide speed reported by the mount [deg/s], `None` when unavailable.
    pub dec_guide_speed: Option<f64>,
    /// Deviation from perpendicular axes [deg].
    pub ortho_error: f64,
    pub orig_binning: u16,
    pub orig_timestamp: Option<u64>,
    pub orig_pier_side: PierSide,
    /// Offsets from the leg start after each RA step.
    pub ra_steps: Vec<Point>,
    /// Offsets from the leg start after each Dec step.
    pub dec_steps: Vec<Point>,
    pub ra_step_count: u32,
    pub dec_step_count: u32,
    pub last_issue: CalibrationIssue,
}

// ─── Tests ──────────────────────────────────────────────────────────
