//! Post-calibration sanity checks.
//!
//! Checks run in order of confidence and only the first match is reported:
//!
//! | Order | Issue       | Condition                                                 |
//! |-------|-------------|-----------------------------------------------------------|
//! | 1     | `Steps`     | RA steps < 4, or 0 < Dec steps < 4                        |
//! | 2     | `Angle`     | Axes deviate from 90° by more than 12.5°                  |
//! | 3     | `Rates`     | `xRate·speedRatio/yRate` vs `cos(dec)` off by > 0.20      |
//! | 4     | `Different` | Dec rate changed > 20% with same image scale and RA angle |
//!
//! The rate check is skipped for unknown declination, declination above 60°,
//! uncalibrated Dec or disabled Dec compensation.

use guide_common::consts::{
    CAL_ALERT_AXISRATES_TOLERANCE, CAL_ALERT_DECRATE_DIFFERENCE, CAL_ALERT_MIN_STEPS,
    CAL_ALERT_ORTHOGONALITY_TOLERANCE_DEG, DEC_COMP_LIMIT,
};
use guide_common::guide::calibration::{Calibration, CalibrationDetails, CalibrationIssue};

/// Image scale difference still considered the same setup [arc-sec/px].
const SAME_IMAGE_SCALE: f64 = 0.1;
/// RA angle difference still considered the same setup [deg].
const SAME_RA_ANGLE_DEG: f64 = 5.0;

/// First sanity issue found, with a human readable detail line.
#[derive(Debug, Clone, PartialEq)]
pub struct SanityReport {
    pub issue: CalibrationIssue,
    pub detail: String,
}

impl SanityReport {
    fn passed() -> Self {
        Self {
            issue: CalibrationIssue::None,
            detail: String::new(),
        }
    }

    #[inline]
    pub fn is_clean(&self) -> bool {
        self.issue == CalibrationIssue::None
    }
}

/// Check a new calibration against the previous one.
///
/// `previous` is the last stored calibration (if any) and `previous_details`
/// its details.
pub fn check(
    new_cal: &Calibration,
    new_details: &CalibrationDetails,
    previous: Option<&Calibration>,
    previous_details: &CalibrationDetails,
    dec_compensation: bool,
) -> SanityReport {
    let x_steps = new_details.ra_step_count;
    let y_steps = new_details.dec_step_count;

    if x_steps < CAL_ALERT_MIN_STEPS || (y_steps > 0 && y_steps < CAL_ALERT_MIN_STEPS) {
        return SanityReport {
            issue: CalibrationIssue::Steps,
            detail: format!("Actual RA calibration steps = {x_steps}, Dec calibration steps = {y_steps}"),
        };
    }

    let non_ortho = new_cal.ortho_error_degrees();
    if non_ortho > CAL_ALERT_ORTHOGONALITY_TOLERANCE_DEG {
        return SanityReport {
            issue: CalibrationIssue::Angle,
            detail: format!("Non-orthogonality = {non_ortho:.3}"),
        };
    }

    if let Some(dec) = new_cal.declination {
        if new_cal.has_dec_calibration() && dec.abs() <= DEC_COMP_LIMIT && dec_compensation {
            let expected = dec.cos();
            let speed_ratio = match (new_details.ra_guide_speed, new_details.dec_guide_speed) {
                (Some(ra), Some(dec_speed)) if ra > 0.0 => dec_speed / ra,
                _ => 1.0,
            };
            let actual = new_cal.x_rate * speed_ratio / new_cal.y_rate;
            if (expected - actual).abs() > CAL_ALERT_AXISRATES_TOLERANCE {
                return SanityReport {
                    issue: CalibrationIssue::Rates,
                    detail: format!(
                        "Expected ratio at dec={:.1} is {expected:.3}, actual is {actual:.3}",
                        dec.to_degrees()
                    ),
                };
            }
        }
    }

    if let Some(old) = previous.filter(|old| old.is_valid) {
        let same_setup = (previous_details.image_scale - new_details.image_scale).abs() < SAME_IMAGE_SCALE
            && (old.x_angle - new_cal.x_angle).to_degrees().abs() < SAME_RA_ANGLE_DEG;
        if same_setup
            && new_cal.has_dec_calibration()
            && old.has_dec_calibration()
            && new_cal.y_rate != 0.0
        {
            let ratio = old.y_rate / new_cal.y_rate;
            if (1.0 - ratio).abs() > CAL_ALERT_DECRATE_DIFFERENCE {
                return SanityReport {
                    issue: CalibrationIssue::Different,
                    detail: format!("Current/previous Dec rate ratio is {ratio:.3}"),
                };
            }
        }
    }

    SanityReport::passed()
}

// ─── Tests ──────────────────────────────────────────────────────────
