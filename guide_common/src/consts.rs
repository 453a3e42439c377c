//! Workspace-wide constants for the guiding core.
//!
//! Single source of truth for pulse limits, calibration thresholds and the
//! empirical backlash tuning values. The tuning values have no derivation
//! beyond field experience and are kept exactly as measured.

use static_assertions::const_assert;

// ─── Pulse Durations ────────────────────────────────────────────────

/// Default calibration pulse [ms].
pub const DEFAULT_CALIBRATION_DURATION_MS: u32 = 750;

/// Default calibration travel before a leg is considered done [px].
pub const DEFAULT_CALIBRATION_DISTANCE_PX: f64 = 25.0;

/// Default RA max guide pulse [ms].
pub const DEFAULT_MAX_RA_DURATION_MS: u32 = 2500;

/// Default Dec max guide pulse [ms].
pub const DEFAULT_MAX_DEC_DURATION_MS: u32 = 2500;

/// Lower bound of the configurable max pulse [ms].
pub const MAX_DURATION_MIN: u32 = 50;

/// Upper bound of the configurable max pulse [ms].
pub const MAX_DURATION_MAX: u32 = 8000;

// ─── Calibration ────────────────────────────────────────────────────

/// Step ceiling for the West and North legs.
pub const MAX_CALIBRATION_STEPS: u32 = 60;

/// Fewer steps than this on either leg raises a sanity advisory.
pub const CAL_ALERT_MIN_STEPS: u32 = 4;

/// Allowed deviation of the RA/Dec angle from 90° [deg].
pub const CAL_ALERT_ORTHOGONALITY_TOLERANCE_DEG: f64 = 12.5;

/// Allowed Dec rate change against the previous calibration (ratio).
pub const CAL_ALERT_DECRATE_DIFFERENCE: f64 = 0.20;

/// Allowed RA/Dec rate ratio error against the cos(dec) model.
pub const CAL_ALERT_AXISRATES_TOLERANCE: f64 = 0.20;

/// Accepted clearing moves before Dec calibration may start.
pub const BL_BACKLASH_MIN_COUNT: u32 = 3;

/// Default time budget for North backlash clearing [ms].
pub const BL_MAX_CLEARING_TIME_MS: u32 = 10_000;

/// Minimum clearing attempts regardless of pulse length.
pub const BL_MIN_CLEARING_PULSES: u32 = 8;

/// Clearing travel that lets calibration proceed after exhausting attempts [px].
pub const BL_MIN_CLEARING_DISTANCE_PX: f64 = 3.0;

/// Scale applied to `xRate * duration` for the expected clearing step.
pub const BL_EXPECTED_STEP_SCALE: f64 = 0.6;

/// Extra South pulses used to return near the calibration start.
pub const MAX_NUDGES: u32 = 3;

/// Nudging stops inside this distance of the start [px].
pub const NUDGE_TOLERANCE_PX: f64 = 2.0;

/// Allowed deviation of the nudge vector from reversed North [deg].
pub const NUDGE_DIRECTION_TOLERANCE_DEG: f64 = 40.0;

/// East leg shorter than this share of the West leg is suspicious.
pub const EAST_ALERT_DISTANCE_RATIO: f64 = 0.25;

/// East leg direction error that is suspicious [deg].
pub const EAST_ALERT_ANGLE_DEG: f64 = 30.0;

/// Dec compensation only applies below this calibration declination [rad] (60°).
pub const DEC_COMP_LIMIT: f64 = std::f64::consts::PI / 3.0;

/// Declination clamp used when compensating the RA rate [deg].
pub const DEC_COMP_MAX_DECLINATION_DEG: f64 = 89.0;

/// Guide speed assumed when the mount does not report one [×sidereal].
pub const DEFAULT_MOUNT_GUIDE_SPEED: f64 = 0.5;

/// One arc-second of RA in hours.
pub const ONE_ARCSEC_HOURS: f64 = 24.0 / (360.0 * 60.0 * 60.0);

/// One arc-second of Dec in degrees.
pub const ONE_ARCSEC_DEGREES: f64 = 1.0 / (60.0 * 60.0);

// ─── Guiding ────────────────────────────────────────────────────────

/// Consecutive clamps in one direction before a limit advisory.
pub const LIMIT_REACHED_WARN_COUNT: u32 = 5;

/// Minimum spacing of limit advisories [ms].
pub const LIMIT_REACHED_ALERT_INTERVAL_MS: u64 = 30_000;

// ─── Backlash Compensation ──────────────────────────────────────────

/// Smallest usable compensation pulse [ms].
pub const MIN_COMP_AMOUNT: u32 = 20;

/// Largest usable compensation pulse [ms].
pub const MAX_COMP_AMOUNT: u32 = 8000;

/// BLC events retained for adaptive tuning.
pub const BLC_HISTORY_DEPTH: usize = 10;

/// Deflections per event: trigger plus two follow-ups.
pub const BLC_ENTRY_CAPACITY: usize = 3;

/// Pulse change that invalidates the learned history [ms].
pub const BLC_HISTORY_RESET_DELTA: u32 = 100;

/// Upper bound of a single increase (factor of the current pulse).
pub const BLC_MAX_INCREASE_FACTOR: f64 = 1.1;

/// Lower bound of a single decrease (factor of the current pulse).
pub const BLC_MAX_DECREASE_FACTOR: f64 = 0.8;

/// Default ceiling when none is given (factor of the pulse).
pub const BLC_DEFAULT_CEILING_FACTOR: f64 = 1.5;

/// Average initial miss at or below this signals over-correction [px].
pub const BLC_OVERSHOOT_AVG_MISS: f64 = -0.1;

// ─── Backlash Measurement ───────────────────────────────────────────

/// Accepted moves that end North clearing.
pub const BACKLASH_MIN_COUNT: u32 = 3;

/// Per-step Dec travel expected while clearing [px].
pub const BACKLASH_EXPECTED_DISTANCE_PX: f64 = 4.0;

/// Cumulative clearing travel that exempts from the accepted-move rule [px].
pub const BACKLASH_EXEMPTION_DISTANCE_PX: f64 = 40.0;

/// Hard cap on North clearing pulses.
pub const MAX_CLEARING_STEPS: u32 = 100;

/// Minimum North measurement pulse [ms].
pub const NORTH_PULSE_SIZE_MS: u32 = 500;

/// Minimum total North measurement time [ms].
pub const MAX_NORTH_PULSES_MS: u32 = 8000;

/// Residual tolerance after the trial correction [arc-sec].
pub const TRIAL_TOLERANCE_ARCSEC: f64 = 2.0;

/// Restore pulses issued at most after a measurement.
pub const MAX_RESTORE_PULSES: u32 = 10;

// ─── Sentinels ──────────────────────────────────────────────────────

/// Stored value meaning "declination not known".
pub const UNKNOWN_DECLINATION: f64 = 997.0;

/// Dec rate stored when Dec was not calibrated.
pub const RATE_UNCALIBRATED: f64 = 123e4;

const_assert!(MIN_COMP_AMOUNT < MAX_COMP_AMOUNT);
const_assert!(MAX_DURATION_MIN < MAX_DURATION_MAX);
const_assert!(BLC_ENTRY_CAPACITY == 3);
const_assert!(BLC_HISTORY_DEPTH >= 5);
const_assert!(DEFAULT_MAX_RA_DURATION_MS <= MAX_DURATION_MAX);
const_assert!(DEFAULT_MAX_DEC_DURATION_MS <= MAX_DURATION_MAX);
