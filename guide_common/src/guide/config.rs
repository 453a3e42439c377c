//! Mount, guider and backlash configuration.
//!
//! All config types deserialize from TOML. Numeric parameters are bounded by
//! `MIN`/`MAX` constants and checked by `validate()`. Optional fields use
//! `#[serde(default)]`.

use serde::{Deserialize, Serialize};

use crate::consts::{
    BL_MAX_CLEARING_TIME_MS, DEFAULT_CALIBRATION_DISTANCE_PX, DEFAULT_CALIBRATION_DURATION_MS,
    DEFAULT_MAX_DEC_DURATION_MS, DEFAULT_MAX_RA_DURATION_MS, MAX_COMP_AMOUNT, MAX_DURATION_MAX,
    MAX_DURATION_MIN,
};
use crate::guide::direction::DecGuideMode;

/// Calibration pulse bounds [ms].
pub const CALIBRATION_DURATION_MIN: u32 = 10;
pub const CALIBRATION_DURATION_MAX: u32 = 10_000;

/// Calibration travel bounds [px].
pub const CALIBRATION_DISTANCE_MIN: f64 = 5.0;
pub const CALIBRATION_DISTANCE_MAX: f64 = 200.0;

/// Tracking box half-size bounds [px].
pub const MAX_MOVE_PIXELS_MIN: f64 = 2.0;
pub const MAX_MOVE_PIXELS_MAX: f64 = 500.0;

// ─── Mount ──────────────────────────────────────────────────────────

/// Per-mount guiding configuration.
///
/// # TOML Example
///
/// ```toml
/// [mount]
/// class_name = "scope"
/// calibration_duration_ms = 750
/// dec_guide_mode = "auto"
///
/// [mount.backlash]
/// enabled = true
/// pulse_ms = 300
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Profile key prefix (`/<class_name>/...`).
    #[serde(default = "default_class_name")]
    pub class_name: String,

    /// Calibration pulse [ms] (default: 750).
    #[serde(default = "default_calibration_duration")]
    pub calibration_duration_ms: u32,

    /// Travel that completes a calibration leg [px] (default: 25).
    #[serde(default = "default_calibration_distance")]
    pub calibration_distance_px: f64,

    /// RA guide pulse ceiling [ms] (default: 2500).
    #[serde(default = "default_max_ra_duration")]
    pub max_ra_duration_ms: u32,

    /// Dec guide pulse ceiling [ms] (default: 2500).
    #[serde(default = "default_max_dec_duration")]
    pub max_dec_duration_ms: u32,

    #[serde(default)]
    pub dec_guide_mode: DecGuideMode,

    /// Force the Dec angle perpendicular to RA.
    #[serde(default)]
    pub assume_orthogonal: bool,

    /// Scale the RA rate with cos(declination).
    #[serde(default = "default_true")]
    pub use_dec_compensation: bool,

    /// Meridian flip also reverses the Dec axis angle.
    #[serde(default)]
    pub calibration_flip_requires_dec_flip: bool,

    /// Recenter calibration legs with the largest safe pulses.
    #[serde(default = "default_true")]
    pub fast_recenter: bool,

    /// Time budget for North backlash clearing [ms] (default: 10000).
    #[serde(default = "default_max_clearing_time")]
    pub max_clearing_time_ms: u32,

    #[serde(default)]
    pub backlash: BacklashConfig,
}

fn default_class_name() -> String {
    "scope".to_string()
}
fn default_calibration_duration() -> u32 {
    DEFAULT_CALIBRATION_DURATION_MS
}
fn default_calibration_distance() -> f64 {
    DEFAULT_CALIBRATION_DISTANCE_PX
}
fn default_max_ra_duration() -> u32 {
    DEFAULT_MAX_RA_DURATION_MS
}
fn default_max_dec_duration() -> u32 {
    DEFAULT_MAX_DEC_DURATION_MS
}
fn default_max_clearing_time() -> u32 {
    BL_MAX_CLEARING_TIME_MS
}
fn default_true() -> bool {
    true
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            class_name: default_class_name(),
            calibration_duration_ms: DEFAULT_CALIBRATION_DURATION_MS,
            calibration_distance_px: DEFAULT_CALIBRATION_DISTANCE_PX,
            max_ra_duration_ms: DEFAULT_MAX_RA_DURATION_MS,
            max_dec_duration_ms: DEFAULT_MAX_DEC_DURATION_MS,
            dec_guide_mode: DecGuideMode::Auto,
            assume_orthogonal: false,
            use_dec_compensation: true,
            calibration_flip_requires_dec_flip: false,
            fast_recenter: true,
            max_clearing_time_ms: BL_MAX_CLEARING_TIME_MS,
            backlash: BacklashConfig::default(),
        }
    }
}

impl MountConfig {
    /// Validate parameter bounds.
    pub fn validate(&self) -> Result<(), String> {
        if self.class_name.is_empty() || self.class_name.contains('/') {
            return Err(format!("class_name '{}' is not a valid key", self.class_name));
        }
        if self.calibration_duration_ms < CALIBRATION_DURATION_MIN
            || self.calibration_duration_ms > CALIBRATION_DURATION_MAX
        {
            return Err(format!(
                "calibration_duration_ms {} out of range [{}, {}]",
                self.calibration_duration_ms, CALIBRATION_DURATION_MIN, CALIBRATION_DURATION_MAX
            ));
        }
        if !(CALIBRATION_DISTANCE_MIN..=CALIBRATION_DISTANCE_MAX)
            .contains(&self.calibration_distance_px)
        {
            return Err(format!(
                "calibration_distance_px {} out of range [{}, {}]",
                self.calibration_distance_px, CALIBRATION_DISTANCE_MIN, CALIBRATION_DISTANCE_MAX
            ));
        }
        for (name, value) in [
            ("max_ra_duration_ms", self.max_ra_duration_ms),
            ("max_dec_duration_ms", self.max_dec_duration_ms),
        ] {
            if !(MAX_DURATION_MIN..=MAX_DURATION_MAX).contains(&value) {
                return Err(format!(
                    "{name} {value} out of range [{MAX_DURATION_MIN}, {MAX_DURATION_MAX}]"
                ));
            }
        }
        if self.max_clearing_time_ms < self.calibration_duration_ms {
            return Err(format!(
                "max_clearing_time_ms {} shorter than one calibration pulse",
                self.max_clearing_time_ms
            ));
        }
        self.backlash.validate()
    }
}

// ─── Backlash ───────────────────────────────────────────────────────

/// Initial Dec backlash compensation settings.
///
/// Values persisted in the profile store take precedence once present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacklashConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Compensation pulse [ms], 0 = none.
    #[serde(default)]
    pub pulse_ms: u32,
    /// Adaptive floor [ms], 0 = derive.
    #[serde(default)]
    pub floor_ms: u32,
    /// Adaptive ceiling [ms], 0 = derive.
    #[serde(default)]
    pub ceiling_ms: u32,
}

impl BacklashConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("pulse_ms", self.pulse_ms),
            ("floor_ms", self.floor_ms),
            ("ceiling_ms", self.ceiling_ms),
        ] {
            if value > MAX_COMP_AMOUNT {
                return Err(format!("backlash.{name} {value} exceeds {MAX_COMP_AMOUNT}"));
            }
        }
        Ok(())
    }
}

// ─── Guider ─────────────────────────────────────────────────────────

/// Camera and tracking-box geometry the core needs from the guider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuiderConfig {
    /// Largest star displacement tracked between frames [px] (default: 20).
    #[serde(default = "default_max_move_pixels")]
    pub max_move_pixels: f64,

    /// Image scale [arc-sec/px] (default: 1.0).
    #[serde(default = "default_pixel_scale")]
    pub pixel_scale_arcsec: f64,

    #[serde(default = "default_binning")]
    pub binning: u16,

    #[serde(default)]
    pub focal_length_mm: f64,

    /// Sensor size [px].
    #[serde(default = "default_frame_width")]
    pub frame_width: u32,
    #[serde(default = "default_frame_height")]
    pub frame_height: u32,
}

fn default_max_move_pixels() -> f64 {
    20.0
}
fn default_pixel_scale() -> f64 {
    1.0
}
fn default_binning() -> u16 {
    1
}
fn default_frame_width() -> u32 {
    1280
}
fn default_frame_height() -> u32 {
    960
}

impl Default for GuiderConfig {
    fn default() -> Self {
        Self {
            max_move_pixels: default_max_move_pixels(),
            pixel_scale_arcsec: default_pixel_scale(),
            binning: default_binning(),
            focal_length_mm: 0.0,
            frame_width: default_frame_width(),
            frame_height: default_frame_height(),
        }
    }
}

impl GuiderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(MAX_MOVE_PIXELS_MIN..=MAX_MOVE_PIXELS_MAX).contains(&self.max_move_pixels) {
            return Err(format!(
                "max_move_pixels {} out of range [{}, {}]",
                self.max_move_pixels, MAX_MOVE_PIXELS_MIN, MAX_MOVE_PIXELS_MAX
            ));
        }
        if !(self.pixel_scale_arcsec > 0.0) {
            return Err(format!(
                "pixel_scale_arcsec {} must be positive",
                self.pixel_scale_arcsec
            ));
        }
        if self.binning == 0 {
            return Err("binning must be at least 1".to_string());
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err("frame size must be non-zero".to_string());
        }
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
