//! Simulator configuration.
//!
//! One TOML file describes the mount settings, the guide camera and the
//! simulated sky:
//!
//! ```toml
//! store_path = "profile.toml"
//!
//! [shared]
//! log_level = "info"
//! service_name = "guide-sim"
//!
//! [mount]
//! class_name = "SimMount"
//! calibration_duration_ms = 750
//!
//! [guider]
//! max_move_pixels = 20.0
//!
//! [sim]
//! camera_angle_deg = 30.0
//! dec_backlash_ms = 600
//! ```
//!
//! `[mount]`, `[guider]` and `[sim]` fall back to their defaults when absent.

use std::path::PathBuf;

use guide_common::config::{ConfigError, SharedConfig};
use guide_common::guide::config::{GuiderConfig, MountConfig};
use guide_common::guide::direction::PierSide;
use serde::{Deserialize, Serialize};

/// Sidereal rate [arc-sec/s].
pub const SIDEREAL_ARCSEC_PER_SEC: f64 = 15.0417;

pub const RATE_MIN: f64 = 0.05;
pub const RATE_MAX: f64 = 100.0;
pub const FRAME_MS_MIN: u64 = 100;
pub const FRAME_MS_MAX: u64 = 60_000;
pub const DEC_BACKLASH_MAX_MS: u32 = 20_000;
pub const GUIDE_SPEED_MIN: f64 = 0.1;
pub const GUIDE_SPEED_MAX: f64 = 2.0;

// ─── Sky model ──────────────────────────────────────────────────────

fn default_camera_angle() -> f64 {
    30.0
}

fn default_rate() -> f64 {
    4.0
}

fn default_guide_speed() -> f64 {
    0.5
}

fn default_declination() -> f64 {
    20.0
}

fn default_ra_hours() -> f64 {
    6.0
}

fn default_pier_side() -> PierSide {
    PierSide::East
}

fn default_true() -> bool {
    true
}

fn default_start_x() -> f64 {
    640.0
}

fn default_start_y() -> f64 {
    480.0
}

fn default_frame_ms() -> u64 {
    2000
}

/// Simulated mount and sky.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimParams {
    /// Angle of the West star motion on the camera [deg].
    #[serde(default = "default_camera_angle")]
    pub camera_angle_deg: f64,

    /// Star speed under a RA pulse at the celestial equator [px/s].
    #[serde(default = "default_rate")]
    pub ra_rate_px_per_sec: f64,

    /// Star speed under a Dec pulse [px/s].
    #[serde(default = "default_rate")]
    pub dec_rate_px_per_sec: f64,

    /// Dec pulse time lost after each Dec reversal [ms].
    #[serde(default)]
    pub dec_backlash_ms: u32,

    /// Constant RA drift, positive West [px/min].
    #[serde(default)]
    pub drift_ra_px_per_min: f64,

    /// Constant Dec drift, positive North [px/min].
    #[serde(default)]
    pub drift_dec_px_per_min: f64,

    #[serde(default = "default_true")]
    pub can_pulse_guide: bool,

    /// Mount guide speed [× sidereal].
    #[serde(default = "default_guide_speed")]
    pub guide_speed: f64,

    #[serde(default = "default_pier_side")]
    pub pier_side: PierSide,

    #[serde(default = "default_declination")]
    pub declination_deg: f64,

    #[serde(default = "default_ra_hours")]
    pub ra_hours: f64,

    /// Initial star position [camera px].
    #[serde(default = "default_start_x")]
    pub start_x: f64,

    #[serde(default = "default_start_y")]
    pub start_y: f64,

    /// Exposure cadence [ms].
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u64,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            camera_angle_deg: default_camera_angle(),
            ra_rate_px_per_sec: default_rate(),
            dec_rate_px_per_sec: default_rate(),
            dec_backlash_ms: 0,
            drift_ra_px_per_min: 0.0,
            drift_dec_px_per_min: 0.0,
            can_pulse_guide: true,
            guide_speed: default_guide_speed(),
            pier_side: default_pier_side(),
            declination_deg: default_declination(),
            ra_hours: default_ra_hours(),
            start_x: default_start_x(),
            start_y: default_start_y(),
            frame_ms: default_frame_ms(),
        }
    }
}

impl SimParams {
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("ra_rate_px_per_sec", self.ra_rate_px_per_sec),
            ("dec_rate_px_per_sec", self.dec_rate_px_per_sec),
        ] {
            if !(RATE_MIN..=RATE_MAX).contains(&value) {
                return Err(format!("sim.{name} {value} out of range [{RATE_MIN}, {RATE_MAX}]"));
            }
        }
        if !(FRAME_MS_MIN..=FRAME_MS_MAX).contains(&self.frame_ms) {
            return Err(format!(
                "sim.frame_ms {} out of range [{FRAME_MS_MIN}, {FRAME_MS_MAX}]",
                self.frame_ms
            ));
        }
        if self.dec_backlash_ms > DEC_BACKLASH_MAX_MS {
            return Err(format!(
                "sim.dec_backlash_ms {} exceeds {DEC_BACKLASH_MAX_MS}",
                self.dec_backlash_ms
            ));
        }
        if !(GUIDE_SPEED_MIN..=GUIDE_SPEED_MAX).contains(&self.guide_speed) {
            return Err(format!(
                "sim.guide_speed {} out of range [{GUIDE_SPEED_MIN}, {GUIDE_SPEED_MAX}]",
                self.guide_speed
            ));
        }
        if self.declination_deg.abs() >= 90.0 {
            return Err(format!("sim.declination_deg {} must be inside (-90, 90)", self.declination_deg));
        }
        if !self.drift_ra_px_per_min.is_finite() || !self.drift_dec_px_per_min.is_finite() {
            return Err("sim drift must be finite".to_string());
        }
        Ok(())
    }

    /// Guide speed on both axes [deg/s].
    pub fn guide_speed_deg_per_sec(&self) -> f64 {
        self.guide_speed * SIDEREAL_ARCSEC_PER_SEC / 3600.0
    }
}

// ─── File ───────────────────────────────────────────────────────────

/// Complete simulator configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub shared: SharedConfig,

    #[serde(default)]
    pub mount: MountConfig,

    #[serde(default)]
    pub guider: GuiderConfig,

    #[serde(default)]
    pub sim: SimParams,

    /// Profile file holding calibration and backlash settings. In-memory
    /// when absent.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

impl SimConfig {
    /// Validate every section.
    ///
    /// # Errors
    ///
    /// `ConfigError::ValidationError` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.mount.validate().map_err(ConfigError::ValidationError)?;
        self.guider.validate().map_err(ConfigError::ValidationError)?;
        self.sim.validate().map_err(ConfigError::ValidationError)?;

        let margin = self.guider.max_move_pixels;
        let inside_x = self.sim.start_x >= margin && self.sim.start_x < f64::from(self.guider.frame_width) - margin;
        let inside_y = self.sim.start_y >= margin && self.sim.start_y < f64::from(self.guider.frame_height) - margin;
        if !inside_x || !inside_y {
            return Err(ConfigError::ValidationError(format!(
                "sim start ({}, {}) is within {margin} px of the frame edge",
                self.sim.start_x, self.sim.start_y
            )));
        }
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use guide_common::config::ConfigLoader;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"
[shared]
service_name = "guide-sim"
"#;

    #[test]
    fn minimal_file_uses_defaults() {
        let config = SimConfig::parse(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mount.calibration_duration_ms, 750);
        assert_eq!(config.guider.frame_width, 1280);
        assert_eq!(config.sim.pier_side, PierSide::East);
        assert_eq!(config.sim.frame_ms, 2000);
        assert!(config.store_path.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let text = r#"
store_path = "/tmp/profile.toml"

[shared]
log_level = "debug"
service_name = "bench"

[mount]
class_name = "Bench"
calibration_duration_ms = 500

[sim]
camera_angle_deg = -45.0
dec_backlash_ms = 800
pier_side = "West"
"#;
        let config = SimConfig::parse(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mount.class_name, "Bench");
        assert_eq!(config.mount.calibration_duration_ms, 500);
        assert_eq!(config.sim.camera_angle_deg, -45.0);
        assert_eq!(config.sim.dec_backlash_ms, 800);
        assert_eq!(config.sim.pier_side, PierSide::West);
        assert_eq!(config.store_path, Some(PathBuf::from("/tmp/profile.toml")));
    }

    #[test]
    fn rejects_bad_sim_values() {
        let mut config = SimConfig::parse(MINIMAL).unwrap();
        config.sim.declination_deg = 90.0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = SimConfig::parse(MINIMAL).unwrap();
        config.sim.frame_ms = 10;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = SimConfig::parse(MINIMAL).unwrap();
        config.sim.start_y = 950.0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(msg)) if msg.contains("frame edge")));
    }

    #[test]
    fn load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = SimConfig::load(file.path()).unwrap();
        assert_eq!(config.shared.service_name, "guide-sim");

        let missing = SimConfig::load(std::path::Path::new("/nonexistent/sim.toml"));
        assert!(matches!(missing, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn guide_speed_in_degrees() {
        let params = SimParams::default();
        assert!((params.guide_speed_deg_per_sec() - 0.5 * 15.0417 / 3600.0).abs() < 1e-15);
    }
}
