//! Session driver.
//!
//! Owns one core [`Mount`] wired to a [`SimulatedMount`] and runs the three
//! operator sessions against it, one simulated exposure per frame:
//!
//! | Session            | Drives                              | Ends when                      |
//! |--------------------|-------------------------------------|--------------------------------|
//! | `calibrate`        | [`CalibrationEngine`]               | `Complete` or `Aborted`        |
//! | `measure_backlash` | [`BacklashMeasurement`]             | `Completed` or `Aborted`       |
//! | `guide`            | [`GuidePulseDispatcher`], identity  | the requested frame count      |
//!
//! Every frame advances the manual clock by `sim.frame_ms` and lets the star
//! drift before the next position is read.

use std::sync::Arc;

use guide_common::clock::{Clock, ManualClock, SystemClock};
use guide_common::geometry::Point;
use guide_common::guide::calibration::CalibrationIssue;
use guide_common::guide::direction::{MoveOptions, PierSide};
use guide_common::guide::error::GuideError;
use guide_common::guide::measurement::MeasurementResult;
use guide_common::guide::step::GuiderOffset;
use guide_common::store::{KeyValueStore, MemoryStore, TomlFileStore};
use guide_core::calibration::{CalibrationEngine, CalibrationState};
use guide_core::dispatch::GuidePulseDispatcher;
use guide_core::measurement::BacklashMeasurement;
use guide_core::mount::{Mount, MountContext};
use guide_core::stats::SampleStats;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SimConfig;
use crate::error::SimError;
use crate::mount::SimulatedMount;
use crate::sink::TracingSink;

/// Frames a calibration may take.
pub const MAX_CALIBRATION_FRAMES: u32 = 1000;
/// Frames a backlash measurement may take.
pub const MAX_MEASUREMENT_FRAMES: u32 = 500;

// ─── Reports ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    pub x_angle_deg: f64,
    pub y_angle_deg: f64,
    pub x_rate_px_per_sec: f64,
    pub y_rate_px_per_sec: f64,
    pub ortho_error_deg: f64,
    pub ra_steps: u32,
    pub dec_steps: u32,
    pub pier_side: PierSide,
    pub issue: CalibrationIssue,
    pub frames: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeasurementReport {
    pub result: MeasurementResult,
    pub backlash_px: f64,
    pub backlash_ms: u32,
    pub sigma_ms: f64,
    pub north_rate_px_per_sec: f64,
    /// Star distance from the North start after the trial correction [px].
    pub trial_residual_px: Option<f64>,
    pub frames: u32,
    /// The measured pulse was installed as the compensation pulse.
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuideReport {
    pub frames: u32,
    pub rms_ra_px: f64,
    pub rms_dec_px: f64,
    pub peak_offset_px: f64,
    pub final_offset_px: f64,
    pub limited_frames: u32,
    pub pulses: u64,
}

// ─── Session ────────────────────────────────────────────────────────

pub struct Session {
    config: SimConfig,
    sim: SimulatedMount,
    clock: Arc<ManualClock>,
    sink: Arc<TracingSink>,
    mount: Mount,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("sim", &self.sim)
            .field("mount", &self.mount)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Validate `config`, open its profile store and build the mount.
    ///
    /// # Errors
    ///
    /// `SimError::Config` on invalid values, `SimError::Store` when the
    /// profile file cannot be read.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        config.validate()?;
        let store: Arc<dyn KeyValueStore> = match &config.store_path {
            Some(path) => {
                info!(path = %path.display(), "using profile file");
                Arc::new(TomlFileStore::open(path)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Build the session on an existing store. `config` is taken as valid.
    pub fn with_store(config: SimConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let sim = SimulatedMount::new(&config.sim);
        let clock = Arc::new(ManualClock::new(SystemClock.now_ms()));
        let sink = Arc::new(TracingSink::new());
        let ctx = MountContext::new(store, clock.clone(), sink.clone());
        let mount = Mount::new(config.mount.clone(), config.guider.clone(), sim.mover(), ctx).with_pointing(sim.pointing());
        info!(
            service = %config.shared.service_name,
            calibrated = mount.is_calibrated(),
            blc = mount.backlash().is_active(),
            "session ready"
        );
        Self {
            config,
            sim,
            clock,
            sink,
            mount,
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn sim(&self) -> &SimulatedMount {
        &self.sim
    }

    pub fn sink(&self) -> &TracingSink {
        &self.sink
    }

    pub fn mount(&self) -> &Mount {
        &self.mount
    }

    pub fn mount_mut(&mut self) -> &mut Mount {
        &mut self.mount
    }

    /// Expose one frame: time passes, the star drifts, its position is read.
    fn next_frame(&self) -> Point {
        let ms = self.config.sim.frame_ms;
        self.clock.advance(ms);
        self.sim.elapse(ms);
        self.sim.star()
    }

    // ─── Calibration ────────────────────────────────────────────────

    /// Calibrate from the current star position.
    pub fn calibrate(&mut self) -> Result<CalibrationReport, SimError> {
        let lock = self.sim.star();
        info!(x = lock.x, y = lock.y, "calibration started");
        let mut engine = CalibrationEngine::begin(&mut self.mount, lock)?;

        for frame in 1..=MAX_CALIBRATION_FRAMES {
            let star = self.next_frame();
            match engine.update(&mut self.mount, star)? {
                CalibrationState::Complete => {
                    let cal = self.mount.calibration();
                    let details = engine.details();
                    let report = CalibrationReport {
                        x_angle_deg: cal.x_angle.to_degrees(),
                        y_angle_deg: cal.y_angle.to_degrees(),
                        x_rate_px_per_sec: cal.x_rate * 1000.0,
                        y_rate_px_per_sec: cal.y_rate * 1000.0,
                        ortho_error_deg: cal.ortho_error_degrees(),
                        ra_steps: details.ra_step_count,
                        dec_steps: details.dec_step_count,
                        pier_side: cal.pier_side,
                        issue: engine.sanity().map(|s| s.issue).unwrap_or_default(),
                        frames: frame,
                    };
                    info!(frames = frame, issue = report.issue.as_str(), "calibration session finished");
                    return Ok(report);
                }
                CalibrationState::Aborted => return Err(SimError::CalibrationIncomplete(CalibrationState::Aborted)),
                state => debug!(frame, state = %state, "calibration frame"),
            }
        }

        engine.abort(&mut self.mount);
        Err(SimError::FrameBudget {
            session: "calibration",
            frames: MAX_CALIBRATION_FRAMES,
        })
    }

    // ─── Backlash measurement ───────────────────────────────────────

    /// Measure Dec backlash. With `apply`, a valid non-zero result becomes
    /// the compensation pulse and compensation is enabled.
    pub fn measure_backlash(&mut self, apply: bool) -> Result<MeasurementReport, SimError> {
        let mut measurement = BacklashMeasurement::new(&self.mount);
        let start = self.sim.star();
        let drift = self.config.sim.drift_dec_px_per_min;
        let mut state = measurement.start(&mut self.mount, drift, start)?;

        let mut frames = 0;
        while !state.is_terminal() {
            if frames >= MAX_MEASUREMENT_FRAMES {
                measurement.stop(&mut self.mount);
                return Err(SimError::FrameBudget {
                    session: "backlash measurement",
                    frames,
                });
            }
            let star = self.next_frame();
            state = measurement.step(&mut self.mount, star)?;
            frames += 1;
        }

        let mut applied = false;
        if apply {
            if measurement.result() == MeasurementResult::Valid && measurement.backlash_ms() > 0 {
                self.mount.set_backlash_pulse(measurement.backlash_ms(), 0, 0);
                self.mount.enable_backlash_comp(true);
                applied = self.mount.backlash().is_active();
            } else {
                warn!(result = %measurement.result(), "measured value not applied");
            }
        }

        let (_, sigma_ms) = measurement.sigma();
        Ok(MeasurementReport {
            result: measurement.result(),
            backlash_px: measurement.backlash_px(),
            backlash_ms: measurement.backlash_ms(),
            sigma_ms,
            north_rate_px_per_sec: measurement.north_rate() * 1000.0,
            trial_residual_px: measurement.trial().map(|t| t.residual_px),
            frames,
            applied,
        })
    }

    // ─── Guiding ────────────────────────────────────────────────────

    /// Guide on the current star position for `frames` frames.
    pub fn guide(&mut self, frames: u32) -> Result<GuideReport, SimError> {
        if !self.mount.is_calibrated() {
            return Err(GuideError::NotCalibrated.into());
        }
        let mut dispatcher = GuidePulseDispatcher::default();
        dispatcher.guiding_started(&mut self.mount);

        let lock = self.sim.star();
        let mut ra_sq = SampleStats::new();
        let mut dec_sq = SampleStats::new();
        let mut peak: f64 = 0.0;
        let mut limited_frames = 0;

        for _ in 0..frames {
            let star = self.next_frame();
            let offset = star - lock;
            peak = peak.max(offset.magnitude());
            let info = match dispatcher.move_offset(&mut self.mount, GuiderOffset::camera(offset), MoveOptions::GUIDE_STEP) {
                Ok(info) => info,
                Err(e) => {
                    dispatcher.guiding_stopped(&mut self.mount);
                    return Err(e.into());
                }
            };
            ra_sq.add(info.mount_offset.x * info.mount_offset.x);
            dec_sq.add(info.mount_offset.y * info.mount_offset.y);
            if info.ra_limited || info.dec_limited {
                limited_frames += 1;
            }
        }
        dispatcher.guiding_stopped(&mut self.mount);

        let report = GuideReport {
            frames,
            rms_ra_px: ra_sq.mean().sqrt(),
            rms_dec_px: dec_sq.mean().sqrt(),
            peak_offset_px: peak,
            final_offset_px: self.sim.star().distance(&lock),
            limited_frames,
            pulses: self.sim.pulse_count(),
        };
        info!(
            frames,
            rms_ra = report.rms_ra_px,
            rms_dec = report.rms_dec_px,
            peak = report.peak_offset_px,
            "guiding session finished"
        );
        Ok(report)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimParams;
    use guide_common::config::SharedConfig;

    fn config(sim: SimParams) -> SimConfig {
        SimConfig {
            shared: SharedConfig {
                log_level: Default::default(),
                service_name: "test".into(),
            },
            mount: Default::default(),
            guider: Default::default(),
            sim,
            store_path: None,
        }
    }

    #[test]
    fn calibration_recovers_sim_geometry() {
        let mut session = Session::new(config(SimParams::default())).unwrap();
        let report = session.calibrate().unwrap();

        // x angle points against the West motion at 30°
        let x = Point::new(report.x_angle_deg.to_radians().cos(), report.x_angle_deg.to_radians().sin());
        let expected = Point::new(-(30f64.to_radians().cos()), -(30f64.to_radians().sin()));
        assert!(x.distance(&expected) < 1e-6);
        assert!((report.x_rate_px_per_sec - 4.0 * 20f64.to_radians().cos()).abs() < 1e-6);
        assert!((report.y_rate_px_per_sec - 4.0).abs() < 1e-6);
        assert_eq!(report.pier_side, PierSide::East);
        assert_eq!(report.issue, CalibrationIssue::None);
        assert!(session.mount().is_calibrated());
    }

    #[test]
    fn guiding_needs_calibration() {
        let mut session = Session::new(config(SimParams::default())).unwrap();
        let err = session.guide(5).unwrap_err();
        assert!(matches!(err, SimError::Guide(GuideError::NotCalibrated)));
    }

    #[test]
    fn guiding_holds_drifting_star() {
        let mut session = Session::new(config(SimParams {
            drift_ra_px_per_min: 2.0,
            drift_dec_px_per_min: -1.0,
            ..Default::default()
        }))
        .unwrap();
        session.calibrate().unwrap();
        let report = session.guide(50).unwrap();

        // one frame of drift is 2000 ms ≈ 0.075 px
        assert_eq!(report.frames, 50);
        assert!(report.rms_ra_px < 0.1, "rms ra {}", report.rms_ra_px);
        assert!(report.rms_dec_px < 0.1, "rms dec {}", report.rms_dec_px);
        assert!(report.final_offset_px < 0.01);
        assert_eq!(report.limited_frames, 0);
        assert_eq!(session.sink().steps(), 50);
    }

    #[test]
    fn guiding_after_meridian_flip() {
        let mut session = Session::new(config(SimParams {
            drift_ra_px_per_min: 2.0,
            ..Default::default()
        }))
        .unwrap();
        session.calibrate().unwrap();
        session.sim().meridian_flip();

        let report = session.guide(30).unwrap();
        assert_eq!(session.mount().calibration().pier_side, PierSide::West);
        assert!(report.rms_ra_px < 0.1, "rms ra {}", report.rms_ra_px);
    }

    #[test]
    fn measurement_seeds_compensation() {
        let mut session = Session::new(config(SimParams {
            dec_backlash_ms: 600,
            ..Default::default()
        }))
        .unwrap();
        session.calibrate().unwrap();
        let report = session.measure_backlash(true).unwrap();

        assert_eq!(report.result, MeasurementResult::Valid);
        assert!((300..=450).contains(&report.backlash_ms), "backlash {} ms", report.backlash_ms);
        assert!(report.applied);
        assert!(session.mount().backlash().is_active());
        assert_eq!(session.mount().backlash().pulse_width(), report.backlash_ms);
    }

    #[test]
    fn slewing_mount_stops_guiding() {
        let mut session = Session::new(config(SimParams {
            drift_ra_px_per_min: 2.0,
            ..Default::default()
        }))
        .unwrap();
        session.calibrate().unwrap();
        session.sim().set_slewing(true);
        let err = session.guide(3).unwrap_err();
        assert!(matches!(err, SimError::Guide(_)));
    }
}
