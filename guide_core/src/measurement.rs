//! Dec backlash measurement.
//!
//! An experiment run outside normal guiding to find a seed value for the
//! Dec backlash compensation pulse. The star is pushed North in equal steps,
//! then brought back South with the same number of steps; the South steps
//! that produce no motion are the backlash.
//!
//! ## States
//!
//! | State          | Action per frame                                               |
//! |----------------|----------------------------------------------------------------|
//! | Initialize     | Record the start position, size the clearing pulse             |
//! | ClearNorth     | North pulses until 3 consecutive moves of ≥ 4 px               |
//! | StepNorth      | Fixed North pulses, record Dec positions and step deltas       |
//! | StepSouth      | Same number of South pulses                                    |
//! | TestCorrection | Estimate backlash, issue one trial South pulse, log the result |
//! | Restore        | Up to 10 South pulses back toward the start                    |
//! | Wrapup         | Reset backlash comp state                                      |
//!
//! Positions are Dec coordinates of the star in mount space [px]; North
//! travel increases them.

use std::fmt;

use guide_common::consts::{
    BACKLASH_EXEMPTION_DISTANCE_PX, BACKLASH_EXPECTED_DISTANCE_PX, BACKLASH_MIN_COUNT,
    MAX_CLEARING_STEPS, MAX_NORTH_PULSES_MS, MAX_RESTORE_PULSES, NORTH_PULSE_SIZE_MS,
    TRIAL_TOLERANCE_ARCSEC,
};
use guide_common::geometry::Point;
use guide_common::guide::config::GuiderConfig;
use guide_common::guide::direction::{GuideDirection, MoveOptions};
use guide_common::guide::error::GuideError;
use guide_common::guide::measurement::MeasurementResult;
use guide_common::notify::GuideEvent;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::mount::Mount;
use crate::stats::SampleStats;

/// Clearing pulse margin over the expected distance.
const CLEARING_PULSE_MARGIN: f64 = 1.25;
/// Share of the tracking box one North step may cover.
const NORTH_STEP_BOX_SHARE: f64 = 0.7;
/// Share of the tracking box the fallback trial pulse may cover.
const TRIAL_BOX_SHARE: f64 = 0.8;
/// Share of the median North step a South step must reach.
const EXPECTED_SOUTH_SHARE: f64 = 0.9;
/// Backlash above this share of the North travel is not trusted.
const MAX_BACKLASH_SHARE: f64 = 0.7;
/// Lower bound of `backlash_px · north_rate`.
const SANITY_LIMIT: f64 = -200.0;

// ─── State ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MeasurementState {
    Initialize,
    ClearNorth,
    StepNorth,
    StepSouth,
    TestCorrection,
    Restore,
    Wrapup,
    Completed,
    Aborted,
}

impl MeasurementState {
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for MeasurementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ─── Estimate ───────────────────────────────────────────────────────

/// Backlash estimate derived from the North and South legs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BacklashEstimate {
    pub result: MeasurementResult,
    /// Backlash [px], never negative.
    pub px: f64,
    /// Backlash as a Dec pulse [ms].
    pub ms: u32,
    /// Drift-corrected empirical North rate [px/ms].
    pub north_rate: f64,
}

/// Outcome of the single trial correction pulse.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrialCorrection {
    pub pulse_ms: u32,
    /// Distance from the North start after the trial [px].
    pub residual_px: f64,
    pub tolerance_px: f64,
    /// The trial pulse carried the star past the North start.
    pub overshoot: bool,
}

impl TrialCorrection {
    #[inline]
    pub fn within_tolerance(&self) -> bool {
        self.residual_px.abs() <= self.tolerance_px
    }
}

/// Estimate the backlash from recorded Dec positions.
///
/// `north_stats` holds the North step deltas, `drift_px` the drift expected
/// over the whole North leg. A South step counts when it moves South by at
/// least 90% of the median North step (or does so averaged with half of the
/// previous step); the shortfall up to the second consecutive counted step
/// is the backlash.
pub fn estimate_backlash(
    north_positions: &[f64],
    north_stats: &SampleStats,
    south_positions: &[f64],
    drift_px: f64,
    pulse_width: u32,
) -> BacklashEstimate {
    if north_positions.len() <= 3 {
        return BacklashEstimate {
            result: MeasurementResult::TooFewNorth,
            px: 0.0,
            ms: 0,
            north_rate: 0.0,
        };
    }

    let step_count = north_stats.count().max(1) as f64;
    let north_delta = north_stats.sum();
    let north_rate = ((north_delta - drift_px) / (step_count * f64::from(pulse_width.max(1)))).abs();
    let drift_per_frame = drift_px / step_count;
    debug!(
        drift_px,
        north_delta,
        drift_per_frame,
        north_rate = north_rate * 1000.0,
        "BLT: drift-corrected north moves"
    );

    let expected = (EXPECTED_SOUTH_SHARE * north_stats.median()).abs();
    let mut good_moves = 0u32;
    let mut early_south = 0.0;
    let mut last_move = 0.0;
    let mut smoothing = false;
    let mut backlash_px = 0.0;
    let mut result = MeasurementResult::TooFewSouth;

    for (step, pair) in south_positions.windows(2).enumerate() {
        let step = (step + 1) as f64;
        let south_move = pair[1] - pair[0];
        early_south += south_move;
        if south_move < 0.0 && (south_move.abs() >= expected || (south_move + last_move / 2.0).abs() > expected) {
            if south_move.abs() < expected {
                smoothing = true;
            }
            good_moves += 1;
            if good_moves == 2 {
                if smoothing {
                    debug!("BLT: smoothing applied to south data points");
                }
                backlash_px = step * expected - (early_south - step * drift_per_frame).abs();
                result = if backlash_px * north_rate < SANITY_LIMIT {
                    MeasurementResult::Sanity
                } else if backlash_px >= MAX_BACKLASH_SHARE * north_delta {
                    MeasurementResult::TooFewNorth
                } else {
                    MeasurementResult::Valid
                };
                if backlash_px < 0.0 {
                    debug!(backlash_px, "BLT: negative measurement, forced to zero");
                    backlash_px = 0.0;
                }
                break;
            }
        } else {
            good_moves = good_moves.saturating_sub(1);
        }
        last_move = south_move;
    }

    let ms = if north_rate > 0.0 {
        (backlash_px / north_rate) as u32
    } else {
        0
    };
    BacklashEstimate {
        result,
        px: backlash_px,
        ms,
        north_rate,
    }
}

/// Uncertainty of a backlash estimate as `(px, ms)`.
///
/// Sigma of the mean North step plus two South measurements, in quadrature.
pub fn backlash_sigma(result: MeasurementResult, north_stats: &SampleStats, north_rate: f64) -> (f64, f64) {
    let usable = matches!(result, MeasurementResult::Valid | MeasurementResult::TooFewNorth);
    let n = north_stats.count();
    if !usable || n < 2 {
        return (0.0, 0.0);
    }
    let variance = north_stats.variance();
    let n = n as f64;
    let px = (variance / n + 2.0 * variance / (n - 1.0)).sqrt();
    let ms = if north_rate > 0.0 { px / north_rate } else { 0.0 };
    (px, ms)
}

fn out_of_room(camera: Point, guider: &GuiderConfig) -> bool {
    let margin = guider.max_move_pixels;
    camera.x < margin
        || camera.y < margin
        || camera.x >= f64::from(guider.frame_width) - margin
        || camera.y >= f64::from(guider.frame_height) - margin
}

enum Flow {
    Wait,
    Enter(MeasurementState),
}

// ─── Measurement ────────────────────────────────────────────────────

/// One backlash measurement run.
#[derive(Debug, Clone)]
pub struct BacklashMeasurement {
    state: MeasurementState,
    result: MeasurementResult,
    status: String,
    /// Dec rate of the last calibration [px/ms].
    last_dec_rate: Option<f64>,
    drift_per_sec: f64,
    pulse_width: u32,
    step_count: u32,
    accepted_moves: u32,
    last_clear_delta: f64,
    cum_clearing_distance: f64,
    backlash_exemption: bool,
    north_pulse_count: u32,
    restore_count: u32,
    marker: Point,
    starting: Point,
    end_south: Point,
    north_positions: Vec<f64>,
    south_positions: Vec<f64>,
    north_stats: SampleStats,
    start_ms: u64,
    end_ms: u64,
    estimate: Option<BacklashEstimate>,
    trial: Option<TrialCorrection>,
    /// Guiding-enabled flag to restore when the run ends.
    prior_guiding_enabled: Option<bool>,
}

impl BacklashMeasurement {
    /// Prepare a measurement. Without a calibrated Dec rate the run starts
    /// out aborted.
    pub fn new(mount: &Mount) -> Self {
        let last_dec_rate = Self::dec_rate(mount);
        let (state, status) = if last_dec_rate.is_some() {
            (MeasurementState::Initialize, String::new())
        } else {
            debug!("BLT: could not get calibration data");
            (
                MeasurementState::Aborted,
                "Backlash measurement cannot be run - please re-run your mount calibration".to_string(),
            )
        };
        Self {
            state,
            result: MeasurementResult::Valid,
            status,
            last_dec_rate,
            drift_per_sec: 0.0,
            pulse_width: 0,
            step_count: 0,
            accepted_moves: 0,
            last_clear_delta: 0.0,
            cum_clearing_distance: 0.0,
            backlash_exemption: false,
            north_pulse_count: 0,
            restore_count: 0,
            marker: Point::ORIGIN,
            starting: Point::ORIGIN,
            end_south: Point::ORIGIN,
            north_positions: Vec::new(),
            south_positions: Vec::new(),
            north_stats: SampleStats::new(),
            start_ms: 0,
            end_ms: 0,
            estimate: None,
            trial: None,
            prior_guiding_enabled: None,
        }
    }

    fn dec_rate(mount: &Mount) -> Option<f64> {
        let cal = mount.calibration();
        (cal.is_valid && cal.has_dec_calibration() && cal.y_rate > 0.0).then_some(cal.y_rate)
    }

    // ─── Accessors ──────────────────────────────────────────────────

    pub fn state(&self) -> MeasurementState {
        self.state
    }

    pub fn result(&self) -> MeasurementResult {
        self.result
    }

    /// Last operator status line.
    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn estimate(&self) -> Option<&BacklashEstimate> {
        self.estimate.as_ref()
    }

    pub fn trial(&self) -> Option<&TrialCorrection> {
        self.trial.as_ref()
    }

    /// Backlash [px], 0 until estimated.
    pub fn backlash_px(&self) -> f64 {
        self.estimate.map_or(0.0, |e| e.px)
    }

    /// Backlash [ms], 0 until estimated.
    pub fn backlash_ms(&self) -> u32 {
        self.estimate.map_or(0, |e| e.ms)
    }

    pub fn north_rate(&self) -> f64 {
        self.estimate
            .map(|e| e.north_rate)
            .filter(|r| *r > 0.0)
            .or(self.last_dec_rate)
            .unwrap_or(0.0)
    }

    /// `(px, ms)` uncertainty of the estimate.
    pub fn sigma(&self) -> (f64, f64) {
        backlash_sigma(self.result, &self.north_stats, self.north_rate())
    }

    pub fn pulse_width(&self) -> u32 {
        self.pulse_width
    }

    /// Dec positions at each North step.
    pub fn north_positions(&self) -> &[f64] {
        &self.north_positions
    }

    /// Dec positions at each South step.
    pub fn south_positions(&self) -> &[f64] {
        &self.south_positions
    }

    pub fn is_graphable(&self) -> bool {
        !self.south_positions.is_empty()
    }

    // ─── Driving ────────────────────────────────────────────────────

    /// Begin measuring with the star at camera position `current`.
    ///
    /// `drift_per_min` is the expected Dec drift [px/min] used to correct
    /// the North rate.
    pub fn start(&mut self, mount: &mut Mount, drift_per_min: f64, current: Point) -> Result<MeasurementState, GuideError> {
        self.state = MeasurementState::Initialize;
        self.result = MeasurementResult::Valid;
        self.drift_per_sec = drift_per_min / 60.0;
        self.north_positions.clear();
        self.south_positions.clear();
        self.north_stats.clear();
        self.estimate = None;
        self.trial = None;
        if self.last_dec_rate.is_none() {
            self.last_dec_rate = Self::dec_rate(mount);
        }
        if self.last_dec_rate.is_none() {
            self.state = MeasurementState::Aborted;
            self.set_status(
                mount,
                "Backlash measurement cannot be run - Dec guide rate not available".to_string(),
            );
            return Err(GuideError::NotCalibrated);
        }
        info!(mount = mount.name(), drift_per_min, "BLT: measurement started");
        self.step(mount, current)
    }

    /// Halt the run and release measurement mode.
    pub fn stop(&mut self, mount: &mut Mount) {
        if self.state.is_terminal() {
            return;
        }
        self.state = MeasurementState::Aborted;
        self.set_status(mount, "Measurement halted".to_string());
        debug!("BLT: measurement halted by user");
        self.clean_up(mount);
    }

    /// Process one frame with the star at camera position `current`.
    pub fn step(&mut self, mount: &mut Mount, current: Point) -> Result<MeasurementState, GuideError> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }
        match self.advance(mount, current) {
            Ok(()) => Ok(self.state),
            Err(e) => {
                warn!(state = %self.state, error = %e, status = %self.status, "BLT: measurement aborted");
                self.state = MeasurementState::Aborted;
                self.clean_up(mount);
                Err(e)
            }
        }
    }

    fn advance(&mut self, mount: &mut Mount, camera: Point) -> Result<(), GuideError> {
        let location = mount.camera_to_mount(camera)?;
        let dec_delta = if self.state == MeasurementState::Initialize {
            0.0
        } else {
            let delta = location.y - self.marker.y;
            self.cum_clearing_distance += delta;
            delta
        };
        debug!(state = %self.state, dec = location.y, dec_delta, "BLT: measurement step");

        loop {
            let flow = match self.state {
                MeasurementState::Initialize => self.initialize(mount, location)?,
                MeasurementState::ClearNorth => self.clear_north(mount, camera, location, dec_delta)?,
                MeasurementState::StepNorth => self.step_north(mount, camera, location)?,
                MeasurementState::StepSouth => self.step_south(mount, location)?,
                MeasurementState::TestCorrection => self.test_correction(mount, location, dec_delta)?,
                MeasurementState::Restore => self.restore(mount, location)?,
                MeasurementState::Wrapup => {
                    self.set_status(mount, "Measurement complete".to_string());
                    self.clean_up(mount);
                    info!(
                        result = %self.result,
                        px = self.backlash_px(),
                        ms = self.backlash_ms(),
                        "BLT: measurement complete"
                    );
                    self.state = MeasurementState::Completed;
                    Flow::Wait
                }
                MeasurementState::Completed | MeasurementState::Aborted => Flow::Wait,
            };
            match flow {
                Flow::Wait => return Ok(()),
                Flow::Enter(next) => {
                    debug!(from = %self.state, to = %next, "BLT: state");
                    self.state = next;
                }
            }
        }
    }

    fn set_status(&mut self, mount: &Mount, message: String) {
        debug!("BLT: {message}");
        mount.publish(GuideEvent::MeasurementStatus {
            message: message.clone(),
        });
        self.status = message;
    }

    fn fail(&mut self, mount: &Mount, result: MeasurementResult, message: &str) -> GuideError {
        self.result = result;
        self.set_status(mount, message.to_string());
        GuideError::MeasurementInvalid { kind: result }
    }

    /// Leave measurement mode.
    fn clean_up(&mut self, mount: &mut Mount) {
        mount.backlash_mut().reset_state();
        if let Some(enabled) = self.prior_guiding_enabled.take() {
            mount.set_guiding_enabled(enabled);
        }
        debug!("BLT: cleanup completed");
    }

    fn pulse(mount: &mut Mount, direction: GuideDirection, duration: u32) -> Result<Flow, GuideError> {
        mount.move_axis(direction, duration, MoveOptions::CALIBRATION_MOVE)?;
        Ok(Flow::Wait)
    }

    fn initialize(&mut self, mount: &mut Mount, location: Point) -> Result<Flow, GuideError> {
        self.step_count = 0;
        self.marker = location;
        self.starting = location;
        let Some(rate) = self.last_dec_rate else {
            self.set_status(
                mount,
                "Backlash measurement cannot be run - Dec guide rate not available".to_string(),
            );
            return Err(GuideError::NotCalibrated);
        };

        self.pulse_width = (BACKLASH_EXPECTED_DISTANCE_PX * CLEARING_PULSE_MARGIN / rate) as u32;
        self.accepted_moves = 0;
        self.last_clear_delta = 0.0;
        self.cum_clearing_distance = 0.0;
        self.backlash_exemption = false;
        self.result = MeasurementResult::Valid;
        self.prior_guiding_enabled.get_or_insert(mount.guiding_enabled());
        mount.set_guiding_enabled(true);
        self.state = MeasurementState::ClearNorth;
        Ok(Flow::Wait)
    }

    fn clear_north(&mut self, mount: &mut Mount, camera: Point, location: Point, dec_delta: f64) -> Result<Flow, GuideError> {
        if self.step_count == 0 {
            debug!(
                pulse = self.pulse_width,
                expected = BACKLASH_EXPECTED_DISTANCE_PX,
                "BLT: starting North backlash clearing"
            );
            Self::pulse(mount, GuideDirection::North, self.pulse_width)?;
            self.step_count = 1;
            self.set_status(mount, format!("Clearing North backlash, step {}", self.step_count));
            return Ok(Flow::Wait);
        }

        if dec_delta.abs() >= BACKLASH_EXPECTED_DISTANCE_PX {
            if self.accepted_moves == 0 || self.last_clear_delta * dec_delta > 0.0 {
                self.accepted_moves += 1;
                debug!(dec_delta, "BLT: accepted clearing move");
            } else {
                self.accepted_moves = 0;
                debug!(dec_delta, "BLT: rejected clearing move, direction reversal");
            }
        } else {
            debug!(dec_delta, "BLT: clearing move not large enough");
        }

        let no_room = out_of_room(camera, mount.guider());
        if self.accepted_moves < BACKLASH_MIN_COUNT {
            if self.step_count >= MAX_CLEARING_STEPS {
                return Err(self.fail(
                    mount,
                    MeasurementResult::BacklashNotCleared,
                    "Could not clear North backlash - test failed",
                ));
            }
            if self.cum_clearing_distance.abs() > BACKLASH_EXEMPTION_DISTANCE_PX {
                debug!(cum = self.cum_clearing_distance, "BLT: large cumulative clearing, continuing");
                self.backlash_exemption = true;
            } else if !no_room {
                Self::pulse(mount, GuideDirection::North, self.pulse_width)?;
                self.step_count += 1;
                self.marker = location;
                self.last_clear_delta = dec_delta;
                self.set_status(
                    mount,
                    format!(
                        "Clearing North backlash, step {} (up to limit of {MAX_CLEARING_STEPS})",
                        self.step_count
                    ),
                );
                return Ok(Flow::Wait);
            }
        }

        if !(self.accepted_moves >= BACKLASH_MIN_COUNT || self.backlash_exemption || no_room) {
            return Ok(Flow::Wait);
        }

        let rate = self.last_dec_rate.unwrap_or(1.0);
        let total_cleared = f64::from(self.step_count) * f64::from(self.pulse_width);
        let box_limit = (NORTH_STEP_BOX_SHARE * mount.guider().max_move_pixels / rate).floor() as u32;
        self.pulse_width = NORTH_PULSE_SIZE_MS
            .max(mount.config().calibration_duration_ms)
            .min(box_limit)
            .max(1);
        self.step_count = 0;
        self.north_pulse_count = MAX_NORTH_PULSES_MS
            .div_ceil(self.pulse_width)
            .max((total_cleared * 1.5 / f64::from(self.pulse_width)) as u32);
        self.start_ms = mount.now_ms();
        debug!(
            dec = location.y,
            pulse = self.pulse_width,
            count = self.north_pulse_count,
            "BLT: starting North moves"
        );
        Ok(Flow::Enter(MeasurementState::StepNorth))
    }

    fn step_north(&mut self, mount: &mut Mount, camera: Point, location: Point) -> Result<Flow, GuideError> {
        let no_room = out_of_room(camera, mount.guider());
        if self.step_count < self.north_pulse_count && !no_room {
            let delta = match self.north_positions.last() {
                Some(&last) if self.step_count >= 1 => {
                    let delta = location.y - last;
                    self.north_stats.add(delta);
                    delta
                }
                _ => {
                    self.marker = location;
                    0.0
                }
            };
            let message = format!(
                "Moving North for {} ms, step {} / {}",
                self.pulse_width,
                self.step_count + 1,
                self.north_pulse_count
            );
            debug!(dec = location.y, delta, "BLT: {message}");
            self.north_positions.push(location.y);
            Self::pulse(mount, GuideDirection::North, self.pulse_width)?;
            self.step_count += 1;
            self.set_status(mount, message);
            return Ok(Flow::Wait);
        }

        self.end_ms = mount.now_ms();
        if self.step_count >= 1 {
            if let Some(&last) = self.north_positions.last() {
                self.north_stats.add(location.y - last);
            }
        }
        self.north_positions.push(location.y);
        debug!(dec = location.y, "BLT: North pulses ended");

        if self.step_count < self.north_pulse_count {
            if f64::from(self.step_count) < 0.5 * f64::from(self.north_pulse_count) {
                return Err(self.fail(
                    mount,
                    MeasurementResult::TooFewNorth,
                    "Star too close to edge for accurate measurement of backlash. Choose a star farther from the edge.",
                ));
            }
            debug!("BLT: North pulses truncated, too close to frame edge");
        }
        self.north_pulse_count = self.step_count;
        self.step_count = 0;
        Ok(Flow::Enter(MeasurementState::StepSouth))
    }

    fn step_south(&mut self, mount: &mut Mount, location: Point) -> Result<Flow, GuideError> {
        self.south_positions.push(location.y);
        if self.step_count < self.north_pulse_count {
            let message = format!(
                "Moving South for {} ms, step {} / {}",
                self.pulse_width,
                self.step_count + 1,
                self.north_pulse_count
            );
            Self::pulse(mount, GuideDirection::South, self.pulse_width)?;
            self.step_count += 1;
            self.set_status(mount, message);
            return Ok(Flow::Wait);
        }

        debug!(dec = location.y, "BLT: South pulses ended");
        self.end_south = location;
        self.step_count = 0;
        Ok(Flow::Enter(MeasurementState::TestCorrection))
    }

    fn test_correction(&mut self, mount: &mut Mount, location: Point, dec_delta: f64) -> Result<Flow, GuideError> {
        if self.step_count == 0 {
            let elapsed_ms = self.end_ms.saturating_sub(self.start_ms) as f64;
            let drift_px = self.drift_per_sec * elapsed_ms / 1000.0;
            let mut estimate = estimate_backlash(
                &self.north_positions,
                &self.north_stats,
                &self.south_positions,
                drift_px,
                self.pulse_width,
            );
            if estimate.north_rate <= 0.0 {
                estimate.north_rate = self.last_dec_rate.unwrap_or(0.0);
            }
            self.estimate = Some(estimate);
            self.result = estimate.result;

            match estimate.result {
                MeasurementResult::Sanity => {
                    return Err(self.fail(mount, estimate.result, "Dec movements too erratic - test failed"));
                }
                MeasurementResult::TooFewSouth => {
                    return Err(self.fail(
                        mount,
                        estimate.result,
                        "Mount never established consistent south moves - test failed",
                    ));
                }
                _ => {}
            }

            let (sigma_px, _) = self.sigma();
            debug!(px = estimate.px, ms = estimate.ms, sigma_px, "BLT: trial backlash amount");

            if estimate.ms == 0 {
                self.step_count = 0;
                return Ok(Flow::Enter(MeasurementState::Restore));
            }
            let max_move = mount.guider().max_move_pixels;
            if estimate.px < max_move {
                self.set_status(mount, format!("Issuing test backlash correction of {} ms", estimate.ms));
                Self::pulse(mount, GuideDirection::South, estimate.ms)?;
                self.step_count += 1;
                return Ok(Flow::Wait);
            }
            let max_frame_move = (TRIAL_BOX_SHARE * max_move / estimate.north_rate).floor() as u32;
            debug!(max_frame_move, "BLT: clearing pulse is very large, issuing max South move");
            Self::pulse(mount, GuideDirection::South, max_frame_move)?;
            self.step_count = 0;
            self.state = MeasurementState::Restore;
            return Ok(Flow::Wait);
        }

        let tolerance_px = TRIAL_TOLERANCE_ARCSEC / mount.guider().pixel_scale_arcsec;
        let overshoot = (self.end_south.y - self.marker.y) * dec_delta < 0.0;
        let trial = TrialCorrection {
            pulse_ms: self.backlash_ms(),
            residual_px: dec_delta,
            tolerance_px,
            overshoot,
        };
        if trial.within_tolerance() {
            debug!(
                residual_arcsec = dec_delta.abs() * mount.guider().pixel_scale_arcsec,
                "BLT: nominal backlash pulse within tolerance"
            );
        } else {
            let pulse_delta = (location.y - self.end_south.y).abs();
            let target_delta = (self.marker.y - self.end_south.y).abs();
            let ratio = if pulse_delta > 0.0 { target_delta / pulse_delta } else { 0.0 };
            if overshoot {
                debug!(ratio, "BLT: nominal backlash value over-shot");
            } else {
                debug!(ratio, "BLT: nominal backlash value under-shot");
            }
        }
        self.trial = Some(trial);
        self.step_count = 0;
        Ok(Flow::Enter(MeasurementState::Restore))
    }

    fn restore(&mut self, mount: &mut Mount, location: Point) -> Result<Flow, GuideError> {
        if self.step_count == 0 {
            let amount = (location.y - self.starting.y).abs();
            let north_rate = self.north_rate();
            self.restore_count = if amount > mount.guider().max_move_pixels && north_rate > 0.0 {
                let steps = ((amount / north_rate) / f64::from(self.pulse_width.max(1))).floor() as u32;
                steps.min(MAX_RESTORE_PULSES)
            } else {
                0
            };
            debug!(amount, steps = self.restore_count, "BLT: final restore distance");
        }
        if self.step_count < self.restore_count {
            Self::pulse(mount, GuideDirection::South, self.pulse_width)?;
            self.step_count += 1;
            self.set_status(mount, "Restoring star position".to_string());
            return Ok(Flow::Wait);
        }
        Ok(Flow::Enter(MeasurementState::Wrapup))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Field, Rig};
    use guide_common::guide::calibration::Calibration;
    use guide_common::guide::config::MountConfig;
    use std::f64::consts::FRAC_PI_2;

    /// 1/128 px per ms on both axes.
    const RATE: f64 = 0.0078125;

    fn rig(field: Field) -> Rig {
        let mut rig = Rig::new(MountConfig::default(), field);
        rig.mount.set_calibration(&Calibration {
            x_angle: 0.0,
            y_angle: FRAC_PI_2,
            x_rate: RATE,
            y_rate: RATE,
            binning: 1,
            ..Default::default()
        })
        .unwrap();
        rig
    }

    fn field() -> Field {
        Field::new(Point::new(7.8125, 0.0), Point::new(0.0, 7.8125))
    }

    fn run(rig: &mut Rig, m: &mut BacklashMeasurement) -> Result<MeasurementState, GuideError> {
        let start = rig.position();
        let mut state = m.start(&mut rig.mount, 0.0, start)?;
        for _ in 0..300 {
            if state.is_terminal() {
                return Ok(state);
            }
            let current = rig.position();
            state = m.step(&mut rig.mount, current)?;
        }
        panic!("measurement did not terminate");
    }

    fn count(rig: &Rig, dir: GuideDirection) -> usize {
        rig.pulses().iter().filter(|(d, _)| *d == dir).count()
    }

    fn stats(values: &[f64]) -> SampleStats {
        let mut s = SampleStats::new();
        for v in values {
            s.add(*v);
        }
        s
    }

    #[test]
    fn estimate_counts_shortfall_before_consistent_south_moves() {
        let north = [0.0, 10.0, 20.0, 30.0, 40.0];
        let south = [40.0, 37.0, 28.0, 19.0, 10.0];
        let est = estimate_backlash(&north, &stats(&[10.0; 4]), &south, 0.0, 1000);

        assert_eq!(est.result, MeasurementResult::Valid);
        // 3 expected moves of 9 px against 21 px of actual travel
        assert!((est.px - 6.0).abs() < 1e-9);
        assert!((est.north_rate - 0.01).abs() < 1e-12);
        assert!((i64::from(est.ms) - 600).abs() <= 1);
    }

    #[test]
    fn estimate_needs_north_samples_and_south_moves() {
        let est = estimate_backlash(&[0.0, 10.0, 20.0], &stats(&[10.0, 10.0]), &[20.0, 10.0], 0.0, 1000);
        assert_eq!(est.result, MeasurementResult::TooFewNorth);

        let north = [0.0, 10.0, 20.0, 30.0, 40.0];
        let south = [40.0, 40.0, 39.0, 40.0, 39.5];
        let est = estimate_backlash(&north, &stats(&[10.0; 4]), &south, 0.0, 1000);
        assert_eq!(est.result, MeasurementResult::TooFewSouth);
        assert_eq!(est.px, 0.0);
    }

    #[test]
    fn large_backlash_is_not_trusted() {
        let north = [0.0, 10.0, 20.0, 30.0, 40.0];
        let south = [40.0, 40.0, 40.0, 40.0, 40.0, 31.0, 22.0];
        let est = estimate_backlash(&north, &stats(&[10.0; 4]), &south, 0.0, 1000);
        // 6·9 − 18 = 36 px against 40 px of North travel
        assert_eq!(est.result, MeasurementResult::TooFewNorth);
    }

    #[test]
    fn sigma_of_north_steps() {
        let s = stats(&[1.0, 2.0, 3.0]);
        let (px, ms) = backlash_sigma(MeasurementResult::Valid, &s, 0.5);
        assert!((px - (1.0f64 / 3.0 + 1.0).sqrt()).abs() < 1e-12);
        assert!((ms - px / 0.5).abs() < 1e-12);
        assert_eq!(backlash_sigma(MeasurementResult::TooFewSouth, &s, 0.5), (0.0, 0.0));
        assert_eq!(backlash_sigma(MeasurementResult::Valid, &stats(&[1.0]), 0.5), (0.0, 0.0));
    }

    #[test]
    fn clean_mount_measures_no_backlash() {
        let mut rig = rig(field());
        let mut m = BacklashMeasurement::new(&rig.mount);
        assert_eq!(run(&mut rig, &mut m).unwrap(), MeasurementState::Completed);

        assert_eq!(m.result(), MeasurementResult::Valid);
        assert_eq!(m.backlash_px(), 0.0);
        assert_eq!(m.backlash_ms(), 0);
        // 3 clearing pulses of 640 ms, then 11 steps of 750 ms each way
        assert_eq!(count(&rig, GuideDirection::North), 14);
        assert_eq!(count(&rig, GuideDirection::South), 11);
        assert_eq!(m.north_positions().len(), 12);
        assert_eq!(m.south_positions().len(), 12);
        assert_eq!(m.status(), "Measurement complete");
        assert!(m.trial().is_none());
    }

    #[test]
    fn dead_south_pulses_show_as_backlash() {
        let mut f = field();
        f.south_script = [Point::ORIGIN, Point::ORIGIN].into_iter().collect();
        let mut rig = rig(f);
        let mut m = BacklashMeasurement::new(&rig.mount);
        assert_eq!(run(&mut rig, &mut m).unwrap(), MeasurementState::Completed);

        assert_eq!(m.result(), MeasurementResult::Valid);
        assert!((m.backlash_px() - 9.375).abs() < 1e-6);
        assert!((i64::from(m.backlash_ms()) - 1200).abs() <= 1);
        // one trial correction after the South leg
        assert_eq!(count(&rig, GuideDirection::South), 12);
        let trial = m.trial().unwrap();
        assert!(!trial.overshoot);
        assert!(m.is_graphable());
    }

    #[test]
    fn frame_edge_stops_north_leg() {
        let mut f = field();
        f.position = Point::new(100.0, 930.0);
        let mut rig = rig(f);
        let mut m = BacklashMeasurement::new(&rig.mount);

        let err = run(&mut rig, &mut m).unwrap_err();
        assert_eq!(
            err,
            GuideError::MeasurementInvalid {
                kind: MeasurementResult::TooFewNorth
            }
        );
        assert_eq!(m.state(), MeasurementState::Aborted);
        assert!(m.status().starts_with("Star too close to edge"));
    }

    #[test]
    fn stuck_dec_is_not_cleared() {
        let mut rig = rig(Field::new(Point::new(7.8125, 0.0), Point::ORIGIN));
        let mut m = BacklashMeasurement::new(&rig.mount);

        let err = run(&mut rig, &mut m).unwrap_err();
        assert_eq!(
            err,
            GuideError::MeasurementInvalid {
                kind: MeasurementResult::BacklashNotCleared
            }
        );
        assert_eq!(count(&rig, GuideDirection::North), MAX_CLEARING_STEPS as usize);
        assert_eq!(m.result(), MeasurementResult::BacklashNotCleared);
    }

    #[test]
    fn needs_dec_calibration() {
        let mut rig = Rig::new(MountConfig::default(), field());
        let mut m = BacklashMeasurement::new(&rig.mount);
        assert_eq!(m.state(), MeasurementState::Aborted);
        assert!(m.status().contains("re-run your mount calibration"));

        let start = rig.position();
        assert_eq!(m.start(&mut rig.mount, 0.0, start), Err(GuideError::NotCalibrated));
        assert!(rig.pulses().is_empty());
    }

    #[test]
    fn stop_halts_and_is_terminal() {
        let mut rig = rig(field());
        let mut m = BacklashMeasurement::new(&rig.mount);
        let start = rig.position();
        m.start(&mut rig.mount, 0.0, start).unwrap();
        let current = rig.position();
        m.step(&mut rig.mount, current).unwrap();

        m.stop(&mut rig.mount);
        assert_eq!(m.state(), MeasurementState::Aborted);
        assert_eq!(m.status(), "Measurement halted");
        let pulses = rig.pulses().len();
        let current = rig.position();
        assert_eq!(m.step(&mut rig.mount, current).unwrap(), MeasurementState::Aborted);
        assert_eq!(rig.pulses().len(), pulses);
    }

    #[test]
    fn guiding_output_restored_after_run() {
        let mut rig = rig(field());
        rig.mount.set_guiding_enabled(false);
        let mut m = BacklashMeasurement::new(&rig.mount);
        assert_eq!(run(&mut rig, &mut m).unwrap(), MeasurementState::Completed);
        assert!(!rig.mount.guiding_enabled());

        // stopped mid-run
        let mut m = BacklashMeasurement::new(&rig.mount);
        let start = rig.position();
        m.start(&mut rig.mount, 0.0, start).unwrap();
        assert!(rig.mount.guiding_enabled());
        m.stop(&mut rig.mount);
        assert!(!rig.mount.guiding_enabled());

        // failed run
        let mut rig = self::rig(Field::new(Point::new(7.8125, 0.0), Point::ORIGIN));
        rig.mount.set_guiding_enabled(false);
        let mut m = BacklashMeasurement::new(&rig.mount);
        assert!(run(&mut rig, &mut m).is_err());
        assert!(!rig.mount.guiding_enabled());
    }

    #[test]
    fn enabled_guiding_stays_enabled() {
        let mut rig = rig(field());
        let mut m = BacklashMeasurement::new(&rig.mount);
        run(&mut rig, &mut m).unwrap();
        assert!(rig.mount.guiding_enabled());
    }
}
