//! Calibration state machine.
//!
//! Drives the mount West, back East, North (after clearing Dec backlash) and
//! back South, one pulse per frame, and derives axis angles, rates and guide
//! parities from the star's travel.
//!
//! ## Per-phase rules
//!
//! | Phase         | Pulse                          | Leaves when                                  |
//! |---------------|--------------------------------|----------------------------------------------|
//! | GoWest        | West, calibration duration     | travel ≥ calibration distance                |
//! | GoEast        | East, recenter pulse           | West duration fully returned                 |
//! | ClearBacklash | North, calibration duration    | 3 accepted moves, or attempts used up        |
//! | GoNorth       | North, calibration duration    | travel ≥ calibration distance                |
//! | GoSouth       | South, recenter pulse          | North duration fully returned                |
//! | NudgeSouth    | South, remaining Dec distance  | within 2 px of start, 3 nudges, wrong course |
//!
//! One `update()` may cross several phases before it issues the next pulse.
//! Any failure aborts the run and invalidates the mount calibration.

use std::f64::consts::{FRAC_PI_2, PI};

use guide_common::consts::{
    BL_BACKLASH_MIN_COUNT, BL_EXPECTED_STEP_SCALE, BL_MIN_CLEARING_DISTANCE_PX,
    BL_MIN_CLEARING_PULSES, EAST_ALERT_ANGLE_DEG, EAST_ALERT_DISTANCE_RATIO,
    MAX_CALIBRATION_STEPS, MAX_NUDGES, NUDGE_DIRECTION_TOLERANCE_DEG, NUDGE_TOLERANCE_PX,
    ONE_ARCSEC_DEGREES, ONE_ARCSEC_HOURS, RATE_UNCALIBRATED,
};
use guide_common::device::SkyCoordinates;
use guide_common::geometry::{Point, norm_angle};
use guide_common::guide::calibration::{Calibration, CalibrationDetails, CalibrationIssue};
use guide_common::guide::direction::{DecGuideMode, GuideAxis, GuideDirection, GuideParity, MoveOptions};
use guide_common::guide::error::GuideError;
use guide_common::notify::GuideEvent;
use tracing::{debug, info, warn};

use super::sanity::{self, SanityReport};
use super::{CalibrationState, persist};
use crate::mount::Mount;
use crate::transform;

const STAR_DID_NOT_MOVE: &str = "star did not move enough";
/// Share of the tracking box a South recenter pulse may cover.
const SOUTH_RECENTER_SCALE: f64 = 0.8;
const EAST_ADVISORY: &str = "Advisory: Little or no east movement was measured, so guiding will probably be \
                             impaired. Check the guide cable and use manual guide moves to confirm basic \
                             operation of the mount.";

enum Flow {
    /// A pulse was issued (or the run ended); wait for the next frame.
    Wait,
    /// Re-evaluate the same frame in another phase.
    Enter(CalibrationState),
}

fn ra_parity(start: Option<SkyCoordinates>, end: Option<SkyCoordinates>) -> GuideParity {
    match (start, end) {
        // westward motion decreases RA
        (Some(s), Some(e)) => {
            let dra = e.ra_hours - s.ra_hours;
            if dra < -ONE_ARCSEC_HOURS {
                GuideParity::Even
            } else if dra > ONE_ARCSEC_HOURS {
                GuideParity::Odd
            } else {
                GuideParity::Unknown
            }
        }
        _ => GuideParity::Unknown,
    }
}

fn dec_parity(start: Option<SkyCoordinates>, end: Option<SkyCoordinates>) -> GuideParity {
    match (start, end) {
        (Some(s), Some(e)) => {
            let ddec = e.dec_degrees - s.dec_degrees;
            if ddec > ONE_ARCSEC_DEGREES {
                GuideParity::Even
            } else if ddec < -ONE_ARCSEC_DEGREES {
                GuideParity::Odd
            } else {
                GuideParity::Unknown
            }
        }
        _ => GuideParity::Unknown,
    }
}

/// One calibration run against one mount.
#[derive(Debug, Clone)]
pub struct CalibrationEngine {
    state: CalibrationState,
    visited: Vec<CalibrationState>,
    cal: Calibration,
    details: CalibrationDetails,
    sanity: Option<SanityReport>,
    /// Calibration pulse [ms].
    duration: u32,
    dist_crit: f64,
    steps: u32,
    ra_steps: u32,
    dec_steps: u32,
    /// Lock position when the run began.
    initial: Point,
    /// Start of the current leg, set on the first frame.
    start: Option<Point>,
    start_coords: Option<SkyCoordinates>,
    east_start: Point,
    south_start: Point,
    recenter_remaining: u32,
    recenter_duration: u32,
    bl_marker: Point,
    bl_expected_step: f64,
    bl_max_pulses: u32,
    bl_last_cum_distance: f64,
    bl_accepted: u32,
    bl_distance_moved: f64,
    /// Unit vector of the North travel, pointing back to the start.
    north_unit: Point,
    total_south_amt: f64,
    east_alert_shown: bool,
}

impl CalibrationEngine {
    /// Start a run from the current lock position.
    ///
    /// Invalidates the mount calibration; the stored one is kept until the
    /// run completes.
    pub fn begin(mount: &mut Mount, lock_position: Point) -> Result<Self, GuideError> {
        if !mount.is_connected() {
            return Err(GuideError::NotConnected);
        }
        if !lock_position.is_finite() {
            return Err(GuideError::InvalidVector);
        }

        mount.clear_calibration();
        let config = mount.config();
        info!(
            mount = mount.name(),
            duration = config.calibration_duration_ms,
            distance = config.calibration_distance_px,
            dec_mode = ?config.dec_guide_mode,
            "calibration started"
        );

        Ok(Self {
            state: CalibrationState::GoWest,
            visited: vec![CalibrationState::Cleared, CalibrationState::GoWest],
            cal: Calibration::default(),
            details: CalibrationDetails::default(),
            sanity: None,
            duration: config.calibration_duration_ms.max(1),
            dist_crit: config.calibration_distance_px,
            steps: 0,
            ra_steps: 0,
            dec_steps: 0,
            initial: lock_position,
            start: None,
            start_coords: None,
            east_start: lock_position,
            south_start: lock_position,
            recenter_remaining: 0,
            recenter_duration: 0,
            bl_marker: lock_position,
            bl_expected_step: 0.0,
            bl_max_pulses: 0,
            bl_last_cum_distance: 0.0,
            bl_accepted: 0,
            bl_distance_moved: 0.0,
            north_unit: Point::ORIGIN,
            total_south_amt: 0.0,
            east_alert_shown: false,
        })
    }

    // ─── Accessors ──────────────────────────────────────────────────

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    /// Every phase entered so far, in order.
    pub fn visited(&self) -> &[CalibrationState] {
        &self.visited
    }

    pub fn details(&self) -> &CalibrationDetails {
        &self.details
    }

    /// Sanity outcome once the run completed.
    pub fn sanity(&self) -> Option<&SanityReport> {
        self.sanity.as_ref()
    }

    pub fn east_alert_shown(&self) -> bool {
        self.east_alert_shown
    }

    /// Steps of the current leg.
    pub fn steps(&self) -> u32 {
        self.steps
    }

    // ─── Driving ────────────────────────────────────────────────────

    /// Process one frame with the star at `current` [camera px].
    ///
    /// Terminal states ignore further frames.
    pub fn update(&mut self, mount: &mut Mount, current: Point) -> Result<CalibrationState, GuideError> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }
        let result = if current.is_finite() {
            self.advance(mount, current)
        } else {
            Err(GuideError::InvalidVector)
        };
        match result {
            Ok(()) => Ok(self.state),
            Err(e) => {
                self.fail(mount, &e);
                Err(e)
            }
        }
    }

    /// Stop the run. The mount is left uncalibrated.
    pub fn abort(&mut self, mount: &mut Mount) {
        if self.state.is_terminal() {
            return;
        }
        info!(phase = %self.state, "calibration aborted");
        self.enter(CalibrationState::Aborted);
        mount.clear_calibration();
    }

    fn fail(&mut self, mount: &mut Mount, error: &GuideError) {
        warn!(phase = %self.state, error = %error, "calibration failed");
        self.enter(CalibrationState::Aborted);
        mount.clear_calibration();
        mount.publish(GuideEvent::CalibrationFailed {
            message: error.to_string(),
        });
    }

    fn enter(&mut self, next: CalibrationState) {
        debug!(from = %self.state, to = %next, "calibration phase");
        self.state = next;
        self.visited.push(next);
    }

    fn advance(&mut self, mount: &mut Mount, current: Point) -> Result<(), GuideError> {
        if self.start.is_none() {
            self.start = Some(current);
            self.start_coords = mount.coordinates();
            debug!(x = current.x, y = current.y, coords = ?self.start_coords, "calibration starting location");
        }

        loop {
            let flow = match self.state {
                CalibrationState::GoWest => self.go_west(mount, current)?,
                CalibrationState::GoEast => self.go_east(mount, current)?,
                CalibrationState::ClearBacklash => self.clear_backlash(mount, current)?,
                CalibrationState::GoNorth => self.go_north(mount, current)?,
                CalibrationState::GoSouth => self.go_south(mount, current)?,
                CalibrationState::NudgeSouth => self.nudge_south(mount, current)?,
                CalibrationState::Complete => {
                    self.complete(mount)?;
                    Flow::Wait
                }
                CalibrationState::Cleared | CalibrationState::Aborted => Flow::Wait,
            };
            match flow {
                Flow::Wait => return Ok(()),
                Flow::Enter(next) => self.enter(next),
            }
        }
    }

    /// Offset of `current` from the leg start, and its length.
    fn leg(&self, current: Point) -> (Point, f64) {
        let start = self.start.unwrap_or(current);
        (start - current, start.distance(&current))
    }

    fn leg_start(&self, current: Point) -> Point {
        self.start.unwrap_or(current)
    }

    fn pulse(
        &mut self,
        mount: &mut Mount,
        direction: GuideDirection,
        duration: u32,
        step: u32,
        dist: f64,
        message: String,
    ) -> Result<Flow, GuideError> {
        debug!(phase = %self.state, step, dist, duration, "{message}");
        mount.publish(GuideEvent::CalibrationStep {
            phase: self.state.label().to_string(),
            step,
            dist,
            message,
        });
        mount.move_axis(direction, duration, MoveOptions::CALIBRATION_MOVE)?;
        Ok(Flow::Wait)
    }

    // ─── RA ─────────────────────────────────────────────────────────

    fn go_west(&mut self, mount: &mut Mount, current: Point) -> Result<Flow, GuideError> {
        let (delta, dist) = self.leg(current);
        self.details.ra_steps.push(delta);

        if dist < self.dist_crit {
            let taken = self.steps;
            self.steps += 1;
            if taken > MAX_CALIBRATION_STEPS {
                return Err(GuideError::CalibrationFailed {
                    axis: GuideAxis::Ra,
                    reason: STAR_DID_NOT_MOVE.to_string(),
                });
            }
            let message = format!("West step {:3}, dist={:4.1}", self.steps, dist);
            return self.pulse(mount, GuideDirection::West, self.duration, self.steps, dist, message);
        }

        let start = self.leg_start(current);
        let steps = self.steps.max(1);
        self.cal.x_angle = start.angle_from(&current);
        self.cal.x_rate = dist / (f64::from(steps) * f64::from(self.duration));
        self.cal.ra_guide_parity = ra_parity(self.start_coords, mount.coordinates());
        self.ra_steps = self.steps;
        info!(
            steps = self.steps,
            angle = self.cal.x_angle.to_degrees(),
            rate = self.cal.x_rate * 1000.0,
            parity = ?self.cal.ra_guide_parity,
            "West calibration complete"
        );

        self.recenter_remaining = steps * self.duration;
        self.recenter_duration = if mount.config().fast_recenter {
            let largest = (mount.guider().max_move_pixels / self.cal.x_rate).floor() as u32;
            largest.min(mount.max_ra_duration()).max(self.duration)
        } else {
            self.duration
        };
        self.steps = self.recenter_remaining.div_ceil(self.recenter_duration);
        self.east_start = current;
        Ok(Flow::Enter(CalibrationState::GoEast))
    }

    fn go_east(&mut self, mount: &mut Mount, current: Point) -> Result<Flow, GuideError> {
        let (delta, dist) = self.leg(current);
        self.details.ra_steps.push(delta);

        if self.recenter_remaining > 0 {
            let duration = self.recenter_duration.min(self.recenter_remaining);
            let step = self.steps;
            let message = format!("East step {step:3}, dist={dist:4.1}");
            self.recenter_remaining -= duration;
            self.steps = self.steps.saturating_sub(1);
            return self.pulse(mount, GuideDirection::East, duration, step, dist, message);
        }

        if !mount.can_pulse_guide() {
            let start = self.leg_start(current);
            let east_dist = self.east_start.distance(&current);
            let west_dist = start.distance(&self.east_start);
            let east_angle = self.east_start.angle_from(&current);
            if east_dist < EAST_ALERT_DISTANCE_RATIO * west_dist
                || norm_angle(east_angle - (self.cal.x_angle + PI)).abs() > EAST_ALERT_ANGLE_DEG.to_radians()
            {
                warn!(east_dist, west_dist, "calibration: little or no east movement");
                mount.publish(GuideEvent::Alert {
                    message: EAST_ADVISORY.to_string(),
                });
                self.east_alert_shown = true;
            }
        }

        self.steps = 0;
        self.start = Some(current);

        if mount.dec_guide_mode() == DecGuideMode::None {
            debug!("skipping Dec calibration, Dec guide mode is none");
            self.cal.y_angle = norm_angle(self.cal.x_angle + FRAC_PI_2);
            self.cal.y_rate = RATE_UNCALIBRATED;
            self.cal.dec_guide_parity = GuideParity::Unknown;
            return Ok(Flow::Enter(CalibrationState::Complete));
        }

        self.bl_marker = current;
        self.start_coords = mount.coordinates();
        let mut expected = self.cal.x_rate * f64::from(self.duration) * BL_EXPECTED_STEP_SCALE;
        if let Some(rates) = mount.guide_rates() {
            if rates.ra != 0.0 && rates.ra != rates.dec {
                expected *= rates.dec / rates.ra;
            }
        }
        self.bl_expected_step = expected;
        self.bl_max_pulses = BL_MIN_CLEARING_PULSES.max(mount.config().max_clearing_time_ms / self.duration);
        self.bl_last_cum_distance = 0.0;
        self.bl_accepted = 0;
        debug!(
            expected,
            max_attempts = self.bl_max_pulses,
            "backlash: looking for {BL_BACKLASH_MIN_COUNT} moves"
        );
        Ok(Flow::Enter(CalibrationState::ClearBacklash))
    }

    // ─── Dec ────────────────────────────────────────────────────────

    fn clear_backlash(&mut self, mount: &mut Mount, current: Point) -> Result<Flow, GuideError> {
        let (_, dist) = self.leg(current);
        let bl_delta = self.bl_marker.distance(&current);
        let bl_cum = dist;

        if self.steps == 0 {
            self.steps = 1;
            let message = "Clearing backlash step 1".to_string();
            return self.pulse(mount, GuideDirection::North, self.duration, 1, dist, message);
        }

        if bl_delta >= self.bl_expected_step {
            if self.bl_accepted == 0 || bl_cum > self.bl_last_cum_distance {
                self.bl_accepted += 1;
                debug!(bl_delta, accepted = self.bl_accepted, "backlash: accepted clearing move");
            } else {
                self.bl_accepted = 0;
                debug!(bl_delta, "backlash: rejected clearing move, direction reversal");
            }
        } else if bl_cum < self.bl_last_cum_distance {
            self.bl_accepted = 0;
            debug!(bl_delta, "backlash: rejected small direction reversal");
        } else {
            debug!(bl_delta, "backlash: rejected small move");
        }

        if self.bl_accepted < BL_BACKLASH_MIN_COUNT {
            if self.steps < self.bl_max_pulses && bl_cum < self.dist_crit {
                self.steps += 1;
                self.bl_marker = current;
                self.start_coords = mount.coordinates();
                self.bl_last_cum_distance = bl_cum;
                let message = format!("Clearing backlash step {:3}", self.steps);
                return self.pulse(mount, GuideDirection::North, self.duration, self.steps, dist, message);
            }
            if bl_cum < BL_MIN_CLEARING_DISTANCE_PX {
                return Err(GuideError::BacklashNotCleared);
            }
            debug!(bl_cum, "backlash: clearing limit reached but star moved enough, proceeding");
            self.steps = 0;
            self.start = Some(current);
        } else {
            // the last clearing move counts as North step 1
            self.details.dec_steps.push(Point::ORIGIN);
            self.steps = 1;
            self.start = Some(self.bl_marker);
            debug!("backlash: got {BL_BACKLASH_MIN_COUNT} acceptable moves, last one is North step 1");
        }

        self.bl_distance_moved = self.bl_marker.distance(&self.initial);
        debug!(
            marker_x = self.bl_marker.x,
            marker_y = self.bl_marker.y,
            offset = self.bl_distance_moved,
            "backlash: North calibration starts"
        );
        Ok(Flow::Enter(CalibrationState::GoNorth))
    }

    fn go_north(&mut self, mount: &mut Mount, current: Point) -> Result<Flow, GuideError> {
        let (delta, dist) = self.leg(current);
        self.details.dec_steps.push(delta);

        if dist < self.dist_crit {
            let taken = self.steps;
            self.steps += 1;
            if taken > MAX_CALIBRATION_STEPS {
                return Err(GuideError::CalibrationFailed {
                    axis: GuideAxis::Dec,
                    reason: STAR_DID_NOT_MOVE.to_string(),
                });
            }
            let message = format!("North step {:3}, dist={:4.1}", self.steps, dist);
            return self.pulse(mount, GuideDirection::North, self.duration, self.steps, dist, message);
        }

        let start = self.leg_start(current);
        let steps = self.steps.max(1);
        let total_ms = f64::from(steps) * f64::from(self.duration);
        let measured = current.angle_from(&start);
        if mount.config().assume_orthogonal {
            let a1 = norm_angle(self.cal.x_angle + FRAC_PI_2);
            let a2 = norm_angle(self.cal.x_angle - FRAC_PI_2);
            self.cal.y_angle = if norm_angle(a1 - measured).abs() < norm_angle(a2 - measured).abs() {
                a1
            } else {
                a2
            };
            let dec_dist = dist * (measured - self.cal.y_angle).cos();
            self.cal.y_rate = dec_dist / total_ms;
            debug!(
                measured = measured.to_degrees(),
                chosen = self.cal.y_angle.to_degrees(),
                dist,
                dec_dist,
                "assuming orthogonal axes"
            );
        } else {
            self.cal.y_angle = measured;
            self.cal.y_rate = dist / total_ms;
        }
        self.dec_steps = self.steps;
        self.cal.dec_guide_parity = dec_parity(self.start_coords, mount.coordinates());
        info!(
            steps = self.steps,
            angle = self.cal.y_angle.to_degrees(),
            rate = self.cal.y_rate * 1000.0,
            parity = ?self.cal.dec_guide_parity,
            "North calibration complete"
        );

        self.recenter_remaining = steps * self.duration;
        self.recenter_duration = if mount.config().fast_recenter {
            let largest = (SOUTH_RECENTER_SCALE * mount.guider().max_move_pixels / self.cal.y_rate).floor() as u32;
            largest.min(mount.max_dec_duration()).max(self.duration)
        } else {
            self.duration
        };
        self.steps = self.recenter_remaining.div_ceil(self.recenter_duration);
        self.south_start = current;
        Ok(Flow::Enter(CalibrationState::GoSouth))
    }

    fn go_south(&mut self, mount: &mut Mount, current: Point) -> Result<Flow, GuideError> {
        let (delta, dist) = self.leg(current);
        self.details.dec_steps.push(delta);

        if self.recenter_remaining > 0 {
            let duration = self.recenter_duration.min(self.recenter_remaining);
            let step = self.steps;
            let message = format!("South step {step:3}, dist={dist:4.1}");
            self.recenter_remaining -= duration;
            self.steps = self.steps.saturating_sub(1);
            return self.pulse(mount, GuideDirection::South, duration, step, dist, message);
        }

        let start = self.leg_start(current);
        let south_dist = self.south_start.distance(&current);
        let north_dist = start.distance(&self.south_start);
        let south_angle = current.angle_from(&self.south_start);
        if south_dist < EAST_ALERT_DISTANCE_RATIO * north_dist
            || norm_angle(south_angle - (self.cal.y_angle + PI)).abs() > EAST_ALERT_ANGLE_DEG.to_radians()
        {
            debug!(south_dist, north_dist, "calibration: little south movement measured");
        }

        self.north_unit = (self.initial - self.south_start).unit().unwrap_or(Point::ORIGIN);
        self.total_south_amt = transform::camera_to_mount(self.south_start - current, &self.cal)?.y;
        self.steps = 0;
        Ok(Flow::Enter(CalibrationState::NudgeSouth))
    }

    fn nudge_south(&mut self, mount: &mut Mount, current: Point) -> Result<Flow, GuideError> {
        let nudge_amt = current.distance(&self.initial);
        let nudge_dir = (current - self.initial).unit().unwrap_or(Point::ORIGIN);
        let theta = nudge_dir.dot(&self.north_unit).clamp(-1.0, 1.0).acos();
        debug!(theta = theta.to_degrees(), nudge_amt, "nudge");

        if (theta.to_degrees() - 180.0).abs() < NUDGE_DIRECTION_TOLERANCE_DEG {
            if self.steps < MAX_NUDGES
                && nudge_amt > NUDGE_TOLERANCE_PX
                && nudge_amt < self.dist_crit + self.bl_distance_moved
            {
                let dec_amt = transform::camera_to_mount(current - self.initial, &self.cal)?.y;
                debug!(dec_amt, south_total = self.total_south_amt, "south nudging");
                if dec_amt * self.total_south_amt > 0.0 {
                    let dec_amt = dec_amt.abs().min(mount.guider().max_move_pixels);
                    let pulse = ((dec_amt / self.cal.y_rate).floor() as u32).min(self.duration);
                    self.steps += 1;
                    let (_, dist) = self.leg(current);
                    let message = format!("Nudge South {:3}", self.steps);
                    return self.pulse(mount, GuideDirection::South, pulse, self.steps, dist, message);
                }
            }
        } else {
            debug!(theta = theta.to_degrees(), "nudging discontinued, wrong direction");
        }

        debug!(
            x = current.x,
            y = current.y,
            target_x = self.initial.x,
            target_y = self.initial.y,
            "final south nudging status"
        );
        Ok(Flow::Enter(CalibrationState::Complete))
    }

    // ─── Completion ─────────────────────────────────────────────────

    fn complete(&mut self, mount: &mut Mount) -> Result<(), GuideError> {
        let previous = persist::load_calibration(mount.store());
        let previous_details = mount.calibration_details();
        let pointing = mount.current_pointing();

        let mut cal = self.cal.clone();
        cal.declination = pointing.declination;
        cal.pier_side = pointing.pier_side;
        cal.rotator_angle = pointing.rotator_angle;
        cal.binning = pointing.binning;
        mount.set_calibration(&cal)?;

        let rates = mount.guide_rates();
        self.details.ra_step_count = self.ra_steps;
        self.details.dec_step_count = self.dec_steps;
        self.details.ra_guide_speed = rates.map(|r| r.ra);
        self.details.dec_guide_speed = rates.map(|r| r.dec);
        self.details.focal_length = mount.guider().focal_length_mm;
        self.details.image_scale = mount.guider().pixel_scale_arcsec;
        self.details.ortho_error = cal.ortho_error_degrees();
        self.details.orig_binning = pointing.binning;
        self.details.orig_timestamp = Some(mount.now_ms());
        self.details.orig_pier_side = pointing.pier_side;
        self.details.last_issue = CalibrationIssue::None;

        let report = sanity::check(
            mount.calibration(),
            &self.details,
            previous.as_ref(),
            &previous_details,
            mount.config().use_dec_compensation,
        );
        self.details.last_issue = report.issue;
        mount.save_calibration_details(&self.details);

        if report.is_clean() {
            debug!("calibration passed sanity checks");
        } else {
            warn!(issue = %report.issue, detail = %report.detail, "{}", report.issue.advisory());
            mount.publish(GuideEvent::CalibrationAdvisory {
                issue: report.issue,
                message: report.issue.advisory().to_string(),
            });
        }
        self.sanity = Some(report);

        info!(
            ra_steps = self.ra_steps,
            dec_steps = self.dec_steps,
            "calibration complete"
        );
        mount.publish(GuideEvent::CalibrationComplete {
            calibration: mount.calibration().clone(),
        });
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
