//! Simulated equatorial mount.
//!
//! The star sits on a camera rotated by `camera_angle_deg` against the mount
//! axes. RA pulses move it along the West unit vector, Dec pulses along the
//! North unit vector. The Dec gear has slack: after each Dec reversal the
//! first `dec_backlash_ms` of pulse produce no motion.
//!
//! A meridian flip reverses the RA motion on the camera; the Dec motion
//! keeps its camera direction because the Dec axis flips with the tube.
//!
//! The mover and the pointing source handed to the core share one state
//! with the session driver, which reads the star position back each frame.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use guide_common::device::{AxisMover, GuideRates, PointingSource, SkyCoordinates};
use guide_common::geometry::Point;
use guide_common::guide::direction::{GuideAxis, GuideDirection, MoveOptions, PierSide};
use guide_common::guide::error::MoveFailure;
use tracing::{debug, trace};

use crate::config::SimParams;

#[derive(Debug)]
struct SimState {
    params: SimParams,
    star: Point,
    pier_side: PierSide,
    last_dec: Option<GuideDirection>,
    /// Dec slack still to take up [ms].
    slack_ms: u32,
    slewing: bool,
    pulse_count: u64,
}

impl SimState {
    /// Star motion per ms of West pulse [px].
    fn west(&self) -> Point {
        let angle = self.params.camera_angle_deg.to_radians();
        let rate = self.params.ra_rate_px_per_sec / 1000.0 * self.params.declination_deg.to_radians().cos();
        let flip = if self.pier_side == self.params.pier_side { 1.0 } else { -1.0 };
        Point::new(angle.cos(), angle.sin()) * (rate * flip)
    }

    /// Star motion per ms of North pulse [px].
    fn north(&self) -> Point {
        let angle = self.params.camera_angle_deg.to_radians();
        let rate = self.params.dec_rate_px_per_sec / 1000.0;
        Point::new(-angle.sin(), angle.cos()) * rate
    }

    fn pulse(&mut self, direction: GuideDirection, duration_ms: u32) {
        let mut effective = duration_ms;
        if direction.axis() == GuideAxis::Dec {
            if self.last_dec.is_some_and(|last| last != direction) {
                self.slack_ms = self.params.dec_backlash_ms;
            }
            self.last_dec = Some(direction);
            let taken = self.slack_ms.min(effective);
            self.slack_ms -= taken;
            effective -= taken;
        }

        let ms = f64::from(effective);
        let step = match direction {
            GuideDirection::West => self.west() * ms,
            GuideDirection::East => -(self.west() * ms),
            GuideDirection::North => self.north() * ms,
            GuideDirection::South => -(self.north() * ms),
        };
        self.star += step;
        self.pulse_count += 1;
        trace!(
            dir = %direction.as_char(),
            duration_ms,
            effective,
            x = self.star.x,
            y = self.star.y,
            "sim pulse"
        );
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Mount ──────────────────────────────────────────────────────────

/// Shared handle on the simulated mount.
#[derive(Debug, Clone)]
pub struct SimulatedMount {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedMount {
    pub fn new(params: &SimParams) -> Self {
        let state = SimState {
            star: Point::new(params.start_x, params.start_y),
            pier_side: params.pier_side,
            // gear starts engaged on the South side
            last_dec: (params.dec_backlash_ms > 0).then_some(GuideDirection::South),
            slack_ms: 0,
            slewing: false,
            pulse_count: 0,
            params: params.clone(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Pulse interface for the core.
    pub fn mover(&self) -> Box<dyn AxisMover> {
        Box::new(SimMover {
            state: Arc::clone(&self.state),
        })
    }

    /// Pointing interface for the core.
    pub fn pointing(&self) -> Box<dyn PointingSource> {
        Box::new(SimPointing {
            state: Arc::clone(&self.state),
        })
    }

    /// Current star position [camera px].
    pub fn star(&self) -> Point {
        lock(&self.state).star
    }

    pub fn set_star(&self, star: Point) {
        lock(&self.state).star = star;
    }

    pub fn pier_side(&self) -> PierSide {
        lock(&self.state).pier_side
    }

    pub fn pulse_count(&self) -> u64 {
        lock(&self.state).pulse_count
    }

    /// Let `ms` of time pass: the star drifts.
    pub fn elapse(&self, ms: u64) {
        let mut s = lock(&self.state);
        let minutes = ms as f64 / 60_000.0;
        let west = s.west();
        let north = s.north();
        let drift = west.unit().unwrap_or(Point::ORIGIN) * (s.params.drift_ra_px_per_min * minutes)
            + north.unit().unwrap_or(Point::ORIGIN) * (s.params.drift_dec_px_per_min * minutes);
        s.star += drift;
    }

    /// Move the tube to the other side of the pier.
    pub fn meridian_flip(&self) {
        let mut s = lock(&self.state);
        s.pier_side = s.pier_side.opposite();
        debug!(pier_side = ?s.pier_side, "sim meridian flip");
    }

    /// While set, every pulse is refused as slewing.
    pub fn set_slewing(&self, slewing: bool) {
        lock(&self.state).slewing = slewing;
    }
}

// ─── Capability handles ─────────────────────────────────────────────

struct SimMover {
    state: Arc<Mutex<SimState>>,
}

impl AxisMover for SimMover {
    fn name(&self) -> &str {
        "simulator"
    }

    fn pulse(&mut self, direction: GuideDirection, duration_ms: u32, _options: MoveOptions) -> Result<u32, MoveFailure> {
        let mut s = lock(&self.state);
        if s.slewing {
            return Err(MoveFailure::Slewing);
        }
        s.pulse(direction, duration_ms);
        Ok(duration_ms)
    }

    fn can_pulse_guide(&self) -> bool {
        lock(&self.state).params.can_pulse_guide
    }
}

struct SimPointing {
    state: Arc<Mutex<SimState>>,
}

impl PointingSource for SimPointing {
    fn coordinates(&self) -> Option<SkyCoordinates> {
        let s = lock(&self.state);
        Some(SkyCoordinates {
            ra_hours: s.params.ra_hours,
            dec_degrees: s.params.declination_deg,
        })
    }

    fn side_of_pier(&self) -> PierSide {
        lock(&self.state).pier_side
    }

    fn guide_rates(&self) -> Option<GuideRates> {
        let speed = lock(&self.state).params.guide_speed_deg_per_sec();
        Some(GuideRates { ra: speed, dec: speed })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
