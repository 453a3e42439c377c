//! Per-frame guide pulse dispatch.
//!
//! [`GuidePulseDispatcher::move_offset`] turns one frame's star offset into
//! at most one RA and one Dec pulse:
//!
//! ```text
//! offset ─► camera→mount ─► BLC track (raw Dec) ─► algorithms ─► durations
//!                                                                  │
//!                  AxisMover ◄─ move_axis ◄─ BLC apply (Dec) ◄─────┘
//! ```
//!
//! Dead-reckoned moves (`ALGORITHM_DEDUCE`) skip the transform and take
//! their distances from the algorithms' estimate instead.
//!
//! A [`GuideStepInfo`] is recorded and published for every processed frame,
//! including frames whose moves failed.

use guide_common::device::GuideAlgorithm;
use guide_common::geometry::Point;
use guide_common::guide::direction::{GuideDirection, MoveOptions};
use guide_common::guide::error::GuideError;
use guide_common::guide::step::{GuideStepInfo, GuiderOffset, MoveOutcome};
use guide_common::notify::GuideEvent;
use tracing::{debug, info, trace};

use crate::algorithm::IdentityAlgorithm;
use crate::mount::Mount;

/// Milliseconds of pulse for `distance` px at `rate` px/ms.
#[inline]
fn pulse_ms(distance: f64, rate: f64) -> u32 {
    let ms = (distance / rate).abs().round();
    if ms.is_finite() { ms as u32 } else { 0 }
}

/// Per-frame pipeline from star offset to axis pulses.
pub struct GuidePulseDispatcher {
    ra_algorithm: Box<dyn GuideAlgorithm>,
    dec_algorithm: Box<dyn GuideAlgorithm>,
    frame_number: u64,
    guiding_started_ms: Option<u64>,
    paused: bool,
    last_step: Option<GuideStepInfo>,
}

impl std::fmt::Debug for GuidePulseDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuidePulseDispatcher")
            .field("ra_algorithm", &self.ra_algorithm.id())
            .field("dec_algorithm", &self.dec_algorithm.id())
            .field("frame_number", &self.frame_number)
            .field("paused", &self.paused)
            .finish_non_exhaustive()
    }
}

impl Default for GuidePulseDispatcher {
    fn default() -> Self {
        Self::new(Box::new(IdentityAlgorithm::new()), Box::new(IdentityAlgorithm::new()))
    }
}

impl GuidePulseDispatcher {
    pub fn new(ra_algorithm: Box<dyn GuideAlgorithm>, dec_algorithm: Box<dyn GuideAlgorithm>) -> Self {
        Self {
            ra_algorithm,
            dec_algorithm,
            frame_number: 0,
            guiding_started_ms: None,
            paused: false,
            last_step: None,
        }
    }

    pub fn ra_algorithm(&self) -> &dyn GuideAlgorithm {
        self.ra_algorithm.as_ref()
    }

    pub fn dec_algorithm(&self) -> &dyn GuideAlgorithm {
        self.dec_algorithm.as_ref()
    }

    pub fn set_ra_algorithm(&mut self, algorithm: Box<dyn GuideAlgorithm>) {
        debug!(from = self.ra_algorithm.id(), to = algorithm.id(), "RA algorithm changed");
        self.ra_algorithm = algorithm;
    }

    pub fn set_dec_algorithm(&mut self, algorithm: Box<dyn GuideAlgorithm>) {
        debug!(from = self.dec_algorithm.id(), to = algorithm.id(), "Dec algorithm changed");
        self.dec_algorithm = algorithm;
    }

    /// Frames processed since guiding started.
    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Telemetry of the most recent frame.
    pub fn last_step(&self) -> Option<&GuideStepInfo> {
        self.last_step.as_ref()
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Guiding (re)starts: adapt the calibration to the current pointing and
    /// reset all per-session state.
    pub fn guiding_started(&mut self, mount: &mut Mount) {
        let pointing = mount.current_pointing();
        mount.adjust_calibration_for_pointing(pointing);
        self.frame_number = 0;
        self.guiding_started_ms = Some(mount.now_ms());
        self.paused = false;
        self.last_step = None;
        self.ra_algorithm.guiding_started();
        self.dec_algorithm.guiding_started();
        mount.backlash_mut().reset_state();
        info!(
            mount = mount.name(),
            ra = self.ra_algorithm.id(),
            dec = self.dec_algorithm.id(),
            "guiding started"
        );
    }

    pub fn guiding_stopped(&mut self, mount: &mut Mount) {
        self.ra_algorithm.guiding_stopped();
        self.dec_algorithm.guiding_stopped();
        mount.backlash_mut().reset_state();
        self.guiding_started_ms = None;
        self.paused = false;
        info!(mount = mount.name(), frames = self.frame_number, "guiding stopped");
    }

    pub fn guiding_paused(&mut self) {
        self.paused = true;
        self.ra_algorithm.guiding_paused();
        self.dec_algorithm.guiding_paused();
        debug!("guiding paused");
    }

    pub fn guiding_resumed(&mut self) {
        self.paused = false;
        self.ra_algorithm.guiding_resumed();
        self.dec_algorithm.guiding_resumed();
        debug!("guiding resumed");
    }

    /// The lock position moved by `amount`; camera px unless `mount_coords`.
    pub fn guiding_dithered(&mut self, mount: &Mount, amount: Point, mount_coords: bool) -> Result<(), GuideError> {
        let mount_amount = if mount_coords {
            amount
        } else {
            mount.camera_to_mount(amount)?
        };
        debug!(ra = mount_amount.x, dec = mount_amount.y, "guiding dithered");
        self.ra_algorithm.guiding_dithered(mount_amount.x);
        self.dec_algorithm.guiding_dithered(mount_amount.y);
        Ok(())
    }

    /// Reset both algorithms' learned parameters.
    pub fn reset_algorithms(&mut self) {
        self.ra_algorithm.reset();
        self.dec_algorithm.reset();
    }

    // ─── Per-frame ──────────────────────────────────────────────────

    /// Process one frame's offset and issue the resulting pulses.
    ///
    /// A failed RA move that does not stop the step (anything but slewing
    /// or an AO limit) still lets the Dec move through; the first error is
    /// returned after the step has been recorded. Frames rejected before any
    /// move (uncalibrated mount, offset that cannot be transformed) are
    /// recorded with zero durations and a zero mount offset.
    pub fn move_offset(
        &mut self,
        mount: &mut Mount,
        offset: GuiderOffset,
        options: MoveOptions,
    ) -> Result<GuideStepInfo, GuideError> {
        let mut ofs = offset;
        let distances = if mount.is_calibrated() {
            self.guide_distances(mount, &mut ofs, options)
        } else {
            Err(GuideError::NotCalibrated)
        };
        let (x_distance, y_distance) = match distances {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, frame = self.frame_number + 1, "guide step rejected");
                ofs.mount = Some(Point::ORIGIN);
                let zero = MoveOutcome::default();
                self.record(mount, &ofs, options, (0.0, 0.0), zero, zero);
                return Err(e);
            }
        };

        let mut first_error = None;
        let mut x_move = MoveOutcome::default();
        let mut y_move = MoveOutcome::default();

        let deduced_nothing =
            options.contains(MoveOptions::ALGORITHM_DEDUCE) && x_distance == 0.0 && y_distance == 0.0;
        if !deduced_nothing {
            let x_direction = GuideDirection::from_ra_distance(x_distance);
            let x_amount = pulse_ms(x_distance, mount.x_rate());
            let stop = match mount.move_axis(x_direction, x_amount, options) {
                Ok(outcome) => {
                    x_move = outcome;
                    false
                }
                Err(e) => {
                    let stop = matches!(&e, GuideError::MoveError { cause } if cause.stops_step());
                    first_error = Some(e);
                    stop
                }
            };

            if !stop {
                let y_direction = GuideDirection::from_dec_distance(y_distance);
                let requested = pulse_ms(y_distance, mount.y_rate());
                let now = mount.now_ms();
                let y_amount = mount.backlash_mut().apply(options, y_distance, requested, now);
                match mount.move_axis(y_direction, y_amount, options) {
                    Ok(outcome) => y_move = outcome,
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        let info = self.record(mount, &ofs, options, (x_distance, y_distance), x_move, y_move);
        match first_error {
            Some(e) => Err(e),
            None => Ok(info),
        }
    }

    /// RA and Dec guide distances for one frame; fills in `ofs.mount`.
    fn guide_distances(
        &mut self,
        mount: &mut Mount,
        ofs: &mut GuiderOffset,
        options: MoveOptions,
    ) -> Result<(f64, f64), GuideError> {
        if options.contains(MoveOptions::ALGORITHM_DEDUCE) {
            let x = self.ra_algorithm.deduce_result();
            let y = self.dec_algorithm.deduce_result();
            ofs.mount = Some(Point::new(x, y));
            debug!(x, y, "dead-reckoning move");
            return Ok((x, y));
        }

        let mount_ofs = match ofs.mount {
            Some(m) if m.is_finite() => m,
            _ => mount.camera_to_mount(ofs.camera)?,
        };
        ofs.mount = Some(mount_ofs);
        trace!(
            camera_x = ofs.camera.x,
            camera_y = ofs.camera.y,
            x = mount_ofs.x,
            y = mount_ofs.y,
            "moving raw distances"
        );

        let now = mount.now_ms();
        let min_move = self.dec_algorithm.min_move();
        let y_rate = mount.y_rate();
        mount.backlash_mut().track(options, mount_ofs.y, min_move, y_rate, now);
        mount.sync_max_dec_duration();

        if options.contains(MoveOptions::ALGORITHM_RESULT) {
            Ok((
                self.ra_algorithm.result(mount_ofs.x),
                self.dec_algorithm.result(mount_ofs.y),
            ))
        } else {
            Ok((mount_ofs.x, mount_ofs.y))
        }
    }

    /// Number, remember and publish a processed frame.
    fn record(
        &mut self,
        mount: &Mount,
        ofs: &GuiderOffset,
        options: MoveOptions,
        (x_distance, y_distance): (f64, f64),
        x_move: MoveOutcome,
        y_move: MoveOutcome,
    ) -> GuideStepInfo {
        self.frame_number += 1;
        let time_ms = self
            .guiding_started_ms
            .map_or(0, |start| mount.now_ms().saturating_sub(start));
        let info = GuideStepInfo {
            frame_number: self.frame_number,
            time_ms,
            move_options: options,
            camera_offset: ofs.camera,
            mount_offset: ofs.mount.unwrap_or(Point::ORIGIN),
            guide_distance_ra: x_distance,
            guide_distance_dec: y_distance,
            duration_ra: x_move.amount_moved,
            direction_ra: GuideDirection::from_ra_distance(x_distance),
            duration_dec: y_move.amount_moved,
            direction_dec: GuideDirection::from_dec_distance(y_distance),
            ra_limited: x_move.limited,
            dec_limited: y_move.limited,
        };
        debug!(
            frame = info.frame_number,
            ra = %format_args!("{}{}", info.direction_ra.as_char(), info.duration_ra),
            dec = %format_args!("{}{}", info.direction_dec.as_char(), info.duration_dec),
            "guide step"
        );
        self.last_step = Some(info.clone());
        mount.publish(GuideEvent::Step(info.clone()));
        info
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
