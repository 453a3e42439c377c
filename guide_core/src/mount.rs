//! Mount axis supervision and calibration ownership.
//!
//! A [`Mount`] wraps one [`AxisMover`] (a telescope mount or an AO unit) and
//! owns everything that is specific to that axis set: the active
//! [`Calibration`], the Dec-compensated RA rate, the Dec backlash compensator
//! and the per-axis limit supervision.
//!
//! ## Move supervision
//!
//! | Condition                                  | Effect                              |
//! |--------------------------------------------|-------------------------------------|
//! | Guiding disabled, move not `MANUAL`        | `GuidingDisabled`, nothing issued   |
//! | Algorithm move, Dec mode disallows dir     | Dec duration forced to 0            |
//! | Algorithm move above max duration          | Clamped, `limited = true`           |
//! | Clamped in the same direction repeatedly   | `LimitReached` advisory (30 s gap)  |
//! | Duration 0                                 | Mover not called                    |
//!
//! Calibration and measurement moves (`CALIBRATION_MOVE`) are never clamped.

use std::sync::Arc;

use guide_common::clock::Clock;
use guide_common::consts::{
    DEC_COMP_LIMIT, DEC_COMP_MAX_DECLINATION_DEG, DEFAULT_MAX_DEC_DURATION_MS,
    DEFAULT_MAX_RA_DURATION_MS, LIMIT_REACHED_ALERT_INTERVAL_MS, LIMIT_REACHED_WARN_COUNT,
    MAX_DURATION_MAX,
};
use guide_common::device::{AxisMover, GuideRates, PointingSource, SkyCoordinates};
use guide_common::geometry::{Point, norm_angle};
use guide_common::guide::calibration::{Calibration, CalibrationDetails};
use guide_common::guide::config::{GuiderConfig, MountConfig};
use guide_common::guide::direction::{
    DecGuideMode, GuideAxis, GuideDirection, GuideParity, MoveOptions, PierSide,
};
use guide_common::guide::error::GuideError;
use guide_common::guide::step::MoveOutcome;
use guide_common::notify::{GuideEvent, GuideEventSink};
use guide_common::store::{KeyValueStore, ScopedStore, StoreError};
use tracing::{debug, info, trace, warn};

use crate::backlash::BacklashComp;
use crate::calibration::persist;
use crate::transform;

/// Guide speed change that invalidates a calibration (ratio).
const GUIDE_SPEED_TOLERANCE: f64 = 0.05;
/// Rotator movement below this is ignored [deg].
const ROTATOR_TOLERANCE_DEG: f64 = 0.05;

// ─── Context ────────────────────────────────────────────────────────

/// Shared capabilities injected into a mount.
#[derive(Clone)]
pub struct MountContext {
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub sink: Arc<dyn GuideEventSink>,
}

impl MountContext {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn GuideEventSink>,
    ) -> Self {
        Self { store, clock, sink }
    }
}

/// Where the telescope points when guiding (re)starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScopePointing {
    /// Declination [rad].
    pub declination: Option<f64>,
    pub pier_side: PierSide,
    pub binning: u16,
    /// Rotator position [deg].
    pub rotator_angle: Option<f64>,
}

/// Consecutive clamps in one direction on one axis.
#[derive(Debug, Clone, Copy, Default)]
struct LimitTracker {
    count: u32,
    direction: Option<GuideDirection>,
}

impl LimitTracker {
    /// Record one algorithm move, returns true when an advisory is due.
    fn observe(&mut self, direction: GuideDirection, limited: bool) -> bool {
        let mut due = false;
        if limited && self.direction == Some(direction) {
            self.count += 1;
            due = self.count >= LIMIT_REACHED_WARN_COUNT;
        } else {
            self.count = 0;
        }
        self.direction = limited.then_some(direction);
        due
    }
}

// ─── Mount ──────────────────────────────────────────────────────────

/// One guided axis set.
pub struct Mount {
    config: MountConfig,
    guider: GuiderConfig,
    mover: Box<dyn AxisMover>,
    pointing: Option<Box<dyn PointingSource>>,
    store: ScopedStore,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn GuideEventSink>,
    calibration: Calibration,
    /// RA rate after Dec compensation [px/ms].
    x_rate: f64,
    guiding_enabled: bool,
    max_dec_duration: u32,
    ra_limit: LimitTracker,
    dec_limit: LimitTracker,
    last_limit_alert_ms: Option<u64>,
    blc: BacklashComp,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("mover", &self.mover.name())
            .field("calibration", &self.calibration)
            .field("x_rate", &self.x_rate)
            .field("guiding_enabled", &self.guiding_enabled)
            .field("blc", &self.blc)
            .finish_non_exhaustive()
    }
}

impl Mount {
    /// Build a mount. A previously persisted calibration is loaded when present.
    pub fn new(
        config: MountConfig,
        guider: GuiderConfig,
        mover: Box<dyn AxisMover>,
        ctx: MountContext,
    ) -> Self {
        let store = ScopedStore::new(ctx.store, &config.class_name);
        let blc = BacklashComp::new(
            store.clone(),
            &config.backlash,
            ctx.sink.clone(),
            ctx.clock.now_ms(),
        );
        let max_dec_duration = config.max_dec_duration_ms;

        let mut mount = Self {
            config,
            guider,
            mover,
            pointing: None,
            store,
            clock: ctx.clock,
            sink: ctx.sink,
            calibration: Calibration::default(),
            x_rate: 1.0,
            guiding_enabled: true,
            max_dec_duration,
            ra_limit: LimitTracker::default(),
            dec_limit: LimitTracker::default(),
            last_limit_alert_ms: None,
            blc,
        };
        if !mount.config.dec_guide_mode.is_bidirectional() && mount.blc.is_active() {
            mount.blc.enable(false);
        }
        mount.sync_max_dec_duration();
        mount.load_calibration();
        mount
    }

    /// Attach a pointing source (sky position, pier side, guide speeds).
    pub fn with_pointing(mut self, pointing: Box<dyn PointingSource>) -> Self {
        self.pointing = Some(pointing);
        self
    }

    // ─── Accessors ──────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        self.mover.name()
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn guider(&self) -> &GuiderConfig {
        &self.guider
    }

    pub fn guider_mut(&mut self) -> &mut GuiderConfig {
        &mut self.guider
    }

    pub fn store(&self) -> &ScopedStore {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn sink(&self) -> &Arc<dyn GuideEventSink> {
        &self.sink
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn publish(&self, event: GuideEvent) {
        self.sink.publish(event);
    }

    pub fn is_connected(&self) -> bool {
        self.mover.is_connected()
    }

    pub fn can_pulse_guide(&self) -> bool {
        self.mover.can_pulse_guide()
    }

    #[inline]
    pub fn is_calibrated(&self) -> bool {
        self.calibration.is_valid
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// RA rate with Dec compensation applied [px/ms].
    #[inline]
    pub fn x_rate(&self) -> f64 {
        self.x_rate
    }

    #[inline]
    pub fn y_rate(&self) -> f64 {
        self.calibration.y_rate
    }

    pub fn dec_guide_mode(&self) -> DecGuideMode {
        self.config.dec_guide_mode
    }

    pub fn max_ra_duration(&self) -> u32 {
        self.config.max_ra_duration_ms
    }

    /// Effective Dec ceiling, never below an active backlash pulse.
    pub fn max_dec_duration(&self) -> u32 {
        self.max_dec_duration
    }

    pub fn guiding_enabled(&self) -> bool {
        self.guiding_enabled
    }

    pub fn set_guiding_enabled(&mut self, enabled: bool) {
        if enabled != self.guiding_enabled {
            info!(mount = self.mover.name(), enabled, "guiding output changed");
        }
        self.guiding_enabled = enabled;
    }

    pub fn backlash(&self) -> &BacklashComp {
        &self.blc
    }

    pub fn backlash_mut(&mut self) -> &mut BacklashComp {
        &mut self.blc
    }

    // ─── Pointing ───────────────────────────────────────────────────

    pub fn coordinates(&self) -> Option<SkyCoordinates> {
        self.pointing.as_ref().and_then(|p| p.coordinates())
    }

    pub fn guide_rates(&self) -> Option<GuideRates> {
        self.pointing.as_ref().and_then(|p| p.guide_rates())
    }

    /// Current pointing as seen by the attached source and the guider.
    pub fn current_pointing(&self) -> ScopePointing {
        match &self.pointing {
            Some(p) => ScopePointing {
                declination: p.declination(),
                pier_side: p.side_of_pier(),
                binning: self.guider.binning,
                rotator_angle: p.rotator_angle(),
            },
            None => ScopePointing {
                declination: None,
                pier_side: PierSide::Unknown,
                binning: self.guider.binning,
                rotator_angle: None,
            },
        }
    }

    // ─── Transforms ─────────────────────────────────────────────────

    pub fn camera_to_mount(&self, camera: Point) -> Result<Point, GuideError> {
        transform::camera_to_mount(camera, &self.calibration)
    }

    pub fn mount_to_camera(&self, mount: Point) -> Result<Point, GuideError> {
        transform::mount_to_camera(mount, &self.calibration)
    }

    // ─── Axis moves ─────────────────────────────────────────────────

    /// Issue one pulse on one axis.
    pub fn move_axis(
        &mut self,
        direction: GuideDirection,
        duration_ms: u32,
        options: MoveOptions,
    ) -> Result<MoveOutcome, GuideError> {
        trace!(dir = %direction.as_char(), duration_ms, options = options.bits(), "move_axis");

        if !self.guiding_enabled && !options.contains(MoveOptions::MANUAL) {
            return Err(GuideError::GuidingDisabled);
        }
        if !self.mover.is_connected() {
            return Err(GuideError::NotConnected);
        }

        let axis = direction.axis();
        let mut duration = duration_ms;
        let mut limited = false;

        if options.is_algorithm_move() {
            if axis == GuideAxis::Dec && !self.config.dec_guide_mode.allows(direction) {
                debug!(mode = ?self.config.dec_guide_mode, dir = %direction, "Dec move suppressed by guide mode");
                duration = 0;
            }
            let max = match axis {
                GuideAxis::Ra => self.config.max_ra_duration_ms,
                GuideAxis::Dec => self.max_dec_duration,
            };
            if duration > max {
                debug!(duration, max, axis = %axis, "duration clamped by max duration");
                duration = max;
                limited = true;
            }
            let tracker = match axis {
                GuideAxis::Ra => &mut self.ra_limit,
                GuideAxis::Dec => &mut self.dec_limit,
            };
            if tracker.observe(direction, limited) {
                self.alert_limit_reached(duration, axis);
            }
        }

        if duration == 0 {
            return Ok(MoveOutcome {
                amount_moved: 0,
                limited,
            });
        }

        match self.mover.pulse(direction, duration, options) {
            Ok(amount_moved) => Ok(MoveOutcome {
                amount_moved,
                limited,
            }),
            Err(cause) => {
                warn!(mount = self.mover.name(), dir = %direction, error = %cause, "guide pulse failed");
                Err(cause.into())
            }
        }
    }

    fn alert_limit_reached(&mut self, duration: u32, axis: GuideAxis) {
        let now = self.clock.now_ms();
        if self
            .last_limit_alert_ms
            .is_some_and(|last| now < last + LIMIT_REACHED_ALERT_INTERVAL_MS)
        {
            return;
        }
        self.last_limit_alert_ms = Some(now);

        let message = limit_reached_message(duration, axis, self.mover.can_pulse_guide());
        warn!(axis = %axis, duration, "{message}");
        self.sink.publish(GuideEvent::LimitReached { axis, message });
    }

    // ─── Dec guide mode ─────────────────────────────────────────────

    /// Change the Dec guide mode. Backlash compensation only runs in `Auto`.
    pub fn set_dec_guide_mode(&mut self, mode: DecGuideMode) {
        if mode == self.config.dec_guide_mode {
            return;
        }
        info!(from = ?self.config.dec_guide_mode, to = ?mode, "Dec guide mode changed");
        self.config.dec_guide_mode = mode;
        if mode.is_bidirectional() {
            self.blc.reset_state();
        } else {
            self.blc.enable(false);
        }
        self.sync_max_dec_duration();
    }

    // ─── Backlash comp ──────────────────────────────────────────────

    /// Change the compensation pulse and bounds.
    pub fn set_backlash_pulse(&mut self, ms: u32, floor: u32, ceiling: u32) {
        self.blc.set_pulse_width(ms, floor, ceiling);
        self.sync_max_dec_duration();
    }

    /// Enable or disable compensation. Refused outside `Auto` Dec mode.
    pub fn enable_backlash_comp(&mut self, enable: bool) {
        if enable && !self.config.dec_guide_mode.is_bidirectional() {
            debug!("BLC: not enabled, Dec guide mode is not auto");
            return;
        }
        self.blc.enable(enable);
        self.sync_max_dec_duration();
    }

    /// Keep the Dec ceiling large enough for the compensation pulse.
    pub(crate) fn sync_max_dec_duration(&mut self) {
        let required = self.blc.required_max_dec_duration().unwrap_or(0);
        let max = self.config.max_dec_duration_ms.max(required).min(MAX_DURATION_MAX);
        if max != self.max_dec_duration {
            debug!(from = self.max_dec_duration, to = max, "max Dec duration adjusted");
            self.max_dec_duration = max;
        }
    }

    // ─── Calibration ────────────────────────────────────────────────

    /// Persist and install a calibration.
    ///
    /// `Unchanged` parities keep the previous value; the timestamp is set to
    /// now. When the store rejects the write the previous calibration stays
    /// in place.
    pub fn set_calibration(&mut self, cal: &Calibration) -> Result<(), StoreError> {
        let mut next = cal.clone();
        if next.ra_guide_parity == GuideParity::Unchanged {
            next.ra_guide_parity = self.calibration.ra_guide_parity;
        }
        if next.dec_guide_parity == GuideParity::Unchanged {
            next.dec_guide_parity = self.calibration.dec_guide_parity;
        }
        let now = self.clock.now_ms();
        next.is_valid = true;
        next.timestamp = Some(now);

        info!(
            mount = self.mover.name(),
            x_angle = next.x_angle.to_degrees(),
            y_angle = next.y_angle.to_degrees(),
            x_rate = next.x_rate * 1000.0,
            y_rate = next.y_rate * 1000.0,
            pier_side = ?next.pier_side,
            "calibration set"
        );
        if let Err(e) = persist::save_calibration(&self.store, &next, now) {
            warn!(error = %e, "failed to persist calibration");
            return Err(e);
        }
        self.x_rate = next.x_rate;
        self.calibration = next;
        Ok(())
    }

    /// Pointing adjustments apply for this session even when the profile
    /// cannot be updated.
    fn set_adjusted_calibration(&mut self, cal: &Calibration) {
        if self.set_calibration(cal).is_err() {
            let mut next = cal.clone();
            next.is_valid = true;
            self.x_rate = next.x_rate;
            self.calibration = next;
        }
    }

    /// Invalidate the in-memory calibration. The stored copy is kept.
    pub fn clear_calibration(&mut self) {
        if self.calibration.is_valid {
            debug!(mount = self.mover.name(), "calibration cleared");
        }
        self.calibration.is_valid = false;
    }

    /// Reload the persisted calibration; false when none was stored.
    pub fn load_calibration(&mut self) -> bool {
        match persist::load_calibration(&self.store) {
            Some(cal) => {
                debug!(mount = self.mover.name(), timestamp = ?cal.timestamp, "calibration loaded");
                self.x_rate = cal.x_rate;
                self.calibration = cal;
                true
            }
            None => false,
        }
    }

    pub fn calibration_details(&self) -> CalibrationDetails {
        persist::load_details(&self.store)
    }

    pub fn save_calibration_details(&self, details: &CalibrationDetails) {
        if let Err(e) = persist::save_details(&self.store, details) {
            warn!(error = %e, "failed to persist calibration details");
        }
    }

    /// Rotate the calibration for the other side of the pier.
    pub fn flip_calibration(&mut self) -> Result<(), GuideError> {
        if !self.is_calibrated() {
            return Err(GuideError::NotCalibrated);
        }

        let orig = self.calibration.clone();
        let dec_flip = self.config.calibration_flip_requires_dec_flip;

        let mut cal = orig.clone();
        cal.x_angle = norm_angle(orig.x_angle + std::f64::consts::PI);
        cal.y_angle = if dec_flip {
            norm_angle(orig.y_angle + std::f64::consts::PI)
        } else {
            norm_angle(orig.y_angle)
        };
        cal.pier_side = orig.pier_side.opposite();
        cal.dec_guide_parity = if dec_flip {
            orig.dec_guide_parity
        } else {
            orig.dec_guide_parity.opposite()
        };

        debug!(
            dec_flip,
            x_before = orig.x_angle.to_degrees(),
            y_before = orig.y_angle.to_degrees(),
            x_after = cal.x_angle.to_degrees(),
            y_after = cal.y_angle.to_degrees(),
            "flip calibration"
        );
        self.set_calibration(&cal)?;
        info!(
            "CAL: {:?}({:.0},{:.0})->{:?}({:.0},{:.0})",
            orig.pier_side,
            orig.x_angle.to_degrees(),
            orig.y_angle.to_degrees(),
            cal.pier_side,
            cal.x_angle.to_degrees(),
            cal.y_angle.to_degrees()
        );
        Ok(())
    }

    fn alert(&self, message: &str) {
        warn!("{message}");
        self.sink.publish(GuideEvent::Alert {
            message: message.to_string(),
        });
    }

    /// Adapt the calibration to where the telescope points now.
    ///
    /// Called when guiding starts. Rescales for binning, flips for the pier
    /// side, rotates for the rotator and compensates the RA rate for
    /// declination.
    pub fn adjust_calibration_for_pointing(&mut self, pointing: ScopePointing) {
        debug!(
            mount = self.mover.name(),
            dec = ?pointing.declination.map(f64::to_degrees),
            pier_side = ?pointing.pier_side,
            cal_dec = ?self.calibration.declination.map(f64::to_degrees),
            cal_pier_side = ?self.calibration.pier_side,
            binning = pointing.binning,
            "adjust calibration for scope pointing"
        );

        self.check_guide_speeds();

        if pointing.pier_side != PierSide::Unknown && self.calibration.pier_side == PierSide::Unknown {
            self.alert(
                "Current calibration did not have side-of-pier information, so meridian flips cannot be \
                 corrected automatically. Do a fresh calibration to correct this problem.",
            );
        }

        if pointing.binning != self.calibration.binning && self.calibration.is_valid {
            let mut cal = self.calibration.clone();
            let adj = f64::from(self.calibration.binning) / f64::from(pointing.binning.max(1));
            cal.x_rate *= adj;
            cal.y_rate *= adj;
            cal.binning = pointing.binning;
            debug!(
                from = self.calibration.binning,
                to = pointing.binning,
                x_rate = cal.x_rate * 1000.0,
                y_rate = cal.y_rate * 1000.0,
                "binning changed, rates rescaled"
            );
            self.set_adjusted_calibration(&cal);
        }

        let opposite_side = pointing.pier_side != PierSide::Unknown
            && self.calibration.pier_side != PierSide::Unknown
            && pointing.pier_side != self.calibration.pier_side;
        if opposite_side {
            debug!(
                cal_side = ?self.calibration.pier_side,
                side = ?pointing.pier_side,
                "guiding starts on the opposite side of the pier"
            );
            if let Err(e) = self.flip_calibration() {
                warn!(error = %e, "calibration flip skipped");
            }
        }

        if let Some(rotator) = pointing.rotator_angle {
            match self.calibration.rotator_angle {
                None => {
                    self.alert("Rotator position has changed, recalibration is needed.");
                    self.calibration.rotator_angle = Some(rotator);
                }
                Some(cal_rotator) => {
                    let delta = rotator - cal_rotator;
                    if delta.abs() > ROTATOR_TOLERANCE_DEG {
                        debug!(rotator, prev = cal_rotator, delta, "rotator moved");
                        let da = delta.to_radians();
                        let mut cal = self.calibration.clone();
                        cal.x_angle = norm_angle(cal.x_angle - da);
                        cal.y_angle = norm_angle(cal.y_angle - da);
                        cal.rotator_angle = Some(rotator);
                        self.set_adjusted_calibration(&cal);
                    }
                }
            }
        }

        self.x_rate = self.calibration.x_rate;
        if let (Some(dec), Some(cal_dec)) = (pointing.declination, self.calibration.declination) {
            if dec != cal_dec {
                if cal_dec.abs() > DEC_COMP_LIMIT {
                    debug!("skipping Dec comp: calibration too far from equator");
                    self.alert("Calibration was too far from equator, recalibration is needed.");
                } else if !self.config.use_dec_compensation {
                    debug!("skipping Dec comp: Dec comp not enabled");
                } else {
                    let limit = DEC_COMP_MAX_DECLINATION_DEG.to_radians();
                    let dec = dec.clamp(-limit, limit);
                    self.x_rate = self.calibration.x_rate / cal_dec.cos() * dec.cos();
                    debug!(
                        dec = dec.to_degrees(),
                        cal_dec = cal_dec.to_degrees(),
                        x_rate = self.x_rate * 1000.0,
                        "Dec comp applied"
                    );
                }
            }
        }
    }

    fn check_guide_speeds(&self) {
        let Some(current) = self.guide_rates() else {
            return;
        };
        let details = self.calibration_details();
        let (Some(ra), Some(dec)) = (details.ra_guide_speed, details.dec_guide_speed) else {
            return;
        };
        if (1.0 - current.ra / ra).abs() > GUIDE_SPEED_TOLERANCE
            || (1.0 - current.dec / dec).abs() > GUIDE_SPEED_TOLERANCE
        {
            debug!(
                orig_ra = ra * 3600.0,
                orig_dec = dec * 3600.0,
                ra = current.ra * 3600.0,
                dec = current.dec * 3600.0,
                "guide speeds changed since calibration [arc-sec/s]"
            );
            self.alert(
                "Mount guide speeds are different from those used in last calibration. Do a new \
                 calibration or reset mount guide speed settings to previous values.",
            );
        }
    }
}

fn limit_reached_message(duration: u32, axis: GuideAxis, can_pulse_guide: bool) -> String {
    if duration >= MAX_DURATION_MAX {
        return format!(
            "Even using the maximum moves, the guider can't properly correct for the large guide star \
             movements in {axis}. Guiding will be impaired until you can eliminate the source of these problems."
        );
    }

    let default = match axis {
        GuideAxis::Ra => DEFAULT_MAX_RA_DURATION_MS,
        GuideAxis::Dec => DEFAULT_MAX_DEC_DURATION_MS,
    };
    if duration < default {
        let setting = format!("Max {axis} Duration setting");
        return format!(
            "Your {setting} is preventing adequate corrections to keep the guide star locked. \
             Try restoring {setting} to its default value to allow larger corrections."
        );
    }

    let hint = if can_pulse_guide {
        "check for problems with the mount mechanics"
    } else {
        "confirm the ST-4 cable is working properly"
    };
    match axis {
        GuideAxis::Ra => format!(
            "Unable to make sufficient corrections in RA. Check for cable snags, try re-doing your \
             calibration, and {hint}."
        ),
        GuideAxis::Dec => format!(
            "Unable to make sufficient corrections in Dec. If the side-of-pier has changed since \
             calibration, check the Dec output reversal setting and recalibrate. Otherwise, check for \
             cable snags, try re-doing your calibration, and {hint}."
        ),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
