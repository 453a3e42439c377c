//! Device capabilities consumed by the guiding core.
//!
//! This module defines:
//! - `AxisMover` trait - Executes timed guide pulses on a mount or AO unit
//! - `PointingSource` trait - Optional sky position / pier side / guide speed source
//! - `GuideAlgorithm` trait - Per-axis smoothing of raw guide distances
//! - `SkyCoordinates`, `GuideRates` - Values reported by a pointing source
//!
//! Concrete transports (ST4, ASCOM, INDI) and concrete smoothing algorithms
//! live outside the core; the simulator crate and the tests provide the
//! in-tree implementations.

use serde::{Deserialize, Serialize};

use crate::guide::direction::{GuideDirection, MoveOptions, PierSide};
use crate::guide::error::MoveFailure;

// ─── Axis Mover ─────────────────────────────────────────────────────

/// Executes guide pulses on one physical axis set.
///
/// The core serializes calls: at most one pulse is outstanding per mover, and
/// a pulse is treated as completed when `pulse()` returns.
///
/// # Contract
///
/// | Call | Caller guarantees | Mover returns |
/// |------|-------------------|---------------|
/// | `pulse()` | `duration_ms > 0` | Duration actually executed |
/// | `pulse()` while slewing | - | `MoveFailure::Slewing` |
/// | `pulse()` past AO travel | - | `MoveFailure::AoLimitReached` |
pub trait AxisMover: Send {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool {
        true
    }

    /// Issue one pulse.
    ///
    /// `options` is `MoveOptions::CALIBRATION_MOVE` for calibration and
    /// measurement pulses so hardware-side compensation can be bypassed.
    fn pulse(
        &mut self,
        direction: GuideDirection,
        duration_ms: u32,
        options: MoveOptions,
    ) -> Result<u32, MoveFailure>;

    /// False for transports that cannot pulse-guide (e.g. relay-only ST4
    /// emulation). Enables the cable/mechanics advisory during calibration.
    fn can_pulse_guide(&self) -> bool {
        true
    }
}

// ─── Pointing Source ────────────────────────────────────────────────

/// Equatorial position of the mount.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SkyCoordinates {
    /// Right ascension [hours].
    pub ra_hours: f64,
    /// Declination [deg].
    pub dec_degrees: f64,
}

/// Mount guide speeds [deg/s].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GuideRates {
    pub ra: f64,
    pub dec: f64,
}

/// Optional source of pointing information.
pub trait PointingSource: Send {
    /// Current position, `None` when unavailable.
    fn coordinates(&self) -> Option<SkyCoordinates>;

    fn side_of_pier(&self) -> PierSide {
        PierSide::Unknown
    }

    /// Guide speeds, `None` when the mount cannot report them.
    fn guide_rates(&self) -> Option<GuideRates> {
        None
    }

    /// Declination [rad], `None` when unavailable.
    fn declination(&self) -> Option<f64> {
        self.coordinates().map(|c| c.dec_degrees.to_radians())
    }

    /// Rotator position [deg], `None` without a rotator.
    fn rotator_angle(&self) -> Option<f64> {
        None
    }
}

// ─── Guide Algorithm ────────────────────────────────────────────────

/// Per-axis guide algorithm.
///
/// Receives the raw mount-space distance for its axis and returns the
/// correction to issue. Lifecycle hooks default to no-ops.
pub trait GuideAlgorithm: Send {
    /// Stable identifier (e.g. `"identity"`, `"hysteresis"`).
    fn id(&self) -> &'static str;

    /// Corrected distance for a raw measured distance [px].
    fn result(&mut self, distance: f64) -> f64;

    /// Dead-reckoned distance when no star measurement exists [px].
    fn deduce_result(&mut self) -> f64 {
        0.0
    }

    fn guiding_started(&mut self) {}
    fn guiding_stopped(&mut self) {}
    fn guiding_paused(&mut self) {}
    fn guiding_resumed(&mut self) {}

    /// Lock position moved by `amount` [px] on this axis.
    fn guiding_dithered(&mut self, _amount: f64) {}

    /// Drop accumulated state.
    fn reset(&mut self);

    /// Smallest distance the algorithm acts on [px], `None` if unbounded.
    fn min_move(&self) -> Option<f64> {
        None
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
