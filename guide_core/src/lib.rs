//! Guide Core Library
//!
//! Mount-side logic of a telescope autoguider: turning star offsets measured
//! on the guide camera into timed guide pulses on the RA and Dec axes.
//!
//! # Module Structure
//!
//! - [`mount`] - Mount state, calibration ownership, single-axis moves
//! - [`transform`] - Camera ↔ mount vector transform
//! - [`calibration`] - Calibration state machine, sanity checks, persistence
//! - [`backlash`] - Dec backlash compensation and its event history
//! - [`dispatch`] - Per-frame offset → pulse pipeline
//! - [`measurement`] - Dec backlash measurement experiment
//! - [`algorithm`] - Built-in guide algorithms
//! - [`stats`] - Sample statistics used by measurement and tuning
//!
//! # Frame flow
//!
//! ```text
//! camera offset ──► camera_to_mount ──► backlash tracking ──► RA / Dec algorithm
//!                                                                  │
//!   GuideEvent::Step ◄── record ◄── move_axis(West|East, North|South) ◄─┘
//! ```
//!
//! Calibration and backlash measurement drive the same mount one frame at a
//! time; the caller feeds each new star position and the engine answers with
//! its next state.

pub mod algorithm;
pub mod backlash;
pub mod calibration;
pub mod dispatch;
pub mod measurement;
pub mod mount;
pub mod stats;
pub mod transform;

#[cfg(test)]
mod testing;

pub use algorithm::IdentityAlgorithm;
pub use backlash::BacklashComp;
pub use calibration::{CalibrationEngine, CalibrationState};
pub use dispatch::GuidePulseDispatcher;
pub use measurement::{BacklashMeasurement, MeasurementState};
pub use mount::{Mount, MountContext, ScopePointing};
