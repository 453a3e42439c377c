//! Guiding domain types.
//!
//! - [`direction`] - Guide directions, axes, parity, pier side, move options
//! - [`calibration`] - Calibration snapshot, details and sanity issues
//! - [`step`] - Per-frame offsets, move outcomes and guide step telemetry
//! - [`measurement`] - Backlash measurement outcome
//! - [`error`] - Error taxonomy of the guiding core
//! - [`config`] - Mount, guider and backlash configuration

pub mod calibration;
pub mod config;
pub mod direction;
pub mod error;
pub mod measurement;
pub mod step;
