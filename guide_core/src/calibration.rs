//! Mount calibration.
//!
//! - [`engine`] - West/East/North/South calibration state machine
//! - [`sanity`] - Advisory checks on a completed calibration
//! - [`persist`] - Calibration and details in the profile store
//!
//! ## State sequence
//!
//! ```text
//! Cleared → GoWest → GoEast → [ClearBacklash → GoNorth → GoSouth → NudgeSouth] → Complete
//!                                                                   any state → Aborted
//! ```
//!
//! The bracketed part is skipped when the Dec guide mode is `None`.

pub mod engine;
pub mod persist;
pub mod sanity;

use serde::Serialize;
use std::fmt;

pub use engine::CalibrationEngine;
pub use sanity::SanityReport;

/// Phase of a calibration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CalibrationState {
    Cleared,
    GoWest,
    GoEast,
    ClearBacklash,
    GoNorth,
    GoSouth,
    NudgeSouth,
    Complete,
    Aborted,
}

impl CalibrationState {
    /// Canonical order of the phases.
    pub const SEQUENCE: [Self; 8] = [
        Self::Cleared,
        Self::GoWest,
        Self::GoEast,
        Self::ClearBacklash,
        Self::GoNorth,
        Self::GoSouth,
        Self::NudgeSouth,
        Self::Complete,
    ];

    /// No further transitions are accepted.
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }

    /// Phase label used in step notifications.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Cleared => "Cleared",
            Self::GoWest => "West",
            Self::GoEast => "East",
            Self::ClearBacklash => "Backlash",
            Self::GoNorth => "North",
            Self::GoSouth => "South",
            Self::NudgeSouth => "NudgeSouth",
            Self::Complete => "Complete",
            Self::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for CalibrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
