//! Guide directions, axes and sign conventions.
//!
//! ## Conventions
//!
//! | Mount distance | Direction |
//! |----------------|-----------|
//! | x > 0          | West      |
//! | x ≤ 0          | East      |
//! | y > 0          | South     |
//! | y ≤ 0          | North     |

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Directions ─────────────────────────────────────────────────────

/// Physical guide pulse direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuideDirection {
    North,
    South,
    East,
    West,
}

impl GuideDirection {
    /// Direction for a signed RA mount distance.
    #[inline]
    pub fn from_ra_distance(distance: f64) -> Self {
        if distance > 0.0 { Self::West } else { Self::East }
    }

    /// Direction for a signed Dec mount distance.
    #[inline]
    pub fn from_dec_distance(distance: f64) -> Self {
        if distance > 0.0 { Self::South } else { Self::North }
    }

    #[inline]
    pub const fn axis(&self) -> GuideAxis {
        match self {
            Self::North | Self::South => GuideAxis::Dec,
            Self::East | Self::West => GuideAxis::Ra,
        }
    }

    #[inline]
    pub const fn opposite(&self) -> Self {
        match self {
            Self::North => Self::South,
            Self::South => Self::North,
            Self::East => Self::West,
            Self::West => Self::East,
        }
    }

    /// Single-letter form used in logs.
    pub const fn as_char(&self) -> char {
        match self {
            Self::North => 'N',
            Self::South => 'S',
            Self::East => 'E',
            Self::West => 'W',
        }
    }
}

impl fmt::Display for GuideDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::North => "North",
            Self::South => "South",
            Self::East => "East",
            Self::West => "West",
        };
        f.write_str(s)
    }
}

/// Mount axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuideAxis {
    Ra,
    Dec,
}

impl fmt::Display for GuideAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ra => "RA",
            Self::Dec => "Dec",
        })
    }
}

// ─── Dec Guide Mode ─────────────────────────────────────────────────

/// Which Dec corrections the mount may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecGuideMode {
    /// No Dec guiding, Dec is left to drift.
    None,
    /// Both directions.
    #[default]
    Auto,
    /// North corrections only.
    North,
    /// South corrections only.
    South,
}

impl DecGuideMode {
    /// True if a guide move in `direction` is permitted.
    #[inline]
    pub const fn allows(&self, direction: GuideDirection) -> bool {
        match (self, direction) {
            (Self::None, _) => false,
            (Self::North, GuideDirection::South) => false,
            (Self::South, GuideDirection::North) => false,
            _ => true,
        }
    }

    /// True if Dec corrections may reverse direction.
    #[inline]
    pub const fn is_bidirectional(&self) -> bool {
        matches!(self, Self::Auto)
    }
}

// ─── Parity / Pier Side ─────────────────────────────────────────────

/// Whether a positive pulse increases the sky coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GuideParity {
    Even,
    Odd,
    #[default]
    Unknown,
    /// Keep whatever parity the previous calibration recorded.
    Unchanged,
}

impl GuideParity {
    /// Integer code used by the profile store.
    pub const fn code(&self) -> i64 {
        match self {
            Self::Even => 1,
            Self::Odd => -1,
            Self::Unknown => 0,
            Self::Unchanged => -5,
        }
    }

    pub const fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Even,
            -1 => Self::Odd,
            -5 => Self::Unchanged,
            _ => Self::Unknown,
        }
    }

    /// Parity after a meridian flip; unknown values stay unknown.
    pub const fn opposite(&self) -> Self {
        match self {
            Self::Even => Self::Odd,
            Self::Odd => Self::Even,
            other => *other,
        }
    }
}

/// Side of the pier the optical tube is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PierSide {
    #[default]
    Unknown,
    East,
    West,
}

impl PierSide {
    pub const fn code(&self) -> i64 {
        match self {
            Self::Unknown => -1,
            Self::East => 0,
            Self::West => 1,
        }
    }

    pub const fn from_code(code: i64) -> Self {
        match code {
            0 => Self::East,
            1 => Self::West,
            _ => Self::Unknown,
        }
    }

    pub const fn opposite(&self) -> Self {
        match self {
            Self::East => Self::West,
            Self::West => Self::East,
            Self::Unknown => Self::Unknown,
        }
    }
}

// ─── Move Options ───────────────────────────────────────────────────

bitflags! {
    /// Flags describing the origin and treatment of a move request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MoveOptions: u32 {
        /// Distances pass through the per-axis guide algorithms.
        const ALGORITHM_RESULT  = 0x01;
        /// Distances come from the algorithms' dead-reckoning estimate.
        const ALGORITHM_DEDUCE  = 0x02;
        /// Dec moves pass through backlash compensation.
        const USE_BACKLASH_COMP = 0x04;
        /// Step is graphed / shown to guiding statistics.
        const GRAPH             = 0x08;
        /// Operator-initiated move; bypasses the guiding-enabled check.
        const MANUAL            = 0x10;
    }
}

impl MoveOptions {
    /// Calibration and measurement pulses.
    pub const CALIBRATION_MOVE: Self = Self::empty();
    /// Ordinary per-frame guide step.
    pub const GUIDE_STEP: Self = Self::ALGORITHM_RESULT
        .union(Self::USE_BACKLASH_COMP)
        .union(Self::GRAPH);
    /// Dead-reckoned step when the star was lost.
    pub const DEDUCED_MOVE: Self = Self::ALGORITHM_DEDUCE
        .union(Self::USE_BACKLASH_COMP)
        .union(Self::GRAPH);
    /// Fast recenter after a dither.
    pub const RECOVERY_MOVE: Self = Self::USE_BACKLASH_COMP;

    /// True for moves whose durations are subject to guide mode and max duration.
    #[inline]
    pub const fn is_algorithm_move(&self) -> bool {
        self.intersects(Self::ALGORITHM_RESULT.union(Self::ALGORITHM_DEDUCE))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
