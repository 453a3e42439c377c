//! Per-frame offsets, move outcomes and guide step telemetry.

use serde::{Serialize, Serializer};

use crate::geometry::Point;
use crate::guide::direction::{GuideDirection, MoveOptions};

/// Star offset for one frame.
///
/// `mount` is filled in by the dispatcher when only the camera offset is
/// known; callers that already work in mount coordinates (dither recenter)
/// set both.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GuiderOffset {
    /// Star minus lock position [camera px].
    pub camera: Point,
    /// Same offset on the mount axes, when known.
    pub mount: Option<Point>,
}

impl GuiderOffset {
    /// Offset known only in camera coordinates.
    pub const fn camera(camera: Point) -> Self {
        Self {
            camera,
            mount: None,
        }
    }

    /// Offset already expressed on the mount axes.
    pub const fn mount(mount: Point, camera: Point) -> Self {
        Self {
            camera,
            mount: Some(mount),
        }
    }
}

/// Result of one axis move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MoveOutcome {
    /// Duration actually issued [ms].
    pub amount_moved: u32,
    /// True when the request was clamped to the max duration.
    pub limited: bool,
}

/// Telemetry record of one guide step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuideStepInfo {
    pub frame_number: u64,
    /// Time since guiding started [ms].
    pub time_ms: u64,
    #[serde(serialize_with = "serialize_move_options")]
    pub move_options: MoveOptions,
    pub camera_offset: Point,
    pub mount_offset: Point,
    /// Corrected RA distance after the algorithm [px].
    pub guide_distance_ra: f64,
    /// Corrected Dec distance after the algorithm [px].
    pub guide_distance_dec: f64,
    pub duration_ra: u32,
    pub direction_ra: GuideDirection,
    pub duration_dec: u32,
    pub direction_dec: GuideDirection,
    pub ra_limited: bool,
    pub dec_limited: bool,
}

fn serialize_move_options<S: Serializer>(opts: &MoveOptions, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u32(opts.bits())
}
