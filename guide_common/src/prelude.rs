//! Prelude module for common re-exports.
//!
//! ```rust
//! use guide_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, LogLevel, SharedConfig};
pub use crate::guide::config::{BacklashConfig, GuiderConfig, MountConfig};

// ─── Geometry ───────────────────────────────────────────────────────
pub use crate::geometry::{Point, norm_angle};

// ─── Guide Types ────────────────────────────────────────────────────
pub use crate::guide::calibration::{Calibration, CalibrationDetails, CalibrationIssue};
pub use crate::guide::direction::{
    DecGuideMode, GuideAxis, GuideDirection, GuideParity, MoveOptions, PierSide,
};
pub use crate::guide::error::{GuideError, MoveFailure};
pub use crate::guide::measurement::MeasurementResult;
pub use crate::guide::step::{GuideStepInfo, GuiderOffset, MoveOutcome};

// ─── Capabilities ───────────────────────────────────────────────────
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::device::{AxisMover, GuideAlgorithm, GuideRates, PointingSource, SkyCoordinates};
pub use crate::notify::{CollectingSink, GuideEvent, GuideEventSink, NullSink};
pub use crate::store::{KeyValueStore, MemoryStore, ScopedStore, StoreError, StoreValue, TomlFileStore};
