//! Session errors.

use guide_common::config::ConfigError;
use guide_common::guide::error::GuideError;
use guide_common::store::StoreError;
use guide_core::calibration::CalibrationState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("profile store: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Guide(#[from] GuideError),

    /// The engine stopped without completing.
    #[error("calibration ended in state {0}")]
    CalibrationIncomplete(CalibrationState),

    /// A session ran out of frames before finishing.
    #[error("{session} did not finish within {frames} frames")]
    FrameBudget { session: &'static str, frames: u32 },
}
