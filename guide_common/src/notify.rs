//! Fire-and-forget notification sinks.
//!
//! The core publishes per-step telemetry, calibration progress, sanity
//! advisories and measurement status through a [`GuideEventSink`]. Nothing
//! the sink does feeds back into the core.

use serde::Serialize;
use std::sync::{Mutex, PoisonError};

use crate::guide::calibration::{Calibration, CalibrationIssue};
use crate::guide::direction::GuideAxis;
use crate::guide::step::GuideStepInfo;

/// Event published by the guiding core.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum GuideEvent {
    /// One guide frame was processed.
    Step(GuideStepInfo),

    /// One calibration pulse was issued.
    CalibrationStep {
        phase: String,
        step: u32,
        /// Distance from the leg start [px].
        dist: f64,
        message: String,
    },

    CalibrationComplete { calibration: Calibration },

    CalibrationFailed { message: String },

    /// Non-blocking sanity advisory.
    CalibrationAdvisory {
        issue: CalibrationIssue,
        message: String,
    },

    /// An axis keeps hitting its max duration.
    LimitReached { axis: GuideAxis, message: String },

    /// Backlash measurement progress.
    MeasurementStatus { message: String },

    /// Operator alert outside calibration (pointing changes, guide speeds).
    Alert { message: String },

    /// A tuned parameter changed (e.g. backlash comp pulse).
    GuidingParam { name: String, value: f64 },
}

/// Receives core events.
pub trait GuideEventSink: Send + Sync {
    fn publish(&self, event: GuideEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl GuideEventSink for NullSink {
    fn publish(&self, _event: GuideEvent) {}
}

/// Keeps every event in order; used by tests and the simulator.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<GuideEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events so far.
    pub fn events(&self) -> Vec<GuideEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Take all events, leaving the sink empty.
    pub fn drain(&self) -> Vec<GuideEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl GuideEventSink for CollectingSink {
    fn publish(&self, event: GuideEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
