//! Event sink that routes core events into the log.

use std::sync::atomic::{AtomicU64, Ordering};

use guide_common::notify::{GuideEvent, GuideEventSink};
use tracing::{debug, info, warn};

/// Logs every event and counts the ones an operator would have to see.
#[derive(Debug, Default)]
pub struct TracingSink {
    steps: AtomicU64,
    alerts: AtomicU64,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guide steps seen.
    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    /// Advisories, alerts and failures seen.
    pub fn alerts(&self) -> u64 {
        self.alerts.load(Ordering::Relaxed)
    }

    fn alert(&self) {
        self.alerts.fetch_add(1, Ordering::Relaxed);
    }
}

impl GuideEventSink for TracingSink {
    fn publish(&self, event: GuideEvent) {
        match event {
            GuideEvent::Step(info) => {
                self.steps.fetch_add(1, Ordering::Relaxed);
                debug!(
                    frame = info.frame_number,
                    ra = %format_args!("{}{}", info.direction_ra.as_char(), info.duration_ra),
                    dec = %format_args!("{}{}", info.direction_dec.as_char(), info.duration_dec),
                    dx = info.mount_offset.x,
                    dy = info.mount_offset.y,
                    "step"
                );
            }
            GuideEvent::CalibrationStep { phase, step, dist, .. } => {
                debug!(phase = %phase, step, dist, "calibration step");
            }
            GuideEvent::CalibrationComplete { calibration } => {
                info!(
                    x_angle = calibration.x_angle.to_degrees(),
                    y_angle = calibration.y_angle.to_degrees(),
                    x_rate = calibration.x_rate * 1000.0,
                    y_rate = calibration.y_rate * 1000.0,
                    "calibration complete"
                );
            }
            GuideEvent::CalibrationFailed { message } => {
                self.alert();
                warn!("calibration failed: {message}");
            }
            GuideEvent::CalibrationAdvisory { issue, message } => {
                self.alert();
                warn!(issue = issue.as_str(), "{message}");
            }
            GuideEvent::LimitReached { axis, message } => {
                self.alert();
                warn!(axis = %axis, "{message}");
            }
            GuideEvent::MeasurementStatus { message } => info!("backlash measurement: {message}"),
            GuideEvent::Alert { message } => {
                self.alert();
                warn!("{message}");
            }
            GuideEvent::GuidingParam { name, value } => info!(value, "{name}"),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
