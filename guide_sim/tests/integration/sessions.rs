//! Integration test: calibrate, measure and guide across restarts.

use std::path::Path;

use guide_common::config::ConfigLoader;
use guide_common::guide::calibration::CalibrationIssue;
use guide_common::guide::direction::PierSide;
use guide_common::guide::measurement::MeasurementResult;
use guide_sim::{Session, SimConfig, SimError};
use tempfile::TempDir;

// ── Helpers ─────────────────────────────────────────────────────────

fn config(profile: &Path, sim: &str) -> SimConfig {
    let text = format!(
        r#"
store_path = "{}"

[shared]
service_name = "guide-sim-test"

[mount]
calibration_duration_ms = 750

[sim]
{sim}
"#,
        profile.display()
    );
    SimConfig::parse(&text).unwrap()
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn calibration_persists_in_profile_file() {
    let dir = TempDir::new().unwrap();
    let profile = dir.path().join("profile.toml");

    let mut first = Session::new(config(&profile, "camera_angle_deg = -60.0")).unwrap();
    let report = first.calibrate().unwrap();
    assert_eq!(report.issue, CalibrationIssue::None);
    assert!(profile.exists());
    drop(first);

    let mut second = Session::new(config(&profile, "camera_angle_deg = -60.0")).unwrap();
    assert!(second.mount().is_calibrated());
    let stored = second.mount().calibration();
    assert!((stored.x_angle.to_degrees() - report.x_angle_deg).abs() < 1e-9);
    assert_eq!(stored.pier_side, PierSide::East);

    // no recalibration needed to guide
    let guide = second.guide(10).unwrap();
    assert!(guide.final_offset_px < 0.01);
}

#[test]
fn measured_backlash_persists_and_guides() {
    let dir = TempDir::new().unwrap();
    let profile = dir.path().join("profile.toml");
    let sim = "dec_backlash_ms = 600\ndrift_ra_px_per_min = 1.5\ndrift_dec_px_per_min = -0.5";

    let mut first = Session::new(config(&profile, sim)).unwrap();
    first.calibrate().unwrap();
    let measured = first.measure_backlash(true).unwrap();
    assert_eq!(measured.result, MeasurementResult::Valid);
    assert!(measured.applied);
    assert!(measured.backlash_px > 0.0);
    assert!(measured.sigma_ms >= 0.0);
    drop(first);

    let mut second = Session::new(config(&profile, sim)).unwrap();
    assert!(second.mount().backlash().is_active());
    assert_eq!(second.mount().backlash().pulse_width(), measured.backlash_ms);

    let report = second.guide(60).unwrap();
    assert_eq!(report.frames, 60);
    assert!(report.rms_ra_px < 0.1, "rms ra {}", report.rms_ra_px);
    assert!(report.rms_dec_px < 0.5, "rms dec {}", report.rms_dec_px);
    assert!(report.final_offset_px < 0.05, "final offset {}", report.final_offset_px);
    assert!(report.pulses > 0);
}

#[test]
fn measurement_without_calibration_fails() {
    let dir = TempDir::new().unwrap();
    let mut session = Session::new(config(&dir.path().join("profile.toml"), "")).unwrap();
    let err = session.measure_backlash(false).unwrap_err();
    assert!(matches!(err, SimError::Guide(_)));
}

#[test]
fn invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let err = Session::new(config(&dir.path().join("profile.toml"), "frame_ms = 5")).unwrap_err();
    assert!(matches!(err, SimError::Config(_)));
}
