//! Integration test: calibrate on a rotated camera, then guide.

use std::f64::consts::PI;

use guide_common::geometry::Point;
use guide_common::guide::config::MountConfig;
use guide_common::guide::direction::{GuideDirection, MoveOptions};
use guide_common::guide::step::GuiderOffset;
use guide_common::notify::GuideEvent;

use guide_core::calibration::{CalibrationEngine, CalibrationState};
use guide_core::dispatch::GuidePulseDispatcher;

use super::support::{Session, Sky};

// ── Helpers ─────────────────────────────────────────────────────────

const RATE: f64 = 0.002;
const CAMERA_ANGLE: f64 = PI / 6.0;

fn config() -> MountConfig {
    MountConfig {
        calibration_duration_ms: 500,
        calibration_distance_px: 25.0,
        ..Default::default()
    }
}

fn calibrate(session: &mut Session) -> CalibrationState {
    let lock = session.star();
    let mut engine = CalibrationEngine::begin(&mut session.mount, lock).unwrap();
    for _ in 0..400 {
        let current = session.star();
        let state = engine.update(&mut session.mount, current).unwrap();
        if state.is_terminal() {
            return state;
        }
    }
    panic!("calibration did not terminate");
}

fn unit(angle: f64) -> Point {
    Point::new(angle.cos(), angle.sin())
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn calibration_finds_camera_rotation() {
    let mut session = Session::new(config(), Sky::new(Point::new(400.0, 300.0), CAMERA_ANGLE, RATE));
    assert_eq!(calibrate(&mut session), CalibrationState::Complete);

    let cal = session.mount.calibration().clone();
    assert!(cal.is_valid);
    // RA axis points opposite to the West star motion, Dec along North
    assert!(unit(cal.x_angle).distance(&unit(CAMERA_ANGLE + PI)) < 1e-6);
    assert!(unit(cal.y_angle).distance(&unit(CAMERA_ANGLE + PI / 2.0)) < 1e-6);
    assert!((cal.x_rate - RATE).abs() < 1e-6);
    assert!((cal.y_rate - RATE).abs() < 1e-6);
    assert!(cal.ortho_error_degrees() < 1e-3);
    assert!(
        session
            .sink
            .events()
            .iter()
            .any(|e| matches!(e, GuideEvent::CalibrationComplete { .. }))
    );
}

#[test]
fn guiding_removes_star_offset() {
    let mut session = Session::new(config(), Sky::new(Point::new(400.0, 300.0), CAMERA_ANGLE, RATE));
    assert_eq!(calibrate(&mut session), CalibrationState::Complete);

    let lock = session.star();
    session.set_star(lock + Point::new(1.5, -1.0));
    let mut dispatcher = GuidePulseDispatcher::default();
    dispatcher.guiding_started(&mut session.mount);

    for _ in 0..3 {
        let offset = GuiderOffset::camera(session.star() - lock);
        dispatcher
            .move_offset(&mut session.mount, offset, MoveOptions::GUIDE_STEP)
            .unwrap();
    }

    // pulse rounding leaves at most 1 ms of error per axis
    assert!(session.star().distance(&lock) < 0.01);
    assert_eq!(dispatcher.frame_number(), 3);
    let steps = session
        .sink
        .events()
        .iter()
        .filter(|e| matches!(e, GuideEvent::Step(_)))
        .count();
    assert_eq!(steps, 3);
}

#[test]
fn calibration_survives_restart() {
    let mut first = Session::new(config(), Sky::new(Point::new(400.0, 300.0), CAMERA_ANGLE, RATE));
    assert_eq!(calibrate(&mut first), CalibrationState::Complete);
    let saved = first.mount.calibration().clone();

    let second = Session::with_store(config(), Sky::new(Point::new(400.0, 300.0), CAMERA_ANGLE, RATE), first.store.clone());
    assert!(second.mount.is_calibrated());
    assert!((second.mount.calibration().x_angle - saved.x_angle).abs() < 1e-9);
    assert!((second.mount.calibration().y_rate - saved.y_rate).abs() < 1e-12);
}

#[test]
fn uncalibrated_axis_move_is_still_possible() {
    let mut session = Session::new(config(), Sky::new(Point::new(400.0, 300.0), 0.0, RATE));
    assert!(!session.mount.is_calibrated());

    let outcome = session
        .mount
        .move_axis(GuideDirection::West, 1000, MoveOptions::MANUAL)
        .unwrap();
    assert_eq!(outcome.amount_moved, 1000);
    assert!(session.star().distance(&Point::new(402.0, 300.0)) < 1e-9);
}
