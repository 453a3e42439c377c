//! Integration test: measure Dec backlash, seed compensation, guide through
//! a Dec reversal.

use std::f64::consts::{FRAC_PI_2, PI};

use guide_common::geometry::Point;
use guide_common::guide::calibration::Calibration;
use guide_common::guide::config::MountConfig;
use guide_common::guide::direction::{GuideDirection, MoveOptions};
use guide_common::guide::measurement::MeasurementResult;
use guide_common::guide::step::GuiderOffset;
use guide_common::notify::GuideEvent;

use guide_core::dispatch::GuidePulseDispatcher;
use guide_core::measurement::{BacklashMeasurement, MeasurementState};

use super::support::{Session, Sky};

// ── Helpers ─────────────────────────────────────────────────────────

const RATE: f64 = 0.002;
const DEC_BACKLASH_MS: u32 = 1500;

/// Mount calibrated to match an unrotated camera.
fn calibrated_session(sky: Sky) -> Session {
    let mut session = Session::new(MountConfig::default(), sky);
    session.mount.set_calibration(&Calibration {
        x_angle: PI,
        y_angle: FRAC_PI_2,
        x_rate: RATE,
        y_rate: RATE,
        binning: 1,
        ..Default::default()
    })
    .unwrap();
    session
}

fn measure(session: &mut Session) -> BacklashMeasurement {
    let mut m = BacklashMeasurement::new(&session.mount);
    let start = session.star();
    let mut state = m.start(&mut session.mount, 0.0, start).unwrap();
    for _ in 0..300 {
        if state.is_terminal() {
            return m;
        }
        let current = session.star();
        state = m.step(&mut session.mount, current).unwrap();
    }
    panic!("measurement did not terminate");
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn measurement_finds_dec_backlash() {
    let sky = Sky::new(Point::new(640.0, 200.0), 0.0, RATE).with_dec_backlash(DEC_BACKLASH_MS);
    let mut session = calibrated_session(sky);
    let m = measure(&mut session);

    assert_eq!(m.state(), MeasurementState::Completed);
    assert_eq!(m.result(), MeasurementResult::Valid);
    // two 750 ms South steps swallowed, counted against 90% of a North step
    assert!((m.backlash_px() - 2.4).abs() < 1e-6);
    assert!((1100..=1300).contains(&m.backlash_ms()));
    assert_eq!(m.north_positions().len(), 21);
    assert!(m.trial().is_some());
    assert!(
        session
            .sink
            .events()
            .iter()
            .any(|e| matches!(e, GuideEvent::MeasurementStatus { message } if message == "Measurement complete"))
    );
}

#[test]
fn clean_dec_measures_zero() {
    let mut session = calibrated_session(Sky::new(Point::new(640.0, 200.0), 0.0, RATE));
    let m = measure(&mut session);

    assert_eq!(m.result(), MeasurementResult::Valid);
    assert_eq!(m.backlash_ms(), 0);
    assert!(m.trial().is_none());
}

#[test]
fn measured_pulse_compensates_reversal_and_persists() {
    let sky = Sky::new(Point::new(640.0, 200.0), 0.0, RATE).with_dec_backlash(DEC_BACKLASH_MS);
    let mut session = calibrated_session(sky);
    let measured = measure(&mut session).backlash_ms();

    session.mount.set_backlash_pulse(measured, 0, 0);
    session.mount.enable_backlash_comp(true);
    assert!(session.mount.backlash().is_active());

    let mut dispatcher = GuidePulseDispatcher::default();
    dispatcher.guiding_started(&mut session.mount);

    let south = dispatcher
        .move_offset(&mut session.mount, GuiderOffset::camera(Point::new(0.0, 1.0)), MoveOptions::GUIDE_STEP)
        .unwrap();
    assert_eq!(south.direction_dec, GuideDirection::South);
    assert_eq!(south.duration_dec, 500);

    let north = dispatcher
        .move_offset(&mut session.mount, GuiderOffset::camera(Point::new(0.0, -1.0)), MoveOptions::GUIDE_STEP)
        .unwrap();
    assert_eq!(north.direction_dec, GuideDirection::North);
    assert_eq!(north.duration_dec, 500 + measured);
    assert!(session.mount.backlash().history().window_open());

    let restarted = Session::with_store(
        MountConfig::default(),
        Sky::new(Point::new(640.0, 200.0), 0.0, RATE),
        session.store.clone(),
    );
    assert!(restarted.mount.is_calibrated());
    assert!(restarted.mount.backlash().is_active());
    assert_eq!(restarted.mount.backlash().pulse_width(), measured);
    assert!(session.pulse_count(GuideDirection::North) > 20);
}
