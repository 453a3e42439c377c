//! Calibration persistence.
//!
//! Keys live under `/<MountClass>/calibration/`. A calibration is only
//! considered present when its `timestamp` key exists. A save drops the
//! timestamp first and writes it last in the same batch, so a store that
//! cannot commit atomically never pairs a new timestamp with old values. Unknown declination is
//! written as [`UNKNOWN_DECLINATION`]; step vectors as `"{x y}, {x y}"`.

use guide_common::consts::UNKNOWN_DECLINATION;
use guide_common::geometry::Point;
use guide_common::guide::calibration::{Calibration, CalibrationDetails, CalibrationIssue};
use guide_common::guide::direction::{GuideParity, PierSide};
use guide_common::store::{ScopedStore, StoreError, StoreOp, StoreValue};

const PREFIX: &str = "/calibration/";

fn key(name: &str) -> String {
    format!("{PREFIX}{name}")
}

fn stored_u64(store: &ScopedStore, name: &str) -> Option<u64> {
    match store.get(&key(name)) {
        Some(StoreValue::Int(v)) => u64::try_from(v).ok(),
        _ => None,
    }
}

// ─── Calibration ────────────────────────────────────────────────────

/// Persist `cal`, stamped with `now_ms`.
pub fn save_calibration(store: &ScopedStore, cal: &Calibration, now_ms: u64) -> Result<(), StoreError> {
    let stamp = i64::try_from(now_ms).unwrap_or(i64::MAX);
    let rotator = match cal.rotator_angle {
        Some(angle) => StoreOp::set(key("rotatorAngle"), angle),
        None => StoreOp::remove(key("rotatorAngle")),
    };
    store.apply(vec![
        StoreOp::remove(key("timestamp")),
        StoreOp::set(key("xAngle"), cal.x_angle),
        StoreOp::set(key("yAngle"), cal.y_angle),
        StoreOp::set(key("xRate"), cal.x_rate),
        StoreOp::set(key("yRate"), cal.y_rate),
        StoreOp::set(key("binning"), u32::from(cal.binning)),
        StoreOp::set(key("declination"), cal.declination.unwrap_or(UNKNOWN_DECLINATION)),
        StoreOp::set(key("pierSide"), cal.pier_side.code()),
        StoreOp::set(key("raGuideParity"), cal.ra_guide_parity.code()),
        StoreOp::set(key("decGuideParity"), cal.dec_guide_parity.code()),
        rotator,
        StoreOp::set(key("timestamp"), stamp),
    ])
}

/// Last persisted calibration, `None` if none was ever saved.
pub fn load_calibration(store: &ScopedStore) -> Option<Calibration> {
    let timestamp = stored_u64(store, "timestamp")?;
    let declination = store.get_float(&key("declination"), UNKNOWN_DECLINATION);
    let binning = store.get_int(&key("binning"), 1);

    Some(Calibration {
        x_angle: store.get_float(&key("xAngle"), 0.0),
        y_angle: store.get_float(&key("yAngle"), 0.0),
        x_rate: store.get_float(&key("xRate"), 1.0),
        y_rate: store.get_float(&key("yRate"), 1.0),
        binning: u16::try_from(binning).unwrap_or(1).max(1),
        declination: (declination != UNKNOWN_DECLINATION).then_some(declination),
        pier_side: PierSide::from_code(store.get_int(&key("pierSide"), PierSide::Unknown.code())),
        ra_guide_parity: GuideParity::from_code(
            store.get_int(&key("raGuideParity"), GuideParity::Unknown.code()),
        ),
        dec_guide_parity: GuideParity::from_code(
            store.get_int(&key("decGuideParity"), GuideParity::Unknown.code()),
        ),
        rotator_angle: store.contains(&key("rotatorAngle")).then(|| store.get_float(&key("rotatorAngle"), 0.0)),
        timestamp: Some(timestamp),
        is_valid: true,
    })
}

// ─── Details ────────────────────────────────────────────────────────

fn format_steps(steps: &[Point]) -> String {
    steps
        .iter()
        .map(|p| format!("{{{:.1} {:.1}}}", p.x, p.y))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse `"{x y}, {x y}"`; stops at the first malformed entry.
fn parse_steps(text: &str) -> Vec<Point> {
    let mut steps = Vec::new();
    for token in text.split("},") {
        let token = token.trim().trim_start_matches('{').trim_end_matches('}');
        if token.is_empty() {
            continue;
        }
        let mut parts = token.split_whitespace().map(str::parse::<f64>);
        match (parts.next(), parts.next()) {
            (Some(Ok(x)), Some(Ok(y))) => steps.push(Point::new(x, y)),
            _ => break,
        }
    }
    steps
}

pub fn save_details(store: &ScopedStore, details: &CalibrationDetails) -> Result<(), StoreError> {
    let orig_timestamp = match details.orig_timestamp.and_then(|t| i64::try_from(t).ok()) {
        Some(t) => StoreOp::set(key("orig_timestamp"), t),
        None => StoreOp::remove(key("orig_timestamp")),
    };
    store.apply(vec![
        StoreOp::set(key("focal_length"), details.focal_length),
        StoreOp::set(key("image_scale"), details.image_scale),
        StoreOp::set(key("ra_guide_rate"), details.ra_guide_speed.unwrap_or(-1.0)),
        StoreOp::set(key("dec_guide_rate"), details.dec_guide_speed.unwrap_or(-1.0)),
        StoreOp::set(key("ortho_error"), details.ortho_error),
        StoreOp::set(key("orig_binning"), u32::from(details.orig_binning)),
        orig_timestamp,
        StoreOp::set(key("orig_pierside"), details.orig_pier_side.code()),
        StoreOp::set(key("ra_steps"), format_steps(&details.ra_steps)),
        StoreOp::set(key("dec_steps"), format_steps(&details.dec_steps)),
        StoreOp::set(key("ra_step_count"), details.ra_step_count),
        StoreOp::set(key("dec_step_count"), details.dec_step_count),
        StoreOp::set(key("last_issue"), details.last_issue.as_str()),
    ])
}

/// Stored details; missing keys read as defaults.
pub fn load_details(store: &ScopedStore) -> CalibrationDetails {
    let speed = |name: &str| {
        let v = store.get_float(&key(name), -1.0);
        (v > 0.0).then_some(v)
    };
    let count = |name: &str| u32::try_from(store.get_int(&key(name), 0)).unwrap_or(0);

    CalibrationDetails {
        focal_length: store.get_float(&key("focal_length"), 0.0),
        image_scale: store.get_float(&key("image_scale"), 1.0),
        ra_guide_speed: speed("ra_guide_rate"),
        dec_guide_speed: speed("dec_guide_rate"),
        ortho_error: store.get_float(&key("ortho_error"), 0.0),
        orig_binning: u16::try_from(store.get_int(&key("orig_binning"), 1)).unwrap_or(1),
        orig_timestamp: stored_u64(store, "orig_timestamp"),
        orig_pier_side: PierSide::from_code(
            store.get_int(&key("orig_pierside"), PierSide::Unknown.code()),
        ),
        ra_steps: parse_steps(&store.get_text(&key("ra_steps"), "")),
        dec_steps: parse_steps(&store.get_text(&key("dec_steps"), "")),
        ra_step_count: count("ra_step_count"),
        dec_step_count: count("dec_step_count"),
        last_issue: CalibrationIssue::from_name(&store.get_text(&key("last_issue"), "none")),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use guide_common::store::{KeyValueStore, MemoryStore, TomlFileStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Store that runs out of space after a fixed number of writes. Uses the
    /// one-at-a-time batch fallback.
    struct FullDisk {
        inner: MemoryStore,
        writes_left: AtomicUsize,
    }

    impl FullDisk {
        fn new(writes_left: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                writes_left: AtomicUsize::new(writes_left),
            }
        }
    }

    impl KeyValueStore for FullDisk {
        fn get(&self, key: &str) -> Option<StoreValue> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: StoreValue) -> Result<(), StoreError> {
            let left = self.writes_left.load(Ordering::SeqCst);
            if left == 0 {
                return Err(StoreError::Io("disk full".into()));
            }
            self.writes_left.store(left - 1, Ordering::SeqCst);
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.inner.remove(key)
        }

        fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
            self.inner.keys_with_prefix(prefix)
        }
    }

    fn sample() -> Calibration {
        Calibration {
            x_angle: 0.5,
            y_angle: 2.07,
            x_rate: 0.002,
            y_rate: 0.0025,
            binning: 2,
            declination: None,
            pier_side: PierSide::West,
            ra_guide_parity: GuideParity::Even,
            dec_guide_parity: GuideParity::Odd,
            rotator_angle: Some(12.5),
            timestamp: None,
            is_valid: true,
        }
    }

    #[test]
    fn nothing_stored() {
        let store = ScopedStore::in_memory("scope");
        assert!(load_calibration(&store).is_none());
        let d = load_details(&store);
        assert!(d.ra_steps.is_empty());
        assert_eq!(d.last_issue, CalibrationIssue::None);
        assert_eq!(d.ra_guide_speed, None);
    }

    #[test]
    fn calibration_survives_reload() {
        let store = ScopedStore::in_memory("scope");
        save_calibration(&store, &sample(), 1_700_000_000_000).unwrap();
        let cal = load_calibration(&store).unwrap();
        assert_eq!(cal.timestamp, Some(1_700_000_000_000));
        assert_eq!(cal.declination, None);
        assert_eq!(cal.binning, 2);
        assert_eq!(cal.pier_side, PierSide::West);
        assert_eq!(cal.dec_guide_parity, GuideParity::Odd);
        assert_eq!(cal.rotator_angle, Some(12.5));
        assert_eq!(
            store.get_float("/calibration/declination", 0.0),
            UNKNOWN_DECLINATION
        );
    }

    #[test]
    fn interrupted_save_never_mixes_records() {
        let disk = Arc::new(FullDisk::new(usize::MAX));
        let store = ScopedStore::new(disk.clone(), "scope");
        save_calibration(&store, &sample(), 1000).unwrap();

        disk.writes_left.store(2, Ordering::SeqCst);
        let newer = Calibration { x_rate: 0.009, ..sample() };
        let err = save_calibration(&store, &newer, 2000).unwrap_err();
        assert_eq!(err, StoreError::Io("disk full".into()));

        // Half-written record reads as absent rather than stamped with the
        // new time over stale rates.
        assert!(load_calibration(&store).is_none());

        disk.writes_left.store(usize::MAX, Ordering::SeqCst);
        save_calibration(&store, &newer, 3000).unwrap();
        let cal = load_calibration(&store).unwrap();
        assert_eq!(cal.timestamp, Some(3000));
        assert_eq!(cal.x_rate, 0.009);
    }

    #[test]
    fn failed_file_save_keeps_previous_calibration() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("profile.toml");
        let store = ScopedStore::new(Arc::new(TomlFileStore::open(&path).unwrap()), "scope");
        save_calibration(&store, &sample(), 1000).unwrap();

        std::fs::create_dir(dir.path().join("profile.toml.tmp")).unwrap();
        let newer = Calibration { x_rate: 0.009, ..sample() };
        assert!(save_calibration(&store, &newer, 2000).is_err());

        let cal = load_calibration(&store).unwrap();
        assert_eq!(cal.timestamp, Some(1000));
        assert_eq!(cal.x_rate, 0.002);
        let reopened = ScopedStore::new(Arc::new(TomlFileStore::open(&path).unwrap()), "scope");
        assert_eq!(load_calibration(&reopened).unwrap().x_rate, 0.002);
    }

    #[test]
    fn details_to_toml_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("profile.toml");
        let details = CalibrationDetails {
            focal_length: 400.0,
            image_scale: 1.9,
            ra_guide_speed: Some(0.0021),
            dec_guide_speed: None,
            ortho_error: 1.5,
            orig_binning: 1,
            orig_timestamp: Some(42),
            orig_pier_side: PierSide::East,
            ra_steps: vec![Point::new(1.0, 0.5), Point::new(2.0, -1.24)],
            dec_steps: vec![Point::new(-0.5, 3.0)],
            ra_step_count: 2,
            dec_step_count: 1,
            last_issue: CalibrationIssue::Angle,
        };
        {
            let store = ScopedStore::new(Arc::new(TomlFileStore::open(&path).unwrap()), "scope");
            save_details(&store, &details).unwrap();
        }
        let store = ScopedStore::new(Arc::new(TomlFileStore::open(&path).unwrap()), "scope");
        let loaded = load_details(&store);
        assert_eq!(loaded.last_issue, CalibrationIssue::Angle);
        assert_eq!(loaded.ra_steps.len(), 2);
        // one decimal is kept
        assert_eq!(loaded.ra_steps[1], Point::new(2.0, -1.2));
        assert_eq!(loaded.dec_steps, vec![Point::new(-0.5, 3.0)]);
        assert_eq!(loaded.dec_guide_speed, None);
        assert_eq!(loaded.orig_timestamp, Some(42));
        assert_eq!(loaded.orig_pier_side, PierSide::East);
    }

    #[test]
    fn step_text_format() {
        let text = format_steps(&[Point::new(1.0, 2.0), Point::new(-3.0, 0.24)]);
        assert_eq!(text, "{1.0 2.0}, {-3.0 0.2}");
        assert_eq!(parse_steps("{1.0 2.0}, {bad}, {3 4}").len(), 1);
        assert!(parse_steps("").is_empty());
    }
}
