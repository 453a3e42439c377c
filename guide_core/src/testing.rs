//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use guide_common::clock::ManualClock;
use guide_common::device::AxisMover;
use guide_common::geometry::Point;
use guide_common::guide::config::{GuiderConfig, MountConfig};
use guide_common::guide::direction::{GuideDirection, MoveOptions};
use guide_common::guide::error::MoveFailure;
use guide_common::notify::CollectingSink;
use guide_common::store::{KeyValueStore, MemoryStore, StoreError, StoreValue};

use crate::mount::{Mount, MountContext};

/// Star on a camera whose axes move by fixed vectors per second of pulse.
#[derive(Debug)]
pub(crate) struct Field {
    pub position: Point,
    /// Star motion per second of West pulse [px]; East is the reverse.
    pub west: Point,
    /// Star motion per second of North pulse [px]; South is the reverse.
    pub north: Point,
    /// Scripted North displacements consumed before `north` applies.
    pub north_script: VecDeque<Point>,
    /// Scripted South displacements consumed before `-north` applies.
    pub south_script: VecDeque<Point>,
    pub can_pulse_guide: bool,
    /// Returned by every pulse while set.
    pub failure: Option<MoveFailure>,
    pub pulses: Vec<(GuideDirection, u32)>,
}

impl Field {
    pub fn new(west: Point, north: Point) -> Self {
        Self {
            position: Point::new(100.0, 100.0),
            west,
            north,
            north_script: VecDeque::new(),
            south_script: VecDeque::new(),
            can_pulse_guide: true,
            failure: None,
            pulses: Vec::new(),
        }
    }
}

pub(crate) struct FieldMover(pub Arc<Mutex<Field>>);

impl AxisMover for FieldMover {
    fn name(&self) -> &str {
        "field"
    }

    fn pulse(
        &mut self,
        direction: GuideDirection,
        duration_ms: u32,
        _options: MoveOptions,
    ) -> Result<u32, MoveFailure> {
        let mut f = self.0.lock().unwrap();
        if let Some(failure) = f.failure.clone() {
            return Err(failure);
        }
        let secs = f64::from(duration_ms) / 1000.0;
        let step = match direction {
            GuideDirection::West => f.west * secs,
            GuideDirection::East => -(f.west * secs),
            GuideDirection::North => match f.north_script.pop_front() {
                Some(scripted) => scripted,
                None => f.north * secs,
            },
            GuideDirection::South => match f.south_script.pop_front() {
                Some(scripted) => scripted,
                None => -(f.north * secs),
            },
        };
        f.position += step;
        f.pulses.push((direction, duration_ms));
        Ok(duration_ms)
    }

    fn can_pulse_guide(&self) -> bool {
        self.0.lock().unwrap().can_pulse_guide
    }
}

/// Memory store that refuses writes while `read_only` is set.
#[derive(Debug, Default)]
pub(crate) struct LockableStore {
    inner: MemoryStore,
    pub read_only: AtomicBool,
}

impl LockableStore {
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::Io("read-only profile".into()));
        }
        Ok(())
    }
}

impl KeyValueStore for LockableStore {
    fn get(&self, key: &str) -> Option<StoreValue> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: StoreValue) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.remove(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.inner.keys_with_prefix(prefix)
    }
}

pub(crate) struct Rig {
    pub mount: Mount,
    pub field: Arc<Mutex<Field>>,
    pub sink: Arc<CollectingSink>,
    pub clock: Arc<ManualClock>,
}

impl Rig {
    pub fn new(config: MountConfig, field: Field) -> Self {
        Self::with_store(config, field, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(config: MountConfig, field: Field, store: Arc<dyn KeyValueStore>) -> Self {
        let field = Arc::new(Mutex::new(field));
        let sink = Arc::new(CollectingSink::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let ctx = MountContext::new(store, clock.clone(), sink.clone());
        let mount = Mount::new(
            config,
            GuiderConfig::default(),
            Box::new(FieldMover(field.clone())),
            ctx,
        );
        Self {
            mount,
            field,
            sink,
            clock,
        }
    }

    pub fn position(&self) -> Point {
        self.field.lock().unwrap().position
    }

    pub fn pulses(&self) -> Vec<(GuideDirection, u32)> {
        self.field.lock().unwrap().pulses.clone()
    }
}
