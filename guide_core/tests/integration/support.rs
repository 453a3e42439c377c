//! Simulated star field shared by the integration scenarios.

use std::sync::{Arc, Mutex};

use guide_common::clock::ManualClock;
use guide_common::device::AxisMover;
use guide_common::geometry::Point;
use guide_common::guide::config::{GuiderConfig, MountConfig};
use guide_common::guide::direction::{GuideAxis, GuideDirection, MoveOptions};
use guide_common::guide::error::MoveFailure;
use guide_common::notify::CollectingSink;
use guide_common::store::{KeyValueStore, MemoryStore};

use guide_core::mount::{Mount, MountContext};

/// Star on a camera rotated by `angle` against the mount axes.
#[derive(Debug)]
pub struct Sky {
    pub star: Point,
    pub angle: f64,
    /// Guide rate on both axes [px/ms].
    pub rate: f64,
    /// Dec pulse time lost after each Dec reversal [ms].
    pub dec_backlash_ms: u32,
    slack_ms: u32,
    last_dec: Option<GuideDirection>,
    pub pulses: Vec<(GuideDirection, u32)>,
}

impl Sky {
    pub fn new(star: Point, angle: f64, rate: f64) -> Self {
        Self {
            star,
            angle,
            rate,
            dec_backlash_ms: 0,
            slack_ms: 0,
            last_dec: None,
            pulses: Vec::new(),
        }
    }

    /// Dec gear starts engaged on the South side.
    pub fn with_dec_backlash(mut self, ms: u32) -> Self {
        self.dec_backlash_ms = ms;
        self.last_dec = Some(GuideDirection::South);
        self
    }

    fn west(&self) -> Point {
        Point::new(self.angle.cos(), self.angle.sin())
    }

    fn north(&self) -> Point {
        Point::new(-self.angle.sin(), self.angle.cos())
    }

    fn apply(&mut self, direction: GuideDirection, duration_ms: u32) {
        let mut effective = duration_ms;
        if direction.axis() == GuideAxis::Dec {
            if self.last_dec.is_some_and(|last| last != direction) {
                self.slack_ms = self.dec_backlash_ms;
            }
            self.last_dec = Some(direction);
            let taken = self.slack_ms.min(effective);
            self.slack_ms -= taken;
            effective -= taken;
        }
        let travel = self.rate * f64::from(effective);
        let step = match direction {
            GuideDirection::West => self.west() * travel,
            GuideDirection::East => -(self.west() * travel),
            GuideDirection::North => self.north() * travel,
            GuideDirection::South => -(self.north() * travel),
        };
        self.star += step;
        self.pulses.push((direction, duration_ms));
    }
}

pub struct SkyMover(pub Arc<Mutex<Sky>>);

impl AxisMover for SkyMover {
    fn name(&self) -> &str {
        "sky"
    }

    fn pulse(&mut self, direction: GuideDirection, duration_ms: u32, _options: MoveOptions) -> Result<u32, MoveFailure> {
        self.0.lock().unwrap().apply(direction, duration_ms);
        Ok(duration_ms)
    }
}

pub struct Session {
    pub mount: Mount,
    pub sky: Arc<Mutex<Sky>>,
    pub sink: Arc<CollectingSink>,
    pub store: Arc<dyn KeyValueStore>,
}

impl Session {
    pub fn new(config: MountConfig, sky: Sky) -> Self {
        Self::with_store(config, sky, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(config: MountConfig, sky: Sky, store: Arc<dyn KeyValueStore>) -> Self {
        let sky = Arc::new(Mutex::new(sky));
        let sink = Arc::new(CollectingSink::new());
        let ctx = MountContext::new(store.clone(), Arc::new(ManualClock::new(1_000)), sink.clone());
        let mount = Mount::new(config, GuiderConfig::default(), Box::new(SkyMover(sky.clone())), ctx);
        Self {
            mount,
            sky,
            sink,
            store,
        }
    }

    pub fn star(&self) -> Point {
        self.sky.lock().unwrap().star
    }

    pub fn set_star(&self, star: Point) {
        self.sky.lock().unwrap().star = star;
    }

    pub fn pulse_count(&self, direction: GuideDirection) -> usize {
        self.sky
            .lock()
            .unwrap()
            .pulses
            .iter()
            .filter(|(d, _)| *d == direction)
            .count()
    }
}
