//! Adaptive Dec backlash compensation.
//!
//! When a Dec correction reverses direction, a fixed extra pulse is added to
//! take up gear slack. For algorithm-driven moves the outcome of each
//! compensated reversal is tracked in [`BlcHistory`] and the pulse is nudged
//! up or down within `[floor, ceiling]`.
//!
//! ## Settings invariant
//!
//! `MIN_COMP_AMOUNT ≤ floor ≤ pulse_width ≤ ceiling ≤ MAX_COMP_AMOUNT`, and the
//! pulse is fixed (not adapted) when `ceiling − floor < MIN_COMP_AMOUNT`.
//!
//! ## Persisted keys (relative to the mount class)
//!
//! | Key                    | Value          |
//! |------------------------|----------------|
//! | `/DecBacklashPulse`    | pulse [ms]     |
//! | `/DecBacklashFloor`    | floor [ms]     |
//! | `/DecBacklashCeiling`  | ceiling [ms]   |
//! | `/BacklashCompEnabled` | bool           |

use std::sync::Arc;

use guide_common::consts::{
    BLC_DEFAULT_CEILING_FACTOR, BLC_HISTORY_RESET_DELTA, BLC_MAX_DECREASE_FACTOR,
    BLC_MAX_INCREASE_FACTOR, MAX_COMP_AMOUNT, MIN_COMP_AMOUNT,
};
use guide_common::guide::config::BacklashConfig;
use guide_common::guide::direction::{GuideDirection, MoveOptions};
use guide_common::notify::{GuideEvent, GuideEventSink};
use guide_common::store::{ScopedStore, StoreValue};
use serde::Serialize;
use tracing::{debug, warn};

use super::history::BlcHistory;

pub const KEY_PULSE: &str = "/DecBacklashPulse";
pub const KEY_FLOOR: &str = "/DecBacklashFloor";
pub const KEY_CEILING: &str = "/DecBacklashCeiling";
pub const KEY_ENABLED: &str = "/BacklashCompEnabled";

/// Current compensation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BacklashSettings {
    pub pulse_width: u32,
    pub floor: u32,
    pub ceiling: u32,
    pub fixed_size: bool,
}

fn stored_ms(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

/// Dec backlash compensator of one mount.
pub struct BacklashComp {
    store: ScopedStore,
    sink: Arc<dyn GuideEventSink>,
    pulse_width: u32,
    floor: u32,
    ceiling: u32,
    fixed_size: bool,
    active: bool,
    last_direction: Option<GuideDirection>,
    history: BlcHistory,
}

impl std::fmt::Debug for BacklashComp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BacklashComp")
            .field("settings", &self.settings())
            .field("active", &self.active)
            .field("last_direction", &self.last_direction)
            .finish_non_exhaustive()
    }
}

impl BacklashComp {
    /// Build from persisted settings, falling back to `config` for keys the
    /// store does not hold yet.
    ///
    /// Compensation is active only with a positive stored pulse and the
    /// enabled flag set.
    pub fn new(
        store: ScopedStore,
        config: &BacklashConfig,
        sink: Arc<dyn GuideEventSink>,
        now_ms: u64,
    ) -> Self {
        let pulse = store.get_int(KEY_PULSE, i64::from(config.pulse_ms));
        let floor = store.get_int(KEY_FLOOR, i64::from(config.floor_ms));
        let ceiling = store.get_int(KEY_CEILING, i64::from(config.ceiling_ms));
        let active = pulse > 0 && store.get_bool(KEY_ENABLED, config.enabled);

        let mut comp = Self {
            store,
            sink,
            pulse_width: 0,
            floor: 0,
            ceiling: 0,
            fixed_size: true,
            active,
            last_direction: None,
            history: BlcHistory::new(now_ms),
        };
        comp.set_comp_values(stored_ms(pulse), stored_ms(floor), stored_ms(ceiling));

        if comp.active {
            debug!(
                pulse = comp.pulse_width,
                floor = comp.floor,
                ceiling = comp.ceiling,
                fixed = comp.fixed_size,
                "BLC: enabled"
            );
        } else {
            debug!("BLC: backlash compensation is disabled");
        }
        comp
    }

    // ─── Accessors ──────────────────────────────────────────────────

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[inline]
    pub fn pulse_width(&self) -> u32 {
        self.pulse_width
    }

    pub fn settings(&self) -> BacklashSettings {
        BacklashSettings {
            pulse_width: self.pulse_width,
            floor: self.floor,
            ceiling: self.ceiling,
            fixed_size: self.fixed_size,
        }
    }

    #[inline]
    pub fn last_direction(&self) -> Option<GuideDirection> {
        self.last_direction
    }

    pub fn history(&self) -> &BlcHistory {
        &self.history
    }

    /// Dec max duration the compensation pulse needs, when active.
    pub fn required_max_dec_duration(&self) -> Option<u32> {
        self.active.then_some(self.pulse_width)
    }

    // ─── Settings ───────────────────────────────────────────────────

    fn set_comp_values(&mut self, requested: u32, floor: u32, ceiling: u32) {
        self.pulse_width = requested.clamp(MIN_COMP_AMOUNT, MAX_COMP_AMOUNT);
        self.floor = if floor > self.pulse_width || floor < MIN_COMP_AMOUNT {
            MIN_COMP_AMOUNT
        } else {
            floor
        };
        self.ceiling = if ceiling < self.pulse_width {
            let derived = (BLC_DEFAULT_CEILING_FACTOR * f64::from(self.pulse_width)).round() as u32;
            derived.min(MAX_COMP_AMOUNT)
        } else {
            ceiling.min(MAX_COMP_AMOUNT)
        };
        self.fixed_size = self.ceiling - self.floor < MIN_COMP_AMOUNT;
    }

    fn persist(&self, key: &str, value: impl Into<StoreValue>) {
        if let Err(e) = self.store.set(key, value) {
            warn!(key, error = %e, "BLC: failed to persist setting");
        }
    }

    /// Request new settings. A ceiling below the pulse derives a default.
    ///
    /// A pulse change larger than [`BLC_HISTORY_RESET_DELTA`] invalidates the
    /// learned history. The resulting settings are always persisted.
    pub fn set_pulse_width(&mut self, ms: u32, floor: u32, ceiling: u32) {
        if self.pulse_width != ms || self.floor != floor || self.ceiling != ceiling {
            let old = self.pulse_width;
            self.set_comp_values(ms, floor, ceiling);
            self.sink.publish(GuideEvent::GuidingParam {
                name: "Backlash comp amount".into(),
                value: f64::from(self.pulse_width),
            });
            debug!(
                pulse = self.pulse_width,
                floor = self.floor,
                ceiling = self.ceiling,
                fixed = self.fixed_size,
                "BLC: comp pulse set"
            );
            if self.pulse_width.abs_diff(old) > BLC_HISTORY_RESET_DELTA {
                self.history.clear();
            }
        }

        self.persist(KEY_PULSE, self.pulse_width);
        self.persist(KEY_FLOOR, self.floor);
        self.persist(KEY_CEILING, self.ceiling);
    }

    pub fn enable(&mut self, enable: bool) {
        let changed = self.active != enable;
        self.active = enable;
        if changed {
            self.sink.publish(GuideEvent::GuidingParam {
                name: "Backlash comp enabled".into(),
                value: if enable { 1.0 } else { 0.0 },
            });
            if enable {
                self.reset_state();
            }
        }
        self.persist(KEY_ENABLED, self.active);
        debug!(enabled = self.active, pulse = self.pulse_width, "BLC: enable");
    }

    /// Forget the last Dec direction and stop tracking.
    pub fn reset_state(&mut self) {
        if self.active {
            self.last_direction = None;
            self.history.close_window();
            debug!("BLC: last direction was reset");
        }
    }

    // ─── Per-step hooks ─────────────────────────────────────────────

    /// Observe the raw Dec offset of a frame and adapt the pulse.
    ///
    /// `min_move` is the Dec algorithm's dead band, `y_rate` the calibrated
    /// Dec rate [px/ms].
    pub fn track(
        &mut self,
        options: MoveOptions,
        y_raw: f64,
        min_move: Option<f64>,
        y_rate: f64,
        now_ms: u64,
    ) {
        if !self.active {
            return;
        }
        if !options.contains(MoveOptions::USE_BACKLASH_COMP) {
            // Dec moved without telling us the direction
            self.reset_state();
            return;
        }
        if !options.contains(MoveOptions::ALGORITHM_RESULT) {
            self.history.close_window();
            return;
        }
        if !self.history.window_open() || self.fixed_size {
            return;
        }

        let direction = GuideDirection::from_dec_distance(y_raw);
        let miss = if Some(direction) == self.last_direction {
            y_raw.abs()
        } else {
            -y_raw.abs()
        };
        let min_move = min_move.unwrap_or(0.0).max(0.0);

        if !self.history.add_deflection(now_ms, miss, min_move) {
            return;
        }
        let Some(adjustment) = self.history.adjustment_needed(miss, min_move, y_rate) else {
            return;
        };

        let pulse = f64::from(self.pulse_width);
        let nominal = pulse + adjustment;
        let new_pulse = if nominal > pulse {
            let increased = (pulse * BLC_MAX_INCREASE_FACTOR).min(nominal).round() as u32;
            if increased > self.ceiling {
                debug!(ceiling = self.ceiling, "BLC: pulse increase limited by ceiling");
                self.ceiling
            } else {
                increased
            }
        } else {
            let decreased = (pulse * BLC_MAX_DECREASE_FACTOR).max(nominal).round() as u32;
            if decreased < self.floor {
                debug!(floor = self.floor, "BLC: pulse decrease limited by floor");
                self.floor
            } else {
                decreased
            }
        };

        debug!(from = self.pulse_width, to = new_pulse, "BLC: pulse adjusted");
        self.persist(KEY_PULSE, new_pulse);
        self.set_comp_values(new_pulse, self.floor, self.ceiling);
    }

    /// Add the compensation pulse to a Dec request that reverses direction.
    ///
    /// Returns the adjusted duration [ms].
    pub fn apply(&mut self, options: MoveOptions, y_distance: f64, amount: u32, now_ms: u64) -> u32 {
        if !options.contains(MoveOptions::USE_BACKLASH_COMP)
            || !self.active
            || self.pulse_width == 0
            || y_distance == 0.0
        {
            return amount;
        }

        let direction = GuideDirection::from_dec_distance(y_distance);
        let algorithm_move = options.contains(MoveOptions::ALGORITHM_RESULT);
        let mut amount = amount;

        if self.last_direction.is_some_and(|last| last != direction) {
            amount = amount.saturating_add(self.pulse_width);
            if algorithm_move {
                self.history.record_pulse(now_ms, y_distance);
            } else {
                self.history.close_window();
                debug!("BLC: compensation applied to non-algorithm move");
            }
            debug!(
                to = %direction,
                pulse = self.pulse_width,
                "BLC: Dec direction reversal, comp pulse applied"
            );
        } else if !algorithm_move {
            debug!("BLC: non-algorithm move does not reverse Dec, no comp applied");
        }

        self.last_direction = Some(direction);
        amount
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
