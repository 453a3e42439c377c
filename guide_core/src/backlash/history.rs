//! Bounded history of backlash compensation events.
//!
//! Each event holds the Dec deflection that triggered a compensation pulse
//! plus up to two follow-up deflections. Follow-ups are collected while the
//! tracking window is open: it opens when a pulse is recorded and closes on
//! an adjustment decision or once the event is full.
//!
//! ## Miss sign
//!
//! | Miss | Meaning                                 |
//! |------|-----------------------------------------|
//! | > 0  | Star kept going the same way: too short |
//! | < 0  | Star came back past the lock: too long  |

use guide_common::consts::{
    BLC_ENTRY_CAPACITY, BLC_HISTORY_DEPTH, BLC_OVERSHOOT_AVG_MISS,
};
use serde::Serialize;
use static_assertions::const_assert;
use tracing::debug;

// Overshoot pruning looks four events back.
const_assert!(BLC_HISTORY_DEPTH > 4);

/// Events that must precede the newest one before an overshoot majority counts.
const OVERSHOOT_MAJORITY_MIN_INDEX: usize = 4;

/// One deflection sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Deflection {
    /// Time since the history was created [ms].
    pub time_offset_ms: u64,
    /// Signed miss [px].
    pub miss: f64,
}

// ─── Event ──────────────────────────────────────────────────────────

/// One compensation pulse and its observed outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct BlcEvent {
    corrections: heapless::Vec<Deflection, BLC_ENTRY_CAPACITY>,
    pub initial_overshoot: bool,
    pub initial_undershoot: bool,
    pub stiction_seen: bool,
}

impl BlcEvent {
    fn new(time_offset_ms: u64, trigger: f64) -> Self {
        let mut corrections = heapless::Vec::new();
        // an empty vector always has room for the trigger
        let _ = corrections.push(Deflection {
            time_offset_ms,
            miss: trigger,
        });
        Self {
            corrections,
            initial_overshoot: false,
            initial_undershoot: false,
            stiction_seen: false,
        }
    }

    #[inline]
    pub fn info_count(&self) -> usize {
        self.corrections.len()
    }

    /// Trigger first, then follow-ups in arrival order.
    pub fn corrections(&self) -> &[Deflection] {
        &self.corrections
    }

    fn miss_at(&self, index: usize) -> Option<f64> {
        self.corrections.get(index).map(|d| d.miss)
    }

    fn add_info(&mut self, time_offset_ms: u64, miss: f64, min_move: f64) {
        if self
            .corrections
            .push(Deflection {
                time_offset_ms,
                miss,
            })
            .is_err()
        {
            return;
        }
        // misses inside the algorithm dead band are stored but not classified
        if miss.abs() <= min_move {
            return;
        }
        match self.corrections.len() {
            2 => {
                if miss > 0.0 {
                    self.initial_undershoot = true;
                } else {
                    self.initial_overshoot = true;
                }
            }
            3 => {
                self.stiction_seen = miss < 0.0 && self.miss_at(1).is_some_and(|m| m > 0.0);
            }
            _ => {}
        }
    }
}

// ─── Stats ──────────────────────────────────────────────────────────

/// Summary of the most recent events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BlcStats {
    /// Events without an initial overshoot.
    pub short_count: u32,
    /// Events with an initial overshoot.
    pub long_count: u32,
    pub stiction_count: u32,
    /// Mean of the first follow-up misses [px].
    pub avg_initial_miss: f64,
    /// Mean of the second follow-up misses of stiction events [px].
    pub avg_stiction_amount: f64,
}

// ─── History ────────────────────────────────────────────────────────

/// FIFO of the last [`BLC_HISTORY_DEPTH`] compensation events.
#[derive(Debug, Clone)]
pub struct BlcHistory {
    events: heapless::Vec<BlcEvent, BLC_HISTORY_DEPTH>,
    /// Event receiving follow-ups, always the newest one.
    index: Option<usize>,
    window_open: bool,
    time_base_ms: u64,
}

impl BlcHistory {
    pub fn new(time_base_ms: u64) -> Self {
        Self {
            events: heapless::Vec::new(),
            index: None,
            window_open: false,
            time_base_ms,
        }
    }

    #[inline]
    pub fn window_open(&self) -> bool {
        self.window_open
    }

    pub fn close_window(&mut self) {
        if self.window_open {
            debug!("BLC: window closed");
        }
        self.window_open = false;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[BlcEvent] {
        &self.events
    }

    /// Event currently tracked, if any.
    pub fn current(&self) -> Option<&BlcEvent> {
        self.index.and_then(|i| self.events.get(i))
    }

    fn offset(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.time_base_ms)
    }

    /// Record a new compensation pulse and open the tracking window.
    pub fn record_pulse(&mut self, now_ms: u64, trigger: f64) {
        if self.events.is_full() {
            self.events.remove(0);
            debug!("BLC: oldest event removed");
        }
        let event = BlcEvent::new(self.offset(now_ms), trigger);
        // room was made above
        let _ = self.events.push(event);
        self.index = Some(self.events.len() - 1);
        self.window_open = true;
    }

    /// Append a follow-up to the current event.
    ///
    /// Returns false and closes the window when the event is already full or
    /// no event exists.
    pub fn add_deflection(&mut self, now_ms: u64, miss: f64, min_move: f64) -> bool {
        let offset = self.offset(now_ms);
        if let Some(event) = self.index.and_then(|i| self.events.get_mut(i)) {
            if event.info_count() < BLC_ENTRY_CAPACITY {
                event.add_info(offset, miss, min_move);
                return true;
            }
        }
        self.close_window();
        false
    }

    fn remove_oldest_where(&mut self, how_many: usize, pred: impl Fn(&BlcEvent) -> bool) {
        for _ in 0..how_many {
            // the newest event is never pruned
            let candidates = self.events.len().saturating_sub(1);
            if let Some(pos) = self.events[..candidates].iter().position(&pred) {
                self.events.remove(pos);
                self.index = self.events.len().checked_sub(1);
            }
        }
    }

    /// Drop up to `how_many` of the oldest overshoot events.
    pub fn remove_oldest_overshoots(&mut self, how_many: usize) {
        self.remove_oldest_where(how_many, |e| e.initial_overshoot);
    }

    /// Drop up to `how_many` of the oldest stiction events.
    pub fn remove_oldest_stictions(&mut self, how_many: usize) {
        self.remove_oldest_where(how_many, |e| e.stiction_seen);
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.index = None;
        self.close_window();
        debug!("BLC: history cleared");
    }

    /// Stats over up to `num_events` events ending at the current one.
    pub fn stats(&self, num_events: usize) -> BlcStats {
        let mut stats = BlcStats::default();
        let Some(top) = self.index else {
            return stats;
        };
        let bottom = (top + 1).saturating_sub(num_events);
        let mut sum = 0.0;
        let mut stiction_sum = 0.0;
        let mut count = 0u32;

        for event in self.events[bottom..=top].iter().rev() {
            if event.initial_overshoot {
                stats.long_count += 1;
            } else {
                stats.short_count += 1;
            }
            if event.stiction_seen {
                stats.stiction_count += 1;
                stiction_sum += event.miss_at(2).unwrap_or(0.0);
            }
            if let Some(first) = event.miss_at(1) {
                sum += first;
                count += 1;
            }
        }

        if count > 0 {
            stats.avg_initial_miss = sum / f64::from(count);
        }
        if stats.stiction_count > 0 {
            stats.avg_stiction_amount = stiction_sum / f64::from(stats.stiction_count);
        }
        stats
    }

    /// Decide whether the compensation pulse should change after `miss`.
    ///
    /// Returns the signed nominal correction [ms] when a change is warranted.
    /// The window is closed after every decision; it stays open only while
    /// the current event still waits for its second follow-up or the miss is
    /// inside the dead band.
    pub fn adjustment_needed(&mut self, miss: f64, min_move: f64, y_rate: f64) -> Option<f64> {
        let top = self.index?;
        let stats = self.stats(BLC_HISTORY_DEPTH);
        let current = self.events.get(top)?.clone();
        debug!(
            miss,
            avg_initial_miss = stats.avg_initial_miss,
            short = stats.short_count,
            long = stats.long_count,
            stiction = stats.stiction_count,
            deflections = ?current.corrections().iter().map(|d| d.miss).collect::<Vec<_>>(),
            "BLC: history state"
        );

        if miss.abs() < min_move {
            debug!("BLC: no correction, miss below min move");
            return None;
        }

        let nominal = |amount: f64| (amount.abs() / y_rate).floor();
        let corr = nominal(stats.avg_initial_miss);

        let correction = if miss > 0.0 {
            // undershoot
            if stats.avg_initial_miss <= 0.0 {
                debug!("BLC: undershoot, no adjustment, average initial miss <= 0");
                None
            } else if current.info_count() < BLC_ENTRY_CAPACITY {
                debug!("BLC: undershoot, waiting for more data");
                return None;
            } else if stats.stiction_count > 2 {
                debug!("BLC: undershoot, no adjustment because of stiction history");
                None
            } else if stats.long_count >= 2 {
                debug!("BLC: undershoot, no adjustment because of overshoot history");
                None
            } else {
                debug!(corr, "BLC: undershoot, nominal increase");
                Some(corr)
            }
        } else if current.stiction_seen {
            if stats.stiction_count > 1 {
                let stiction_corr = nominal(stats.avg_stiction_amount);
                self.remove_oldest_stictions(1);
                debug!(corr = -stiction_corr, "BLC: overshoot with stiction, nominal decrease");
                Some(-stiction_corr)
            } else {
                debug!("BLC: overshoot, first stiction event, no adjustment");
                None
            }
        } else if stats.long_count > stats.short_count && top >= OVERSHOOT_MAJORITY_MIN_INDEX {
            self.remove_oldest_overshoots(2);
            debug!(corr = -corr, "BLC: recent overshoot history, nominal decrease");
            Some(-corr)
        } else if stats.avg_initial_miss <= BLC_OVERSHOOT_AVG_MISS {
            debug!(corr = -corr, "BLC: average miss indicates overshooting, nominal decrease");
            Some(-corr)
        } else {
            debug!("BLC: overshoot, no adjustment based on average initial miss");
            None
        };

        self.close_window();
        correction
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Record one complete event with the given follow-ups.
    fn event(h: &mut BlcHistory, t: u64, follow: &[f64]) {
        h.record_pulse(t, 1.0);
        for (i, m) in follow.iter().enumerate() {
            assert!(h.add_deflection(t + 1 + i as u64, *m, 0.0));
        }
    }

    #[test]
    fn eleventh_event_evicts_oldest() {
        let mut h = BlcHistory::new(0);
        for t in 0..10 {
            h.record_pulse(t * 100, t as f64);
        }
        assert_eq!(h.len(), 10);
        h.record_pulse(2000, 42.0);
        assert_eq!(h.len(), 10);
        assert_eq!(h.events()[0].corrections()[0].miss, 1.0);
        assert_eq!(h.current().unwrap().corrections()[0].miss, 42.0);
        assert!(h.window_open());
    }

    #[test]
    fn event_flags() {
        let mut h = BlcHistory::new(0);
        event(&mut h, 0, &[0.4]);
        assert!(h.current().unwrap().initial_undershoot);

        event(&mut h, 10, &[-0.4]);
        assert!(h.current().unwrap().initial_overshoot);

        event(&mut h, 20, &[0.4, -0.3]);
        let e = h.current().unwrap();
        assert!(e.initial_undershoot && e.stiction_seen);
    }

    #[test]
    fn dead_band_misses_are_stored_but_unclassified() {
        let mut h = BlcHistory::new(0);
        h.record_pulse(0, 1.0);
        assert!(h.add_deflection(1, 0.05, 0.1));
        let e = h.current().unwrap();
        assert_eq!(e.info_count(), 2);
        assert!(!e.initial_undershoot && !e.initial_overshoot);
    }

    #[test]
    fn full_event_closes_window() {
        let mut h = BlcHistory::new(0);
        event(&mut h, 0, &[0.5, 0.5]);
        assert!(h.window_open());
        assert!(!h.add_deflection(5, 0.5, 0.0));
        assert!(!h.window_open());
        assert_eq!(h.current().unwrap().info_count(), 3);
    }

    #[test]
    fn deflection_without_event_is_rejected() {
        let mut h = BlcHistory::new(0);
        assert!(!h.add_deflection(0, 1.0, 0.0));
        assert!(h.adjustment_needed(1.0, 0.0, 0.01).is_none());
    }

    #[test]
    fn stats_average_first_follow_ups() {
        let mut h = BlcHistory::new(0);
        event(&mut h, 0, &[0.2, 0.1]);
        event(&mut h, 10, &[-0.6]);
        event(&mut h, 20, &[0.4, -0.2]);
        let s = h.stats(BLC_HISTORY_DEPTH);
        assert_eq!(s.long_count, 1);
        assert_eq!(s.short_count, 2);
        assert_eq!(s.stiction_count, 1);
        assert!((s.avg_initial_miss - 0.0).abs() < 1e-12);
        assert!((s.avg_stiction_amount + 0.2).abs() < 1e-12);
    }

    #[test]
    fn pruning_keeps_newest_event() {
        let mut h = BlcHistory::new(0);
        event(&mut h, 0, &[-0.5]);
        event(&mut h, 10, &[0.5]);
        event(&mut h, 20, &[-0.5]);
        h.remove_oldest_overshoots(5);
        assert_eq!(h.len(), 2);
        assert!(h.current().unwrap().initial_overshoot);
        assert!(h.events()[0].initial_undershoot);
    }

    #[test]
    fn undershoot_waits_for_second_follow_up() {
        let mut h = BlcHistory::new(0);
        h.record_pulse(0, 1.0);
        h.add_deflection(1, 0.5, 0.0);
        assert!(h.adjustment_needed(0.5, 0.0, 0.01).is_none());
        assert!(h.window_open());
        h.add_deflection(2, 0.5, 0.0);
        assert_eq!(h.adjustment_needed(0.5, 0.0, 0.01), Some(50.0));
        assert!(!h.window_open());
    }

    #[test]
    fn overshoot_average_decreases() {
        let mut h = BlcHistory::new(0);
        h.record_pulse(0, 1.0);
        h.add_deflection(1, -0.25, 0.0);
        assert_eq!(h.adjustment_needed(-0.25, 0.0, 1.0 / 64.0), Some(-16.0));
        assert!(!h.window_open());
    }

    #[test]
    fn small_overshoot_is_ignored() {
        let mut h = BlcHistory::new(0);
        h.record_pulse(0, 1.0);
        h.add_deflection(1, -0.05, 0.0);
        assert_eq!(h.adjustment_needed(-0.05, 0.0, 0.01), None);
        assert!(!h.window_open());
    }

    #[test]
    fn overshoot_majority_prunes_two() {
        let mut h = BlcHistory::new(0);
        for t in 0..5 {
            event(&mut h, t * 10, &[-0.125]);
        }
        assert_eq!(h.len(), 5);
        let corr = h.adjustment_needed(-0.125, 0.0, 1.0 / 64.0);
        assert_eq!(corr, Some(-8.0));
        assert_eq!(h.len(), 3);
    }
}
