//! Built-in guide algorithm.
//!
//! Smoothing algorithms (hysteresis, lowpass, resist-switch, ...) plug in
//! through [`GuideAlgorithm`]; the core only ships a pass-through with an
//! optional dead band, used when no algorithm is configured.

use guide_common::device::GuideAlgorithm;

/// Pass-through algorithm with an optional minimum move.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IdentityAlgorithm {
    min_move: Option<f64>,
}

impl IdentityAlgorithm {
    pub const fn new() -> Self {
        Self { min_move: None }
    }

    /// Distances below `min_move` [px] are suppressed.
    pub const fn with_min_move(min_move: f64) -> Self {
        Self {
            min_move: Some(min_move),
        }
    }
}

impl GuideAlgorithm for IdentityAlgorithm {
    fn id(&self) -> &'static str {
        "identity"
    }

    fn result(&mut self, distance: f64) -> f64 {
        match self.min_move {
            Some(min) if distance.abs() < min => 0.0,
            _ => distance,
        }
    }

    fn reset(&mut self) {}

    fn min_move(&self) -> Option<f64> {
        self.min_move
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_through() {
        let mut a = IdentityAlgorithm::new();
        assert_eq!(a.result(-0.01), -0.01);
        assert_eq!(a.min_move(), None);
        assert_eq!(a.id(), "identity");
    }

    #[test]
    fn dead_band() {
        let mut a = IdentityAlgorithm::with_min_move(0.2);
        assert_eq!(a.result(0.15), 0.0);
        assert_eq!(a.result(-0.25), -0.25);
        assert_eq!(a.min_move(), Some(0.2));
    }
}
