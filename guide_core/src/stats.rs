//! Running sample statistics.
//!
//! Keeps the raw samples so the median is available; sample counts in this
//! crate are small (tens of North steps), so sorting on demand is fine.

use serde::Serialize;

/// Sum, mean, sample variance and median of a sample set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SampleStats {
    values: Vec<f64>,
    sum: f64,
    sum_sq: f64,
}

impl SampleStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.values.push(value);
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f64
        }
    }

    /// Unbiased sample variance, 0 with fewer than two samples.
    pub fn variance(&self) -> f64 {
        let n = self.values.len() as f64;
        if self.values.len() < 2 {
            return 0.0;
        }
        ((n * self.sum_sq - self.sum * self.sum) / (n * (n - 1.0))).max(0.0)
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Median; mean of the two middle samples for even counts.
    pub fn median(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mut sorted = self.values.clone();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
