//! Bounded-Window Rolling Statistics
//!
//! Fixed-capacity sample window with O(1) mean/stddev via incremental
//! accumulators. Oldest sample is evicted FIFO once the window is full.

use serde::Serialize;
use std::collections::VecDeque;

/// Descriptive statistics over the most recent `capacity` samples.
#[derive(Debug, Clone)]
pub struct StatsWindow {
    capacity: usize,
    samples: VecDeque<f64>,
    sum: f64,
    sum_sq: f64,
}

impl StatsWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    /// Add a sample, evicting the oldest when at capacity.
    /// Non-finite samples are ignored.
    pub fn add(&mut self, x: f64) {
        if !x.is_finite() {
            return;
        }
        if self.samples.len() == self.capacity {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
                self.sum_sq -= old * old;
            }
        }
        self.samples.push_back(x);
        self.sum += x;
        self.sum_sq += x * x;
    }

    #[inline]
    pub fn n(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.sum / self.samples.len() as f64
    }

    /// Sample standard deviation (divisor N−1); 0 for fewer than 2 samples.
    pub fn stddev(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean();
        // Accumulator cancellation can leave a tiny negative residue.
        let var = ((self.sum_sq - self.sum * mean) / (n - 1) as f64).max(0.0);
        var.sqrt()
    }

    /// Coefficient of variation (stddev / mean); 0 when the mean is not positive.
    pub fn coefficient_of_variation(&self) -> f64 {
        let mean = self.mean();
        if mean <= 0.0 {
            return 0.0;
        }
        self.stddev() / mean
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            n: self.n(),
            mean: self.mean(),
            stddev: self.stddev(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct WindowSnapshot {
    pub n: usize,
    pub mean: f64,
    pub stddev: f64,
}
