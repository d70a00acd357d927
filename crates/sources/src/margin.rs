//! Rolling margin statistics
//!
//! The margin of a frame is `timestamp_as_wallclock − now` at the moment
//! the frame leaves the decoder; positive margins mean the frame arrived
//! ahead of its nominal transmit time. The window holds the last 2500
//! samples, about one minute of frames.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Samples kept in the window (≈ 60 s at 24 ms per frame).
pub const MARGIN_WINDOW: usize = 2500;

/// Summary of the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MarginStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stdev: f64,
    pub num_measurements: usize,
}

/// Bounded window of margin samples in milliseconds.
#[derive(Debug, Default)]
pub struct MarginWindow {
    samples: Mutex<VecDeque<f64>>,
}

impl MarginWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, margin_ms: f64) {
        let mut samples = self.samples.lock();
        if samples.len() == MARGIN_WINDOW {
            samples.pop_front();
        }
        samples.push_back(margin_ms);
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }

    pub fn stats(&self) -> MarginStats {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return MarginStats::default();
        }

        let n = samples.len() as f64;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for &s in samples.iter() {
            min = min.min(s);
            max = max.max(s);
            sum += s;
        }
        let mean = sum / n;
        let sq_sum: f64 = samples.iter().map(|s| (s - mean) * (s - mean)).sum();

        MarginStats {
            min,
            max,
            mean,
            stdev: (sq_sum / n).sqrt(),
            num_measurements: samples.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_is_all_zero() {
        let window = MarginWindow::new();
        assert_eq!(window.stats(), MarginStats::default());
    }

    #[test]
    fn stats_over_known_samples() {
        let window = MarginWindow::new();
        for s in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            window.push(s);
        }
        let stats = window.stats();
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
        assert_eq!(stats.mean, 5.0);
        assert!((stats.stdev - 2.0).abs() < 1e-9);
        assert_eq!(stats.num_measurements, 8);
    }

    #[test]
    fn window_is_bounded() {
        let window = MarginWindow::new();
        for i in 0..(MARGIN_WINDOW + 100) {
            window.push(i as f64);
        }
        let stats = window.stats();
        assert_eq!(stats.num_measurements, MARGIN_WINDOW);
        // the oldest 100 samples fell out
        assert_eq!(stats.min, 100.0);
    }

    #[test]
    fn negative_margins_are_legal() {
        let window = MarginWindow::new();
        window.push(-12.5);
        window.push(12.5);
        let stats = window.stats();
        assert_eq!(stats.min, -12.5);
        assert_eq!(stats.mean, 0.0);
    }
}
