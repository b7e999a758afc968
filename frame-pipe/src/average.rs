//! Fixed-window moving average of per-frame durations, used for ETA.

use std::time::{Duration, Instant};

/// Circular buffer of the last `window` samples.
///
/// The average is only recomputed when the buffer wraps; between wraps
/// callers combine the stored average with [`RateAverager::time_since_update`].
#[derive(Debug, Clone)]
pub struct RateAverager {
    samples: Vec<Duration>,
    next: usize,
    average: Duration,
    ready: bool,
    updated_at: Option<Instant>,
}

impl Default for RateAverager {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

impl RateAverager {
    pub const DEFAULT_WINDOW: usize = 10;

    pub fn new(window: usize) -> Self {
        Self {
            samples: vec![Duration::ZERO; window.max(1)],
            next: 0,
            average: Duration::ZERO,
            ready: false,
            updated_at: None,
        }
    }

    pub fn window(&self) -> usize {
        self.samples.len()
    }

    pub fn push(&mut self, sample: Duration) {
        self.samples[self.next] = sample;
        self.next = (self.next + 1) % self.samples.len();

        if self.next == 0 {
            let total: Duration = self.samples.iter().sum();
            self.average = total / self.samples.len() as u32;
            self.ready = true;
            self.updated_at = Some(Instant::now());
        } else {
            self.ready = false;
        }
    }

    /// Whether the buffer has just wrapped and the average is fresh.
    pub fn average_ready(&self) -> bool {
        self.ready
    }

    /// Last computed average; zero before the first wrap.
    pub fn average(&self) -> Duration {
        self.average
    }

    pub fn get_average(&mut self, reset_ready: bool) -> Duration {
        if reset_ready {
            self.ready = false;
        }
        self.average
    }

    /// Zero until the first average has been computed.
    pub fn time_since_update(&self) -> Duration {
        self.updated_at
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    /// `remaining * average - time_since_update`, floored at zero.
    ///
    /// `None` until the first average has been computed.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        if self.average.is_zero() {
            return None;
        }
        let total = self.average.as_secs_f64() * remaining as f64;
        let total = Duration::try_from_secs_f64(total).unwrap_or(Duration::MAX);
        Some(total.saturating_sub(self.time_since_update()))
    }

    pub fn reset(&mut self) {
        self.samples.fill(Duration::ZERO);
        self.next = 0;
        self.average = Duration::ZERO;
        self.ready = false;
        self.updated_at = None;
    }
}

#[cfg(test)]
#[path = "average_test.rs"]
mod average_test;
