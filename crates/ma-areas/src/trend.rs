//! Sliding-window humidity trend detection

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_MIN_SAMPLES: usize = 2;

const RISING_WINDOW: Duration = Duration::from_secs(600);
const RISING_MAX_SAMPLES: usize = 3;
const FALLING_WINDOW: Duration = Duration::from_secs(300);
const FALLING_MAX_SAMPLES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendSettings {
    /// Samples older than this are evicted on evaluation
    pub window: Duration,
    pub max_samples: usize,
    pub min_samples: usize,
    /// Gradient per second; the sign selects the direction
    pub threshold: f64,
}

impl TrendSettings {
    pub fn rising(threshold: f64) -> Self {
        Self {
            window: RISING_WINDOW,
            max_samples: RISING_MAX_SAMPLES,
            min_samples: DEFAULT_MIN_SAMPLES,
            threshold,
        }
    }

    pub fn falling(threshold: f64) -> Self {
        Self {
            window: FALLING_WINDOW,
            max_samples: FALLING_MAX_SAMPLES,
            min_samples: DEFAULT_MIN_SAMPLES,
            threshold,
        }
    }
}

/// Detects whether a quantity moves faster than a threshold in one direction
#[derive(Debug, Clone)]
pub struct HumidityTrendTracker {
    settings: TrendSettings,
    samples: VecDeque<(Instant, f64)>,
    active: bool,
    gradient: Option<f64>,
}

impl HumidityTrendTracker {
    pub fn new(settings: TrendSettings) -> Self {
        Self {
            settings,
            samples: VecDeque::with_capacity(settings.max_samples + 1),
            active: false,
            gradient: None,
        }
    }

    pub fn settings(&self) -> &TrendSettings {
        &self.settings
    }

    /// Append a reading. Non-finite values are rejected.
    pub fn ingest(&mut self, at: Instant, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        self.samples.push_back((at, value));
        while self.samples.len() > self.settings.max_samples {
            self.samples.pop_front();
        }
        true
    }

    /// Evict aged samples and return the points to regress, or `None` when
    /// too few remain to judge
    pub fn prepare(&mut self, now: Instant) -> Option<Vec<(f64, f64)>> {
        if let Some(cutoff) = now.checked_sub(self.settings.window) {
            while self.samples.front().is_some_and(|(at, _)| *at < cutoff) {
                self.samples.pop_front();
            }
        }
        if self.samples.len() < self.settings.min_samples {
            return None;
        }
        let (origin, _) = self.samples.front().copied()?;
        Some(
            self.samples
                .iter()
                .map(|(at, value)| (at.duration_since(origin).as_secs_f64(), *value))
                .collect(),
        )
    }

    /// Record the regression result; a degenerate fit counts as inactive
    pub fn apply(&mut self, gradient: Option<f64>) -> bool {
        self.gradient = gradient;
        self.active = gradient.is_some_and(|g| exceeds(g, self.settings.threshold));
        self.active
    }

    /// `prepare` and `apply` in one step on the calling thread
    pub fn evaluate(&mut self, now: Instant) -> bool {
        match self.prepare(now) {
            Some(points) => self.apply(least_squares_slope(&points)),
            None => self.active,
        }
    }

    /// Carry over a verdict published before a restart. It holds until
    /// enough new samples arrive to judge.
    pub fn restore_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn gradient(&self) -> Option<f64> {
        self.gradient
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// Ordinary least-squares slope of `(x, y)` points. `None` for fewer than two
/// points or when every x is the same.
pub fn least_squares_slope(points: &[(f64, f64)]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;

    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (x, y) in points {
        let dx = x - mean_x;
        sxy += dx * (y - mean_y);
        sxx += dx * dx;
    }
    if sxx == 0.0 {
        return None;
    }
    let slope = sxy / sxx;
    slope.is_finite().then_some(slope)
}

/// Steeper than `threshold` and in the same direction
pub fn exceeds(gradient: f64, threshold: f64) -> bool {
    gradient.abs() > threshold.abs() && gradient.signum() == threshold.signum()
}
