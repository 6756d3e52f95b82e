//! Hotstreak detection and pattern analysis.
//!
//! The detector keeps a bounded rolling window of round outcomes and
//! classifies the short-term trend against the longer-term baseline. It is
//! a pure function of its window contents — no hidden state — so recovery
//! can replay persisted history and land on an identical signal.

use serde::Deserialize;
use std::collections::VecDeque;
use tracing::debug;

use crate::types::{HotstreakSignal, StreakClass};

/// Below this, a standard deviation is treated as degenerate.
const STD_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which series the window statistics run over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesKind {
    /// Raw crash multipliers.
    Multiplier,
    /// Binary indicator: 1.0 when the crash reached `high_multiplier`.
    Indicator,
}

/// Detector tuning. All thresholds and window sizes are configuration —
/// the defaults were tuned empirically against live history.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Ring buffer capacity; oldest outcome evicted on overflow.
    pub window_capacity: usize,
    /// Length of the short (recent) segment.
    pub short_len: usize,
    /// Minimum length of the long (baseline) segment.
    pub long_len: usize,
    /// Standard deviations the short mean must clear to classify.
    pub threshold_sigma: f64,
    /// Threshold for the binary high-multiplier indicator.
    pub high_multiplier: f64,
    pub series: SeriesKind,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_capacity: 50,
            short_len: 5,
            long_len: 15,
            threshold_sigma: 1.5,
            high_multiplier: 2.0,
            series: SeriesKind::Multiplier,
        }
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Rolling-window hot/cold streak classifier.
pub struct HotstreakDetector {
    config: DetectorConfig,
    window: VecDeque<f64>,
}

impl HotstreakDetector {
    pub fn new(config: DetectorConfig) -> Self {
        let capacity = config.window_capacity;
        Self {
            config,
            window: VecDeque::with_capacity(capacity),
        }
    }

    /// Record a settled round's crash multiplier and return the signal for
    /// the updated window.
    pub fn observe(&mut self, crash_multiplier: f64) -> HotstreakSignal {
        if self.window.len() == self.config.window_capacity {
            self.window.pop_front();
        }
        self.window.push_back(crash_multiplier);
        self.signal()
    }

    /// Replace the window with replayed history (most recent last).
    /// Only the trailing `window_capacity` outcomes are retained.
    pub fn seed<I: IntoIterator<Item = f64>>(&mut self, outcomes: I) {
        self.window.clear();
        for m in outcomes {
            if self.window.len() == self.config.window_capacity {
                self.window.pop_front();
            }
            self.window.push_back(m);
        }
        debug!(samples = self.window.len(), "Detector window seeded");
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Full window contents, oldest first.
    pub fn contents(&self) -> Vec<f64> {
        self.window.iter().copied().collect()
    }

    /// Last `n` outcomes, oldest first. Empty if fewer than `n` are held.
    pub fn last_n(&self, n: usize) -> Vec<f64> {
        if self.window.len() < n {
            return Vec::new();
        }
        self.window.iter().skip(self.window.len() - n).copied().collect()
    }

    /// Compute the signal from the current window contents.
    ///
    /// The window splits into a long baseline segment and the short tail
    /// (last `short_len`). Classification compares the short mean against
    /// the long mean in units of the long segment's standard deviation.
    pub fn signal(&self) -> HotstreakSignal {
        let n = self.window.len();
        let cfg = &self.config;

        if n < cfg.long_len + cfg.short_len {
            return HotstreakSignal::insufficient(n);
        }

        let series: Vec<f64> = match cfg.series {
            SeriesKind::Multiplier => self.window.iter().copied().collect(),
            SeriesKind::Indicator => self
                .window
                .iter()
                .map(|m| if *m >= cfg.high_multiplier { 1.0 } else { 0.0 })
                .collect(),
        };

        let (long, short) = series.split_at(n - cfg.short_len);
        let long_mean = mean(long);
        let long_std = std_dev(long);
        let short_mean = mean(short);
        let diff = short_mean - long_mean;

        let (classification, confidence) = if long_std < STD_EPSILON {
            // Degenerate baseline: any deviation from an all-identical long
            // segment is maximal evidence.
            if diff.abs() < STD_EPSILON {
                (StreakClass::Neutral, 0.0)
            } else if diff > 0.0 {
                (StreakClass::Hot, 1.0)
            } else {
                (StreakClass::Cold, 1.0)
            }
        } else {
            let z = diff / long_std;
            let class = if z > cfg.threshold_sigma {
                StreakClass::Hot
            } else if z < -cfg.threshold_sigma {
                StreakClass::Cold
            } else {
                StreakClass::Neutral
            };
            let confidence = (z.abs() / (2.0 * cfg.threshold_sigma)).clamp(0.0, 1.0);
            (class, confidence)
        };

        HotstreakSignal {
            classification,
            confidence,
            short_mean,
            long_mean,
            long_std,
            samples: n,
        }
    }
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Population standard deviation.
fn std_dev(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let m = mean(xs);
    (xs.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / xs.len() as f64).sqrt()
}

// ---------------------------------------------------------------------------
// Pattern signals
// ---------------------------------------------------------------------------

/// Tuning for the stateless pattern scans.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Window size the scans run over.
    pub window: usize,
    /// Standard deviation above which `HighDeviation` fires.
    pub high_deviation_limit: f64,
    pub pre_streak_mean: f64,
    pub pre_streak_min_high: usize,
    pub pre_streak_deviation: f64,
    pub pre_streak_spike: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            window: 10,
            high_deviation_limit: 25.0,
            pre_streak_mean: 3.75,
            pre_streak_min_high: 4,
            pre_streak_deviation: 12.0,
            pre_streak_spike: 7.16,
        }
    }
}

/// Advisory signals used to arm signal-gated strategies. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum PatternSignal {
    /// Volatility burst: window standard deviation above the limit.
    HighDeviation { std_dev: f64 },
    /// Elevated mean, several high multipliers, high deviation, and a
    /// spike — the shape that tends to precede a streak.
    PreStreak,
}

/// Scan a window of crash multipliers (oldest first) for pattern signals.
pub fn analyze_window(window: &[f64], config: &PatternConfig) -> Vec<PatternSignal> {
    let mut signals = Vec::new();
    if window.is_empty() {
        return signals;
    }

    let avg = mean(window);
    let std = std_dev(window);
    let max = window.iter().copied().fold(f64::MIN, f64::max);
    let high_count = window.iter().filter(|m| **m >= 2.0).count();

    if window.len() == config.window
        && avg > config.pre_streak_mean
        && high_count >= config.pre_streak_min_high
        && std > config.pre_streak_deviation
        && max > config.pre_streak_spike
    {
        signals.push(PatternSignal::PreStreak);
    }

    if std > config.high_deviation_limit {
        signals.push(PatternSignal::HighDeviation { std_dev: std });
    }

    signals
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
