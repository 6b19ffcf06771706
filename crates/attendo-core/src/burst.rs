//! Online estimate of a device's probe burst interval.
//!
//! Phones emit probe requests in bursts: several frames within a few
//! milliseconds, then silence for seconds to minutes depending on the OS and
//! screen state. Intra-burst gaps say nothing about presence, so only gaps
//! of at least the burst cutoff feed the estimate. The resulting mean is the
//! adaptive silence timeout the presence machine uses to suspect departure.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Default gap below which two sightings are considered the same burst.
pub const DEFAULT_BURST_CUTOFF: Duration = Duration::seconds(1);

/// Interval assumed until at least one inter-burst gap has been observed.
pub const DEFAULT_BURST_INTERVAL: Duration = Duration::hours(1);

/// Running mean and variance (Welford) of inter-burst gaps, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BurstEstimator {
    count: u64,
    mean: f64,
    m2: f64,
}

impl BurstEstimator {
    /// An estimator with no observations.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    /// Feeds the gap between two consecutive sightings.
    ///
    /// Returns `true` if the gap counted as an inter-burst interval. Gaps
    /// shorter than `cutoff`, negative gaps (out-of-order delivery) and
    /// non-finite values are ignored.
    pub fn observe(&mut self, gap: Duration, cutoff: Duration) -> bool {
        if gap < cutoff || gap <= Duration::zero() {
            return false;
        }
        self.observe_secs(duration_secs(gap))
    }

    /// Feeds a gap already expressed in seconds. Applies no cutoff.
    pub fn observe_secs(&mut self, secs: f64) -> bool {
        if !secs.is_finite() || secs <= 0.0 {
            return false;
        }
        self.count += 1;
        let delta = secs - self.mean;
        #[allow(clippy::cast_precision_loss)]
        let n = self.count as f64;
        self.mean += delta / n;
        self.m2 += delta * (secs - self.mean);
        true
    }

    /// Number of inter-burst gaps observed.
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Mean gap in seconds, `None` before the first observation.
    #[must_use]
    pub fn mean_secs(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    /// Sample variance in seconds², `None` with fewer than two observations.
    #[must_use]
    pub fn variance_secs(&self) -> Option<f64> {
        #[allow(clippy::cast_precision_loss)]
        (self.count > 1).then(|| self.m2 / (self.count - 1) as f64)
    }

    /// Current interval estimate, falling back to `default` on cold start.
    #[must_use]
    pub fn interval_or(&self, default: Duration) -> Duration {
        self.mean_secs().map_or(default, secs_duration)
    }

    /// Current interval estimate with the built-in one hour fallback.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval_or(DEFAULT_BURST_INTERVAL)
    }
}

#[allow(clippy::cast_precision_loss)]
fn duration_secs(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

#[allow(clippy::cast_possible_truncation)]
fn secs_duration(secs: f64) -> Duration {
    Duration::milliseconds((secs * 1000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cold_start_uses_default() {
        let est = BurstEstimator::new();
        assert_eq!(est.count(), 0);
        assert_eq!(est.mean_secs(), None);
        assert_eq!(est.interval(), Duration::hours(1));
        assert_eq!(est.interval_or(Duration::minutes(5)), Duration::minutes(5));
    }

    #[test]
    fn test_burst_gaps_are_ignored() {
        let mut est = BurstEstimator::new();
        assert!(!est.observe(Duration::milliseconds(20), DEFAULT_BURST_CUTOFF));
        assert!(!est.observe(Duration::milliseconds(999), DEFAULT_BURST_CUTOFF));
        assert!(!est.observe(Duration::seconds(-30), DEFAULT_BURST_CUTOFF));
        assert_eq!(est.count(), 0);

        assert!(est.observe(Duration::seconds(1), DEFAULT_BURST_CUTOFF));
        assert_eq!(est.count(), 1);
    }

    #[test]
    fn test_incremental_mean_matches_update_rule() {
        let mut est = BurstEstimator::new();
        for secs in [30, 60, 90] {
            est.observe(Duration::seconds(secs), DEFAULT_BURST_CUTOFF);
        }
        assert_eq!(est.count(), 3);
        assert!((est.mean_secs().unwrap() - 60.0).abs() < 1e-9);
        assert_eq!(est.interval(), Duration::seconds(60));
        // Sample variance of 30, 60, 90 is 900.
        assert!((est.variance_secs().unwrap() - 900.0).abs() < 1e-9);
    }

    #[test]
    fn test_variance_needs_two_samples() {
        let mut est = BurstEstimator::new();
        est.observe_secs(12.0);
        assert_eq!(est.variance_secs(), None);
        est.observe_secs(14.0);
        assert!((est.variance_secs().unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_non_finite() {
        let mut est = BurstEstimator::new();
        assert!(!est.observe_secs(f64::NAN));
        assert!(!est.observe_secs(f64::INFINITY));
        assert!(!est.observe_secs(0.0));
        assert_eq!(est.count(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn mean_matches_batch_mean(samples in proptest::collection::vec(1.0f64..7200.0, 1..400)) {
            let mut est = BurstEstimator::new();
            for s in &samples {
                est.observe_secs(*s);
            }
            #[allow(clippy::cast_precision_loss)]
            let batch = samples.iter().sum::<f64>() / samples.len() as f64;
            prop_assert_eq!(est.count(), samples.len() as u64);
            prop_assert!((est.mean_secs().unwrap() - batch).abs() <= 1e-6 * batch.max(1.0));
        }

        #[test]
        fn variance_matches_batch_variance(samples in proptest::collection::vec(1.0f64..600.0, 2..200)) {
            let mut est = BurstEstimator::new();
            for s in &samples {
                est.observe_secs(*s);
            }
            #[allow(clippy::cast_precision_loss)]
            let n = samples.len() as f64;
            let mean = samples.iter().sum::<f64>() / n;
            let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
            prop_assert!((est.variance_secs().unwrap() - var).abs() <= 1e-6 * var.max(1.0));
        }

        #[test]
        fn converges_to_population_mean(seed in 0u64..1000) {
            // Deterministic saw-tooth series around 120s; its population mean is 120.
            let mut est = BurstEstimator::new();
            for i in 0..2000u64 {
                let offset = ((i + seed) % 41) as f64 - 20.0;
                est.observe_secs(120.0 + offset);
            }
            prop_assert!((est.mean_secs().unwrap() - 120.0).abs() < 0.5);
        }
    }
}
