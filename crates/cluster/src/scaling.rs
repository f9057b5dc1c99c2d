//! Scaling signal computation: time-of-day weighting and smoothed trend.

/// Outcome of one scaling evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    ScaleUp,
    ScaleDown,
    Hold,
}

/// Demand multiplier for an hour of the day (UTC).
///
/// Peak business hours amplify the observed ratio so the cluster scales up
/// earlier; quiet hours damp it so a night-time blip does not add nodes.
pub(crate) fn hour_weight(hour: u32) -> f64 {
    match hour {
        9..=17 => 1.25,
        23 | 0..=5 => 0.75,
        _ => 1.0,
    }
}

/// Exponentially smoothed load ratio per hour-of-day bucket.
///
/// Each bucket remembers the typical (weighted) ratio for that hour, so the
/// trend compares the current sample against what this hour normally looks
/// like rather than against a different part of the day.
#[derive(Debug)]
pub(crate) struct LoadTrend {
    buckets: [Option<f64>; 24],
    alpha: f64,
}

impl LoadTrend {
    pub(crate) fn new() -> Self {
        Self {
            buckets: [None; 24],
            alpha: 0.3,
        }
    }

    /// Folds `ratio` into the bucket for `hour` and returns the delta
    /// against the previous smoothed value. The first sample of a bucket
    /// has no history and reports a flat trend.
    pub(crate) fn observe(&mut self, hour: u32, ratio: f64) -> f64 {
        let slot = &mut self.buckets[(hour % 24) as usize];
        match *slot {
            Some(prev) => {
                let smoothed = prev + self.alpha * (ratio - prev);
                *slot = Some(smoothed);
                smoothed - prev
            }
            None => {
                *slot = Some(ratio);
                0.0
            }
        }
    }
}
