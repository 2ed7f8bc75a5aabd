//! Build duration prediction
//!
//! Exponential blend of a static base estimate with observed history: each
//! completed build folds into a per-target moving average. The scheduler
//! reads predictions when deciding whether remaining frame budget covers a
//! reload step.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Per-target exponential moving average of build durations.
pub struct DurationEstimator {
    base: Duration,
    alpha: f64,
    history_ms: Mutex<HashMap<String, f64>>,
}

impl DurationEstimator {
    /// Estimator with a base estimate for unseen targets and blend factor
    /// `alpha` (weight of the newest observation, clamped to 0..=1).
    pub fn new(base: Duration, alpha: f64) -> Self {
        DurationEstimator {
            base,
            alpha: alpha.clamp(0.0, 1.0),
            history_ms: Mutex::new(HashMap::new()),
        }
    }

    /// Predicted duration for `target`.
    pub fn predict(&self, target: &str) -> Duration {
        let history = self.history_ms.lock();
        match history.get(target) {
            Some(ms) => Duration::from_secs_f64(ms / 1000.0),
            None => self.base,
        }
    }

    /// Fold one observed duration into the target's estimate.
    pub fn observe(&self, target: &str, observed: Duration) {
        let observed_ms = observed.as_secs_f64() * 1000.0;
        let mut history = self.history_ms.lock();
        let entry = history
            .entry(target.to_string())
            .or_insert(self.base.as_secs_f64() * 1000.0);
        *entry = self.alpha * observed_ms + (1.0 - self.alpha) * *entry;
    }

    /// Number of targets with observed history.
    pub fn tracked_targets(&self) -> usize {
        self.history_ms.lock().len()
    }
}

impl Default for DurationEstimator {
    fn default() -> Self {
        DurationEstimator::new(Duration::from_secs(2), 0.3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unseen_target_predicts_base() {
        let e = DurationEstimator::new(Duration::from_secs(3), 0.5);
        assert_eq!(e.predict("never-built"), Duration::from_secs(3));
    }

    #[test]
    fn test_observation_blends_toward_reality() {
        let e = DurationEstimator::new(Duration::from_secs(2), 0.5);
        e.observe("fast", Duration::from_millis(200));
        // First blend: 0.5 * 200 + 0.5 * 2000 = 1100ms.
        assert_eq!(e.predict("fast").as_millis(), 1100);

        // Repeated observations converge.
        for _ in 0..20 {
            e.observe("fast", Duration::from_millis(200));
        }
        assert!(e.predict("fast").as_millis() < 250);
    }

    #[test]
    fn test_targets_tracked_independently() {
        let e = DurationEstimator::new(Duration::from_secs(1), 0.3);
        e.observe("a", Duration::from_millis(100));
        e.observe("b", Duration::from_secs(10));
        assert!(e.predict("a") < e.predict("b"));
        assert_eq!(e.tracked_targets(), 2);
    }

    #[test]
    fn test_alpha_is_clamped() {
        let e = DurationEstimator::new(Duration::from_secs(1), 7.0);
        e.observe("t", Duration::from_millis(400));
        // alpha clamps to 1.0: the estimate IS the observation.
        assert_eq!(e.predict("t").as_millis(), 400);
    }
}
