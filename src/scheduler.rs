//! Learning rate scheduler reducing on a validation-loss plateau.

use serde::{Deserialize, Serialize};

use crate::config::PlateauConfig;

/// Outcome of one scheduler step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlateauDecision {
    /// The metric improved on the best value; the counter was reset.
    Improved,
    /// No improvement, patience not exhausted.
    NoImprovement {
        /// Consecutive non-improving epochs.
        count: usize,
    },
    /// Patience exhausted; the learning rate was reduced and the counter reset.
    Reduced {
        /// Previous learning rate.
        from: f64,
        /// New learning rate.
        to: f64,
    },
}

/// Reduce-on-plateau scheduler in minimization mode.
///
/// An epoch improves when `metric < best * (1 - threshold)`. After `patience`
/// consecutive non-improving epochs the learning rate is multiplied by
/// `factor` (never below `min_lr`) and the counter restarts.
///
/// # Example
///
/// ```
/// use action_fusion_rs::config::PlateauConfig;
/// use action_fusion_rs::scheduler::ReduceLROnPlateau;
///
/// let mut scheduler = ReduceLROnPlateau::new(PlateauConfig::default(), 0.1);
/// for loss in [1.0, 0.9, 0.95, 0.96, 0.80] {
///     scheduler.step(loss);
/// }
/// assert!((scheduler.lr() - 0.01).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceLROnPlateau {
    config: PlateauConfig,
    lr: f64,
    best: Option<f64>,
    num_bad_epochs: usize,
    num_reductions: usize,
}

/// Reductions smaller than this are skipped.
const MIN_LR_DELTA: f64 = 1e-8;

impl ReduceLROnPlateau {
    /// Create a scheduler starting at `lr`.
    #[must_use]
    pub fn new(config: PlateauConfig, lr: f64) -> Self {
        Self {
            config,
            lr,
            best: None,
            num_bad_epochs: 0,
            num_reductions: 0,
        }
    }

    /// Feed one epoch's validation loss.
    pub fn step(&mut self, metric: f64) -> PlateauDecision {
        if self.is_better(metric) {
            self.best = Some(metric);
            self.num_bad_epochs = 0;
            return PlateauDecision::Improved;
        }

        self.num_bad_epochs += 1;
        if self.num_bad_epochs < self.config.patience {
            return PlateauDecision::NoImprovement {
                count: self.num_bad_epochs,
            };
        }

        self.num_bad_epochs = 0;
        let from = self.lr;
        let to = (from * self.config.factor).max(self.config.min_lr);
        if from - to > MIN_LR_DELTA {
            self.lr = to;
            self.num_reductions += 1;
            tracing::info!("Reducing learning rate: {:.3e} -> {:.3e}", from, to);
        }
        PlateauDecision::Reduced { from, to: self.lr }
    }

    fn is_better(&self, metric: f64) -> bool {
        match self.best {
            None => !metric.is_nan(),
            Some(best) => metric < best * (1.0 - self.config.threshold),
        }
    }

    /// Current learning rate.
    #[must_use]
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Best metric seen so far.
    #[must_use]
    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Current non-improvement count.
    #[must_use]
    pub fn num_bad_epochs(&self) -> usize {
        self.num_bad_epochs
    }

    /// Number of reductions applied.
    #[must_use]
    pub fn num_reductions(&self) -> usize {
        self.num_reductions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(patience: usize) -> ReduceLROnPlateau {
        let config = PlateauConfig {
            patience,
            ..Default::default()
        };
        ReduceLROnPlateau::new(config, 1e-3)
    }

    #[test]
    fn test_single_reduction_then_reset() {
        let mut s = scheduler(2);
        let decisions: Vec<_> = [1.0, 0.9, 0.95, 0.96, 0.80]
            .into_iter()
            .map(|loss| s.step(loss))
            .collect();

        assert_eq!(decisions[0], PlateauDecision::Improved);
        assert_eq!(decisions[1], PlateauDecision::Improved);
        assert_eq!(decisions[2], PlateauDecision::NoImprovement { count: 1 });
        assert!(matches!(decisions[3], PlateauDecision::Reduced { .. }));
        assert_eq!(decisions[4], PlateauDecision::Improved);

        assert_eq!(s.num_reductions(), 1);
        assert!((s.lr() - 1e-4).abs() < 1e-12);
        assert_eq!(s.num_bad_epochs(), 0);
        assert_eq!(s.best(), Some(0.80));
    }

    #[test]
    fn test_improvement_resets_counter() {
        let mut s = scheduler(2);
        s.step(1.0);
        s.step(1.1);
        assert_eq!(s.num_bad_epochs(), 1);
        s.step(0.5);
        assert_eq!(s.num_bad_epochs(), 0);
        s.step(0.6);
        assert_eq!(s.num_reductions(), 0);
    }

    #[test]
    fn test_threshold_is_relative() {
        let mut s = scheduler(1);
        s.step(1.0);
        // within 1e-4 relative of the best: not an improvement
        assert!(matches!(s.step(0.99995), PlateauDecision::Reduced { .. }));
    }

    #[test]
    fn test_min_lr_floor() {
        let config = PlateauConfig {
            patience: 1,
            min_lr: 5e-4,
            ..Default::default()
        };
        let mut s = ReduceLROnPlateau::new(config, 1e-3);
        s.step(1.0);
        s.step(2.0);
        assert!((s.lr() - 5e-4).abs() < 1e-12);
        s.step(2.0);
        assert!((s.lr() - 5e-4).abs() < 1e-12);
        assert_eq!(s.num_reductions(), 1);
    }

    #[test]
    fn test_state_serializes() {
        let mut s = scheduler(2);
        s.step(1.0);
        s.step(1.5);
        let json = serde_json::to_string(&s).unwrap();
        let restored: ReduceLROnPlateau = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, s);

        let fresh = serde_json::to_string(&scheduler(2)).unwrap();
        let restored: ReduceLROnPlateau = serde_json::from_str(&fresh).unwrap();
        assert_eq!(restored.best(), None);
    }
}
