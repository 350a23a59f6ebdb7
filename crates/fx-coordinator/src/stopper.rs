//! Early stopping on a tracked evaluation metric.

use serde::{Deserialize, Serialize};

/// Whether the tracked metric should go up or down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Minimize
    }
}

/// Decides after each evaluation whether the run should end early.
pub trait EarlyStopper: Send {
    fn track_and_check(&mut self, metric: f64) -> bool;
}

/// Never requests an early stop.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverStop;

impl EarlyStopper for NeverStop {
    fn track_and_check(&mut self, _metric: f64) -> bool {
        false
    }
}

/// Stops once the metric has not improved for `patience` consecutive checks.
///
/// A patience of zero disables stopping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatienceStopper {
    pub patience: usize,
    /// Minimum change that counts as an improvement.
    pub min_delta: f64,
    pub direction: ObjectiveDirection,
    best: Option<f64>,
    stale_checks: usize,
}

impl PatienceStopper {
    pub fn new(patience: usize, min_delta: f64, direction: ObjectiveDirection) -> Self {
        Self {
            patience,
            min_delta,
            direction,
            best: None,
            stale_checks: 0,
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    fn improves(&self, metric: f64) -> bool {
        match self.best {
            None => !metric.is_nan(),
            Some(best) => match self.direction {
                ObjectiveDirection::Minimize => metric < best - self.min_delta,
                ObjectiveDirection::Maximize => metric > best + self.min_delta,
            },
        }
    }
}

impl EarlyStopper for PatienceStopper {
    fn track_and_check(&mut self, metric: f64) -> bool {
        if self.patience == 0 {
            return false;
        }
        if self.improves(metric) {
            self.best = Some(metric);
            self.stale_checks = 0;
        } else {
            self.stale_checks += 1;
        }
        self.stale_checks >= self.patience
    }
}
