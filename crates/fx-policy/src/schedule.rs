//! Step-size schedules for the exponential-weights update.

use fx_types::FxError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How the per-aspect step size `eta0 / denominator` is scaled each round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepSchedule {
    /// AdaGrad-style: square root of the accumulated squared sup-norms.
    Adaptive,
    /// Normalize by the current gradient's sup-norm.
    Aggressive,
    /// Decay as `1 / sqrt(t)`.
    Auto,
    Constant,
    /// Multiply by `sqrt(2 ln size)`; single-arm aspects never move.
    Scale,
}

impl StepSchedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Adaptive => "adaptive",
            Self::Aggressive => "aggressive",
            Self::Auto => "auto",
            Self::Constant => "constant",
            Self::Scale => "scale",
        }
    }

    /// Denominator for this round's step.
    ///
    /// `grad_accum` is the aspect's accumulator, updated in place for the
    /// schedules that accumulate.
    pub fn denominator(&self, grad: &[f64], grad_accum: &mut f64) -> f64 {
        match self {
            Self::Adaptive => {
                let norm = sup_norm(grad);
                *grad_accum += norm * norm;
                grad_accum.sqrt()
            }
            Self::Aggressive => {
                if grad.iter().all(|g| *g == 0.0) {
                    1.0
                } else {
                    sup_norm(grad)
                }
            }
            Self::Auto => {
                *grad_accum += 1.0;
                grad_accum.sqrt()
            }
            Self::Constant => 1.0,
            Self::Scale => {
                if grad.len() > 1 {
                    1.0 / (2.0 * (grad.len() as f64).ln()).sqrt()
                } else {
                    f64::INFINITY
                }
            }
        }
    }

    /// Step size for the given base and denominator.
    ///
    /// A zero or non-finite denominator means there is nothing to move by, so
    /// the step is zero.
    pub fn step_size(eta0: f64, denominator: f64) -> f64 {
        if denominator > 0.0 && denominator.is_finite() {
            eta0 / denominator
        } else {
            0.0
        }
    }
}

impl FromStr for StepSchedule {
    type Err = FxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adaptive" => Ok(Self::Adaptive),
            "aggressive" => Ok(Self::Aggressive),
            "auto" => Ok(Self::Auto),
            "constant" => Ok(Self::Constant),
            "scale" => Ok(Self::Scale),
            other => Err(FxError::UnsupportedSchedule(other.to_string())),
        }
    }
}

impl std::fmt::Display for StepSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn sup_norm(grad: &[f64]) -> f64 {
    grad.iter().fold(0.0, |acc, g| acc.max(g.abs()))
}
