//! Coordinator and policy configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config_error;
use crate::errors::FxResult;

/// Which reported losses feed the bandit gradient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossPairing {
    /// Use the participant's reported (before, after) pair.
    BeforeAndAfter,
    /// Use the reported after-training loss for both ends of the pair.
    AfterOnly,
}

impl Default for LossPairing {
    fn default() -> Self {
        Self::BeforeAndAfter
    }
}

/// Top-level configuration for a FedEx run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FedExConfig {
    /// Number of random configurations drawn when the search space is flattened.
    pub num_arms: usize,

    /// Collapse the search space into one aspect of randomly drawn arms.
    pub flatten_search_space: bool,

    /// Grid points per continuous parameter when the space is not flattened.
    pub grid_steps: usize,

    /// Step-size schedule: "adaptive", "aggressive", "auto", "constant" or "scale".
    /// Checked when the policy is updated.
    pub step_schedule: String,

    /// Step-size base override; defaults to `sqrt(2 ln size)` per aspect.
    pub eta0: Option<f64>,

    /// Use `after - before` instead of `after` as the observed loss.
    pub use_difference: bool,

    /// Discount applied to past refine values when computing the baseline.
    pub discount_factor: f64,

    /// Exploration stops once the policy entropy drops below this value.
    pub entropy_cutoff: f64,

    pub loss_pairing: LossPairing,

    /// Evaluate every this many rounds.
    pub eval_frequency: u64,

    pub total_round_budget: u64,

    /// Participants sampled per training round; 0 means all of them.
    pub sample_client_num: usize,

    /// Evaluation metric fed to the early stopper.
    pub tracked_metric: String,

    /// Seed for the coordinator's random source.
    pub seed: Option<u64>,

    /// Directory receiving the persisted policy.
    pub outdir: Option<PathBuf>,
}

impl Default for FedExConfig {
    fn default() -> Self {
        Self {
            num_arms: 16,
            flatten_search_space: true,
            grid_steps: 5,
            step_schedule: "auto".to_string(),
            eta0: None,
            use_difference: false,
            discount_factor: 1.0,
            entropy_cutoff: 1.0e-5,
            loss_pairing: LossPairing::BeforeAndAfter,
            eval_frequency: 1,
            total_round_budget: 10,
            sample_client_num: 0,
            tracked_metric: "test_loss".to_string(),
            seed: None,
            outdir: None,
        }
    }
}

impl FedExConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(raw: &str) -> FxResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> FxResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn with_num_arms(mut self, n: usize) -> Self {
        self.num_arms = n;
        self
    }

    pub fn with_flatten(mut self, flatten: bool) -> Self {
        self.flatten_search_space = flatten;
        self
    }

    pub fn with_schedule(mut self, schedule: &str) -> Self {
        self.step_schedule = schedule.to_string();
        self
    }

    pub fn with_eta0(mut self, eta0: f64) -> Self {
        self.eta0 = Some(eta0);
        self
    }

    pub fn with_difference(mut self, use_difference: bool) -> Self {
        self.use_difference = use_difference;
        self
    }

    pub fn with_discount(mut self, gamma: f64) -> Self {
        self.discount_factor = gamma;
        self
    }

    pub fn with_entropy_cutoff(mut self, cutoff: f64) -> Self {
        self.entropy_cutoff = cutoff;
        self
    }

    pub fn with_rounds(mut self, total: u64, eval_frequency: u64) -> Self {
        self.total_round_budget = total;
        self.eval_frequency = eval_frequency;
        self
    }

    pub fn with_sample_client_num(mut self, n: usize) -> Self {
        self.sample_client_num = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_outdir(mut self, outdir: impl Into<PathBuf>) -> Self {
        self.outdir = Some(outdir.into());
        self
    }

    pub fn validate(&self) -> FxResult<()> {
        if self.num_arms == 0 {
            return Err(config_error!("num_arms must be positive"));
        }
        if !self.flatten_search_space && self.grid_steps < 2 {
            return Err(config_error!(
                "grid_steps must be at least 2, got {}",
                self.grid_steps
            ));
        }
        if !(0.0..=1.0).contains(&self.discount_factor) {
            return Err(config_error!(
                "discount_factor must lie in [0, 1], got {}",
                self.discount_factor
            ));
        }
        if !(self.entropy_cutoff >= 0.0) {
            return Err(config_error!(
                "entropy_cutoff must be non-negative, got {}",
                self.entropy_cutoff
            ));
        }
        if let Some(eta0) = self.eta0 {
            if !eta0.is_finite() || eta0 < 0.0 {
                return Err(config_error!(
                    "eta0 must be finite and non-negative, got {eta0}"
                ));
            }
        }
        if self.eval_frequency == 0 {
            return Err(config_error!("eval_frequency must be positive"));
        }
        if self.total_round_budget == 0 {
            return Err(config_error!("total_round_budget must be positive"));
        }
        Ok(())
    }
}
