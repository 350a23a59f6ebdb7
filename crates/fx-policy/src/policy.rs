//! Policy state: per-aspect log-probabilities and the queries built on them.

use fx_types::{internal_error, validation_error, FxResult, HyperConfig};
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::search::ActionSpace;

/// Snapshots normalized within this bound are restored bit for bit.
const RESTORE_TOLERANCE: f64 = 1e-12;

/// Numerically stable `ln(Σ exp(x))`.
pub fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Step-size base used when none is configured: `sqrt(2 ln size)`.
pub fn default_eta0(size: usize) -> f64 {
    (2.0 * (size as f64).ln()).sqrt()
}

/// One independently sampled dimension of the action space.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchAspect {
    candidates: Vec<HyperConfig>,
    log_prob: Vec<f64>,
    prob: Vec<f64>,
    grad_accum: f64,
    eta0: f64,
}

impl SearchAspect {
    fn new(candidates: Vec<HyperConfig>, eta0: Option<f64>) -> Self {
        let size = candidates.len();
        let log_prob = vec![-(size as f64).ln(); size];
        let mut aspect = Self {
            candidates,
            prob: Vec::new(),
            log_prob,
            grad_accum: 0.0,
            eta0: eta0.unwrap_or_else(|| default_eta0(size)),
        };
        aspect.refresh_prob();
        aspect
    }

    pub fn size(&self) -> usize {
        self.candidates.len()
    }

    pub fn candidates(&self) -> &[HyperConfig] {
        &self.candidates
    }

    pub fn log_prob(&self) -> &[f64] {
        &self.log_prob
    }

    pub fn prob(&self) -> &[f64] {
        &self.prob
    }

    pub fn grad_accum(&self) -> f64 {
        self.grad_accum
    }

    pub fn eta0(&self) -> f64 {
        self.eta0
    }

    /// Index of the most likely arm; ties go to the lowest index.
    pub fn argmax(&self) -> usize {
        let mut best = 0;
        for (i, p) in self.prob.iter().enumerate() {
            if *p > self.prob[best] {
                best = i;
            }
        }
        best
    }

    pub fn max_prob(&self) -> f64 {
        self.prob[self.argmax()]
    }

    /// Entropy of this aspect over its positive support.
    pub fn entropy(&self) -> f64 {
        -self
            .prob
            .iter()
            .filter(|p| **p > 0.0)
            .map(|p| p * p.ln())
            .sum::<f64>()
    }

    pub(crate) fn grad_accum_mut(&mut self) -> &mut f64 {
        &mut self.grad_accum
    }

    /// Exponential-weights step: `log_prob -= eta * grad`, then renormalize.
    pub(crate) fn apply_step(&mut self, eta: f64, grad: &[f64]) {
        if eta != 0.0 {
            for (z, g) in self.log_prob.iter_mut().zip(grad) {
                *z -= eta * g;
            }
        }
        let norm = logsumexp(&self.log_prob);
        for z in self.log_prob.iter_mut() {
            *z -= norm;
        }
        self.refresh_prob();
    }

    fn refresh_prob(&mut self) {
        self.prob = self.log_prob.iter().map(|z| z.exp()).collect();
    }

    fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> FxResult<usize> {
        let dist = WeightedIndex::<f64>::new(&self.prob).map_err(|e| {
            internal_error!("cannot sample from {:?}: {e}", self.prob)
        })?;
        Ok(dist.sample(rng))
    }
}

/// Arms drawn for one receiver: indices for the update, configurations for dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmSample {
    pub arms: Vec<usize>,
    pub configs: Vec<HyperConfig>,
}

/// Serializable log-probabilities, one vector per aspect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub log_probs: Vec<Vec<f64>>,
    #[serde(default)]
    pub exploration_stopped: bool,
}

/// The sampling distribution over the whole action space.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyState {
    aspects: Vec<SearchAspect>,
    exploration_stopped: bool,
    cutoff_entropy: f64,
}

impl PolicyState {
    /// Uniform policy over the action space.
    pub fn new(action_space: ActionSpace, eta0: Option<f64>, cutoff_entropy: f64) -> Self {
        let aspects = action_space
            .into_aspects()
            .into_iter()
            .map(|candidates| SearchAspect::new(candidates, eta0))
            .collect();
        Self {
            aspects,
            exploration_stopped: false,
            cutoff_entropy,
        }
    }

    /// Rebuild a policy from a persisted snapshot.
    ///
    /// Aspects whose log-probabilities do not sum to one are renormalized; an
    /// aspect with no finite entry is rejected.
    pub fn restore(
        action_space: ActionSpace,
        snapshot: &PolicySnapshot,
        eta0: Option<f64>,
        cutoff_entropy: f64,
    ) -> FxResult<Self> {
        let mut state = Self::new(action_space, eta0, cutoff_entropy);
        if snapshot.log_probs.len() != state.aspects.len() {
            return Err(validation_error!(
                "snapshot has {} aspects, action space has {}",
                snapshot.log_probs.len(),
                state.aspects.len()
            ));
        }
        for (i, (aspect, log_prob)) in state
            .aspects
            .iter_mut()
            .zip(&snapshot.log_probs)
            .enumerate()
        {
            if log_prob.len() != aspect.size() {
                return Err(validation_error!(
                    "snapshot aspect {i} has {} entries, expected {}",
                    log_prob.len(),
                    aspect.size()
                ));
            }
            if log_prob.iter().any(|z| z.is_nan() || *z == f64::INFINITY) {
                return Err(validation_error!(
                    "snapshot aspect {i} holds invalid log-probabilities"
                ));
            }
            let norm = logsumexp(log_prob);
            if !norm.is_finite() {
                return Err(validation_error!(
                    "snapshot aspect {i} has no probability mass"
                ));
            }
            aspect.log_prob = if norm.abs() > RESTORE_TOLERANCE {
                log_prob.iter().map(|z| z - norm).collect()
            } else {
                log_prob.clone()
            };
            aspect.refresh_prob();
        }
        state.exploration_stopped = snapshot.exploration_stopped;
        Ok(state)
    }

    /// Check that `arms` names one in-range arm per aspect, none of which
    /// had zero probability while exploring.
    pub fn check_arms(&self, arms: &[usize]) -> FxResult<()> {
        if arms.len() != self.aspects.len() {
            return Err(internal_error!(
                "feedback names {} arms, policy has {} aspects",
                arms.len(),
                self.aspects.len()
            ));
        }
        for (i, (aspect, &arm)) in self.aspects.iter().zip(arms).enumerate() {
            match aspect.prob.get(arm) {
                None => {
                    return Err(internal_error!(
                        "arm {arm} out of range for aspect {i} of size {}",
                        aspect.size()
                    ))
                }
                Some(p) if *p <= 0.0 && !self.exploration_stopped => {
                    return Err(internal_error!(
                        "arm {arm} of aspect {i} was played with zero probability"
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub fn aspects(&self) -> &[SearchAspect] {
        &self.aspects
    }

    pub(crate) fn aspects_mut(&mut self) -> &mut [SearchAspect] {
        &mut self.aspects
    }

    pub fn exploration_stopped(&self) -> bool {
        self.exploration_stopped
    }

    pub(crate) fn stop_exploration(&mut self) {
        self.exploration_stopped = true;
    }

    pub fn cutoff_entropy(&self) -> f64 {
        self.cutoff_entropy
    }

    /// Draw one arm per aspect, or take the most likely arms once exploration stopped.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> FxResult<ArmSample> {
        let mut arms = Vec::with_capacity(self.aspects.len());
        let mut configs = Vec::with_capacity(self.aspects.len());
        for aspect in &self.aspects {
            let idx = if self.exploration_stopped {
                aspect.argmax()
            } else {
                aspect.draw(rng)?
            };
            arms.push(idx);
            configs.push(aspect.candidates[idx].clone());
        }
        Ok(ArmSample { arms, configs })
    }

    /// Joint entropy of the product distribution.
    ///
    /// Aspects are sampled independently, so the joint entropy is the sum of
    /// the per-aspect entropies over their positive support.
    pub fn entropy(&self) -> f64 {
        self.aspects
            .iter()
            .map(SearchAspect::entropy)
            .sum::<f64>()
            .max(0.0)
    }

    /// Probability of the single most likely joint configuration.
    pub fn mle(&self) -> f64 {
        self.aspects.iter().map(SearchAspect::max_prob).product()
    }

    pub fn probabilities(&self) -> Vec<Vec<f64>> {
        self.aspects.iter().map(|a| a.prob.clone()).collect()
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            log_probs: self.aspects.iter().map(|a| a.log_prob.clone()).collect(),
            exploration_stopped: self.exploration_stopped,
        }
    }
}
