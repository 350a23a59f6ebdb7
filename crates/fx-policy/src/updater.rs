//! Exponential-weights policy updates driven by per-round participant feedback.

use fx_types::{internal_error, validation_error, FedExConfig, Feedback, FxResult, LossPairing};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::policy::PolicyState;
use crate::schedule::StepSchedule;

/// Weighted mean of `trace` where the entry `k` steps back weighs `factor^k`.
pub fn discounted_mean(trace: &[f64], factor: f64) -> f64 {
    let n = trace.len();
    let mut num = 0.0;
    let mut den = 0.0;
    for (k, value) in trace.iter().enumerate() {
        let weight = factor.powi((n - 1 - k) as i32);
        num += value * weight;
        den += weight;
    }
    num / den
}

/// Series recorded once per completed round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceKey {
    /// Weighted mean loss before local training.
    Global,
    /// Weighted mean loss after local training.
    Refine,
    Entropy,
    Mle,
}

/// Append-only diagnostic history of the policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    global: Vec<f64>,
    refine: Vec<f64>,
    entropy: Vec<f64>,
    mle: Vec<f64>,
}

impl Trace {
    fn seeded(entropy: f64, mle: f64) -> Self {
        Self {
            entropy: vec![entropy],
            mle: vec![mle],
            ..Self::default()
        }
    }

    pub fn get(&self, key: TraceKey) -> &[f64] {
        match key {
            TraceKey::Global => &self.global,
            TraceKey::Refine => &self.refine,
            TraceKey::Entropy => &self.entropy,
            TraceKey::Mle => &self.mle,
        }
    }

    pub fn last(&self, key: TraceKey) -> Option<f64> {
        self.get(key).last().copied()
    }

    /// Number of rounds recorded so far.
    pub fn rounds(&self) -> usize {
        self.refine.len()
    }
}

/// What one update did to the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub global: f64,
    pub refine: f64,
    pub baseline: f64,
    pub entropy: f64,
    pub mle: f64,
    /// Step size applied to each aspect; empty when the policy is frozen.
    pub step_sizes: Vec<f64>,
    /// The policy was already frozen and was left untouched.
    pub frozen: bool,
    /// Exploration stopped as a result of this update.
    pub stopped_exploration: bool,
}

/// Applies the exponential-weights update to a [`PolicyState`].
#[derive(Debug, Clone)]
pub struct PolicyUpdater {
    schedule: String,
    use_difference: bool,
    discount_factor: f64,
    loss_pairing: LossPairing,
    trace: Trace,
}

impl PolicyUpdater {
    pub fn new(config: &FedExConfig, policy: &PolicyState) -> Self {
        Self {
            schedule: config.step_schedule.clone(),
            use_difference: config.use_difference,
            discount_factor: config.discount_factor,
            loss_pairing: config.loss_pairing,
            trace: Trace::seeded(policy.entropy(), policy.mle()),
        }
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    /// Reference loss the next round's observations are measured against.
    pub fn baseline(&self) -> f64 {
        if self.trace.refine.is_empty() {
            return 0.0;
        }
        if self.use_difference {
            let diffs: Vec<f64> = self
                .trace
                .refine
                .iter()
                .zip(&self.trace.global)
                .map(|(r, g)| r - g)
                .collect();
            discounted_mean(&diffs, self.discount_factor)
        } else {
            discounted_mean(&self.trace.refine, self.discount_factor)
        }
    }

    /// Reject a single participant's feedback that the update could not consume.
    pub fn check_feedback(&self, policy: &PolicyState, feedback: &Feedback) -> FxResult<()> {
        if !(feedback.sample_size > 0.0 && feedback.sample_size.is_finite()) {
            return Err(validation_error!(
                "sample size must be positive, got {}",
                feedback.sample_size
            ));
        }
        let (before, after) = self.loss_pair(feedback);
        if !(before.is_finite() && after.is_finite()) {
            return Err(validation_error!("feedback carries non-finite losses"));
        }
        policy.check_arms(&feedback.arms)
    }

    /// Everything [`update`](Self::update) checks before it touches the policy.
    pub fn validate(&self, policy: &PolicyState, feedback: &[Feedback]) -> FxResult<StepSchedule> {
        let schedule: StepSchedule = self.schedule.parse()?;
        if feedback.is_empty() {
            return Err(validation_error!("no feedback for policy update"));
        }
        for fb in feedback {
            self.check_feedback(policy, fb)?;
        }
        Ok(schedule)
    }

    fn loss_pair(&self, feedback: &Feedback) -> (f64, f64) {
        match self.loss_pairing {
            LossPairing::BeforeAndAfter => (feedback.loss_before, feedback.loss_after),
            LossPairing::AfterOnly => (feedback.loss_after, feedback.loss_after),
        }
    }

    /// Fold one round of feedback into the policy.
    pub fn update(
        &mut self,
        policy: &mut PolicyState,
        feedback: &[Feedback],
    ) -> FxResult<UpdateReport> {
        let schedule = self.validate(policy, feedback)?;
        let total: f64 = feedback.iter().map(|fb| fb.sample_size).sum();
        let weights: Vec<f64> = feedback.iter().map(|fb| fb.sample_size / total).collect();
        let (before, after): (Vec<f64>, Vec<f64>) =
            feedback.iter().map(|fb| self.loss_pair(fb)).unzip();

        let baseline = self.baseline();
        let grads = if policy.exploration_stopped() {
            Vec::new()
        } else {
            let observed: Vec<f64> = before
                .iter()
                .zip(&after)
                .map(|(b, a)| if self.use_difference { a - b } else { *a })
                .collect();
            gradients(policy, feedback, &weights, &observed, baseline)?
        };

        let global = inner(&before, &weights);
        let refine = inner(&after, &weights);
        self.trace.global.push(global);
        self.trace.refine.push(refine);

        if policy.exploration_stopped() {
            self.trace.entropy.push(0.0);
            self.trace.mle.push(1.0);
            debug!(global, refine, "policy frozen, skipping update");
            return Ok(UpdateReport {
                global,
                refine,
                baseline,
                entropy: 0.0,
                mle: 1.0,
                step_sizes: Vec::new(),
                frozen: true,
                stopped_exploration: false,
            });
        }

        let mut step_sizes = Vec::with_capacity(grads.len());
        for (aspect, grad) in policy.aspects_mut().iter_mut().zip(&grads) {
            let denom = schedule.denominator(grad, aspect.grad_accum_mut());
            let eta = StepSchedule::step_size(aspect.eta0(), denom);
            aspect.apply_step(eta, grad);
            step_sizes.push(eta);
        }

        let entropy = policy.entropy();
        let mle = policy.mle();
        self.trace.entropy.push(entropy);
        self.trace.mle.push(mle);

        let stopped_exploration = entropy < policy.cutoff_entropy();
        if stopped_exploration {
            policy.stop_exploration();
        }

        info!(
            schedule = %schedule,
            baseline,
            entropy,
            mle,
            probs = ?policy.probabilities(),
            "updated policy"
        );
        if stopped_exploration {
            info!(entropy, cutoff = policy.cutoff_entropy(), "exploration stopped");
        }

        Ok(UpdateReport {
            global,
            refine,
            baseline,
            entropy,
            mle,
            step_sizes,
            frozen: false,
            stopped_exploration,
        })
    }
}

/// Importance-weighted gradient estimate for every aspect.
///
/// Arms have been checked by [`PolicyState::check_arms`].
fn gradients(
    policy: &PolicyState,
    feedback: &[Feedback],
    weights: &[f64],
    observed: &[f64],
    baseline: f64,
) -> FxResult<Vec<Vec<f64>>> {
    let aspects = policy.aspects();
    let mut grads = Vec::with_capacity(aspects.len());
    for (i, aspect) in aspects.iter().enumerate() {
        let mut grad = vec![0.0; aspect.size()];
        for ((fb, w), s) in feedback.iter().zip(weights).zip(observed) {
            let arm = fb.arms[i];
            let p = aspect.prob()[arm];
            grad[arm] += w * (s - baseline) / p;
        }
        if grad.iter().any(|g| !g.is_finite()) {
            return Err(internal_error!(
                "non-finite gradient for aspect {i}: {grad:?}"
            ));
        }
        grads.push(grad);
    }
    Ok(grads)
}

fn inner(values: &[f64], weights: &[f64]) -> f64 {
    values.iter().zip(weights).map(|(v, w)| v * w).sum()
}
