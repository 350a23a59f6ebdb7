//! # fx-policy
//!
//! Exponential-weights hyperparameter policy for federated exploration.
//!
//! Provides search space definitions and their expansion into finite action
//! spaces, the per-aspect sampling distribution, step-size schedules, and the
//! bandit update that folds per-round participant feedback into the policy.

mod policy;
mod schedule;
mod search;
mod updater;

pub use policy::{default_eta0, logsumexp, ArmSample, PolicySnapshot, PolicyState, SearchAspect};
pub use schedule::StepSchedule;
pub use search::{ActionSpace, ParameterDef, ParameterKind, RandomSearch, SearchSpace};
pub use updater::{discounted_mean, PolicyUpdater, Trace, TraceKey, UpdateReport};
