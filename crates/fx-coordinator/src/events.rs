//! Coordinator lifecycle states and the events published while a run progresses.

use chrono::{DateTime, Utc};
use fx_policy::UpdateReport;
use fx_types::ParticipantId;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::eval::EvalSummary;

/// Where the coordinator is in its round cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "round", rename_all = "snake_case")]
pub enum CoordinatorState {
    Idle,
    Sampling(u64),
    AwaitingFeedback(u64),
    Aggregating(u64),
    PolicyUpdating(u64),
    Evaluating(u64),
    Finished,
}

impl CoordinatorState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Sampling(r) => write!(f, "sampling({r})"),
            Self::AwaitingFeedback(r) => write!(f, "awaiting_feedback({r})"),
            Self::Aggregating(r) => write!(f, "aggregating({r})"),
            Self::PolicyUpdating(r) => write!(f, "policy_updating({r})"),
            Self::Evaluating(r) => write!(f, "evaluating({r})"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// Why a message was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Late,
    Unexpected,
}

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rounds_completed: u64,
    pub early_stopped: bool,
    pub final_entropy: f64,
    pub final_mle: f64,
    /// Most likely arm per aspect.
    pub best_arms: Vec<usize>,
    pub last_evaluation: Option<EvalSummary>,
}

/// Structured progress notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    StateChanged {
        from: CoordinatorState,
        to: CoordinatorState,
    },
    RoundStarted {
        round: u64,
        receivers: Vec<ParticipantId>,
    },
    FeedbackBuffered {
        round: u64,
        participant: ParticipantId,
        received: usize,
        required: usize,
    },
    MessageDropped {
        round: u64,
        participant: ParticipantId,
        reason: DropReason,
    },
    Aggregated {
        round: u64,
        participants: usize,
    },
    PolicyUpdated {
        round: u64,
        report: UpdateReport,
    },
    ExplorationStopped {
        round: u64,
        entropy: f64,
    },
    EvaluationStarted {
        round: u64,
        participants: usize,
    },
    EvaluationMerged {
        summary: EvalSummary,
    },
    EarlyStopped {
        round: u64,
        metric: f64,
    },
    Finished {
        summary: RunSummary,
    },
}
