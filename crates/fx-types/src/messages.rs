//! Messages exchanged between the coordinator and participants.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::params::{HyperConfig, ModelParams};

/// Participant identifier. Participants are numbered from 1.
pub type ParticipantId = u32;

/// Result of one participant's local training round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientUpdate {
    /// Number of local training samples, used as aggregation weight.
    pub sample_size: f64,
    /// Locally trained model.
    pub model: ModelParams,
    /// Arm index chosen for each aspect, as received from the coordinator.
    pub arms: Vec<usize>,
    pub loss_before: f64,
    pub loss_after: f64,
}

impl ClientUpdate {
    pub fn feedback(&self) -> Feedback {
        Feedback {
            sample_size: self.sample_size,
            arms: self.arms.clone(),
            loss_before: self.loss_before,
            loss_after: self.loss_after,
        }
    }
}

/// The bandit feedback tuple consumed by the policy updater.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub sample_size: f64,
    pub arms: Vec<usize>,
    pub loss_before: f64,
    pub loss_after: f64,
}

impl Feedback {
    pub fn new(sample_size: f64, arms: Vec<usize>, loss_before: f64, loss_after: f64) -> Self {
        Self {
            sample_size,
            arms,
            loss_before,
            loss_after,
        }
    }
}

/// Evaluation metrics reported by one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub sample_size: f64,
    pub metrics: BTreeMap<String, f64>,
}

/// Inbound message from a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Train {
        round: u64,
        sender: ParticipantId,
        update: ClientUpdate,
    },
    Eval {
        round: u64,
        sender: ParticipantId,
        report: EvalReport,
    },
}

impl ClientMessage {
    pub fn round(&self) -> u64 {
        match self {
            Self::Train { round, .. } | Self::Eval { round, .. } => *round,
        }
    }

    pub fn sender(&self) -> ParticipantId {
        match self {
            Self::Train { sender, .. } | Self::Eval { sender, .. } => *sender,
        }
    }
}

/// Outbound payload dispatched to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Dispatch {
    /// Train locally with the sampled configuration.
    Train {
        round: u64,
        model: ModelParams,
        arms: Vec<usize>,
        /// Fixed search-space values overlaid with the sampled configuration.
        hyperparams: HyperConfig,
    },
    /// Evaluate the current global model.
    Evaluate { round: u64, model: ModelParams },
    /// The run is over; carries the final model.
    Finish { round: u64, model: ModelParams },
}

impl Dispatch {
    pub fn round(&self) -> u64 {
        match self {
            Self::Train { round, .. } | Self::Evaluate { round, .. } | Self::Finish { round, .. } => {
                *round
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Train { .. } => "train",
            Self::Evaluate { .. } => "evaluate",
            Self::Finish { .. } => "finish",
        }
    }
}
