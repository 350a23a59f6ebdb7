use thiserror::Error;

use crate::messages::ParticipantId;

/// Main error type for the FedEx coordinator
#[derive(Error, Debug)]
pub enum FxError {
    #[error("Invalid search space: {0}")]
    InvalidSearchSpace(String),

    #[error("Unsupported step-size schedule: {0}")]
    UnsupportedSchedule(String),

    #[error("Internal consistency error: {0}")]
    InternalConsistency(String),

    #[error("Feedback error: {0}")]
    Feedback(#[from] FeedbackError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Not enough participants: requested {requested}, available {available}")]
    InsufficientParticipants { requested: usize, available: usize },

    #[error("Invalid coordinator state: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Errors raised while accepting participant results into a round buffer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedbackError {
    #[error("Late arrival from participant {participant} for round {round} (current round {current})")]
    LateArrival {
        round: u64,
        participant: ParticipantId,
        current: u64,
    },

    #[error("Result from participant {participant} for round {round} which is not open (current round {current})")]
    UnexpectedRound {
        round: u64,
        participant: ParticipantId,
        current: u64,
    },

    #[error("Participant {participant} was not asked to report for round {round}")]
    UnexpectedParticipant { round: u64, participant: ParticipantId },

    #[error("Malformed result from participant {participant} for round {round}: {reason}")]
    Malformed {
        round: u64,
        participant: ParticipantId,
        reason: String,
    },

    #[error("No round is open for results")]
    NoOpenRound,
}

/// Errors surfaced by transport implementations
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Unknown participant: {0}")]
    UnknownParticipant(ParticipantId),

    #[error("Channel to participant {participant} closed")]
    ChannelClosed { participant: ParticipantId },
}

/// Result type alias for FedEx operations
pub type FxResult<T> = Result<T, FxError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::FxError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal consistency errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::FxError::InternalConsistency(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::FxError::Config(format!($($arg)*))
    };
}
