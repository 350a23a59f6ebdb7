//! Round coordination for federated hyperparameter exploration.
//!
//! Provides:
//! - The round state machine that samples, gates on quorum, aggregates and updates the policy
//! - Collaborator traits for transport, aggregation, early stopping and policy persistence
//! - In-process reference implementations of those collaborators
//! - Structured progress events via channels

pub mod aggregator;
pub mod buffer;
pub mod coordinator;
pub mod eval;
pub mod events;
pub mod sink;
pub mod stopper;
pub mod transport;

pub use aggregator::{Aggregator, WeightedAverageAggregator};
pub use buffer::{BufferOutcome, RoundBuffer};
pub use coordinator::RoundCoordinator;
pub use eval::EvalSummary;
pub use events::{CoordinatorEvent, CoordinatorState, DropReason, RunSummary};
pub use sink::{JsonFileSink, PolicySink, POLICY_FILE};
pub use stopper::{EarlyStopper, NeverStop, ObjectiveDirection, PatienceStopper};
pub use transport::{ChannelTransport, Transport};
