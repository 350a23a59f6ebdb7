//! Per-round result buffering with quorum detection.

use fx_types::{FeedbackError, ParticipantId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

/// What happened to a result handed to [`RoundBuffer::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOutcome {
    /// Stored; the round is still waiting for more participants.
    Pending { received: usize, required: usize },
    /// This result completed the round. Returned exactly once per round.
    QuorumReached { received: usize },
}

#[derive(Debug)]
struct Gate {
    round: u64,
    expected: BTreeSet<ParticipantId>,
    sealed: bool,
}

#[derive(Debug)]
struct Inner<T> {
    gate: Option<Gate>,
    rounds: BTreeMap<u64, BTreeMap<ParticipantId, T>>,
}

/// Results keyed by round and participant.
///
/// Only one round is open at a time. Insertion and the quorum check happen
/// under one lock, so concurrent arrivals cannot both complete a round.
#[derive(Debug)]
pub struct RoundBuffer<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for RoundBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RoundBuffer<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                gate: None,
                rounds: BTreeMap::new(),
            }),
        }
    }

    /// Open `round`, waiting for exactly the `expected` participants.
    pub fn open(&self, round: u64, expected: BTreeSet<ParticipantId>) {
        let mut inner = self.inner.lock();
        inner.gate = Some(Gate {
            round,
            expected,
            sealed: false,
        });
    }

    /// Stop accepting results for the open round.
    pub fn seal(&self) {
        if let Some(gate) = self.inner.lock().gate.as_mut() {
            gate.sealed = true;
        }
    }

    /// Store a participant's result, replacing any earlier one for the same round.
    pub fn insert(
        &self,
        round: u64,
        participant: ParticipantId,
        payload: T,
    ) -> Result<BufferOutcome, FeedbackError> {
        let mut inner = self.inner.lock();
        let Inner { gate, rounds } = &mut *inner;
        let gate = gate.as_mut().ok_or(FeedbackError::NoOpenRound)?;

        if round < gate.round || (round == gate.round && gate.sealed) {
            return Err(FeedbackError::LateArrival {
                round,
                participant,
                current: gate.round,
            });
        }
        if round > gate.round {
            return Err(FeedbackError::UnexpectedRound {
                round,
                participant,
                current: gate.round,
            });
        }
        if !gate.expected.contains(&participant) {
            return Err(FeedbackError::UnexpectedParticipant { round, participant });
        }

        let entries = rounds.entry(round).or_default();
        entries.insert(participant, payload);
        let received = entries.len();
        let required = gate.expected.len();

        if received >= required {
            gate.sealed = true;
            Ok(BufferOutcome::QuorumReached { received })
        } else {
            Ok(BufferOutcome::Pending { received, required })
        }
    }

    /// Remove and return everything buffered for `round`, ordered by participant.
    pub fn take(&self, round: u64) -> BTreeMap<ParticipantId, T> {
        self.inner.lock().rounds.remove(&round).unwrap_or_default()
    }
}
