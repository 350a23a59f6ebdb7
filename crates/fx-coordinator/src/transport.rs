//! Message transport between the coordinator and participants.

use async_trait::async_trait;
use fx_types::{Dispatch, ParticipantId, TransportError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Outbound side of the coordinator's communication layer.
///
/// Inbound results are handed to the coordinator by whoever owns the
/// receiving end, so only dispatch lives here.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Currently registered participants, in ascending id order.
    fn participants(&self) -> Vec<ParticipantId>;

    /// Deliver a payload to one participant.
    async fn dispatch(
        &self,
        participant: ParticipantId,
        payload: Dispatch,
    ) -> Result<(), TransportError>;
}

/// In-process transport backed by one tokio channel per participant.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    senders: RwLock<BTreeMap<ParticipantId, UnboundedSender<Dispatch>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant and return the receiving end of its inbox.
    ///
    /// Re-registering an id replaces the previous inbox.
    pub fn register(&self, participant: ParticipantId) -> UnboundedReceiver<Dispatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.write().insert(participant, tx);
        debug!(participant, "registered participant");
        rx
    }

    pub fn unregister(&self, participant: ParticipantId) -> bool {
        self.senders.write().remove(&participant).is_some()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn participants(&self) -> Vec<ParticipantId> {
        self.senders.read().keys().copied().collect()
    }

    async fn dispatch(
        &self,
        participant: ParticipantId,
        payload: Dispatch,
    ) -> Result<(), TransportError> {
        let senders = self.senders.read();
        let tx = senders
            .get(&participant)
            .ok_or(TransportError::UnknownParticipant(participant))?;
        tx.send(payload)
            .map_err(|_| TransportError::ChannelClosed { participant })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fx_types::ModelParams;

    fn finish(round: u64) -> Dispatch {
        Dispatch::Finish {
            round,
            model: ModelParams::new(),
        }
    }

    #[tokio::test]
    async fn delivers_to_registered_participant() {
        let transport = ChannelTransport::new();
        let mut rx2 = transport.register(2);
        let _rx1 = transport.register(1);
        assert_eq!(transport.participants(), vec![1, 2]);

        transport.dispatch(2, finish(5)).await.unwrap();
        assert_eq!(rx2.recv().await.unwrap().round(), 5);
    }

    #[tokio::test]
    async fn unknown_and_closed_participants_fail() {
        let transport = ChannelTransport::new();
        assert!(matches!(
            transport.dispatch(9, finish(0)).await,
            Err(TransportError::UnknownParticipant(9))
        ));

        let rx = transport.register(3);
        drop(rx);
        assert!(matches!(
            transport.dispatch(3, finish(0)).await,
            Err(TransportError::ChannelClosed { participant: 3 })
        ));

        assert!(transport.unregister(3));
        assert!(transport.participants().is_empty());
    }
}
