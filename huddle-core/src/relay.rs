use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::{Envelope, EnvelopeKind, PeerConnection, PeerId, Routing};

/// Delivers envelopes among a session's peers.
///
/// Every delivery is a push onto the recipient's ordered outbox, so messages from
/// one sender reach each recipient in the order they were relayed.
pub struct SignalRelay<'a> {
    peers: &'a [Arc<PeerConnection>],
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("{0:?} envelopes can only be sent by the server")]
    ServerOnly(EnvelopeKind),
    #[error("Signal does not name a target peer")]
    MissingTarget,
    #[error("Peer {0} is not in this session")]
    UnknownPeer(PeerId),
}

impl<'a> SignalRelay<'a> {
    pub fn new(peers: &'a [Arc<PeerConnection>]) -> Self {
        Self { peers }
    }

    /// Sends the envelope to every peer except `exclude`, returning how many received it
    pub fn fan_out(&self, envelope: &Envelope, exclude: Option<PeerId>) -> usize {
        self.peers
            .iter()
            .filter(|p| Some(p.id()) != exclude)
            .filter(|p| p.send(envelope.clone()))
            .count()
    }

    /// Sends the envelope to a single peer
    pub fn point_to_point(&self, envelope: Envelope, target: PeerId) -> Result<(), RelayError> {
        let peer = self
            .peers
            .iter()
            .find(|p| p.id() == target)
            .ok_or(RelayError::UnknownPeer(target))?;

        peer.send(envelope);
        Ok(())
    }

    /// Routes an envelope received from `from` according to its kind,
    /// returning how many peers it was delivered to.
    pub fn route(&self, from: PeerId, envelope: &Envelope) -> Result<usize, RelayError> {
        if !self.peers.iter().any(|p| p.id() == from) {
            return Err(RelayError::UnknownPeer(from));
        }

        match envelope.kind.routing() {
            Routing::ServerOnly => Err(RelayError::ServerOnly(envelope.kind)),
            Routing::PointToPoint => {
                let target = envelope.target().ok_or(RelayError::MissingTarget)?;

                // Signalling yourself is never useful
                if target == from {
                    return Err(RelayError::UnknownPeer(target));
                }

                self.point_to_point(envelope.stamped(from), target)?;
                debug!("Relayed {:?} from {} to {}", envelope.kind, from, target);

                Ok(1)
            }
            Routing::FanOut => Ok(self.fan_out(&envelope.stamped(from), Some(from))),
        }
    }
}
