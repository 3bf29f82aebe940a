use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::{Envelope, Id};

pub type PeerId = Id<PeerConnection>;

/// The close code used when the server ends a connection on purpose.
pub const NORMAL_CLOSURE: u16 = 1000;

/// The authenticated user behind a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerIdentity {
    #[serde(rename = "id")]
    pub user_id: i32,
    #[serde(rename = "name")]
    pub display_name: String,
}

/// A frame waiting to be written to the socket
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Envelope(Envelope),
    Close(u16),
}

/// One accepted socket connection.
///
/// Frames are queued on an ordered outbox that the transport drains into the socket,
/// so everything sent before [PeerConnection::close] is written before the close frame.
#[derive(Debug)]
pub struct PeerConnection {
    id: PeerId,
    identity: PeerIdentity,
    /// Set when a session admits the connection
    joined_at: Mutex<Option<DateTime<Utc>>>,
    outbox: UnboundedSender<Outgoing>,
    /// Cancelled once the connection is gone, from either side
    closed: CancellationToken,
}

/// The receiving end of a connection's outbox, owned by the transport
#[derive(Debug)]
pub struct Outbox {
    receiver: UnboundedReceiver<Outgoing>,
}

/// Fires when the connection it was taken from closes.
///
/// Bound to the operation that created it, dropping it deregisters it.
#[derive(Debug)]
pub struct CloseWatcher {
    token: CancellationToken,
}

impl PeerConnection {
    pub fn new(identity: PeerIdentity) -> (Arc<Self>, Outbox) {
        let (sender, receiver) = mpsc::unbounded_channel();

        let connection = Self {
            id: PeerId::new(),
            identity,
            joined_at: Mutex::new(None),
            outbox: sender,
            closed: CancellationToken::new(),
        };

        (Arc::new(connection), Outbox { receiver })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// When the connection was admitted into a room, if it was
    pub fn joined_at(&self) -> Option<DateTime<Utc>> {
        *self.joined_at.lock()
    }

    pub(crate) fn mark_joined(&self) {
        *self.joined_at.lock() = Some(Utc::now());
    }

    /// Queues an envelope, returning false if the connection is already closed
    pub fn send(&self, envelope: Envelope) -> bool {
        if self.is_closed() {
            return false;
        }

        self.outbox.send(Outgoing::Envelope(envelope)).is_ok()
    }

    /// Queues a close frame behind whatever was sent before, and marks the connection closed
    pub fn close(&self, code: u16) {
        if !self.is_closed() {
            let _ = self.outbox.send(Outgoing::Close(code));
        }

        self.closed.cancel();
    }

    /// Called by the transport when the socket went away
    pub fn mark_closed(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Starts watching for the connection to close
    pub fn watch_close(&self) -> CloseWatcher {
        CloseWatcher {
            token: self.closed.child_token(),
        }
    }
}

impl Outbox {
    pub async fn recv(&mut self) -> Option<Outgoing> {
        self.receiver.recv().await
    }

    /// Returns the next queued frame without waiting
    pub fn try_recv(&mut self) -> Option<Outgoing> {
        match self.receiver.try_recv() {
            Ok(outgoing) => Some(outgoing),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Drains every queued frame
    pub fn drain(&mut self) -> Vec<Outgoing> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl CloseWatcher {
    pub fn has_fired(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::Arc;

    use crate::{Envelope, EnvelopeKind, RoomErrorCode};

    use super::{Outbox, Outgoing, PeerConnection, PeerIdentity, NORMAL_CLOSURE};

    pub fn mock_peer(name: &str) -> (Arc<PeerConnection>, Outbox) {
        PeerConnection::new(PeerIdentity {
            user_id: name.len() as i32,
            display_name: name.to_string(),
        })
    }

    /// Returns the kinds of all queued envelopes, ignoring close frames
    pub fn drained_kinds(outbox: &mut Outbox) -> Vec<EnvelopeKind> {
        outbox
            .drain()
            .into_iter()
            .filter_map(|o| match o {
                Outgoing::Envelope(e) => Some(e.kind),
                Outgoing::Close(_) => None,
            })
            .collect()
    }

    #[test]
    fn close_is_queued_after_pending_envelopes() {
        let (peer, mut outbox) = mock_peer("john");
        let error = Envelope::error(RoomErrorCode::NotFound);

        assert!(peer.send(error.clone()));
        peer.close(NORMAL_CLOSURE);

        assert!(peer.is_closed());
        assert!(!peer.send(error.clone()));
        assert_eq!(
            outbox.drain(),
            vec![Outgoing::Envelope(error), Outgoing::Close(NORMAL_CLOSURE)]
        );
    }

    #[test]
    fn watchers_fire_when_the_connection_closes() {
        let (peer, _outbox) = mock_peer("mary");

        let watcher = peer.watch_close();
        assert!(!watcher.has_fired());
        assert!(peer.joined_at().is_none());

        peer.mark_closed();
        assert!(watcher.has_fired());

        let late_watcher = peer.watch_close();
        assert!(late_watcher.has_fired());
    }

    #[test]
    fn dropped_watchers_do_not_affect_the_connection() {
        let (peer, _outbox) = mock_peer("mary");

        drop(peer.watch_close());

        assert!(!peer.is_closed());
        assert!(peer.send(Envelope::error(RoomErrorCode::FullRoom)));
    }
}
