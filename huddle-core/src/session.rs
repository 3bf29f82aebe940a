use std::{
    fmt::Display,
    sync::{Arc, Weak},
};

use crossbeam::atomic::AtomicCell;
use log::info;
use parking_lot::Mutex;

use crate::{
    Envelope, Id, PeerConnection, PeerId, PeerIdentity, RelayError, RoomRegistry, SignalRelay,
    NORMAL_CLOSURE,
};

pub type SessionId = Id<RoomSession>;

/// Addresses one active session: an organization and the slug of one of its rooms.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub organization: i32,
    pub slug: String,
}

/// The persistent room record a session is hydrated from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub id: i32,
    pub name: String,
    /// Two letter country flag shown next to the name
    pub flag: String,
    pub peer_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Hydrated, nobody has been admitted yet
    Idle,
    /// At least one peer is connected
    Active,
    /// The last peer left, eviction is pending
    Draining,
    /// Evicted or deleted. Nothing can be admitted anymore.
    Removed,
}

/// The outcome of an admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// The session is at capacity, nothing was changed
    Full,
    /// The session was removed from the registry, the room has to be looked up again
    Retired,
}

/// One live meeting.
pub struct RoomSession {
    id: SessionId,
    key: RoomKey,
    record: RoomRecord,
    registry: Weak<RoomRegistry>,
    /// How many callers hold a [SessionClaim] on this session, or on its hydration
    interest: Arc<AtomicCell<usize>>,
    inner: Mutex<SessionInner>,
}

/// The peer set and the state share a lock so admission and eviction see the same thing.
struct SessionInner {
    state: SessionState,
    /// The connected peers, in order of admission
    peers: Vec<Arc<PeerConnection>>,
    /// Bumped on every admission, so a pending eviction can tell the session was used since
    generation: u64,
}

/// Counts one caller that is on its way to admit a peer.
#[derive(Debug)]
pub(crate) struct Interest(Arc<AtomicCell<usize>>);

/// A session handed out to a caller that is about to admit a peer into it.
///
/// While a claim is held the session is never evicted for being empty. Dropping
/// the claim offers the session back to the eviction policy if nobody was admitted.
pub struct SessionClaim {
    session: Arc<RoomSession>,
    interest: Option<Interest>,
}

impl Interest {
    /// Registers a caller. The registry does this with the entry locked.
    pub(crate) fn register(count: &Arc<AtomicCell<usize>>) -> Self {
        count.fetch_add(1);
        Self(count.clone())
    }
}

impl Drop for Interest {
    fn drop(&mut self) {
        self.0.fetch_sub(1);
    }
}

impl SessionClaim {
    pub(crate) fn new(session: Arc<RoomSession>, interest: Interest) -> Self {
        Self {
            session,
            interest: Some(interest),
        }
    }

    pub fn session(&self) -> &Arc<RoomSession> {
        &self.session
    }

    /// Admits the peer up to the room's own peer limit
    pub fn admit(&self, peer: Arc<PeerConnection>) -> Admission {
        self.session.admit(peer, self.session.peer_limit())
    }

    /// Gives up the claim without offering the session for eviction
    pub fn into_session(mut self) -> Arc<RoomSession> {
        self.interest = None;
        self.session.clone()
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        let Some(interest) = self.interest.take() else {
            return;
        };

        drop(interest);
        self.session.offer_eviction();
    }
}

impl RoomKey {
    pub fn new(organization: i32, slug: impl Into<String>) -> Self {
        Self {
            organization,
            slug: slug.into(),
        }
    }
}

impl Display for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.organization, self.slug)
    }
}

impl RoomSession {
    pub(crate) fn new(
        key: RoomKey,
        record: RoomRecord,
        registry: Weak<RoomRegistry>,
        interest: Arc<AtomicCell<usize>>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            key,
            record,
            registry,
            interest,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                peers: vec![],
                generation: 0,
            }),
        }
    }

    /// Adds the peer if there is room for it.
    ///
    /// The count check and the insertion happen under one lock, so two admissions
    /// can never both take the last slot. Existing peers are told about the new
    /// one, and the new peer gets the list of existing peers.
    pub fn admit(&self, peer: Arc<PeerConnection>, capacity: usize) -> Admission {
        let mut inner = self.inner.lock();

        if inner.state == SessionState::Removed {
            return Admission::Retired;
        }

        if inner.peers.len() >= capacity {
            return Admission::Full;
        }

        let existing: Vec<_> = inner
            .peers
            .iter()
            .map(|p| (p.id(), p.identity().clone()))
            .collect();

        SignalRelay::new(&inner.peers)
            .fan_out(&Envelope::peer_join(peer.id(), peer.identity()), None);
        peer.send(Envelope::join(peer.id(), &existing));
        peer.mark_joined();

        info!(
            "{} joined room {} ({}/{})",
            peer.identity().display_name,
            self.key,
            inner.peers.len() + 1,
            capacity
        );

        inner.peers.push(peer);
        inner.state = SessionState::Active;
        inner.generation += 1;

        Admission::Admitted
    }

    /// Removes a peer and tells the others. Returns false if the peer was not here.
    ///
    /// When the last peer leaves, the registry is asked to evict the session.
    pub fn remove(&self, peer_id: PeerId) -> bool {
        let drained = {
            let mut inner = self.inner.lock();

            let Some(index) = inner.peers.iter().position(|p| p.id() == peer_id) else {
                return false;
            };

            let peer = inner.peers.remove(index);
            SignalRelay::new(&inner.peers).fan_out(&Envelope::peer_leave(peer_id), None);

            info!(
                "{} left room {} ({} remaining)",
                peer.identity().display_name,
                self.key,
                inner.peers.len()
            );

            let now_empty = inner.peers.is_empty() && inner.state != SessionState::Removed;

            if now_empty {
                inner.state = SessionState::Draining;
            }

            now_empty.then_some(inner.generation)
        };

        if let Some(generation) = drained {
            if let Some(registry) = self.registry.upgrade() {
                registry.notify_empty(self, generation);
            }
        }

        true
    }

    /// Sends an envelope to every peer except `exclude`
    pub fn broadcast(&self, envelope: &Envelope, exclude: Option<PeerId>) -> usize {
        let inner = self.inner.lock();
        SignalRelay::new(&inner.peers).fan_out(envelope, exclude)
    }

    /// Sends an envelope to one peer
    pub fn relay_to(&self, envelope: Envelope, target: PeerId) -> Result<(), RelayError> {
        let inner = self.inner.lock();
        SignalRelay::new(&inner.peers).point_to_point(envelope, target)
    }

    /// Routes an envelope received from one of the peers
    pub fn dispatch(&self, from: PeerId, envelope: &Envelope) -> Result<usize, RelayError> {
        let inner = self.inner.lock();
        SignalRelay::new(&inner.peers).route(from, envelope)
    }

    /// Marks the session removed if it has no peers and nobody holds a claim on it.
    /// With a generation, nobody may have been admitted since it was taken.
    ///
    /// Called by the registry with the entry locked, which is where claims are registered.
    pub(crate) fn retire_if_idle(&self, generation: Option<u64>) -> bool {
        let mut inner = self.inner.lock();

        let idle = inner.peers.is_empty()
            && self.interest.load() == 0
            && generation.map_or(true, |g| g == inner.generation);

        if idle {
            inner.state = SessionState::Removed;
        }

        idle
    }

    /// Hands the session to the registry's eviction policy if it has no peers
    fn offer_eviction(&self) {
        let generation = {
            let inner = self.inner.lock();

            if !inner.peers.is_empty() || inner.state == SessionState::Removed {
                return;
            }

            inner.generation
        };

        if let Some(registry) = self.registry.upgrade() {
            registry.notify_empty(self, generation);
        }
    }

    /// Marks the session removed and closes every connection still in it
    pub(crate) fn retire(&self) {
        let peers = {
            let mut inner = self.inner.lock();
            inner.state = SessionState::Removed;
            std::mem::take(&mut inner.peers)
        };

        for peer in peers {
            peer.close(NORMAL_CLOSURE);
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    pub fn record(&self) -> &RoomRecord {
        &self.record
    }

    pub(crate) fn interest(&self) -> &Arc<AtomicCell<usize>> {
        &self.interest
    }

    pub fn peer_limit(&self) -> usize {
        self.record.peer_limit
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn peer_count(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.inner.lock().peers.iter().any(|p| p.id() == peer_id)
    }

    /// Returns the connected peers in order of admission
    pub fn peers(&self) -> Vec<(PeerId, PeerIdentity)> {
        self.inner
            .lock()
            .peers
            .iter()
            .map(|p| (p.id(), p.identity().clone()))
            .collect()
    }
}
