use std::{
    future::Future,
    sync::{Arc, Weak},
};

use crossbeam::atomic::AtomicCell;
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::{
    session::Interest, Config, Id, RoomKey, RoomRecord, RoomSession, SessionClaim, SessionId,
};

type Hydration = Shared<BoxFuture<'static, Result<Arc<RoomSession>, HydrationError>>>;
type HydrationId = Id<Hydration>;

/// Maps room keys to live sessions, hydrating them from their persistent record on first access.
pub struct RoomRegistry {
    me: Weak<RoomRegistry>,
    config: Config,
    rooms: DashMap<RoomKey, Slot>,
}

enum Slot {
    /// A load is in flight. Every lookup of the key awaits the same one.
    Hydrating {
        id: HydrationId,
        pending: Hydration,
        /// Handed over to the session once it is loaded
        interest: Arc<AtomicCell<usize>>,
    },
    Ready(Arc<RoomSession>),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HydrationError {
    #[error("Room {0} does not exist")]
    NotFound(RoomKey),
    #[error("Could not load room {key}: {reason}")]
    Store { key: RoomKey, reason: String },
    #[error("Loading room {0} was interrupted")]
    Interrupted(RoomKey),
}

impl Slot {
    fn is_hydration(&self, hydration: HydrationId) -> bool {
        matches!(self, Self::Hydrating { id, .. } if *id == hydration)
    }

    fn is_session(&self, session: SessionId) -> bool {
        matches!(self, Self::Ready(s) if s.id() == session)
    }
}

impl RoomRegistry {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            rooms: Default::default(),
        })
    }

    /// Returns the session for the key if it is already hydrated
    pub fn get(&self, key: &RoomKey) -> Option<Arc<RoomSession>> {
        match self.rooms.get(key)?.value() {
            Slot::Ready(session) => Some(session.clone()),
            Slot::Hydrating { .. } => None,
        }
    }

    /// Returns the session for the key, hydrating it with `loader` if needed.
    ///
    /// The loader runs at most once per key no matter how many callers race here,
    /// and on its own task, so it completes even if every caller goes away.
    /// All callers get the same session, or the same error.
    pub async fn get_or_hydrate<L, F>(
        &self,
        key: &RoomKey,
        loader: L,
    ) -> Result<Arc<RoomSession>, HydrationError>
    where
        L: FnOnce() -> F + Send,
        F: Future<Output = Result<RoomRecord, HydrationError>> + Send + 'static,
    {
        self.claim(key, loader).await.map(SessionClaim::into_session)
    }

    /// Like [RoomRegistry::get_or_hydrate], but the session is kept from being evicted
    /// for being empty until the returned claim is dropped.
    ///
    /// The claim is registered before the hydration is awaited, so a caller that gives
    /// up never evicts a session another caller is about to admit into.
    pub async fn claim<L, F>(&self, key: &RoomKey, loader: L) -> Result<SessionClaim, HydrationError>
    where
        L: FnOnce() -> F + Send,
        F: Future<Output = Result<RoomRecord, HydrationError>> + Send + 'static,
    {
        let (pending, interest) = match self.rooms.entry(key.clone()) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Ready(session) => {
                    let interest = Interest::register(session.interest());
                    return Ok(SessionClaim::new(session.clone(), interest));
                }
                Slot::Hydrating {
                    pending, interest, ..
                } => (pending.clone(), Interest::register(interest)),
            },
            Entry::Vacant(entry) => {
                let id = HydrationId::new();
                let (sender, receiver) = oneshot::channel();
                let count = Arc::new(AtomicCell::new(0));

                let interrupted = key.clone();
                let pending = receiver
                    .map(move |r| r.unwrap_or(Err(HydrationError::Interrupted(interrupted))))
                    .boxed()
                    .shared();

                let interest = Interest::register(&count);

                entry.insert(Slot::Hydrating {
                    id,
                    pending: pending.clone(),
                    interest: count.clone(),
                });

                debug!("Hydrating room {}", key);
                self.spawn_hydration(key.clone(), id, count, loader(), sender);

                (pending, interest)
            }
        };

        let session = pending.await?;
        Ok(SessionClaim::new(session, interest))
    }

    /// Evicts the session for the key and closes its connections.
    /// Returns false if there was nothing to remove.
    pub fn remove(&self, key: &RoomKey) -> bool {
        match self.rooms.remove(key) {
            Some((_, Slot::Ready(session))) => {
                info!("Removed room {} with {} peers", key, session.peer_count());
                session.retire();
                true
            }
            Some((_, Slot::Hydrating { .. })) => {
                info!("Removed room {} while it was hydrating", key);
                true
            }
            None => false,
        }
    }

    /// Evicts the session if it is still the one registered for its key, it has no peers,
    /// and nobody holds a claim on it.
    ///
    /// All of it is checked with the entry locked, so a peer admitted in the
    /// meantime keeps the session alive.
    pub fn evict_if_empty(&self, session: &RoomSession) -> bool {
        self.evict(session, None)
    }

    /// Returns how many peers are connected to the room, zero if it has no session
    pub fn peer_count(&self, key: &RoomKey) -> usize {
        self.get(key).map(|s| s.peer_count()).unwrap_or_default()
    }

    /// Returns the number of hydrated sessions
    pub fn len(&self) -> usize {
        self.rooms
            .iter()
            .filter(|s| matches!(s.value(), Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Called by a session that has no peers left. Nobody may be admitted after
    /// `generation` for the eviction to go through.
    pub(crate) fn notify_empty(&self, session: &RoomSession, generation: u64) {
        let Some(grace) = self.config.eviction_grace() else {
            self.evict(session, Some(generation));
            return;
        };

        let registry = self.me.clone();
        let key = session.key().clone();
        let session_id = session.id();

        debug!("Room {} is empty, evicting in {:?}", key, grace);

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let Some(registry) = registry.upgrade() else {
                return;
            };

            if let Some(session) = registry.get(&key).filter(|s| s.id() == session_id) {
                registry.evict(&session, Some(generation));
            }
        });
    }

    fn evict(&self, session: &RoomSession, generation: Option<u64>) -> bool {
        let evicted = self
            .rooms
            .remove_if(session.key(), |_, slot| {
                slot.is_session(session.id()) && session.retire_if_idle(generation)
            })
            .is_some();

        if evicted {
            info!("Evicted empty room {}", session.key());
        }

        evicted
    }

    fn spawn_hydration<F>(
        &self,
        key: RoomKey,
        id: HydrationId,
        interest: Arc<AtomicCell<usize>>,
        load: F,
        sender: oneshot::Sender<Result<Arc<RoomSession>, HydrationError>>,
    ) where
        F: Future<Output = Result<RoomRecord, HydrationError>> + Send + 'static,
    {
        let registry = self.me.clone();

        tokio::spawn(async move {
            let loaded = load.await;

            let outcome = match registry.upgrade() {
                Some(registry) => registry.install(&key, id, interest, loaded),
                None => Err(HydrationError::Interrupted(key)),
            };

            // Nobody may be waiting anymore, which is fine
            let _ = sender.send(outcome);
        });
    }

    /// Replaces the hydration slot with the loaded session, or clears it on failure.
    /// A session whose key was removed during the load is retired instead of installed.
    fn install(
        &self,
        key: &RoomKey,
        id: HydrationId,
        interest: Arc<AtomicCell<usize>>,
        loaded: Result<RoomRecord, HydrationError>,
    ) -> Result<Arc<RoomSession>, HydrationError> {
        let record = match loaded {
            Ok(record) => record,
            Err(error) => {
                self.rooms.remove_if(key, |_, slot| slot.is_hydration(id));
                warn!("Could not hydrate room {}: {}", key, error);

                return Err(error);
            }
        };

        let session = Arc::new(RoomSession::new(
            key.clone(),
            record,
            self.me.clone(),
            interest,
        ));

        let installed = match self.rooms.get_mut(key) {
            Some(mut slot) if slot.is_hydration(id) => {
                *slot = Slot::Ready(session.clone());
                true
            }
            _ => false,
        };

        if installed {
            info!(
                "Hydrated room {} ({}, limit {})",
                key,
                session.record().name,
                session.peer_limit()
            );
        } else {
            debug!("Room {} was removed while hydrating", key);
            session.retire();
        }

        Ok(session)
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use futures_util::{
        future::{join_all, BoxFuture},
        FutureExt,
    };
    use tokio::sync::oneshot;

    use super::{HydrationError, RoomRegistry};
    use crate::{
        peer::test::mock_peer, session::test::mock_record, Admission, Config, RoomKey,
        RoomRecord, SessionState,
    };

    fn counting_loader(
        calls: &Arc<AtomicUsize>,
        result: Result<RoomRecord, HydrationError>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<RoomRecord, HydrationError>> {
        let calls = calls.clone();

        move || {
            calls.fetch_add(1, Ordering::SeqCst);

            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                result
            }
            .boxed()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lookups_hydrate_once() {
        let registry = RoomRegistry::new(Config::default());
        let key = RoomKey::new(1, "standup");
        let calls = Arc::new(AtomicUsize::new(0));

        let lookups = (0..16).map(|_| {
            let registry = registry.clone();
            let key = key.clone();
            let loader = counting_loader(&calls, Ok(mock_record(2)));

            tokio::spawn(async move { registry.get_or_hydrate(&key, loader).await })
        });

        let sessions: Vec<_> = join_all(lookups)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert!(Arc::ptr_eq(&registry.get(&key).unwrap(), &sessions[0]));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_hydration_is_shared_and_not_cached() {
        let registry = RoomRegistry::new(Config::default());
        let key = RoomKey::new(1, "gone");
        let calls = Arc::new(AtomicUsize::new(0));

        let lookups = (0..8).map(|_| {
            let registry = registry.clone();
            let key = key.clone();
            let loader = counting_loader(&calls, Err(HydrationError::NotFound(key.clone())));

            tokio::spawn(async move { registry.get_or_hydrate(&key, loader).await })
        });

        for result in join_all(lookups).await {
            assert_eq!(result.unwrap().err(), Some(HydrationError::NotFound(key.clone())));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.get(&key).is_none());

        let retry = counting_loader(&calls, Ok(mock_record(2)));
        assert!(registry.get_or_hydrate(&key, retry).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn hydration_outlives_its_callers() {
        let registry = RoomRegistry::new(Config::default());
        let key = RoomKey::new(1, "standup");
        let (release, gate) = oneshot::channel::<()>();
        let (started, has_started) = oneshot::channel::<()>();

        let caller = {
            let registry = registry.clone();
            let key = key.clone();

            tokio::spawn(async move {
                registry
                    .get_or_hydrate(&key, move || {
                        let _ = started.send(());

                        async move {
                            let _ = gate.await;
                            Ok(mock_record(2))
                        }
                    })
                    .await
            })
        };

        has_started.await.unwrap();
        caller.abort();
        let _ = caller.await;

        release.send(()).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let session = registry
            .get_or_hydrate(&key, counting_loader(&calls, Ok(mock_record(2))))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(session.peer_limit(), 2);
    }

    #[tokio::test]
    async fn removal_is_idempotent_and_closes_peers() {
        let registry = RoomRegistry::new(Config::default());
        let key = RoomKey::new(1, "standup");
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(!registry.remove(&key));

        let session = registry
            .get_or_hydrate(&key, counting_loader(&calls, Ok(mock_record(2))))
            .await
            .unwrap();

        let (peer, _outbox) = mock_peer("a");
        session.admit(peer.clone(), 2);

        assert!(registry.remove(&key));
        assert!(!registry.remove(&key));

        assert!(registry.get(&key).is_none());
        assert!(peer.is_closed());
        assert_eq!(session.state(), SessionState::Removed);

        let (late, _outbox) = mock_peer("b");
        assert_eq!(session.admit(late, 2), Admission::Retired);
    }

    #[tokio::test]
    async fn sessions_removed_while_hydrating_are_never_installed() {
        let registry = RoomRegistry::new(Config::default());
        let key = RoomKey::new(1, "standup");
        let (release, gate) = oneshot::channel::<()>();
        let (started, has_started) = oneshot::channel::<()>();

        let lookup = {
            let registry = registry.clone();
            let key = key.clone();

            tokio::spawn(async move {
                registry
                    .get_or_hydrate(&key, move || {
                        let _ = started.send(());

                        async move {
                            let _ = gate.await;
                            Ok(mock_record(2))
                        }
                    })
                    .await
            })
        };

        has_started.await.unwrap();
        assert!(registry.remove(&key));
        release.send(()).unwrap();

        let session = lookup.await.unwrap().unwrap();

        assert_eq!(session.state(), SessionState::Removed);
        assert!(registry.get(&key).is_none());
    }

    #[tokio::test]
    async fn the_last_peer_leaving_evicts_the_session() {
        let registry = RoomRegistry::new(Config::default());
        let key = RoomKey::new(1, "standup");
        let calls = Arc::new(AtomicUsize::new(0));

        let session = registry
            .get_or_hydrate(&key, counting_loader(&calls, Ok(mock_record(2))))
            .await
            .unwrap();

        let (a, _a_out) = mock_peer("a");
        let (b, _b_out) = mock_peer("b");
        session.admit(a.clone(), 2);
        session.admit(b.clone(), 2);

        assert_eq!(registry.peer_count(&key), 2);
        assert!(!registry.evict_if_empty(&session));

        session.remove(a.id());
        assert!(registry.get(&key).is_some());

        session.remove(b.id());
        assert!(registry.get(&key).is_none());
        assert_eq!(registry.peer_count(&key), 0);
        assert_eq!(session.state(), SessionState::Removed);
    }

    #[tokio::test(start_paused = true)]
    async fn a_grace_period_tolerates_rejoining() {
        let config = Config {
            eviction_grace_in_seconds: 5.,
            ..Default::default()
        };

        let registry = RoomRegistry::new(config);
        let key = RoomKey::new(1, "standup");
        let calls = Arc::new(AtomicUsize::new(0));

        let session = registry
            .get_or_hydrate(&key, counting_loader(&calls, Ok(mock_record(2))))
            .await
            .unwrap();

        let (a, _a_out) = mock_peer("a");
        session.admit(a.clone(), 2);
        session.remove(a.id());
        assert_eq!(session.state(), SessionState::Draining);

        // Rejoining during the grace period keeps the session
        tokio::time::sleep(Duration::from_secs(2)).await;
        let (b, _b_out) = mock_peer("b");
        assert_eq!(session.admit(b.clone(), 2), Admission::Admitted);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(registry.get(&key).is_some());

        session.remove(b.id());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(registry.get(&key).is_none());
    }

    #[tokio::test]
    async fn an_abandoned_claim_leaves_the_session_to_other_claimants() {
        let registry = RoomRegistry::new(Config::default());
        let key = RoomKey::new(1, "standup");
        let calls = Arc::new(AtomicUsize::new(0));

        let first = registry
            .claim(&key, counting_loader(&calls, Ok(mock_record(2))))
            .await
            .unwrap();

        let second = registry
            .claim(&key, counting_loader(&calls, Ok(mock_record(2))))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(first.session(), second.session()));

        // Nobody was admitted, but the other claim is still pending
        drop(first);
        assert!(registry.get(&key).is_some());

        let (peer, _outbox) = mock_peer("a");
        assert_eq!(second.admit(peer.clone()), Admission::Admitted);

        let session = second.session().clone();
        drop(second);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.get(&key).is_some());

        session.remove(peer.id());
        assert!(registry.get(&key).is_none());
    }

    #[tokio::test]
    async fn the_last_abandoned_claim_evicts_an_idle_session() {
        let registry = RoomRegistry::new(Config::default());
        let key = RoomKey::new(1, "standup");
        let calls = Arc::new(AtomicUsize::new(0));

        let claim = registry
            .claim(&key, counting_loader(&calls, Ok(mock_record(2))))
            .await
            .unwrap();

        let session = claim.session().clone();
        assert!(!registry.evict_if_empty(&session));

        drop(claim);

        assert!(registry.get(&key).is_none());
        assert_eq!(session.state(), SessionState::Removed);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_grace_timers_do_not_cut_a_later_grace_short() {
        let config = Config {
            eviction_grace_in_seconds: 5.,
            ..Default::default()
        };

        let registry = RoomRegistry::new(config);
        let key = RoomKey::new(1, "standup");
        let calls = Arc::new(AtomicUsize::new(0));

        let session = registry
            .get_or_hydrate(&key, counting_loader(&calls, Ok(mock_record(2))))
            .await
            .unwrap();

        let (a, _a_out) = mock_peer("a");
        session.admit(a.clone(), 2);
        session.remove(a.id());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let (b, _b_out) = mock_peer("b");
        session.admit(b.clone(), 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        session.remove(b.id());

        // The first timer fires at 5s, the second drain started at 3s
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(registry.get(&key).is_some());
        assert_eq!(session.state(), SessionState::Draining);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(registry.get(&key).is_none());
    }
}
