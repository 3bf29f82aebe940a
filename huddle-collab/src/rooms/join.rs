use std::{future::Future, sync::Arc};

use huddle_core::{
    Admission, Envelope, HydrationError, PeerConnection, RoomErrorCode, RoomKey, RoomRecord,
    RoomSession, NORMAL_CLOSURE,
};
use log::{debug, warn};
use thiserror::Error;

use crate::Database;

use super::RoomManager;

/// Why a peer could not be admitted into a room
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("Room or organization does not exist")]
    NotFound,
    #[error("User is not an active member of the organization")]
    Unauthorized,
    #[error("Room is full")]
    FullRoom,
    /// Nobody is left to tell
    #[error("Peer disconnected before it was admitted")]
    Disconnected,
}

impl JoinError {
    /// The code sent to the peer, if it is still there to receive one
    pub fn code(&self) -> Option<RoomErrorCode> {
        match self {
            Self::NotFound => Some(RoomErrorCode::NotFound),
            Self::Unauthorized => Some(RoomErrorCode::Unauthorized),
            Self::FullRoom => Some(RoomErrorCode::FullRoom),
            Self::Disconnected => None,
        }
    }
}

impl RoomManager {
    /// Admits a connected peer into a room of an organization.
    ///
    /// On success the peer is part of the returned session and has been sent the
    /// current peer list. On failure the peer is sent a `ROOM/ERROR` envelope
    /// and its connection is closed.
    pub async fn join(
        &self,
        peer: &Arc<PeerConnection>,
        org_slug: &str,
        slug: &str,
    ) -> Result<Arc<RoomSession>, JoinError> {
        let result = self.try_join(peer, org_slug, slug).await;

        if let Err(error) = &result {
            debug!(
                "{} could not join {}/{}: {}",
                peer.identity().display_name,
                org_slug,
                slug,
                error
            );

            if let Some(code) = error.code() {
                peer.send(Envelope::error(code));
                peer.close(NORMAL_CLOSURE);
            }
        }

        result
    }

    async fn try_join(
        &self,
        peer: &Arc<PeerConnection>,
        org_slug: &str,
        slug: &str,
    ) -> Result<Arc<RoomSession>, JoinError> {
        // Registered before anything is awaited, so a disconnect at any point is seen
        let watcher = peer.watch_close();

        let org = self
            .auth
            .organization(org_slug)
            .await
            .map_err(|_| JoinError::NotFound)?;

        self.auth
            .membership(&org, peer.identity().user_id)
            .await
            .map_err(|_| JoinError::Unauthorized)?;

        if watcher.has_fired() {
            return Err(JoinError::Disconnected);
        }

        let registry = &self.context.registry;
        let key = RoomKey::new(org.id, slug);

        for _ in 0..registry.config().hydration_attempts {
            // Dropping the claim offers a session nobody was admitted into for eviction
            let claim = registry
                .claim(&key, || hydrate(self.context.database.clone(), key.clone()))
                .await
                .map_err(|_| JoinError::NotFound)?;

            if watcher.has_fired() {
                return Err(JoinError::Disconnected);
            }

            match claim.admit(peer.clone()) {
                Admission::Admitted => return Ok(claim.session().clone()),
                Admission::Full => return Err(JoinError::FullRoom),
                Admission::Retired => debug!("Session for {} was retired, looking it up again", key),
            }
        }

        warn!("Gave up joining {} after repeated retirements", key);
        Err(JoinError::NotFound)
    }
}

/// Loads the persistent record of a room
fn hydrate(
    database: Arc<dyn Database>,
    key: RoomKey,
) -> impl Future<Output = Result<RoomRecord, HydrationError>> + Send + 'static {
    async move {
        match database.room_by_slug(key.organization, &key.slug).await {
            Ok(room) => Ok(room.into()),
            Err(e) if e.is_not_found() => Err(HydrationError::NotFound(key)),
            Err(e) => Err(HydrationError::Store {
                reason: e.to_string(),
                key,
            }),
        }
    }
}
