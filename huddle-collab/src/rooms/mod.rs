mod join;

use std::sync::Arc;

use huddle_core::RoomKey;
use log::info;
use thiserror::Error;

use crate::{util::room_slug, Auth, AuthError, CollabContext, DatabaseError, NewRoom, PrimaryKey, RoomData};

pub use join::*;

pub struct RoomManager {
    context: CollabContext,
    auth: Auth,
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Db(#[from] DatabaseError),
}

/// A room as it is listed, with its live peer count
#[derive(Debug, Clone)]
pub struct RoomListing {
    pub room: RoomData,
    pub peers: usize,
}

/// What is needed to create a room
#[derive(Debug, Clone)]
pub struct RoomRequest {
    pub name: String,
    pub flag: String,
    /// Clamped into the configured range, the configured default if missing
    pub peer_limit: Option<usize>,
    /// Makes the room private, listed only to these members and admins
    pub users: Option<Vec<PrimaryKey>>,
}

impl RoomManager {
    pub fn new(context: &CollabContext) -> Self {
        Self {
            context: context.clone(),
            auth: Auth::new(&context.database),
        }
    }

    /// Lists the rooms of an organization the user is a member of.
    /// Admins see every room, other members the public ones and those they were added to.
    pub async fn list_rooms(
        &self,
        org_slug: &str,
        user_id: PrimaryKey,
    ) -> Result<Vec<RoomListing>, RoomError> {
        let (org, member) = self.auth.ensure_member(org_slug, user_id).await?;
        let rooms = self.context.database.list_rooms(org.id).await?;

        let listings = rooms
            .into_iter()
            .filter(|room| member.admin || room.is_listed_to(user_id))
            .map(|room| {
                let key = RoomKey::new(org.id, room.slug.as_str());

                RoomListing {
                    peers: self.context.registry.peer_count(&key),
                    room,
                }
            })
            .collect();

        Ok(listings)
    }

    /// Creates a room, if the user is an admin of the organization
    pub async fn create_room(
        &self,
        org_slug: &str,
        user_id: PrimaryKey,
        request: RoomRequest,
    ) -> Result<RoomData, RoomError> {
        let org = self.auth.ensure_admin(org_slug, user_id).await?;
        let peer_limit = self
            .context
            .registry
            .config()
            .clamp_peer_limit(request.peer_limit);

        let room = self
            .context
            .database
            .create_room(NewRoom {
                org_id: org.id,
                slug: room_slug(&request.name),
                name: request.name,
                flag: request.flag,
                peer_limit: peer_limit as i32,
                public: request.users.is_none(),
                users: request.users.unwrap_or_default(),
            })
            .await?;

        info!("Created room {} in {} ({} peers)", room.name, org.slug, peer_limit);

        Ok(room)
    }

    /// Deletes a room and evicts its session, closing every connection in it
    pub async fn delete_room(
        &self,
        org_slug: &str,
        user_id: PrimaryKey,
        slug: &str,
    ) -> Result<(), RoomError> {
        let org = self.auth.ensure_admin(org_slug, user_id).await?;

        self.context.database.delete_room(org.id, slug).await?;
        self.context.registry.remove(&RoomKey::new(org.id, slug));

        info!("Deleted room {} in {}", slug, org.slug);

        Ok(())
    }
}
