//! All schemas that are exposed from endpoints are defined here
//! along with the From<T> impls

use huddle_collab::{RoomData, RoomListing};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    slug: String,
    name: String,
    flag: String,
    peer_limit: i32,
    /// How many peers are connected right now
    peers: usize,
}

/// Helper trait to convert any type into a serialized version
pub trait ToSerialized<T>
where
    T: Serialize,
{
    fn to_serialized(&self) -> T;
}

impl<I, O> ToSerialized<Vec<O>> for Vec<I>
where
    I: ToSerialized<O>,
    O: Serialize,
{
    fn to_serialized(&self) -> Vec<O> {
        self.iter().map(|x| x.to_serialized()).collect()
    }
}

impl ToSerialized<Room> for RoomListing {
    fn to_serialized(&self) -> Room {
        Room {
            peers: self.peers,
            ..self.room.to_serialized()
        }
    }
}

impl ToSerialized<Room> for RoomData {
    fn to_serialized(&self) -> Room {
        Room {
            slug: self.slug.clone(),
            name: self.name.clone(),
            flag: self.flag.clone(),
            peer_limit: self.peer_limit,
            peers: 0,
        }
    }
}
