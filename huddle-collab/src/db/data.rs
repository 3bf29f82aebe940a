use chrono::{DateTime, Utc};
use huddle_core::RoomRecord;
use sqlx::FromRow;

/// The type used for primary keys in the database.
pub type PrimaryKey = i32;

/// A huddle account
#[derive(Debug, Clone, FromRow)]
pub struct UserData {
    pub id: PrimaryKey,
    pub username: String,
    pub display_name: String,
}

/// Login session data for authentication
#[derive(Debug, Clone)]
pub struct SessionData {
    pub id: PrimaryKey,
    /// The session token, or key if you will
    pub token: String,
    pub expires_at: DateTime<Utc>,
    /// The user that is logged in
    pub user: UserData,
}

/// An organization owning a set of rooms
#[derive(Debug, Clone, FromRow)]
pub struct OrgData {
    pub id: PrimaryKey,
    /// A slug used to identify the organization in urls
    pub slug: String,
    pub name: String,
}

/// The membership of a user in an organization
#[derive(Debug, Clone, FromRow)]
pub struct OrgMemberData {
    pub id: PrimaryKey,
    pub org_id: PrimaryKey,
    pub user_id: PrimaryKey,
    /// Inactive members have requested to join but were not accepted yet
    pub active: bool,
    /// If this is true, the member can create and delete rooms
    pub admin: bool,
}

/// A meeting room of an organization
#[derive(Debug, Clone, FromRow)]
pub struct RoomData {
    pub id: PrimaryKey,
    pub org_id: PrimaryKey,
    /// Unique within the organization
    pub slug: String,
    pub name: String,
    pub flag: String,
    pub peer_limit: i32,
    /// Public rooms are listed to every member of the organization
    pub public: bool,
    /// The members a private room is listed to, besides admins
    pub users: Vec<PrimaryKey>,
}

impl RoomData {
    /// Returns true if a regular member can see this room
    pub fn is_listed_to(&self, user_id: PrimaryKey) -> bool {
        self.public || self.users.contains(&user_id)
    }
}

impl From<RoomData> for RoomRecord {
    fn from(room: RoomData) -> Self {
        Self {
            id: room.id,
            name: room.name,
            flag: room.flag,
            peer_limit: usize::try_from(room.peer_limit).unwrap_or_default(),
        }
    }
}
