use async_trait::async_trait;
use thiserror::Error;

mod data;
pub use data::*;

mod memory;
pub use memory::*;

mod pg;
pub use pg::*;

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    /// An unknown or internal error happened with the database
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
    /// A resource already exists
    #[error("{resource} with {field} of value {value} already exists")]
    Conflict {
        /// The resource in question
        resource: &'static str,
        /// The field that is conflicting
        field: &'static str,
        /// The conflicting value
        value: String,
    },
    /// A resource in the database doesn't exist
    #[error("{resource}:{identifier} doesn't exist")]
    NotFound {
        resource: &'static str,
        identifier: &'static str,
    },
}

/// Helper trait to reduce boilerplate
pub trait IntoDatabaseError {
    fn not_found_or(self, resource: &'static str, identifier: &'static str) -> DatabaseError;
    fn any(self) -> DatabaseError;
}

/// Helper trait to reduce boilerplate
pub trait DatabaseResult {
    /// Turns the Result into a conflict error if it's Ok()
    fn conflict_or_ok(self, resource: &'static str, field: &'static str, value: &str)
        -> Result<()>;
}

impl<T> DatabaseResult for Result<T> {
    fn conflict_or_ok(
        self,
        resource: &'static str,
        field: &'static str,
        value: &str,
    ) -> Result<()> {
        match self {
            Ok(_) => Err(DatabaseError::Conflict {
                resource,
                field,
                value: value.to_string(),
            }),
            Err(DatabaseError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl DatabaseError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Represents a type that can fetch huddle data from a database
#[async_trait]
pub trait Database: Send + Sync {
    async fn session_by_token(&self, token: &str) -> Result<SessionData>;

    async fn org_by_slug(&self, slug: &str) -> Result<OrgData>;
    async fn org_member(&self, org_id: PrimaryKey, user_id: PrimaryKey) -> Result<OrgMemberData>;

    async fn room_by_slug(&self, org_id: PrimaryKey, slug: &str) -> Result<RoomData>;
    async fn list_rooms(&self, org_id: PrimaryKey) -> Result<Vec<RoomData>>;
    async fn create_room(&self, new_room: NewRoom) -> Result<RoomData>;
    async fn delete_room(&self, org_id: PrimaryKey, slug: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct NewRoom {
    pub org_id: PrimaryKey,
    pub slug: String,
    pub name: String,
    pub flag: String,
    pub peer_limit: i32,
    pub public: bool,
    pub users: Vec<PrimaryKey>,
}
