use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use crossbeam::atomic::AtomicCell;
use parking_lot::RwLock;

use crate::{
    util::random_string, Database, DatabaseError, DatabaseResult, NewRoom, OrgData,
    OrgMemberData, PrimaryKey, Result, RoomData, SessionData, UserData,
};

/// A database kept entirely in memory, for tests and local runs without postgres.
#[derive(Default)]
pub struct MemoryDatabase {
    /// Every read waits this long before answering
    latency: Option<Duration>,
    next_id: AtomicCell<PrimaryKey>,
    room_reads: AtomicCell<usize>,
    tables: RwLock<Tables>,
}

#[derive(Default)]
struct Tables {
    users: Vec<UserData>,
    sessions: Vec<SessionData>,
    orgs: Vec<OrgData>,
    members: Vec<OrgMemberData>,
    rooms: Vec<RoomData>,
}

impl MemoryDatabase {
    const SESSION_DURATION_IN_DAYS: i64 = 7;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Default::default()
        }
    }

    pub fn add_user(&self, username: &str, display_name: &str) -> UserData {
        let user = UserData {
            id: self.next_id(),
            username: username.to_string(),
            display_name: display_name.to_string(),
        };

        self.tables.write().users.push(user.clone());
        user
    }

    /// Creates a session for the user and returns its token
    pub fn add_session(&self, user: &UserData) -> String {
        let session = SessionData {
            id: self.next_id(),
            token: random_string(32),
            expires_at: Utc::now() + ChronoDuration::days(Self::SESSION_DURATION_IN_DAYS),
            user: user.clone(),
        };

        let token = session.token.clone();
        self.tables.write().sessions.push(session);

        token
    }

    pub fn add_org(&self, slug: &str, name: &str) -> OrgData {
        let org = OrgData {
            id: self.next_id(),
            slug: slug.to_string(),
            name: name.to_string(),
        };

        self.tables.write().orgs.push(org.clone());
        org
    }

    pub fn add_member(&self, org: &OrgData, user: &UserData, active: bool, admin: bool) {
        let member = OrgMemberData {
            id: self.next_id(),
            org_id: org.id,
            user_id: user.id,
            active,
            admin,
        };

        self.tables.write().members.push(member);
    }

    /// How many room records were looked up by slug, across every room
    pub fn room_reads(&self) -> usize {
        self.room_reads.load()
    }

    fn next_id(&self) -> PrimaryKey {
        self.next_id.fetch_add(1) + 1
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn session_by_token(&self, token: &str) -> Result<SessionData> {
        self.delay().await;

        self.tables
            .read()
            .sessions
            .iter()
            .find(|s| s.token == token && s.expires_at > Utc::now())
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "session",
                identifier: "token",
            })
    }

    async fn org_by_slug(&self, slug: &str) -> Result<OrgData> {
        self.delay().await;

        self.tables
            .read()
            .orgs
            .iter()
            .find(|o| o.slug == slug)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "org",
                identifier: "slug",
            })
    }

    async fn org_member(&self, org_id: PrimaryKey, user_id: PrimaryKey) -> Result<OrgMemberData> {
        self.delay().await;

        self.tables
            .read()
            .members
            .iter()
            .find(|m| m.org_id == org_id && m.user_id == user_id)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "org member",
                identifier: "org_id:user_id",
            })
    }

    async fn room_by_slug(&self, org_id: PrimaryKey, slug: &str) -> Result<RoomData> {
        self.room_reads.fetch_add(1);
        self.delay().await;

        self.tables
            .read()
            .rooms
            .iter()
            .find(|r| r.org_id == org_id && r.slug == slug)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "room",
                identifier: "org_id:slug",
            })
    }

    async fn list_rooms(&self, org_id: PrimaryKey) -> Result<Vec<RoomData>> {
        self.delay().await;

        let rooms = self
            .tables
            .read()
            .rooms
            .iter()
            .filter(|r| r.org_id == org_id)
            .cloned()
            .collect();

        Ok(rooms)
    }

    async fn create_room(&self, new_room: NewRoom) -> Result<RoomData> {
        let mut tables = self.tables.write();

        tables
            .rooms
            .iter()
            .find(|r| r.org_id == new_room.org_id && r.slug == new_room.slug)
            .ok_or(DatabaseError::NotFound {
                resource: "room",
                identifier: "org_id:slug",
            })
            .conflict_or_ok("room", "slug", &new_room.slug)?;

        let room = RoomData {
            id: self.next_id(),
            org_id: new_room.org_id,
            slug: new_room.slug,
            name: new_room.name,
            flag: new_room.flag,
            peer_limit: new_room.peer_limit,
            public: new_room.public,
            users: new_room.users,
        };

        tables.rooms.push(room.clone());
        Ok(room)
    }

    async fn delete_room(&self, org_id: PrimaryKey, slug: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let count = tables.rooms.len();

        tables
            .rooms
            .retain(|r| !(r.org_id == org_id && r.slug == slug));

        if tables.rooms.len() == count {
            return Err(DatabaseError::NotFound {
                resource: "room",
                identifier: "org_id:slug",
            });
        }

        Ok(())
    }
}
