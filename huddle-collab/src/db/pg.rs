use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use sqlx::{postgres::PgPoolOptions, query, query_as, Error as SqlxError, FromRow, PgPool};

use crate::{
    Database, DatabaseError, DatabaseResult, IntoDatabaseError, NewRoom, OrgData, OrgMemberData,
    PrimaryKey, Result, RoomData, SessionData, UserData,
};

/// A postgres database implementation for huddle
pub struct PgDatabase {
    pool: PgPool,
}

#[derive(FromRow)]
struct SessionRow {
    id: PrimaryKey,
    token: String,
    expires_at: DateTime<Utc>,
    user_id: PrimaryKey,
    username: String,
    display_name: String,
}

impl PgDatabase {
    /// Connects to the database and brings its schema up to date
    pub async fn new(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| e.any())?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::Internal(Box::new(e)))?;

        info!("Connected to database");

        Ok(Self { pool })
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn session_by_token(&self, token: &str) -> Result<SessionData> {
        let row = query_as::<_, SessionRow>(
            "SELECT
                sessions.id,
                sessions.token,
                sessions.expires_at,
                sessions.user_id,
                users.username,
                users.display_name
            FROM sessions
                INNER JOIN users ON sessions.user_id = users.id
            WHERE token = $1 AND expires_at > timezone('UTC', now())",
        )
        .bind(token)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.not_found_or("session", "token"))?;

        Ok(SessionData {
            id: row.id,
            token: row.token,
            expires_at: row.expires_at,
            user: UserData {
                id: row.user_id,
                username: row.username,
                display_name: row.display_name,
            },
        })
    }

    async fn org_by_slug(&self, slug: &str) -> Result<OrgData> {
        query_as::<_, OrgData>("SELECT * FROM orgs WHERE slug = $1")
            .bind(slug)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.not_found_or("org", "slug"))
    }

    async fn org_member(&self, org_id: PrimaryKey, user_id: PrimaryKey) -> Result<OrgMemberData> {
        query_as::<_, OrgMemberData>("SELECT * FROM org_members WHERE org_id = $1 AND user_id = $2")
            .bind(org_id)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.not_found_or("org member", "org_id:user_id"))
    }

    async fn room_by_slug(&self, org_id: PrimaryKey, slug: &str) -> Result<RoomData> {
        query_as::<_, RoomData>("SELECT * FROM rooms WHERE org_id = $1 AND slug = $2")
            .bind(org_id)
            .bind(slug)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| e.not_found_or("room", "org_id:slug"))
    }

    async fn list_rooms(&self, org_id: PrimaryKey) -> Result<Vec<RoomData>> {
        query_as::<_, RoomData>("SELECT * FROM rooms WHERE org_id = $1 ORDER BY id")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.any())
    }

    async fn create_room(&self, new_room: NewRoom) -> Result<RoomData> {
        self.room_by_slug(new_room.org_id, &new_room.slug)
            .await
            .conflict_or_ok("room", "slug", &new_room.slug)?;

        query_as::<_, RoomData>(
            "INSERT INTO rooms (org_id, slug, name, flag, peer_limit, public, users)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *",
        )
        .bind(new_room.org_id)
        .bind(&new_room.slug)
        .bind(&new_room.name)
        .bind(&new_room.flag)
        .bind(new_room.peer_limit)
        .bind(new_room.public)
        .bind(&new_room.users)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.any())
    }

    async fn delete_room(&self, org_id: PrimaryKey, slug: &str) -> Result<()> {
        // Ensure room exists
        let _ = self.room_by_slug(org_id, slug).await?;

        query("DELETE FROM rooms WHERE org_id = $1 AND slug = $2")
            .bind(org_id)
            .bind(slug)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }
}

impl IntoDatabaseError for SqlxError {
    fn any(self) -> DatabaseError {
        DatabaseError::Internal(Box::new(self))
    }

    fn not_found_or(self, resource: &'static str, identifier: &'static str) -> DatabaseError {
        match self {
            SqlxError::RowNotFound => DatabaseError::NotFound {
                resource,
                identifier,
            },
            e => Self::any(e),
        }
    }
}
