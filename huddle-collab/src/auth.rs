use std::sync::Arc;

use thiserror::Error;

use crate::{Database, DatabaseError, OrgData, OrgMemberData, PrimaryKey, SessionData};

/// Resolves sessions and checks organization access
#[derive(Clone)]
pub struct Auth {
    db: Arc<dyn Database>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Organization does not exist")]
    UnknownOrg,
    #[error("User is not an active member of this organization")]
    NotMember,
    #[error("User is not an admin of this organization")]
    NotAdmin,
    /// Something else went wrong with the database
    #[error(transparent)]
    Db(DatabaseError),
}

impl Auth {
    pub fn new(db: &Arc<dyn Database>) -> Self {
        Self { db: db.clone() }
    }

    /// Returns a session if it exists and has not expired
    pub async fn session(&self, token: &str) -> Result<SessionData, DatabaseError> {
        self.db.session_by_token(token).await
    }

    /// Returns the organization with the given slug
    pub async fn organization(&self, slug: &str) -> Result<OrgData, AuthError> {
        self.db.org_by_slug(slug).await.map_err(|e| match e {
            e if e.is_not_found() => AuthError::UnknownOrg,
            e => AuthError::Db(e),
        })
    }

    /// Returns the membership of the user, if it is active
    pub async fn membership(
        &self,
        org: &OrgData,
        user_id: PrimaryKey,
    ) -> Result<OrgMemberData, AuthError> {
        let member = self
            .db
            .org_member(org.id, user_id)
            .await
            .map_err(|e| match e {
                e if e.is_not_found() => AuthError::NotMember,
                e => AuthError::Db(e),
            })?;

        if !member.active {
            return Err(AuthError::NotMember);
        }

        Ok(member)
    }

    /// Ensures the user is an active member of the organization
    pub async fn ensure_member(
        &self,
        org_slug: &str,
        user_id: PrimaryKey,
    ) -> Result<(OrgData, OrgMemberData), AuthError> {
        let org = self.organization(org_slug).await?;
        let member = self.membership(&org, user_id).await?;

        Ok((org, member))
    }

    /// Ensures the user is an active admin of the organization
    pub async fn ensure_admin(&self, org_slug: &str, user_id: PrimaryKey) -> Result<OrgData, AuthError> {
        let org = self.organization(org_slug).await?;
        let member = self.membership(&org, user_id).await?;

        if !member.admin {
            return Err(AuthError::NotAdmin);
        }

        Ok(org)
    }
}
