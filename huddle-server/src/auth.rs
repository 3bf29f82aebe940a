use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts, Query},
    http::{header, request::Parts, StatusCode},
};
use huddle_collab::{SessionData, UserData};
use huddle_core::PeerIdentity;
use serde::Deserialize;

use crate::ServerContext;

/// Wraps [SessionData] so [FromRequestParts] can be implemented for it
pub struct Session(SessionData);

/// Browsers cannot set headers on websocket requests, so the token may come as `?token=`
#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

impl Session {
    /// Returns the user of the session
    pub fn user(&self) -> &UserData {
        &self.0.user
    }

    /// Returns the identity a connection of this session is known by in a room
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity {
            user_id: self.0.user.id,
            display_name: self.0.user.display_name.clone(),
        }
    }
}

#[async_trait]
impl FromRequestParts<ServerContext> for Session {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ServerContext,
    ) -> Result<Self, Self::Rejection> {
        let context = ServerContext::from_ref(state);

        let token = match parts.headers.get(header::AUTHORIZATION) {
            Some(value) => {
                let value = value
                    .to_str()
                    .map_err(|_| (StatusCode::BAD_REQUEST, "Authorization must be Bearer"))?;

                let parts: Vec<_> = value.split_ascii_whitespace().collect();

                if parts.first() != Some(&"Bearer") {
                    return Err((StatusCode::BAD_REQUEST, "Authorization must be Bearer"));
                }

                parts.last().map(|t| t.to_string()).unwrap_or_default()
            }
            None => {
                Query::<TokenQuery>::try_from_uri(&parts.uri)
                    .map_err(|_| (StatusCode::UNAUTHORIZED, "Missing authorization"))?
                    .0
                    .token
            }
        };

        let session = context
            .collab
            .auth
            .session(&token)
            .await
            .map_err(|_| (StatusCode::UNAUTHORIZED, "Session does not exist"))?;

        Ok(Self(session))
    }
}
