use axum::{response::IntoResponse, Json};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

use crate::{rooms, schemas::NewRoomSchema, serialized::Room};

#[derive(OpenApi)]
#[openapi(
    paths(
        rooms::list_rooms,
        rooms::create_room,
        rooms::delete_room,
        rooms::socket,
    ),
    components(schemas(Room, NewRoomSchema)),
    modifiers(&Security),
    info(
        description = "huddle-server exposes endpoints to manage and join the meeting rooms of an organization"
    ))
]
pub struct ApiDoc;

struct Security;

impl Modify for Security {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            let scheme = HttpBuilder::new()
                .scheme(HttpAuthScheme::Bearer)
                .bearer_format("Bearer <token>")
                .build();

            components.add_security_scheme("BearerAuth", SecurityScheme::Http(scheme))
        }
    }
}

pub async fn docs() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}
