use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    response::IntoResponse,
    routing::{delete, get},
    Json,
};
use huddle_collab::RoomRequest;

use crate::{
    auth::Session,
    context::ServerContext,
    errors::ServerResult,
    schemas::{NewRoomSchema, ValidatedJson},
    serialized::{Room, ToSerialized},
    socket::handle_socket,
    Router,
};

#[utoipa::path(
    get,
    path = "/v1/orgs/{org}/rooms",
    tag = "rooms",
    params(("org" = String, Path, description = "Organization slug")),
    security(
        ("BearerAuth" = [])
    ),
    responses(
        (status = 200, body = Vec<Room>)
    )
)]
pub(crate) async fn list_rooms(
    session: Session,
    State(context): State<ServerContext>,
    Path(org): Path<String>,
) -> ServerResult<Json<Vec<Room>>> {
    let rooms = context
        .collab
        .rooms
        .list_rooms(&org, session.user().id)
        .await?;

    Ok(Json(rooms.to_serialized()))
}

#[utoipa::path(
    post,
    path = "/v1/orgs/{org}/rooms",
    tag = "rooms",
    params(("org" = String, Path, description = "Organization slug")),
    request_body = NewRoomSchema,
    security(
        ("BearerAuth" = [])
    ),
    responses(
        (status = 200, body = Room),
        (status = 403, description = "User is not an admin of the organization")
    )
)]
pub(crate) async fn create_room(
    session: Session,
    State(context): State<ServerContext>,
    Path(org): Path<String>,
    ValidatedJson(body): ValidatedJson<NewRoomSchema>,
) -> ServerResult<Json<Room>> {
    let room = context
        .collab
        .rooms
        .create_room(
            &org,
            session.user().id,
            RoomRequest {
                name: body.name.trim().to_string(),
                flag: body.flag,
                peer_limit: body.peer_limit,
                users: body.users,
            },
        )
        .await?;

    Ok(Json(room.to_serialized()))
}

#[utoipa::path(
    delete,
    path = "/v1/orgs/{org}/rooms/{slug}",
    tag = "rooms",
    params(
        ("org" = String, Path, description = "Organization slug"),
        ("slug" = String, Path, description = "Room slug")
    ),
    security(
        ("BearerAuth" = [])
    ),
    responses(
        (status = 200, description = "Room was deleted and everyone in it disconnected"),
        (status = 403, description = "User is not an admin of the organization")
    )
)]
pub(crate) async fn delete_room(
    session: Session,
    State(context): State<ServerContext>,
    Path((org, slug)): Path<(String, String)>,
) -> ServerResult<()> {
    context
        .collab
        .rooms
        .delete_room(&org, session.user().id, &slug)
        .await?;

    Ok(())
}

#[utoipa::path(
    get,
    path = "/v1/orgs/{org}/rooms/{slug}/socket",
    tag = "rooms",
    params(
        ("org" = String, Path, description = "Organization slug"),
        ("slug" = String, Path, description = "Room slug"),
        ("token" = Option<String>, Query, description = "Session token, if not sent as a header")
    ),
    security(
        ("BearerAuth" = [])
    ),
    responses(
        (status = 101, description = "Switched to the room's websocket protocol")
    )
)]
pub(crate) async fn socket(
    session: Session,
    State(context): State<ServerContext>,
    Path((org, slug)): Path<(String, String)>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    let identity = session.identity();

    upgrade.on_upgrade(move |socket| handle_socket(socket, context.collab, identity, org, slug))
}

pub fn router() -> Router {
    Router::new()
        .route("/:org/rooms", get(list_rooms).post(create_room))
        .route("/:org/rooms/:slug", delete(delete_room))
        .route("/:org/rooms/:slug/socket", get(socket))
}

#[cfg(test)]
mod test {
    use std::{net::SocketAddr, sync::Arc};

    use futures_util::{SinkExt, StreamExt};
    use huddle_collab::{Collab, MemoryDatabase};
    use huddle_core::Config;
    use reqwest::{Client, StatusCode};
    use serde_json::{json, Value};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

    use crate::{app, ServerContext};

    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestServer {
        addr: SocketAddr,
        admin_token: String,
        member_token: String,
        client: Client,
    }

    impl TestServer {
        async fn start() -> Self {
            let db = Arc::new(MemoryDatabase::new());
            let org = db.add_org("acme", "Acme");

            let admin = db.add_user("admin", "Admin");
            let member = db.add_user("member", "Member");
            db.add_member(&org, &admin, true, true);
            db.add_member(&org, &member, true, false);

            let admin_token = db.add_session(&admin);
            let member_token = db.add_session(&member);

            let collab = Arc::new(Collab::new(Config::default(), db));
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            tokio::spawn(async move {
                axum::serve(listener, app(ServerContext { collab }))
                    .await
                    .unwrap()
            });

            Self {
                addr,
                admin_token,
                member_token,
                client: Client::new(),
            }
        }

        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }

        async fn create_room(&self, peer_limit: usize) -> String {
            let room: Value = self
                .client
                .post(self.url("/v1/orgs/acme/rooms"))
                .bearer_auth(&self.admin_token)
                .json(&json!({ "flag": "no", "name": "Standup", "peerLimit": peer_limit }))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();

            room["slug"].as_str().unwrap().to_string()
        }

        async fn connect(&self, slug: &str, token: &str) -> Socket {
            let url = format!(
                "ws://{}/v1/orgs/acme/rooms/{}/socket?token={}",
                self.addr, slug, token
            );

            connect_async(url).await.unwrap().0
        }
    }

    async fn next_envelope(socket: &mut Socket) -> Value {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("Expected a text frame, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn rooms_are_managed_by_admins() {
        let server = TestServer::start().await;
        let rooms = server.url("/v1/orgs/acme/rooms");

        let created: Value = server
            .client
            .post(&rooms)
            .bearer_auth(&server.admin_token)
            .json(&json!({ "flag": "no", "name": " Daily ", "peerLimit": 20 }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(created["name"], "Daily");
        assert_eq!(created["peerLimit"], 8);
        assert_eq!(created["peers"], 0);

        let forbidden = server
            .client
            .post(&rooms)
            .bearer_auth(&server.member_token)
            .json(&json!({ "flag": "no", "name": "Mine" }))
            .send()
            .await
            .unwrap();

        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let listed: Value = server
            .client
            .get(format!("{}?token={}", rooms, server.member_token))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(listed.as_array().map(Vec::len), Some(1));

        let slug = created["slug"].as_str().unwrap();
        let room = server.url(&format!("/v1/orgs/acme/rooms/{slug}"));

        let deleted = server
            .client
            .delete(&room)
            .bearer_auth(&server.admin_token)
            .send()
            .await
            .unwrap();

        assert_eq!(deleted.status(), StatusCode::OK);

        let deleted_again = server
            .client
            .delete(&room)
            .bearer_auth(&server.admin_token)
            .send()
            .await
            .unwrap();

        assert_eq!(deleted_again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_requests_are_refused() {
        let server = TestServer::start().await;
        let rooms = server.url("/v1/orgs/acme/rooms");

        let anonymous = server.client.get(&rooms).send().await.unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let bad_flag = server
            .client
            .post(&rooms)
            .bearer_auth(&server.admin_token)
            .json(&json!({ "flag": "nor", "name": "Daily" }))
            .send()
            .await
            .unwrap();

        assert_eq!(bad_flag.status(), StatusCode::BAD_REQUEST);

        let long_name = server
            .client
            .post(&rooms)
            .bearer_auth(&server.admin_token)
            .json(&json!({ "flag": "no", "name": "a".repeat(26) }))
            .send()
            .await
            .unwrap();

        assert_eq!(long_name.status(), StatusCode::BAD_REQUEST);

        let unknown_org = server
            .client
            .get(server.url("/v1/orgs/nope/rooms"))
            .bearer_auth(&server.admin_token)
            .send()
            .await
            .unwrap();

        assert_eq!(unknown_org.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn the_api_is_documented() {
        let server = TestServer::start().await;

        let docs: Value = server
            .client
            .get(server.url("/api.json"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert!(docs["paths"]["/v1/orgs/{org}/rooms/{slug}/socket"].is_object());
    }

    #[tokio::test]
    async fn refused_sockets_get_the_error_before_the_close() {
        let server = TestServer::start().await;
        let mut socket = server.connect("nope", &server.member_token).await;

        assert_eq!(
            next_envelope(&mut socket).await,
            json!({ "type": "ROOM/ERROR", "payload": "NOT_FOUND" })
        );

        match socket.next().await {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 1000),
            other => panic!("Expected a close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn sockets_relay_between_peers_until_they_leave() {
        let server = TestServer::start().await;
        let slug = server.create_room(4).await;

        let mut admin = server.connect(&slug, &server.admin_token).await;
        let welcome = next_envelope(&mut admin).await;

        assert_eq!(welcome["type"], "ROOM/JOIN");
        assert_eq!(welcome["payload"]["peers"], json!([]));
        let admin_id = welcome["payload"]["peer"].clone();

        let mut member = server.connect(&slug, &server.member_token).await;
        let welcome = next_envelope(&mut member).await;

        assert_eq!(welcome["type"], "ROOM/JOIN");
        assert_eq!(welcome["payload"]["peers"][0]["peer"], admin_id);
        let member_id = welcome["payload"]["peer"].clone();

        let joined = next_envelope(&mut admin).await;
        assert_eq!(joined["type"], "ROOM/PEER_JOIN");
        assert_eq!(joined["payload"]["peer"], member_id);
        assert_eq!(joined["payload"]["user"]["name"], "Member");

        let pointer = json!({ "type": "ROOM/PEER_POINTER", "payload": { "x": 0.5 } });
        member
            .send(Message::Text(pointer.to_string().into()))
            .await
            .unwrap();

        assert_eq!(
            next_envelope(&mut admin).await,
            json!({ "type": "ROOM/PEER_POINTER", "payload": { "x": 0.5, "peer": member_id } })
        );

        member.close(None).await.unwrap();

        assert_eq!(
            next_envelope(&mut admin).await,
            json!({ "type": "ROOM/PEER_LEAVE", "payload": { "peer": member_id } })
        );

        let listed: Value = server
            .client
            .get(server.url("/v1/orgs/acme/rooms"))
            .bearer_auth(&server.admin_token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(listed[0]["peers"], 1);
    }
}
