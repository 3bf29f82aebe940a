mod auth;
mod context;
mod docs;
mod errors;
mod rooms;
mod schemas;
mod serialized;
mod socket;

use std::{
    net::{Ipv6Addr, SocketAddr},
    sync::Arc,
};

use axum::routing::get;
use huddle_collab::Collab;
use log::info;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

pub use context::ServerContext;
pub use errors::*;

/// The default port the server will listen on.
pub const DEFAULT_PORT: u16 = 9050;

pub type Router = axum::Router<ServerContext>;

/// Starts the huddle server
pub async fn run_server(collab: Arc<Collab>, port: u16) -> std::io::Result<()> {
    let addr: SocketAddr = (Ipv6Addr::UNSPECIFIED, port).into();
    let listener = TcpListener::bind(&addr).await?;

    info!("Listening on port {}", port);

    axum::serve(listener, app(ServerContext { collab })).await
}

/// Builds the routes of the server
pub fn app(context: ServerContext) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let version_one_router = Router::new().nest("/orgs", rooms::router());

    Router::new()
        .nest("/v1", version_one_router)
        .route("/api.json", get(docs::docs))
        .layer(cors)
        .with_state(context)
}
