mod auth;
mod db;
mod rooms;
mod util;

use std::sync::Arc;

pub use auth::*;
pub use db::*;
pub use rooms::*;

use huddle_core::{Config, RoomRegistry};

/// The huddle collab system, facilitating room management, authentication, and joining.
pub struct Collab {
    pub registry: Arc<RoomRegistry>,
    pub auth: Auth,
    pub rooms: RoomManager,
}

/// A type passed to various components of the collab system, to access shared state.
#[derive(Clone)]
pub struct CollabContext {
    pub database: Arc<dyn Database>,
    pub registry: Arc<RoomRegistry>,
}

impl Collab {
    pub fn new(config: Config, database: Arc<dyn Database>) -> Self {
        let registry = RoomRegistry::new(config);

        let context = CollabContext {
            database,
            registry: registry.clone(),
        };

        Self {
            registry,
            auth: Auth::new(&context.database),
            rooms: RoomManager::new(&context),
        }
    }
}
