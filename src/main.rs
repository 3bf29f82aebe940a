use std::{env, sync::Arc};

use colored::Colorize;
use huddle_collab::{Collab, Database, DatabaseError, MemoryDatabase, NewRoom, PgDatabase};
use huddle_core::Config;
use huddle_server::DEFAULT_PORT;
use log::{error, info, warn};
use thiserror::Error;
use tokio::runtime::{self, Runtime};

mod logging;

/// Rooms every demo organization starts with
const DEMO_ROOMS: [(&str, &str, &str); 3] = [
    ("lobby", "Lobby", "es"),
    ("standup", "Standup", "no"),
    ("coffee", "Coffee", "it"),
];

#[derive(Debug, Error)]
enum HuddleError {
    #[error("Could not initialize database: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid value for {variable}: {value}")]
    Environment {
        variable: &'static str,
        value: String,
    },

    #[error("Server stopped: {0}")]
    Server(#[from] std::io::Error),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Settings read from the environment
struct Settings {
    port: u16,
    database_url: Option<String>,
    config: Config,
}

impl Settings {
    fn from_env() -> Result<Self, HuddleError> {
        let port = match env::var("HUDDLE_SERVER_PORT") {
            Ok(value) => value.parse().map_err(|_| HuddleError::Environment {
                variable: "HUDDLE_SERVER_PORT",
                value,
            })?,
            Err(_) => DEFAULT_PORT,
        };

        let mut config = Config::default();

        if let Ok(value) = env::var("HUDDLE_EVICTION_GRACE") {
            config.eviction_grace_in_seconds = value
                .parse::<f32>()
                .ok()
                .filter(|s| s.is_finite() && *s >= 0.)
                .ok_or(HuddleError::Environment {
                    variable: "HUDDLE_EVICTION_GRACE",
                    value,
                })?;
        }

        Ok(Self {
            port,
            database_url: env::var("HUDDLE_DATABASE_URL").ok(),
            config,
        })
    }
}

struct Huddle {
    settings: Settings,
    collab: Arc<Collab>,
    runtime: Runtime,
}

impl Huddle {
    fn new() -> Result<Self, HuddleError> {
        let settings = Settings::from_env()?;

        info!("Building async runtime...");
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("huddle-async")
            .build()
            .map_err(|e| HuddleError::Fatal(e.to_string()))?;

        let database: Arc<dyn Database> = match &settings.database_url {
            Some(url) => {
                info!("Connecting to database...");
                Arc::new(runtime.block_on(PgDatabase::new(url))?)
            }
            None => {
                warn!("HUDDLE_DATABASE_URL is not set, rooms will only be kept in memory");
                Arc::new(runtime.block_on(demo_database())?)
            }
        };

        let collab = Arc::new(Collab::new(settings.config.clone(), database));

        Ok(Self {
            settings,
            collab,
            runtime,
        })
    }

    fn run(self) -> Result<(), HuddleError> {
        let collab = self.collab.clone();
        let port = self.settings.port;

        self.runtime
            .block_on(huddle_server::run_server(collab, port))
            .map_err(HuddleError::from)
    }
}

impl HuddleError {
    fn hint(&self) -> String {
        match self {
            HuddleError::Database(_) => "This is a database error. Make sure HUDDLE_DATABASE_URL points to a running postgres instance, then try again.".to_string(),
            HuddleError::Environment { variable, .. } => format!("Check the value of {variable}, or unset it to use the default."),
            HuddleError::Server(_) => "The server could not listen. Make sure the port is not already in use.".to_string(),
            HuddleError::Fatal(_) => "This error is fatal, and should not happen.".to_string(),
        }
    }
}

/// An in-memory database with one organization and a guest session to try things with
async fn demo_database() -> Result<MemoryDatabase, DatabaseError> {
    let db = MemoryDatabase::new();

    let org = db.add_org("demo", "Demo");
    let guest = db.add_user("guest", "Guest");
    db.add_member(&org, &guest, true, true);

    for (slug, name, flag) in DEMO_ROOMS {
        db.create_room(NewRoom {
            org_id: org.id,
            slug: slug.to_string(),
            name: name.to_string(),
            flag: flag.to_string(),
            peer_limit: Config::default().default_peer_limit as i32,
            public: true,
            users: vec![],
        })
        .await?;
    }

    info!(
        "Created organization \"{}\", sign in with token {}",
        org.slug,
        db.add_session(&guest)
    );

    Ok(db)
}

fn main() {
    logging::init_logger().expect("logging is initialized");

    let result = Huddle::new().and_then(|huddle| {
        info!("Initialized successfully.");
        huddle.run()
    });

    if let Err(error) = result {
        error!("{} Read the error below to troubleshoot the issue. If you think this might be a bug, please report it by making a GitHub issue.", "Huddle failed to start!".bold().red());
        error!("{}", error);
        error!("{}", format!("Hint: {}", error.hint()).dimmed().italic());
    }
}
