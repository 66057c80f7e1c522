pub mod agent;
pub mod broker;
pub mod config;
pub mod ingest;
pub mod limits;
pub mod models;
pub mod mq;
pub mod routes;
pub mod store;

// Socket frame type, re-exported so clients and tests can build frames.
pub use rocket_ws as ws;

use rocket::{Build, Rocket};
use rocket_cors::CorsOptions;
use std::sync::Arc;

use broker::Broker;
use config::Config;
use ingest::Ingest;
use mq::{EmbeddedLog, MessageQueue};
use store::{ChatStore, SqliteStore};

pub fn rocket_from_env() -> Rocket<Build> {
    build(Config::from_env())
}

pub fn build(cfg: Config) -> Rocket<Build> {
    for path in [&cfg.db_path, &cfg.log_path] {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
    }

    let store: Arc<dyn ChatStore> =
        Arc::new(SqliteStore::open(&cfg.db_path).expect("failed to open chat store"));
    let mq: Arc<dyn MessageQueue> =
        Arc::new(EmbeddedLog::open(&cfg.log_path).expect("failed to open message log"));
    let ingest = Arc::new(Ingest::new(Arc::clone(&mq), Arc::clone(&store)));
    let broker = Arc::new(Broker::new(
        Arc::clone(&mq),
        Arc::clone(&store),
        Arc::clone(&ingest),
    ));

    let cors = CorsOptions::default()
        .to_cors()
        .expect("failed to create CORS");

    rocket::build()
        .manage(cfg)
        .manage(store)
        .manage(mq)
        .manage(ingest)
        .manage(broker)
        .attach(cors)
        .mount(
            "/",
            rocket::routes![
                routes::create_channel,
                routes::list_channels,
                routes::unread_count,
                routes::register,
                routes::list_members,
                routes::connect,
            ],
        )
}
