use std::env;

use crate::limits::{DEFAULT_BOUNDS, Limit, Policy};

/// Application configuration, read from the environment with defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file backing the chat store.
    pub db_path: String,
    /// SQLite file backing the embedded message log.
    pub log_path: String,
    pub admin_username: String,
    pub admin_password: String,
    pub policy: Policy,
}

impl Config {
    pub fn from_env() -> Config {
        let bounds: Vec<(Limit, (usize, usize))> = DEFAULT_BOUNDS
            .iter()
            .map(|&(lim, default)| (lim, bounds_from_env(lim, default)))
            .collect();
        Config {
            db_path: env::var("CHATD_DB_PATH").unwrap_or_else(|_| "data/chat.db".to_string()),
            log_path: env::var("CHATD_LOG_PATH").unwrap_or_else(|_| "data/log.db".to_string()),
            admin_username: env::var("CHATD_ADMIN_USERNAME")
                .unwrap_or_else(|_| "admin".to_string()),
            admin_password: env::var("CHATD_ADMIN_PASSWORD")
                .unwrap_or_else(|_| "admin".to_string()),
            policy: Policy::new(&bounds),
        }
    }
}

/// Per-field overrides take the form `min:max`, e.g. `CHATD_LIMIT_UID=4:16`.
fn bounds_from_env(lim: Limit, default: (usize, usize)) -> (usize, usize) {
    let key = match lim {
        Limit::DisplayName => "CHATD_LIMIT_DISPLAY_NAME",
        Limit::Uid => "CHATD_LIMIT_UID",
        Limit::Secret => "CHATD_LIMIT_SECRET",
        Limit::Chan => "CHATD_LIMIT_CHANNEL",
        Limit::ChanSecret => "CHATD_LIMIT_CHANNEL_SECRET",
    };
    env::var(key)
        .ok()
        .and_then(|v| {
            let (lo, hi) = v.split_once(':')?;
            Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?))
        })
        .unwrap_or(default)
}
