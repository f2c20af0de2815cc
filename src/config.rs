use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::gateway::rest::RoomListing;
use crate::poller::{MESSAGE_POLL_INTERVAL, ROOM_LIST_POLL_INTERVAL};

#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    Rest {
        url: String,
        anon_key: String,
        room_listing: RoomListing,
    },
    Local {
        db_path: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub backend: Backend,
    pub message_poll: Duration,
    pub room_poll: Duration,
}

impl Config {
    /// Reads `.env` (if any) and then the process environment.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file loaded: {}", e);
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let backend_name = match get("MURMUR_BACKEND") {
            Some(name) => name.to_ascii_lowercase(),
            None if get("SUPABASE_URL").is_some() => "rest".to_string(),
            None => "local".to_string(),
        };

        let backend = match backend_name.as_str() {
            "rest" | "supabase" => {
                let url = get("SUPABASE_URL").context("SUPABASE_URL is required for the rest backend")?;
                let anon_key = get("SUPABASE_ANON_KEY").context("SUPABASE_ANON_KEY is required for the rest backend")?;
                let room_listing = match get("MURMUR_ROOM_LISTING") {
                    Some(raw) => raw.parse::<RoomListing>().map_err(anyhow::Error::msg)?,
                    None => RoomListing::default(),
                };
                Backend::Rest {
                    url,
                    anon_key,
                    room_listing,
                }
            }
            "local" | "sqlite" => {
                let db_path = match get("MURMUR_DB_PATH") {
                    Some(path) => PathBuf::from(path),
                    None => {
                        let home = get("HOME").unwrap_or_else(|| ".".into());
                        PathBuf::from(home).join(".murmur").join("murmur.db")
                    }
                };
                Backend::Local { db_path }
            }
            other => bail!("Unknown MURMUR_BACKEND: {}", other),
        };

        Ok(Self {
            backend,
            message_poll: millis(&get, "MURMUR_POLL_MESSAGES_MS", MESSAGE_POLL_INTERVAL)?,
            room_poll: millis(&get, "MURMUR_POLL_ROOMS_MS", ROOM_LIST_POLL_INTERVAL)?,
        })
    }
}

fn millis(get: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
    match get(key) {
        Some(raw) => {
            let ms: u64 = raw.parse().with_context(|| format!("{} must be a number of milliseconds", key))?;
            if ms == 0 {
                bail!("{} must be greater than zero", key);
            }
            Ok(Duration::from_millis(ms))
        }
        None => Ok(default),
    }
}
