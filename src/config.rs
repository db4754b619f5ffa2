//! Relay configuration, read once from the environment at startup.

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{RelayError, Result};

/// Largest inbound text frame the relay will act on, in bytes.
pub const MAX_FRAME_BYTES: usize = 65_536;
/// Largest accepted event content, in bytes.
pub const MAX_CONTENT_BYTES: usize = 65_536;
pub const MAX_SUBID_LEN: usize = 64;
pub const MAX_FILTERS: usize = 10;
pub const MAX_LIMIT: usize = 500;
pub const MAX_SUBSCRIPTIONS: usize = 20;
pub const MAX_EVENT_TAGS: usize = 2_000;
/// Capacity of a session's outbound queue. Overflow disconnects the session.
pub const SEND_QUEUE_CAPACITY: usize = 256;
pub const PING_INTERVAL_SECS: u64 = 54;
/// Sessions with no inbound traffic for this long are torn down.
pub const IDLE_TIMEOUT_SECS: u64 = PING_INTERVAL_SECS * 2;
/// NIP-42 AUTH events must carry a created_at within this many seconds of now.
pub const AUTH_WINDOW_SECS: i64 = 600;
pub const PARSE_FAILURE_LIMIT: u32 = 10;
pub const PARSE_FAILURE_WINDOW_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    /// Advertised WebSocket URL, checked against the `relay` tag of AUTH events.
    pub relay_url: String,
    pub relay_name: String,
    pub relay_description: String,
    pub relay_contact: Option<String>,
    pub owner_only: bool,
    pub owner_pubkey: Option<String>,
    /// Minimum number of leading zero bits required on event ids. 0 disables.
    pub min_pow: u8,
    pub created_at_past_limit: i64,
    pub created_at_future_limit: i64,
    /// Per-session inbound frame allowance per minute. 0 disables rate limiting.
    pub max_frames_per_minute: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = parsed("RELAY_PORT")?.unwrap_or(8080);
        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());
        let owner_only = parsed("RELAY_OWNER_ONLY")?.unwrap_or(false);
        let owner_pubkey = std::env::var("NOSTR_OWNER_PUBKEY").ok();

        if let Some(pk) = &owner_pubkey {
            if !crate::event::is_lower_hex(pk, 64) {
                return Err(RelayError::Config(
                    "NOSTR_OWNER_PUBKEY must be 64 lowercase hex characters".to_string(),
                ));
            }
        }
        if owner_only && owner_pubkey.is_none() {
            return Err(RelayError::Config(
                "RELAY_OWNER_ONLY=true requires NOSTR_OWNER_PUBKEY".to_string(),
            ));
        }

        Ok(Config {
            port,
            data_dir: PathBuf::from(data_dir),
            relay_url: std::env::var("RELAY_URL")
                .unwrap_or_else(|_| format!("ws://localhost:{port}")),
            relay_name: std::env::var("RELAY_NAME").unwrap_or_else(|_| "home-relay".to_string()),
            relay_description: std::env::var("RELAY_DESCRIPTION")
                .unwrap_or_else(|_| "A personal Nostr relay".to_string()),
            relay_contact: std::env::var("RELAY_CONTACT").ok(),
            owner_only,
            owner_pubkey,
            min_pow: parsed("RELAY_MIN_POW")?.unwrap_or(0),
            created_at_past_limit: parsed("RELAY_CREATED_AT_PAST_LIMIT_SECONDS")?
                .unwrap_or(2_592_000),
            created_at_future_limit: parsed("RELAY_CREATED_AT_FUTURE_LIMIT_SECONDS")?
                .unwrap_or(600),
            max_frames_per_minute: parsed("RELAY_MAX_FRAMES_PER_MINUTE")?.unwrap_or(0),
        })
    }
}

fn parsed<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| RelayError::Config(format!("{key} has an invalid value: {raw:?}"))),
        Err(_) => Ok(None),
    }
}
