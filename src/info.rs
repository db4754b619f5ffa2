//! NIP-11 relay information document and the operator stats surface.

use serde::Serialize;

use crate::config::{
    Config, MAX_CONTENT_BYTES, MAX_EVENT_TAGS, MAX_FILTERS, MAX_FRAME_BYTES, MAX_LIMIT,
    MAX_SUBID_LEN, MAX_SUBSCRIPTIONS,
};

pub const SUPPORTED_NIPS: &[u16] = &[1, 9, 11, 13, 26, 40, 42, 45, 50];

#[derive(Debug, Serialize)]
pub struct RelayInfo {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub supported_nips: Vec<u16>,
    pub software: String,
    pub version: String,
    pub limitation: Limitation,
}

#[derive(Debug, Serialize)]
pub struct Limitation {
    pub max_message_length: usize,
    pub max_subscriptions: usize,
    pub max_filters: usize,
    pub max_limit: usize,
    pub max_subid_length: usize,
    pub max_event_tags: usize,
    pub max_content_length: usize,
    pub min_pow_difficulty: u8,
    pub auth_required: bool,
    pub payment_required: bool,
    pub restricted_writes: bool,
    pub created_at_lower_limit: i64,
    pub created_at_upper_limit: i64,
}

pub fn relay_info(config: &Config) -> RelayInfo {
    RelayInfo {
        name: config.relay_name.clone(),
        description: config.relay_description.clone(),
        pubkey: config.owner_pubkey.clone(),
        contact: config.relay_contact.clone(),
        supported_nips: SUPPORTED_NIPS.to_vec(),
        software: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        limitation: Limitation {
            max_message_length: MAX_FRAME_BYTES,
            max_subscriptions: MAX_SUBSCRIPTIONS,
            max_filters: MAX_FILTERS,
            max_limit: MAX_LIMIT,
            max_subid_length: MAX_SUBID_LEN,
            max_event_tags: MAX_EVENT_TAGS,
            max_content_length: MAX_CONTENT_BYTES,
            min_pow_difficulty: config.min_pow,
            auth_required: false,
            payment_required: false,
            restricted_writes: config.owner_only,
            created_at_lower_limit: config.created_at_past_limit,
            created_at_upper_limit: config.created_at_future_limit,
        },
    }
}

#[derive(Debug, Serialize)]
pub struct RelayStats {
    pub connected_clients: usize,
    pub total_events: u64,
    pub supported_nips: Vec<u16>,
    pub owner_only: bool,
    pub relay_name: String,
}
