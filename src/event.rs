//! The Nostr event record: strict parsing, canonical serialization,
//! id hashing and BIP-340 signature verification.

use std::str::FromStr;
use std::sync::LazyLock;

use secp256k1::{schnorr, Message, Secp256k1, VerifyOnly, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{MAX_CONTENT_BYTES, MAX_EVENT_TAGS};

pub const KIND_METADATA: u16 = 0;
pub const KIND_CONTACTS: u16 = 3;
pub const KIND_DELETION: u16 = 5;
pub const KIND_AUTH: u16 = 22_242;

pub(crate) static SECP: LazyLock<Secp256k1<VerifyOnly>> =
    LazyLock::new(Secp256k1::verification_only);

/// A signed event. Immutable once it has passed validation; `received_at`
/// is assigned by the relay and never appears on the wire.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
    #[serde(skip)]
    pub received_at: i64,
}

impl Event {
    /// Strict parse from a JSON value. Field types are enforced here
    /// (`kind` is a u16 by construction); shape checks that produce an
    /// `OK false` verdict live in [`Event::check_shape`].
    pub fn parse(value: serde_json::Value) -> Result<Event, String> {
        serde_json::from_value(value).map_err(|e| format!("malformed event: {e}"))
    }

    /// Field-level checks beyond what the types give us: hex charsets,
    /// lengths, non-empty tag arrays.
    pub fn check_shape(&self) -> Result<(), String> {
        if !is_lower_hex(&self.id, 64) {
            return Err("id must be 64 lowercase hex characters".to_string());
        }
        if !is_lower_hex(&self.pubkey, 64) {
            return Err("pubkey must be 64 lowercase hex characters".to_string());
        }
        if !is_lower_hex(&self.sig, 128) {
            return Err("sig must be 128 lowercase hex characters".to_string());
        }
        if self.content.len() > MAX_CONTENT_BYTES {
            return Err("content too long".to_string());
        }
        if self.tags.len() > MAX_EVENT_TAGS {
            return Err("too many tags".to_string());
        }
        if self.tags.iter().any(|t| t.is_empty()) {
            return Err("tags must not be empty arrays".to_string());
        }
        Ok(())
    }

    /// The canonical `[0, pubkey, created_at, kind, tags, content]` form.
    /// serde_json emits exactly the NIP-01 escape set: `\"`, `\\`, `\n`,
    /// `\r`, `\t`, `\b`, `\f`, `\uXXXX` for remaining control characters,
    /// and raw UTF-8 for everything else, with no insignificant whitespace.
    pub fn canonical(&self) -> String {
        let form = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content,
        ]);
        serde_json::to_string(&form).unwrap_or_default()
    }

    pub fn compute_id(&self) -> String {
        hex::encode(Sha256::digest(self.canonical().as_bytes()))
    }

    pub fn verify_id(&self) -> bool {
        self.compute_id() == self.id
    }

    pub fn verify_sig(&self) -> bool {
        let digest: [u8; 32] = match hex::decode(&self.id).ok().and_then(|b| b.try_into().ok()) {
            Some(d) => d,
            None => return false,
        };
        let msg = Message::from_digest(digest);
        let Ok(pubkey) = XOnlyPublicKey::from_str(&self.pubkey) else {
            return false;
        };
        let Ok(sig) = schnorr::Signature::from_str(&self.sig) else {
            return false;
        };
        SECP.verify_schnorr(&sig, &msg, &pubkey).is_ok()
    }

    /// Number of leading zero bits in the event id (NIP-13).
    pub fn pow_bits(&self) -> u32 {
        let Ok(bytes) = hex::decode(&self.id) else {
            return 0;
        };
        let mut bits = 0;
        for b in bytes {
            if b == 0 {
                bits += 8;
            } else {
                bits += b.leading_zeros();
                break;
            }
        }
        bits
    }

    /// Second element of the first tag named `name`.
    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1).map(String::as_str))
    }

    /// The `d` identifier for parameterized replaceable events.
    /// A missing tag or missing value reads as the empty string.
    pub fn d_tag(&self) -> &str {
        self.first_tag_value("d").unwrap_or("")
    }

    /// Unix timestamp from the `expiration` tag, if present and numeric.
    pub fn expiration(&self) -> Option<i64> {
        self.first_tag_value("expiration")?.parse().ok()
    }

    /// All `e`-tag references (used by kind-5 deletions).
    pub fn referenced_event_ids(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some("e"))
            .filter_map(|t| t.get(1).cloned())
            .collect()
    }
}

/// Kinds 0, 3 and 10000-19999 keep only the latest event per (pubkey, kind).
pub fn is_replaceable(kind: u16) -> bool {
    kind == KIND_METADATA || kind == KIND_CONTACTS || (10_000..20_000).contains(&kind)
}

/// Kinds 30000-39999 keep only the latest event per (pubkey, kind, d).
pub fn is_param_replaceable(kind: u16) -> bool {
    (30_000..40_000).contains(&kind)
}

/// Kinds 20000-29999 are broadcast but never stored.
pub fn is_ephemeral(kind: u16) -> bool {
    (20_000..30_000).contains(&kind)
}

pub fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && is_hex_prefix(s)
}

/// A (possibly partial, possibly odd-length) lowercase hex string usable
/// as an id or pubkey prefix. The empty prefix is legal and matches
/// everything.
pub fn is_hex_prefix(s: &str) -> bool {
    s.len() <= 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
