//! NIP-26 delegated event signing.
//!
//! A `delegation` tag carries the delegator's pubkey, a conditions string
//! and a Schnorr signature over `nostr:delegation:<delegatee>:<conditions>`.
//! Events with a delegation tag are only accepted when the token verifies
//! and every condition holds for the event.

use std::str::FromStr;

use secp256k1::{schnorr, Message, XOnlyPublicKey};
use sha2::{Digest, Sha256};

use crate::event::{Event, SECP};

/// Checks the delegation tag, if any. `Ok(())` for events without one.
pub fn check(event: &Event) -> Result<(), String> {
    let Some(tag) = event
        .tags
        .iter()
        .find(|t| t.first().map(String::as_str) == Some("delegation"))
    else {
        return Ok(());
    };
    if tag.len() < 4 {
        return Err("delegation tag needs delegator, conditions and token".to_string());
    }
    let (delegator, conditions, token) = (&tag[1], &tag[2], &tag[3]);

    check_conditions(event, conditions)?;

    let payload = format!("nostr:delegation:{}:{}", event.pubkey, conditions);
    let digest: [u8; 32] = Sha256::digest(payload.as_bytes()).into();
    let Ok(pubkey) = XOnlyPublicKey::from_str(delegator) else {
        return Err("delegation has a malformed delegator pubkey".to_string());
    };
    let Ok(sig) = schnorr::Signature::from_str(token) else {
        return Err("delegation has a malformed token".to_string());
    };
    if SECP
        .verify_schnorr(&sig, &Message::from_digest(digest), &pubkey)
        .is_err()
    {
        return Err("delegation token does not verify".to_string());
    }
    Ok(())
}

/// Every `&`-separated condition must hold. Unrecognized conditions
/// invalidate the delegation.
fn check_conditions(event: &Event, conditions: &str) -> Result<(), String> {
    for cond in conditions.split('&').filter(|c| !c.is_empty()) {
        if let Some(kind) = cond.strip_prefix("kind=") {
            let Ok(kind) = kind.parse::<u16>() else {
                return Err(format!("delegation condition not understood: {cond}"));
            };
            if event.kind != kind {
                return Err(format!("delegation does not cover kind {}", event.kind));
            }
        } else if let Some(ts) = cond.strip_prefix("created_at<") {
            let Ok(ts) = ts.parse::<i64>() else {
                return Err(format!("delegation condition not understood: {cond}"));
            };
            if event.created_at >= ts {
                return Err("delegation expired for this created_at".to_string());
            }
        } else if let Some(ts) = cond.strip_prefix("created_at>") {
            let Ok(ts) = ts.parse::<i64>() else {
                return Err(format!("delegation condition not understood: {cond}"));
            };
            if event.created_at <= ts {
                return Err("delegation not yet valid for this created_at".to_string());
            }
        } else {
            return Err(format!("delegation condition not understood: {cond}"));
        }
    }
    Ok(())
}
