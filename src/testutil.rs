//! Key generation and event signing helpers for unit tests.

use secp256k1::{Keypair, Message, Secp256k1};

use crate::event::Event;

pub fn keypair() -> (Keypair, String) {
    let secp = Secp256k1::new();
    let keys = Keypair::new(&secp, &mut rand::thread_rng());
    let (xonly, _) = keys.x_only_public_key();
    (keys, hex::encode(xonly.serialize()))
}

pub fn sign_event(
    keys: &Keypair,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: &str,
    created_at: i64,
) -> Event {
    let secp = Secp256k1::new();
    let (xonly, _) = keys.x_only_public_key();
    let mut event = Event {
        id: String::new(),
        pubkey: hex::encode(xonly.serialize()),
        created_at,
        kind,
        tags,
        content: content.to_string(),
        sig: String::new(),
        received_at: 0,
    };
    event.id = event.compute_id();
    let digest: [u8; 32] = hex::decode(&event.id)
        .expect("fresh id is hex")
        .try_into()
        .expect("sha256 is 32 bytes");
    let sig = secp.sign_schnorr_no_aux_rand(&Message::from_digest(digest), keys);
    event.sig = sig.to_string();
    event
}
