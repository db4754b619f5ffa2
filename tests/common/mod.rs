//! Shared helpers for the end-to-end tests: an in-process relay on an
//! ephemeral port, a thin WebSocket client, and event signing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use secp256k1::{Keypair, Message as SecpMessage, Secp256k1};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use home_relay::config::Config;
use home_relay::event::Event;
use home_relay::AppState;

pub fn test_config(data_dir: &std::path::Path) -> Config {
    Config {
        port: 0,
        data_dir: data_dir.to_path_buf(),
        relay_url: "ws://test-relay".to_string(),
        relay_name: "test-relay".to_string(),
        relay_description: "integration test relay".to_string(),
        relay_contact: None,
        owner_only: false,
        owner_pubkey: None,
        min_pow: 0,
        created_at_past_limit: 2_592_000,
        created_at_future_limit: 600,
        max_frames_per_minute: 0,
    }
}

/// Boots the real router on an ephemeral port.
pub async fn spawn_relay(config: Config) -> (SocketAddr, Arc<AppState>) {
    let state = AppState::init(config).await.expect("state init");
    let app = home_relay::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, state)
}

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
    let sig = secp.sign_schnorr_no_aux_rand(&SecpMessage::from_digest(digest), keys);
    event.sig = sig.to_string();
    event
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// The NIP-42 challenge the relay issued on connect.
    pub challenge: String,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}/")).await.expect("connect");
        let mut client = Client {
            ws,
            challenge: String::new(),
        };
        let frame = client.recv_json().await;
        assert_eq!(frame[0], "AUTH", "relay greets with its auth challenge");
        client.challenge = frame[1].as_str().expect("challenge").to_string();
        client
    }

    pub async fn send(&mut self, frame: Value) {
        self.send_text(frame.to_string()).await;
    }

    pub async fn send_text(&mut self, text: String) {
        self.ws.send(Message::Text(text)).await.expect("send");
    }

    /// Next JSON frame, skipping transport pings. Panics after 5 seconds.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .expect("socket error");
            match msg {
                Message::Text(text) => {
                    return serde_json::from_str(&text).expect("frame is JSON")
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    /// Asserts that nothing but transport noise arrives for `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        match tokio::time::timeout(wait, self.ws.next()).await {
            Err(_) => {}
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
            Ok(other) => panic!("expected silence, got {other:?}"),
        }
    }

    /// Sends ["EVENT", event] and returns the matching OK frame.
    pub async fn publish(&mut self, event: &Event) -> Value {
        self.send(json!(["EVENT", event])).await;
        let frame = self.recv_json().await;
        assert_eq!(frame[0], "OK");
        assert_eq!(frame[1], event.id.as_str());
        frame
    }

    /// Sends a REQ and collects EVENT frames until EOSE.
    pub async fn backfill(&mut self, sub_id: &str, filters: Vec<Value>) -> Vec<Value> {
        let mut frame = vec![json!("REQ"), json!(sub_id)];
        frame.extend(filters);
        self.send(Value::Array(frame)).await;
        let mut events = Vec::new();
        loop {
            let frame = self.recv_json().await;
            match frame[0].as_str() {
                Some("EVENT") => {
                    assert_eq!(frame[1], sub_id);
                    events.push(frame[2].clone());
                }
                Some("EOSE") => {
                    assert_eq!(frame[1], sub_id);
                    return events;
                }
                other => panic!("unexpected frame during backfill: {other:?}"),
            }
        }
    }
}
