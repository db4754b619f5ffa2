//! The per-connection state machine: one reader loop, one writer task,
//! a heartbeat, and the frame dispatch for EVENT / REQ / CLOSE / COUNT /
//! AUTH.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use crate::config::{
    AUTH_WINDOW_SECS, IDLE_TIMEOUT_SECS, MAX_FILTERS, MAX_FRAME_BYTES, MAX_LIMIT, MAX_SUBID_LEN,
    MAX_SUBSCRIPTIONS, PARSE_FAILURE_LIMIT, PARSE_FAILURE_WINDOW_SECS, PING_INTERVAL_SECS,
    SEND_QUEUE_CAPACITY,
};
use crate::event::{Event, KIND_AUTH};
use crate::filter::Filter;
use crate::hub::SessionHandle;
use crate::now_unix;
use crate::protocol::{self, ClientFrame};
use crate::rate_limit::FrameLimiter;
use crate::subscription::Subscription;
use crate::AppState;

pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let session_id = nanoid::nanoid!();
    let challenge = nanoid::nanoid!();
    info!("session {} connected", session_id);

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(SEND_QUEUE_CAPACITY);
    let closing = Arc::new(AtomicBool::new(false));
    let kicked = Arc::new(Notify::new());
    let subscriptions: Arc<RwLock<HashMap<String, Subscription>>> =
        Arc::new(RwLock::new(HashMap::new()));

    state
        .hub
        .register(
            &session_id,
            SessionHandle::new(
                out_tx.clone(),
                closing.clone(),
                kicked.clone(),
                subscriptions.clone(),
            ),
        )
        .await;

    // Writer task: drains the bounded queue in FIFO order. When the hub
    // marks the session closing it bypasses the queue with a close frame
    // so the client always observes the disconnect.
    let writer_closing = closing.clone();
    let writer_kicked = kicked.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = out_rx.recv() => match frame {
                    Some(msg) => {
                        if sender.send(msg).await.is_err() {
                            break;
                        }
                        if writer_closing.load(Ordering::Relaxed) {
                            let _ = sender
                                .send(Message::Close(Some(CloseFrame {
                                    code: close_code::POLICY,
                                    reason: "slow consumer".into(),
                                })))
                                .await;
                            break;
                        }
                    }
                    None => break,
                },
                _ = writer_kicked.notified() => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: "slow consumer".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // NIP-42: hand the client its challenge up front.
    let _ = out_tx
        .send(Message::Text(protocol::auth_frame(&challenge)))
        .await;

    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + Duration::from_secs(PING_INTERVAL_SECS),
        Duration::from_secs(PING_INTERVAL_SECS),
    );
    let mut last_seen = Instant::now();
    let mut parse_failures = 0u32;
    let mut parse_window = Instant::now();
    let frame_lim_opt = FrameLimiter::per_minute(state.config.max_frames_per_minute);
    let mut authed_pubkey: Option<String> = None;

    loop {
        tokio::select! {
            _ = kicked.notified() => break,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    if text.len() > MAX_FRAME_BYTES {
                        let _ = out_tx
                            .send(Message::Text(protocol::notice_frame("invalid: message too large")))
                            .await;
                        break;
                    }
                    match protocol::parse_frame(&text) {
                        Ok(frame) => {
                            if let Some(lim) = &frame_lim_opt {
                                if !lim.try_take() {
                                    let reply = match &frame {
                                        ClientFrame::Event(event) => protocol::ok_frame(
                                            &event.id,
                                            false,
                                            "rate-limited: slow down",
                                        ),
                                        _ => protocol::notice_frame("rate-limited"),
                                    };
                                    let _ = out_tx.send(Message::Text(reply)).await;
                                    continue;
                                }
                            }
                            dispatch(
                                frame,
                                &state,
                                &subscriptions,
                                &out_tx,
                                &challenge,
                                &mut authed_pubkey,
                            )
                            .await;
                        }
                        Err(detail) => {
                            if parse_window.elapsed()
                                > Duration::from_secs(PARSE_FAILURE_WINDOW_SECS)
                            {
                                parse_window = Instant::now();
                                parse_failures = 0;
                            }
                            parse_failures += 1;
                            let _ = out_tx
                                .send(Message::Text(protocol::notice_frame(&format!(
                                    "invalid: {detail}"
                                ))))
                                .await;
                            if parse_failures > PARSE_FAILURE_LIMIT {
                                warn!("session {} flooding malformed frames, closing", session_id);
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    last_seen = Instant::now();
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary frames are ignored
                Some(Err(e)) => {
                    warn!("session {} socket error: {}", session_id, e);
                    break;
                }
            },
            _ = ping.tick() => {
                if last_seen.elapsed() >= Duration::from_secs(IDLE_TIMEOUT_SECS) {
                    info!("session {} idle, closing", session_id);
                    break;
                }
                if out_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
        if closing.load(Ordering::Relaxed) {
            break;
        }
    }

    state.hub.unregister(&session_id).await;
    // Let the writer flush whatever is queued; dropping the last sender
    // ends its loop.
    drop(out_tx);
    if tokio::time::timeout(Duration::from_secs(5), &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
    debug!("session {} closed (authed: {:?})", session_id, authed_pubkey);
}

async fn dispatch(
    frame: ClientFrame,
    state: &Arc<AppState>,
    subscriptions: &Arc<RwLock<HashMap<String, Subscription>>>,
    out_tx: &mpsc::Sender<Message>,
    challenge: &str,
    authed_pubkey: &mut Option<String>,
) {
    match frame {
        ClientFrame::Event(event) => {
            let outcome = state.ingest.submit(*event).await;
            let (id, accepted, message) = outcome.ok_parts();
            let _ = out_tx
                .send(Message::Text(protocol::ok_frame(id, accepted, &message)))
                .await;
        }
        ClientFrame::Req { sub_id, filters } => {
            handle_req(state, subscriptions, out_tx, sub_id, filters).await;
        }
        ClientFrame::Close { sub_id } => {
            // Unknown ids are silently ignored; CLOSE sends no reply.
            subscriptions.write().await.remove(&sub_id);
        }
        ClientFrame::Count { sub_id, filters } => {
            handle_count(state, out_tx, sub_id, filters).await;
        }
        ClientFrame::Auth(event) => {
            handle_auth(state, out_tx, challenge, authed_pubkey, *event).await;
        }
        ClientFrame::Unsupported(word) => {
            let _ = out_tx
                .send(Message::Text(protocol::notice_frame(&format!(
                    "unsupported: {word}"
                ))))
                .await;
        }
    }
}

/// Clamps REQ/COUNT parameters to the advertised limits, sending a NOTICE
/// naming the limit that was hit. Returns None when the request cannot be
/// salvaged.
async fn clamp_request(
    out_tx: &mpsc::Sender<Message>,
    sub_id: &str,
    filters: &mut Vec<Filter>,
) -> Option<()> {
    if sub_id.is_empty() || sub_id.len() > MAX_SUBID_LEN {
        let _ = out_tx
            .send(Message::Text(protocol::notice_frame(&format!(
                "invalid: subscription id must be 1-{MAX_SUBID_LEN} characters"
            ))))
            .await;
        return None;
    }
    if filters.len() > MAX_FILTERS {
        let _ = out_tx
            .send(Message::Text(protocol::notice_frame(&format!(
                "invalid: more than {MAX_FILTERS} filters, extra filters dropped"
            ))))
            .await;
        filters.truncate(MAX_FILTERS);
    }
    for filter in filters.iter_mut() {
        if filter.limit.is_some_and(|l| l > MAX_LIMIT) {
            let _ = out_tx
                .send(Message::Text(protocol::notice_frame(&format!(
                    "invalid: limit capped at {MAX_LIMIT}"
                ))))
                .await;
            filter.limit = Some(MAX_LIMIT);
        }
    }
    Some(())
}

async fn handle_req(
    state: &Arc<AppState>,
    subscriptions: &Arc<RwLock<HashMap<String, Subscription>>>,
    out_tx: &mpsc::Sender<Message>,
    sub_id: String,
    mut filters: Vec<Filter>,
) {
    if clamp_request(out_tx, &sub_id, &mut filters).await.is_none() {
        return;
    }
    {
        let subs = subscriptions.read().await;
        if subs.len() >= MAX_SUBSCRIPTIONS && !subs.contains_key(&sub_id) {
            let _ = out_tx
                .send(Message::Text(protocol::notice_frame(&format!(
                    "invalid: at most {MAX_SUBSCRIPTIONS} subscriptions per connection"
                ))))
                .await;
            return;
        }
    }

    debug!("REQ {} with {} filters", sub_id, filters.len());
    match state.store.query(&filters, MAX_LIMIT).await {
        Ok(events) => {
            for event in &events {
                let _ = out_tx
                    .send(Message::Text(protocol::event_frame(&sub_id, event)))
                    .await;
            }
        }
        Err(e) => {
            tracing::error!("backfill query failed: {e}");
            let _ = out_tx
                .send(Message::Text(protocol::notice_frame("error: storage")))
                .await;
        }
    }

    // Register (replacing any same-id subscription) before EOSE goes out,
    // so a client that has seen EOSE is live from that point on.
    subscriptions.write().await.insert(
        sub_id.clone(),
        Subscription::new(sub_id.clone(), filters),
    );
    let _ = out_tx
        .send(Message::Text(protocol::eose_frame(&sub_id)))
        .await;
}

async fn handle_count(
    state: &Arc<AppState>,
    out_tx: &mpsc::Sender<Message>,
    sub_id: String,
    mut filters: Vec<Filter>,
) {
    if clamp_request(out_tx, &sub_id, &mut filters).await.is_none() {
        return;
    }
    match state.store.count(&filters).await {
        Ok(count) => {
            let _ = out_tx
                .send(Message::Text(protocol::count_frame(&sub_id, count)))
                .await;
        }
        Err(e) => {
            tracing::error!("count query failed: {e}");
            let _ = out_tx
                .send(Message::Text(protocol::notice_frame("error: storage")))
                .await;
        }
    }
}

async fn handle_auth(
    state: &Arc<AppState>,
    out_tx: &mpsc::Sender<Message>,
    challenge: &str,
    authed_pubkey: &mut Option<String>,
    event: Event,
) {
    let reply = |accepted: bool, message: String| {
        Message::Text(protocol::ok_frame(&event.id, accepted, &message))
    };

    let verdict = auth_verdict(&state.config.relay_url, challenge, &event);
    match verdict {
        Ok(()) => {
            info!("session authenticated as {}", event.pubkey);
            *authed_pubkey = Some(event.pubkey.clone());
            let _ = out_tx.send(reply(true, String::new())).await;
        }
        Err(detail) => {
            let _ = out_tx.send(reply(false, format!("invalid: {detail}"))).await;
        }
    }
}

/// NIP-42 checks: kind 22242, our challenge, our relay URL, fresh
/// created_at, and a valid id + signature.
fn auth_verdict(relay_url: &str, challenge: &str, event: &Event) -> Result<(), String> {
    event.check_shape()?;
    if !event.verify_id() {
        return Err("id does not match the event hash".to_string());
    }
    if !event.verify_sig() {
        return Err("bad signature".to_string());
    }
    if event.kind != KIND_AUTH {
        return Err("auth requires a kind 22242 event".to_string());
    }
    if event.first_tag_value("challenge") != Some(challenge) {
        return Err("wrong challenge".to_string());
    }
    let relay_tag = event.first_tag_value("relay").unwrap_or("");
    if relay_tag.trim_end_matches('/') != relay_url.trim_end_matches('/') {
        return Err("wrong relay".to_string());
    }
    if (event.created_at - now_unix()).abs() > AUTH_WINDOW_SECS {
        return Err("auth event is too old or too new".to_string());
    }
    Ok(())
}
