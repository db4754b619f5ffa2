//! The broadcast hub: the registry of live sessions and their
//! subscriptions. `publish` fans a freshly accepted event out to every
//! matching subscription without ever blocking on a slow consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};

use crate::event::Event;
use crate::protocol;
use crate::subscription::Subscription;

/// The hub's view of one session. The subscription table is owned by the
/// session's reader task; the hub only ever takes the read lock on it.
pub struct SessionHandle {
    out: mpsc::Sender<Message>,
    closing: Arc<AtomicBool>,
    kicked: Arc<Notify>,
    subscriptions: Arc<RwLock<HashMap<String, Subscription>>>,
}

impl SessionHandle {
    pub fn new(
        out: mpsc::Sender<Message>,
        closing: Arc<AtomicBool>,
        kicked: Arc<Notify>,
        subscriptions: Arc<RwLock<HashMap<String, Subscription>>>,
    ) -> Self {
        SessionHandle {
            out,
            closing,
            kicked,
            subscriptions,
        }
    }
}

#[derive(Default)]
pub struct Hub {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl Hub {
    pub fn new() -> Self {
        Hub::default()
    }

    pub async fn register(&self, session_id: &str, handle: SessionHandle) {
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), handle);
    }

    pub async fn unregister(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
        debug!("session {} removed from hub", session_id);
    }

    pub async fn connected(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Delivers `event` to every matching subscription of every live
    /// session. A session whose queue is full is marked closing and
    /// skipped; its writer task emits the close frame.
    pub async fn publish(&self, event: &Event) {
        let sessions = self.sessions.read().await;
        for (session_id, handle) in sessions.iter() {
            if handle.closing.load(Ordering::Relaxed) {
                continue;
            }
            let subscriptions = handle.subscriptions.read().await;
            for sub in subscriptions.values() {
                if !sub.matches(event) {
                    continue;
                }
                let frame = Message::Text(protocol::event_frame(&sub.id, event));
                match handle.out.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("session {} send queue full, disconnecting slow consumer", session_id);
                        handle.closing.store(true, Ordering::Relaxed);
                        handle.kicked.notify_waiters();
                        break;
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }
    }
}
