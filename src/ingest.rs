//! The ingest pipeline: every EVENT frame passes through the same ordered
//! verdict sequence, and the first failing rule terminates it. Persist and
//! publish happen under the store writer lease so the hub's fan-out order
//! is the store's serialization order.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::event::{self, Event, KIND_AUTH, KIND_DELETION};
use crate::hub::Hub;
use crate::nip26;
use crate::now_unix;
use crate::store::{PutOutcome, Store};

#[derive(Debug)]
pub enum IngestOutcome {
    /// Accepted, persisted unless ephemeral, and broadcast.
    Accepted { id: String },
    /// The exact event is already stored. Accepting again is idempotent
    /// and does not re-broadcast.
    Duplicate { id: String },
    Rejected { id: String, reason: Reject },
}

impl IngestOutcome {
    /// The `["OK", id, accepted, message]` triple for this verdict.
    pub fn ok_parts(&self) -> (&str, bool, String) {
        match self {
            IngestOutcome::Accepted { id } => (id, true, String::new()),
            IngestOutcome::Duplicate { id } => (id, true, "duplicate:".to_string()),
            IngestOutcome::Rejected { id, reason } => (id, false, reason.message()),
        }
    }
}

/// Machine-readable rejection classes, rendered with the protocol's
/// standard reason prefixes.
#[derive(Debug)]
pub enum Reject {
    Invalid(String),
    Pow(String),
    Restricted(String),
    RateLimited(String),
    Duplicate(String),
    Error(String),
}

impl Reject {
    pub fn message(&self) -> String {
        match self {
            Reject::Invalid(detail) => format!("invalid: {detail}"),
            Reject::Pow(detail) => format!("pow: {detail}"),
            Reject::Restricted(detail) => format!("restricted: {detail}"),
            Reject::RateLimited(detail) => format!("rate-limited: {detail}"),
            Reject::Duplicate(detail) => format!("duplicate: {detail}"),
            Reject::Error(detail) => format!("error: {detail}"),
        }
    }
}

pub struct Ingest {
    store: Arc<Store>,
    hub: Arc<Hub>,
    config: Arc<Config>,
    /// Single-writer lease; held across kind treatment, persist and publish.
    write_lease: Mutex<()>,
}

impl Ingest {
    pub fn new(store: Arc<Store>, hub: Arc<Hub>, config: Arc<Config>) -> Self {
        Ingest {
            store,
            hub,
            config,
            write_lease: Mutex::new(()),
        }
    }

    pub async fn submit(&self, mut event: Event) -> IngestOutcome {
        let id = event.id.clone();
        let reject = |reason| IngestOutcome::Rejected { id: event.id.clone(), reason };

        if let Err(detail) = event.check_shape() {
            return reject(Reject::Invalid(detail));
        }
        if !event.verify_id() {
            return reject(Reject::Invalid("id does not match the event hash".to_string()));
        }
        if !event.verify_sig() {
            return reject(Reject::Invalid("bad signature".to_string()));
        }

        let now = now_unix();
        if event.created_at > now + self.config.created_at_future_limit {
            return reject(Reject::Invalid("created_at is too far in the future".to_string()));
        }
        if event.created_at < now - self.config.created_at_past_limit {
            return reject(Reject::Invalid("created_at is too far in the past".to_string()));
        }
        if event.expiration().is_some_and(|exp| exp <= now) {
            return reject(Reject::Invalid("expired".to_string()));
        }

        if self.config.owner_only && self.config.owner_pubkey.as_deref() != Some(&event.pubkey) {
            return reject(Reject::Restricted("only owner can publish".to_string()));
        }
        if self.config.min_pow > 0 && event.pow_bits() < u32::from(self.config.min_pow) {
            return reject(Reject::Pow(format!(
                "difficulty {} is below the required {}",
                event.pow_bits(),
                self.config.min_pow
            )));
        }
        if let Err(detail) = nip26::check(&event) {
            return reject(Reject::Invalid(detail));
        }
        if event.kind == KIND_AUTH {
            return reject(Reject::Invalid("auth events belong in an AUTH frame".to_string()));
        }

        event.received_at = now;
        debug!("accepting event {} kind {} from {}", event.id, event.kind, event.pubkey);

        if event::is_ephemeral(event.kind) {
            // Broadcast only, never stored.
            self.hub.publish(&event).await;
            return IngestOutcome::Accepted { id };
        }

        let _lease = self.write_lease.lock().await;

        if event.kind == KIND_DELETION {
            let targets = event.referenced_event_ids();
            match self.store.delete_by_author(&event.pubkey, &targets).await {
                Ok(removed) => {
                    info!("deletion by {} removed {} of {} referenced events",
                        event.pubkey, removed, targets.len());
                }
                Err(e) => {
                    error!("deletion failed: {e}");
                    return IngestOutcome::Rejected {
                        id,
                        reason: Reject::Error("storage".to_string()),
                    };
                }
            }
        }

        match self.store.put(&event).await {
            Ok(PutOutcome::Stored) => {
                self.hub.publish(&event).await;
                IngestOutcome::Accepted { id }
            }
            Ok(PutOutcome::Duplicate) => IngestOutcome::Duplicate { id },
            Ok(PutOutcome::Stale) => IngestOutcome::Rejected {
                id,
                reason: Reject::Duplicate("have a newer version of this event".to_string()),
            },
            Err(e) => {
                error!("event insert failed: {e}");
                IngestOutcome::Rejected {
                    id,
                    reason: Reject::Error("storage".to_string()),
                }
            }
        }
    }
}
