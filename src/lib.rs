//! A personal Nostr relay: WebSocket protocol handler, subscription
//! matcher, SQLite event store and broadcast fan-out, with a small HTTP
//! info surface on the same listener.

pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod hub;
pub mod info;
pub mod ingest;
pub mod nip26;
pub mod protocol;
pub mod rate_limit;
pub mod session;
pub mod store;
pub mod subscription;

#[cfg(test)]
pub(crate) mod testutil;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{Config, MAX_FRAME_BYTES};
use crate::error::{RelayError, Result};
use crate::hub::Hub;
use crate::info::{relay_info, RelayStats, SUPPORTED_NIPS};
use crate::ingest::Ingest;
use crate::store::Store;

pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub hub: Arc<Hub>,
    pub ingest: Ingest,
}

impl AppState {
    pub async fn init(config: Config) -> Result<Arc<AppState>> {
        let config = Arc::new(config);
        let store = Arc::new(Store::open(&config.data_dir).await?);
        let purged = store.purge_expired().await?;
        if purged > 0 {
            info!("purged {} expired events", purged);
        }
        let hub = Arc::new(Hub::new());
        let ingest = Ingest::new(store.clone(), hub.clone(), config.clone());
        Ok(Arc::new(AppState {
            config,
            store,
            hub,
            ingest,
        }))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/relay/info", get(info_handler))
        .route("/relay/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(RelayError::Bind)?;
    info!("listening on {}", addr);
    let app = router(state);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn root_handler(
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Some(ws) = ws {
        // Our own limit check answers oversize frames with a NOTICE, so
        // the transport limit sits above the advertised maximum.
        return ws
            .max_message_size(MAX_FRAME_BYTES * 4)
            .on_upgrade(move |socket| session::handle_socket(socket, state))
            .into_response();
    }

    let wants_nostr_json = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/nostr+json"));
    if wants_nostr_json {
        return Json(relay_info(&state.config)).into_response();
    }

    format!("{}: a personal Nostr relay\n", state.config.relay_name).into_response()
}

async fn info_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(relay_info(&state.config)).into_response()
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    let total_events = match state.store.total_events().await {
        Ok(n) => n,
        Err(e) => {
            tracing::error!("stats query failed: {e}");
            return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response();
        }
    };
    Json(RelayStats {
        connected_clients: state.hub.connected().await,
        total_events,
        supported_nips: SUPPORTED_NIPS.to_vec(),
        owner_only: state.config.owner_only,
        relay_name: state.config.relay_name.clone(),
    })
    .into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "clients": state.hub.connected().await,
    }))
    .into_response()
}
