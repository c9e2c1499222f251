//! Webhook Router and out-of-core HTTP surface (§4.6, §4.8): the only
//! inbound network entry point into the sync daemon. Everything else —
//! uploads, downloads, reconciliation — runs entirely out of the Sync
//! Engine's own background loops.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use sync_core::{Bus, StoreGateway};
use sync_subscriptions::SubscriptionManager;

mod dedup;
mod health;
mod tasks;
mod webhook;

pub use dedup::DedupWindow;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StoreGateway>,
    pub bus: Arc<Bus>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub dedup: Arc<DedupWindow>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/webhook/planner", post(webhook::planner_webhook))
        .route("/webhook/chats", post(webhook::chat_webhook))
        .route("/health", get(health::health))
        .route("/tasks/{local_id}", get(tasks::get_task).put(tasks::put_task))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
