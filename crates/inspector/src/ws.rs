//! Read-only dashboard: status snapshot, recent outcomes and a live WebSocket feed.

use crate::feed::LiveFeed;
use crate::status::{DEFAULT_RECENT_LIMIT, RECENT_CAPACITY, ServiceStatus};
use axum::{
    Json, Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use schema::InspectionOutcome;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct DashboardState {
    pub status: ServiceStatus,
    pub feed: LiveFeed,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    limit: Option<usize>,
}

pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/recent", get(recent_handler))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server(
    addr: SocketAddr,
    state: DashboardState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Dashboard listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.status.snapshot())
}

async fn recent_handler(
    State(state): State<DashboardState>,
    Query(query): Query<RecentQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .min(RECENT_CAPACITY);
    let recent: Vec<InspectionOutcome> = state
        .status
        .recent(limit)
        .iter()
        .map(|outcome| outcome.as_ref().clone())
        .collect();
    Json(recent)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<DashboardState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: DashboardState) {
    tracing::info!("Dashboard WebSocket connected");

    let mut rx = state.feed.subscribe();

    loop {
        let outcome: Arc<InspectionOutcome> = match rx.recv().await {
            Ok(outcome) => outcome,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Dashboard client lagging, outcomes skipped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let json = match serde_json::to_string(outcome.as_ref()) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("JSON serialization error: {}", e);
                continue;
            }
        };

        if socket.send(Message::Text(json)).await.is_err() {
            tracing::info!("Dashboard WebSocket disconnected");
            break;
        }
    }
}
