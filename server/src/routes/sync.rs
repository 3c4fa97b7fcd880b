//! Sync endpoint routes.

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tether_engine::{Change, Timestamp};

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::websocket::handle_websocket_connection;
use crate::AppState;

/// Query of `GET /stores/{store}/changes`.
#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    pub since: Option<Timestamp>,
}

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/stores/{store}/changes", get(changes_handler))
}

/// GET /ws - Upgrade to a sync session.
async fn ws_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    ws: WebSocketUpgrade,
) -> Response {
    let server = state.server.clone();
    ws.on_upgrade(move |socket| handle_websocket_connection(socket, server))
}

/// GET /stores/{store}/changes - Read a store's changes after `since`.
async fn changes_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(store): Path<String>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<Vec<Change>>> {
    let changes = state.server.log().get_changes(&store, query.since).await?;
    Ok(Json(changes))
}
