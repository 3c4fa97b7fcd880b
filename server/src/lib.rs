//! Tether Server - change log server for offline-first record sync.
//!
//! Clients push their local changes and pull everyone else's through a
//! per-store, timestamp-ordered change log. Sessions arrive over WebSocket
//! (`/ws`) or in process via [`SyncServer::connect_local`]; each message is
//! dispatched through a [`HandlerTable`] that applications can extend.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod persistence;
pub mod routes;
pub mod server;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, Utc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use crate::config::{Config, ConfigError, Persistence};
pub use crate::error::{AppError, Result};
pub use crate::handlers::{Context, Handler, HandlerTable};
pub use crate::persistence::{ChangeLog, CouchDbChangeLog, MemoryChangeLog, PostgresChangeLog};
pub use crate::server::{Session, SyncServer};
pub use crate::websocket::ConnectionManager;

/// Application state shared across HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub server: Arc<SyncServer>,
    pub config: Arc<Config>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(server: Arc<SyncServer>, config: Config) -> Self {
        Self {
            server,
            config: Arc::new(config),
            started_at: Utc::now(),
        }
    }
}

/// Build the HTTP router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
