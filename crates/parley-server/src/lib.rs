pub mod auth;
pub mod config;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use parley_gateway::Gateway;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub jwt_secret: Arc<str>,
    pub internal_key: Option<Arc<str>>,
    pub heartbeat: Duration,
}

impl AppState {
    pub fn new(gateway: Gateway, config: &Config) -> Self {
        Self {
            gateway,
            jwt_secret: config.jwt_secret.as_str().into(),
            internal_key: config.internal_key.as_deref().map(Into::into),
            heartbeat: config.heartbeat,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/dm/{dm_id}", get(routes::dm_upgrade))
        .route(
            "/ws/chatroom/{chatroom_id}/{channel_id}",
            get(routes::chatroom_upgrade),
        )
        .route("/ws/notifications", get(routes::notifications_upgrade))
        .route("/ws/activity", get(routes::activity_upgrade))
        .route("/internal/events", post(routes::post_event))
        .route("/health", get(routes::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
