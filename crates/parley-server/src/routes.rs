use axum::{
    Json,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{info, warn};

use parley_gateway::{GatewayError, connection};
use parley_types::api::{DomainEvent, EventAccepted};
use parley_types::models::Route;

use crate::AppState;
use crate::auth::{has_internal_key, identify};

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

pub async fn dm_upgrade(
    State(state): State<AppState>,
    Path(dm_id): Path<i64>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, query, Route::DirectMessage { dm_id }, ws).await
}

pub async fn chatroom_upgrade(
    State(state): State<AppState>,
    Path((chatroom_id, channel_id)): Path<(i64, i64)>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let route = Route::Chatroom {
        chatroom_id,
        channel_id,
    };
    upgrade(state, query, route, ws).await
}

pub async fn notifications_upgrade(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, query, Route::Notifications, ws).await
}

pub async fn activity_upgrade(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, query, Route::Activity, ws).await
}

/// Authorize before accepting the upgrade, so a rejected client gets a
/// plain HTTP status and never sees a frame.
async fn upgrade(state: AppState, query: TokenQuery, route: Route, ws: WebSocketUpgrade) -> Response {
    let identity = identify(&state.jwt_secret, query.token.as_deref());
    let grant = match state.gateway.authorize(&identity, route).await {
        Ok(grant) => grant,
        Err(e) => {
            if e.is_authorization_failure() {
                info!("Refused {:?}: {}", route, e);
            } else {
                warn!("Could not authorize {:?}: {}", route, e);
            }
            return status_for(&e).into_response();
        }
    };

    let gateway = state.gateway.clone();
    let heartbeat = state.heartbeat;
    ws.on_upgrade(move |socket| async move {
        let (session, outbound) = gateway.open_session(grant).await;
        connection::serve(socket, session, outbound, heartbeat).await;
    })
}

fn status_for(e: &GatewayError) -> StatusCode {
    match e {
        GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
        GatewayError::Forbidden => StatusCode::FORBIDDEN,
        GatewayError::ContextNotFound => StatusCode::NOT_FOUND,
        GatewayError::MalformedFrame(_) => StatusCode::BAD_REQUEST,
        GatewayError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Persistence(_) | GatewayError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Domain events from the rest of the system (friend requests,
/// invitations, join requests, direct messages).
pub async fn post_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<DomainEvent>,
) -> Result<Json<EventAccepted>, StatusCode> {
    let Some(key) = state.internal_key.as_deref() else {
        return Err(StatusCode::NOT_FOUND);
    };
    if !has_internal_key(&headers, key) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let view = state
        .gateway
        .notifier()
        .handle_event(event)
        .await
        .map_err(|e| {
            warn!("Domain event rejected: {}", e);
            status_for(&e)
        })?;

    Ok(Json(EventAccepted {
        notification_id: view.id,
        is_read: view.is_read,
    }))
}

pub async fn health() -> &'static str {
    "ok"
}
