//! WebSocket endpoint for voice devices

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade, ws::WebSocket},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::{ApiState, SessionGuard};
use crate::relay::{DeviceRelay, pump_inbound};
use crate::session::Session;

/// Header a device may use instead of the query parameter
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// Inbound microphone frames buffered ahead of the session
const INBOUND_CAPACITY: usize = 64;

/// Optional query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
struct WsQuery {
    device_id: Option<String>,
}

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Pick the device id from the query, then the header, else generate one
#[must_use]
pub fn resolve_device_id(query: Option<&str>, headers: &HeaderMap) -> String {
    query
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .or_else(|| {
            headers
                .get(DEVICE_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
        })
        .unwrap_or_else(|| format!("anon-{}", uuid::Uuid::new_v4()))
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let device_id = resolve_device_id(query.device_id.as_deref(), &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, device_id))
}

/// Run one device session over an upgraded socket
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>, device_id: String) {
    let _guard = SessionGuard::new(&state.sessions);
    tracing::info!(device_id = %device_id, "device connected");

    let (sink, stream) = socket.split();
    let relay = Arc::new(DeviceRelay::new(device_id.clone(), Box::new(sink)));

    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    let pump = tokio::spawn(pump_inbound(stream, tx));

    let device = state.devices.get(&device_id).await;

    match Session::new(&state.services, device, Arc::clone(&relay)) {
        Ok(session) => {
            if let Err(e) = session.run(rx).await {
                tracing::warn!(device_id = %device_id, error = %e, "session ended with error");
            }
        }
        Err(e) => {
            tracing::error!(device_id = %device_id, error = %e, "failed to build session");
            relay.close().await;
        }
    }

    pump.abort();
    tracing::info!(device_id = %device_id, "device disconnected");
}
