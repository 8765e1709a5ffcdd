//! HTTP and WebSocket front door for devices

pub mod health;
pub mod websocket;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::device::DeviceConfigService;
use crate::session::SessionServices;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    /// Collaborators each device session is built from
    pub services: SessionServices,
    /// Per-device configuration lookups
    pub devices: DeviceConfigService,
    /// Number of live device sessions
    pub sessions: Arc<AtomicUsize>,
}

impl ApiState {
    /// Create state with no active sessions
    #[must_use]
    pub fn new(services: SessionServices, devices: DeviceConfigService) -> Self {
        Self {
            services,
            devices,
            sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of live device sessions
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }
}

/// Counts a session as active for as long as it is held
pub struct SessionGuard {
    sessions: Arc<AtomicUsize>,
}

impl SessionGuard {
    /// Register a new active session
    #[must_use]
    pub fn new(sessions: &Arc<AtomicUsize>) -> Self {
        sessions.fetch_add(1, Ordering::Relaxed);
        Self {
            sessions: Arc::clone(sessions),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Build the router with all routes
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(health::router(Arc::clone(&state)))
        .merge(websocket::router(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    host: String,
    port: u16,
}

impl ApiServer {
    /// Create a server for the given state and listen address
    #[must_use]
    pub fn new(state: ApiState, host: impl Into<String>, port: u16) -> Self {
        Self {
            state: Arc::new(state),
            host: host.into(),
            port,
        }
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(address = %addr, "API server listening");

        axum::serve(listener, router(self.state))
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }
}
