//! Listening endpoint and lifecycle.
//!
//! [`start`] wires the relay task, the controller link and the HTTP listener
//! together; [`RunningRelay::stop`] takes them down in order: app sessions,
//! mock sessions, listener, controller link, relay task.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use cube_core::{RelayError, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::RelayConfig;
use crate::health::{health_check, HealthResponse};
use crate::link::{spawn_controller_link, LinkSettings};
use crate::relay::{spawn_relay, RelayHandle, EVENT_QUEUE};
use crate::router::Router;
use crate::session::Group;
use crate::websocket::{run_session, SessionSettings};

/// Per-group admission flags checked before upgrading a connection.
#[derive(Debug)]
pub struct AcceptGates {
    app: AtomicBool,
    mock: AtomicBool,
}

impl AcceptGates {
    pub fn new() -> Self {
        Self {
            app: AtomicBool::new(true),
            mock: AtomicBool::new(true),
        }
    }

    fn flag(&self, group: Group) -> &AtomicBool {
        match group {
            Group::App => &self.app,
            Group::Mock => &self.mock,
        }
    }

    pub fn is_open(&self, group: Group) -> bool {
        self.flag(group).load(Ordering::Acquire)
    }

    pub fn close(&self, group: Group) {
        self.flag(group).store(false, Ordering::Release);
    }
}

impl Default for AcceptGates {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state passed to Axum handlers.
#[derive(Clone)]
pub struct ServerState {
    pub relay: RelayHandle,
    pub gates: Arc<AcceptGates>,
    pub settings: SessionSettings,
    pub mock_path_prefix: Arc<str>,
    pub start_time: Instant,
}

impl ServerState {
    pub fn new(relay: RelayHandle, config: &RelayConfig) -> Self {
        Self {
            relay,
            gates: Arc::new(AcceptGates::new()),
            settings: SessionSettings::from_config(config),
            mock_path_prefix: Arc::from(config.mock_path_prefix.as_str()),
            start_time: Instant::now(),
        }
    }
}

/// `/health` plus a WebSocket upgrade on every other path.
pub fn build_router(state: ServerState) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health_handler))
        .fallback(upgrade_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn upgrade_handler(
    State(state): State<ServerState>,
    uri: Uri,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let group = Group::for_path(uri.path(), &state.mock_path_prefix);
    if !state.gates.is_open(group) {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let relay = state.relay.clone();
    let settings = state.settings.clone();
    ws.on_upgrade(move |socket| run_session(socket, group, relay, settings))
}

async fn health_handler(
    State(state): State<ServerState>,
) -> std::result::Result<Json<HealthResponse>, StatusCode> {
    match state.relay.status().await {
        Some(status) => Ok(Json(health_check(state.start_time, status))),
        None => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

/// Start the relay and begin accepting connections.
///
/// A bind failure stops everything already started and is returned as
/// [`RelayError::Bind`].
pub async fn start(config: RelayConfig) -> Result<RunningRelay> {
    config.validate()?;

    let (relay, relay_task) = spawn_relay(Router::new(), EVENT_QUEUE);
    let link_token = CancellationToken::new();
    let link_task = spawn_controller_link(
        LinkSettings::from_config(&config),
        relay.clone(),
        link_token.clone(),
    );

    let addr = config.listen_addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind listening endpoint");
            link_token.cancel();
            let _ = link_task.await;
            relay.shutdown().await;
            let _ = relay_task.await;
            return Err(RelayError::bind(addr, e));
        }
    };
    let local_addr = listener.local_addr()?;

    let state = ServerState::new(relay.clone(), &config);
    let gates = Arc::clone(&state.gates);
    let app = build_router(state);

    let serve_token = CancellationToken::new();
    let serve_task = tokio::spawn({
        let token = serve_token.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        }
    });

    info!(
        %local_addr,
        controller = %config.controller_url(),
        mock_prefix = %config.mock_path_prefix,
        "relay listening"
    );

    Ok(RunningRelay {
        local_addr,
        relay,
        gates,
        serve_token,
        serve_task: Some(serve_task),
        link_token,
        link_task,
        relay_task,
    })
}

/// Handle to a started relay. Dropping it leaves the tasks running; call
/// [`RunningRelay::stop`] for an ordered shutdown.
pub struct RunningRelay {
    local_addr: SocketAddr,
    relay: RelayHandle,
    gates: Arc<AcceptGates>,
    serve_token: CancellationToken,
    serve_task: Option<JoinHandle<std::io::Result<()>>>,
    link_token: CancellationToken,
    link_task: JoinHandle<()>,
    relay_task: JoinHandle<()>,
}

impl RunningRelay {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> RelayHandle {
        self.relay.clone()
    }

    /// Serve until `signal` resolves or the listener fails, then stop.
    pub async fn run_until<F>(mut self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Some(mut serve_task) = self.serve_task.take() else {
            return self.stop().await;
        };
        tokio::select! {
            _ = signal => {
                info!("shutdown requested");
                self.serve_task = Some(serve_task);
                self.stop().await
            }
            result = &mut serve_task => {
                error!("listening endpoint stopped unexpectedly");
                let stopped = self.stop().await;
                flatten_serve(result)?;
                stopped
            }
        }
    }

    /// Ordered shutdown. Each stage is awaited before the next begins.
    pub async fn stop(mut self) -> Result<()> {
        info!("stopping relay");

        self.gates.close(Group::App);
        let closed = self.relay.close_group(Group::App).await.unwrap_or(0);
        info!(closed, "app sessions closed");

        self.gates.close(Group::Mock);
        let closed = self.relay.close_group(Group::Mock).await.unwrap_or(0);
        info!(closed, "mock sessions closed");

        self.serve_token.cancel();
        let served = match self.serve_task.take() {
            Some(task) => flatten_serve(task.await),
            None => Ok(()),
        };
        info!("listening endpoint closed");

        self.link_token.cancel();
        if let Err(e) = (&mut self.link_task).await {
            warn!(error = %e, "controller link task failed");
        }

        self.relay.shutdown().await;
        if let Err(e) = (&mut self.relay_task).await {
            warn!(error = %e, "relay task failed");
        }

        info!("relay stopped");
        served
    }
}

fn flatten_serve(
    result: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(RelayError::Io(e)),
        Err(e) => Err(RelayError::Io(std::io::Error::other(e))),
    }
}
