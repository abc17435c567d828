//! V2 lobby HTTP endpoints
//!
//! Served over TCP on the V2 tunnel port:
//! - `GET /status` - free and used slot counts
//! - `GET /request?clients=N` - reserve N client ids for a new lobby
//! - `GET /maintenance[/{password}]` - enable maintenance mode

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::server::shutdown_requested;
use crate::tunnel::{Tunnel, V2};

pub const MIN_GAME_CLIENTS: usize = 2;
pub const MAX_GAME_CLIENTS: usize = 8;

#[derive(Debug, Deserialize)]
pub struct LobbyRequest {
    clients: Option<String>,
}

/// HTTP front end of the V2 tunnel
pub struct LobbyApi {
    tunnel: Arc<Tunnel<V2>>,
}

impl LobbyApi {
    pub fn new(tunnel: Arc<Tunnel<V2>>) -> Self {
        Self { tunnel }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/status", get(status))
            .route("/request", get(request))
            .route("/maintenance", get(maintenance))
            .route("/maintenance/:password", get(maintenance_with_password))
            .with_state(self.tunnel.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve on the V2 port until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.tunnel.settings().bind_addr;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "V2 lobby HTTP listening");

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
        .await?;

        Ok(())
    }
}

type LobbyState = State<Arc<Tunnel<V2>>>;

fn allowed(tunnel: &Tunnel<V2>, peer: SocketAddr) -> bool {
    tunnel.protocol().request_limiter.allow(peer.ip())
}

async fn status(State(tunnel): LobbyState, ConnectInfo(peer): ConnectInfo<SocketAddr>) -> Response {
    if !allowed(&tunnel, peer) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let used = tunnel.state().registry.len();
    let free = tunnel.settings().max_clients.saturating_sub(used);
    format!("{} slots free.\n{} slots in use.\n", free, used).into_response()
}

async fn request(
    State(tunnel): LobbyState,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<LobbyRequest>,
) -> Response {
    if tunnel.state().maintenance() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let clients = params
        .clients
        .as_deref()
        .and_then(|clients| clients.trim().parse::<usize>().ok())
        .filter(|clients| (MIN_GAME_CLIENTS..=MAX_GAME_CLIENTS).contains(clients));
    let Some(clients) = clients else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let ids = tunnel.state().registry.reserve(clients, Instant::now());
    if ids.len() < MIN_GAME_CLIENTS {
        info!(%peer, clients, "lobby refused, tunnel full");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let body = format!(
        "[{}]",
        ids.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
    );
    info!(host = %peer, clients, ids = %body, "new V2 lobby");
    body.into_response()
}

async fn maintenance(State(tunnel): LobbyState, ConnectInfo(peer): ConnectInfo<SocketAddr>) -> Response {
    enable_maintenance(&tunnel, peer, None)
}

async fn maintenance_with_password(
    State(tunnel): LobbyState,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(password): Path<String>,
) -> Response {
    enable_maintenance(&tunnel, peer, Some(&password))
}

fn enable_maintenance(tunnel: &Tunnel<V2>, peer: SocketAddr, password: Option<&str>) -> Response {
    if !allowed(tunnel, peer) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    match password {
        Some(password) if tunnel.protocol().check_maintenance_password(password) => {
            tunnel.state().set_maintenance(true);
            warn!(%peer, "maintenance mode enabled");
            StatusCode::OK.into_response()
        }
        _ => {
            warn!(%peer, "invalid maintenance mode request");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}
