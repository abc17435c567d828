//! Tunnel server: wires the tunnels, responders and HTTP listeners together

use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::announce::{MasterAnnouncer, Reporter};
use crate::config::ServerConfig;
use crate::heartbeat::HeartbeatScheduler;
use crate::lobby::LobbyApi;
use crate::metrics::ServerMetrics;
use crate::stun::{self, NatDiscoveryResponder};
use crate::tunnel::{Tunnel, TunnelSettings, V2, V3};

/// Delay before a failed task is started again
pub const RESTART_DELAY: Duration = Duration::from_secs(1);
/// How long running tasks get to finish after shutdown is signalled
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct TunnelServer {
    config: ServerConfig,
    metrics: Arc<ServerMetrics>,
    shutdown_tx: watch::Sender<bool>,
}

impl TunnelServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(ServerMetrics::new()?);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            metrics,
            shutdown_tx,
        })
    }

    /// Start every enabled service and block until SIGINT, SIGTERM or
    /// [`TunnelServer::shutdown`].
    pub async fn run(&self) -> Result<()> {
        let config = &self.config;
        let mut tasks = JoinSet::new();

        let reporter: Option<Arc<dyn Reporter>> = if config.no_master_announce {
            None
        } else {
            let announcer = MasterAnnouncer::new(
                config.master_server_url.clone(),
                config.master_password.as_deref(),
                config.announce_ipv4_only,
            )
            .context("failed to create master server client")?;
            let announcer: Arc<dyn Reporter> = Arc::new(announcer);
            Some(announcer)
        };

        if config.tunnel_v3_enabled {
            let tunnel = Arc::new(Tunnel::new(
                V3::new(config.maintenance_password.as_deref()),
                TunnelSettings::v3(config),
                self.metrics.clone(),
            ));

            let engine = tunnel.clone();
            tasks.spawn(supervise("tunnel-v3", self.shutdown_tx.subscribe(), move |shutdown| {
                engine.clone().run(shutdown)
            }));
            tasks.spawn(
                HeartbeatScheduler::new(tunnel, reporter.clone(), config.announce_interval())
                    .run(self.shutdown_tx.subscribe()),
            );
        }

        if config.tunnel_v2_enabled {
            let tunnel = Arc::new(Tunnel::new(
                V2::new(config.ip_limit, config.maintenance_password.as_deref()),
                TunnelSettings::v2(config),
                self.metrics.clone(),
            ));

            let engine = tunnel.clone();
            tasks.spawn(supervise("tunnel-v2", self.shutdown_tx.subscribe(), move |shutdown| {
                engine.clone().run(shutdown)
            }));
            let lobby = tunnel.clone();
            tasks.spawn(supervise("lobby-http", self.shutdown_tx.subscribe(), move |shutdown| {
                LobbyApi::new(lobby.clone()).run(shutdown)
            }));
            tasks.spawn(
                HeartbeatScheduler::new(tunnel, reporter.clone(), config.announce_interval())
                    .run(self.shutdown_tx.subscribe()),
            );
        }

        if config.peer_to_peer_enabled() {
            let template = stun::random_template();
            for &port in &config.peer_to_peer_ports {
                let responder = Arc::new(NatDiscoveryResponder::new(
                    SocketAddr::new(config.bind_address, port),
                    template,
                    self.metrics.clone(),
                ));
                tasks.spawn(supervise("nat-discovery", self.shutdown_tx.subscribe(), move |shutdown| {
                    responder.clone().run(shutdown)
                }));
            }
        }

        if let Some(addr) = config.metrics_addr {
            let metrics = self.metrics.clone();
            tasks.spawn(supervise("metrics-http", self.shutdown_tx.subscribe(), move |shutdown| {
                serve_metrics(addr, metrics.clone(), shutdown)
            }));
        }

        info!(
            name = %config.name,
            v3 = config.tunnel_v3_enabled,
            v2 = config.tunnel_v2_enabled,
            nat_discovery = config.peer_to_peer_enabled(),
            "tunnel server started"
        );

        Self::shutdown_signal(self.shutdown_tx.subscribe()).await;
        self.shutdown();

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "shutdown grace period elapsed, aborting tasks");
            tasks.abort_all();
        }

        info!("tunnel server stopped");
        Ok(())
    }

    async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).ok()
        };

        tokio::select! {
            _ = async {
                #[cfg(unix)]
                {
                    match sigterm.as_mut() {
                        Some(sigterm) => {
                            sigterm.recv().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("Received SIGTERM, starting graceful shutdown");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, starting graceful shutdown");
            }
            _ = shutdown_requested(&mut shutdown) => {
                info!("Shutdown requested");
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Resolves once shutdown is signalled (immediately if it already was) or
/// the sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Run `task` until shutdown, starting it again [`RESTART_DELAY`] after it
/// fails or returns early.
pub async fn supervise<F, Fut, E>(name: &'static str, mut shutdown: watch::Receiver<bool>, mut task: F)
where
    F: FnMut(watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    loop {
        let result = task(shutdown.clone()).await;
        if *shutdown.borrow() {
            break;
        }

        match result {
            Ok(()) => warn!(task = name, "task exited early, restarting"),
            Err(e) => error!(task = name, error = %e, "task failed, restarting"),
        }

        tokio::select! {
            _ = tokio::time::sleep(RESTART_DELAY) => {}
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }
}

/// `/health` and `/metrics`
pub fn metrics_router(metrics: Arc<ServerMetrics>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

async fn serve_metrics(
    addr: SocketAddr,
    metrics: Arc<ServerMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", addr))?;
    info!(%addr, "HTTP server for health/metrics listening");

    axum::serve(listener, metrics_router(metrics))
        .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
        .await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(metrics): State<Arc<ServerMetrics>>) -> Response {
    match metrics.export() {
        Ok(body) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics export failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
