//! Tunnel engines
//!
//! A [`Tunnel`] owns one UDP socket and one receive loop. Everything that
//! differs between protocol versions (header layout, admission policy,
//! eviction cleanup) lives behind the [`Protocol`] trait; the receive loop,
//! ping handling, endpoint screening and forwarding are shared.

pub mod v2;
pub mod v3;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::announce::Announcement;
use crate::config::ServerConfig;
use crate::metrics::{ServerMetrics, Service};
use crate::packet::{
    is_valid_endpoint, same_endpoint, PacketHeader, PING_REQUEST_SIZE, PING_RESPONSE_SIZE,
};
use crate::rate_limit::{ConnectionCounter, RateLimiter};
use crate::registry::{ClientRegistry, TunnelClient};
use crate::server::shutdown_requested;

pub use v2::V2;
pub use v3::V3;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-tunnel settings derived from [`ServerConfig`]
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub name: String,
    pub bind_addr: SocketAddr,
    pub max_clients: usize,
    pub ip_limit: u32,
    pub client_timeout: Duration,
    pub max_packet_size: usize,
    pub max_pings_global: usize,
    pub max_pings_per_ip: u32,
    pub max_in_flight: usize,
}

impl TunnelSettings {
    pub fn v3(config: &ServerConfig) -> Self {
        Self::with_addr(config, config.tunnel_addr())
    }

    pub fn v2(config: &ServerConfig) -> Self {
        Self::with_addr(config, config.tunnel_v2_addr())
    }

    fn with_addr(config: &ServerConfig, bind_addr: SocketAddr) -> Self {
        Self {
            name: config.name.clone(),
            bind_addr,
            max_clients: config.max_clients,
            ip_limit: config.ip_limit,
            client_timeout: config.client_timeout(),
            max_packet_size: config.max_packet_size,
            max_pings_global: config.max_pings_global,
            max_pings_per_ip: config.max_pings_per_ip,
            max_in_flight: config.max_in_flight,
        }
    }
}

/// Why a datagram was not answered or forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Size,
    Saturated,
    Malformed,
    InvalidEndpoint,
    SelfAddressed,
    InvalidPing,
    PingRateLimited,
    Command,
    ReservedSender,
    UnknownSender,
    AdmissionDenied,
    EndpointMismatch,
    NoRoute,
    Loopback,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Size => "size",
            DropReason::Saturated => "saturated",
            DropReason::Malformed => "malformed",
            DropReason::InvalidEndpoint => "invalid_endpoint",
            DropReason::SelfAddressed => "self_addressed",
            DropReason::InvalidPing => "invalid_ping",
            DropReason::PingRateLimited => "ping_rate_limited",
            DropReason::Command => "command",
            DropReason::ReservedSender => "reserved_sender",
            DropReason::UnknownSender => "unknown_sender",
            DropReason::AdmissionDenied => "admission_denied",
            DropReason::EndpointMismatch => "endpoint_mismatch",
            DropReason::NoRoute => "no_route",
            DropReason::Loopback => "loopback",
        }
    }
}

/// Outcome of handling one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Answer the sender directly (ping echo)
    Reply { to: SocketAddr, payload: Bytes },
    /// Relay the datagram unmodified
    Forward { to: SocketAddr, payload: Bytes },
    Drop(DropReason),
}

/// Mutable state shared by the receive loop, handlers, heartbeat and HTTP
pub struct TunnelState {
    pub registry: ClientRegistry,
    pub connections: ConnectionCounter,
    pub ping_limiter: RateLimiter,
    pub metrics: Arc<ServerMetrics>,
    service: Service,
    maintenance: AtomicBool,
}

impl TunnelState {
    pub fn new(service: Service, settings: &TunnelSettings, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            registry: ClientRegistry::new(settings.max_clients, settings.client_timeout),
            connections: ConnectionCounter::new(settings.ip_limit),
            ping_limiter: RateLimiter::new(settings.max_pings_global, settings.max_pings_per_ip),
            metrics,
            service,
            maintenance: AtomicBool::new(false),
        }
    }

    pub fn service(&self) -> Service {
        self.service
    }

    pub fn maintenance(&self) -> bool {
        self.maintenance.load(Ordering::Acquire)
    }

    pub fn set_maintenance(&self, enabled: bool) {
        self.maintenance.store(enabled, Ordering::Release);
        self.metrics.set_maintenance(self.service, enabled);
    }

    /// Flip maintenance mode, returning the new state
    pub fn toggle_maintenance(&self) -> bool {
        let enabled = !self.maintenance.fetch_xor(true, Ordering::AcqRel);
        self.metrics.set_maintenance(self.service, enabled);
        enabled
    }
}

/// Version-specific behavior of a tunnel
pub trait Protocol: Send + Sync + 'static {
    /// Version number reported to the master server
    const VERSION: u8;
    const SERVICE: Service;
    /// Shortest datagram worth decoding
    const MIN_PACKET_SIZE: usize;

    fn decode_header(datagram: &[u8]) -> Option<PacketHeader>;

    /// Decide what to do with one decoded datagram
    fn handle(
        &self,
        state: &TunnelState,
        header: PacketHeader,
        datagram: &Bytes,
        from: SocketAddr,
        now: Instant,
    ) -> Verdict;

    /// Called for every client removed by a sweep. Runs while the registry
    /// shard is locked, so it must not touch the registry.
    fn on_evict(&self, _state: &TunnelState, _id: u32, _client: &TunnelClient) {}

    /// Called once per heartbeat after the sweep
    fn on_sweep(&self, _state: &TunnelState) {}
}

/// Checks shared by every version, run once the header is decoded
pub(crate) fn screen(header: &PacketHeader, from: SocketAddr) -> Result<(), DropReason> {
    if header.is_self_addressed() {
        return Err(DropReason::SelfAddressed);
    }
    if !is_valid_endpoint(from) {
        return Err(DropReason::InvalidEndpoint);
    }
    Ok(())
}

/// Echo the first bytes of a well-formed ping, subject to the ping limiter
pub(crate) fn answer_ping(state: &TunnelState, datagram: &Bytes, from: SocketAddr) -> Verdict {
    if datagram.len() != PING_REQUEST_SIZE {
        return Verdict::Drop(DropReason::InvalidPing);
    }
    if !state.ping_limiter.allow(from.ip()) {
        return Verdict::Drop(DropReason::PingRateLimited);
    }
    Verdict::Reply {
        to: from,
        payload: datagram.slice(..PING_RESPONSE_SIZE),
    }
}

/// Forward the whole datagram to the receiver's bound endpoint
pub(crate) fn route(
    state: &TunnelState,
    receiver_id: u32,
    from: SocketAddr,
    datagram: &Bytes,
) -> Verdict {
    match state.registry.get(receiver_id).and_then(|client| client.endpoint) {
        None => Verdict::Drop(DropReason::NoRoute),
        Some(to) if same_endpoint(to, from) => Verdict::Drop(DropReason::Loopback),
        Some(to) => Verdict::Forward {
            to,
            payload: datagram.clone(),
        },
    }
}

/// A tunnel engine for one protocol version
pub struct Tunnel<P: Protocol> {
    protocol: P,
    state: TunnelState,
    settings: TunnelSettings,
}

impl<P: Protocol> Tunnel<P> {
    pub fn new(protocol: P, settings: TunnelSettings, metrics: Arc<ServerMetrics>) -> Self {
        let state = TunnelState::new(P::SERVICE, &settings, metrics);
        Self {
            protocol,
            state,
            settings,
        }
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn state(&self) -> &TunnelState {
        &self.state
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    /// Decode and handle one datagram without touching the socket
    pub fn process(&self, datagram: &Bytes, from: SocketAddr, now: Instant) -> Verdict {
        let Some(header) = P::decode_header(datagram) else {
            return Verdict::Drop(DropReason::Malformed);
        };
        self.protocol.handle(&self.state, header, datagram, from, now)
    }

    /// Evict timed-out clients and open a new rate limiting window.
    /// Returns the number of evicted clients.
    pub fn sweep(&self, now: Instant) -> usize {
        let evicted = self.state.registry.sweep_expired(now, |id, client| {
            self.protocol.on_evict(&self.state, id, client)
        });
        self.state.ping_limiter.reset();
        self.protocol.on_sweep(&self.state);

        self.state.metrics.record_evictions(P::SERVICE, evicted);
        self.state
            .metrics
            .set_live_clients(P::SERVICE, self.state.registry.len());
        evicted
    }

    /// Snapshot reported to the master server
    pub fn announcement(&self) -> Announcement {
        Announcement {
            version: P::VERSION,
            name: self.settings.name.clone(),
            port: self.settings.bind_addr.port(),
            clients: self.state.registry.len(),
            max_clients: self.settings.max_clients,
            maintenance: self.state.maintenance(),
        }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<(), TunnelError> {
        let addr = self.settings.bind_addr;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TunnelError::Bind { addr, source })?;
        self.serve(Arc::new(socket), shutdown).await
    }

    /// Receive loop on an already bound socket.
    ///
    /// Each accepted datagram is handled on its own task. At most
    /// `max_in_flight` handlers run at once; datagrams arriving while every
    /// permit is taken are dropped so the loop never blocks.
    pub async fn serve(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        let max_packet_size = self.settings.max_packet_size;
        let permits = Arc::new(Semaphore::new(self.settings.max_in_flight));
        let mut buf = vec![0u8; max_packet_size.saturating_add(1)];

        info!(
            version = P::VERSION,
            addr = %socket.local_addr()?,
            max_clients = self.settings.max_clients,
            "tunnel listening"
        );

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                received = socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            debug!(version = P::VERSION, error = %e, "receive failed");
                            continue;
                        }
                    };
                    self.state.metrics.record_received(P::SERVICE);

                    if len < P::MIN_PACKET_SIZE || len > max_packet_size {
                        trace!(%from, len, "datagram size out of range");
                        self.state.metrics.record_drop(P::SERVICE, DropReason::Size.as_str());
                        continue;
                    }

                    let Ok(permit) = permits.clone().try_acquire_owned() else {
                        debug!(%from, "handler limit reached, dropping datagram");
                        self.state.metrics.record_drop(P::SERVICE, DropReason::Saturated.as_str());
                        continue;
                    };

                    let datagram = Bytes::copy_from_slice(&buf[..len]);
                    let tunnel = self.clone();
                    let socket = socket.clone();
                    tokio::spawn(async move {
                        tunnel.dispatch(&socket, datagram, from).await;
                        drop(permit);
                    });
                }
            }
        }

        info!(version = P::VERSION, "tunnel stopped");
        Ok(())
    }

    async fn dispatch(&self, socket: &UdpSocket, datagram: Bytes, from: SocketAddr) {
        trace!(%from, payload = %hex::encode(&datagram), "datagram");

        match self.process(&datagram, from, Instant::now()) {
            Verdict::Reply { to, payload } => match socket.send_to(&payload, to).await {
                Ok(_) => self.state.metrics.record_reply(P::SERVICE),
                Err(e) => debug!(%to, error = %e, "reply failed"),
            },
            Verdict::Forward { to, payload } => match socket.send_to(&payload, to).await {
                Ok(sent) => self.state.metrics.record_forward(P::SERVICE, sent),
                Err(e) => debug!(%to, error = %e, "forward failed"),
            },
            Verdict::Drop(reason) => {
                trace!(%from, reason = reason.as_str(), "datagram dropped");
                self.state.metrics.record_drop(P::SERVICE, reason.as_str());
            }
        }
    }
}
