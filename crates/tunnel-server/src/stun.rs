//! NAT discovery responder
//!
//! Clients send a 48 byte request starting with the magic `26262` (u16 BE)
//! and get back their public IPv4 address and port in a 40 byte reply.
//! The reply starts from a per-process random template with the magic
//! re-embedded at `[6..8]`; the address octets go to `[0..4]`, the port
//! (BE) to `[4..6]`, and those six bytes are XORed with `0x20`.
//!
//! Replies are sent from spawned tasks so a slow send never stalls the
//! receive loop; at most [`MAX_PENDING_REPLIES`] are in flight per responder.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::metrics::{ServerMetrics, Service};
use crate::packet::is_valid_endpoint;
use crate::rate_limit::RateLimiter;
use crate::server::shutdown_requested;
use crate::tunnel::TunnelError;

pub const REQUEST_SIZE: usize = 48;
pub const RESPONSE_SIZE: usize = 40;
pub const MAGIC: u16 = 26262;
const XOR_MASK: u8 = 0x20;

pub const MAX_REQUESTS_GLOBAL: usize = 5000;
pub const MAX_REQUESTS_PER_IP: u32 = 20;
pub const RESET_INTERVAL: Duration = Duration::from_secs(60);
/// Replies awaiting send before new requests are dropped
pub const MAX_PENDING_REPLIES: usize = 256;

/// Reply template shared by every responder in the process
pub type ResponseTemplate = [u8; RESPONSE_SIZE];

/// Random reply template with the magic at `[6..8]`
pub fn random_template() -> ResponseTemplate {
    let mut template = [0u8; RESPONSE_SIZE];
    rand::thread_rng().fill_bytes(&mut template);
    template[6..8].copy_from_slice(&MAGIC.to_be_bytes());
    template
}

pub struct NatDiscoveryResponder {
    addr: SocketAddr,
    template: ResponseTemplate,
    limiter: RateLimiter,
    metrics: Arc<ServerMetrics>,
}

impl NatDiscoveryResponder {
    pub fn new(addr: SocketAddr, template: ResponseTemplate, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            addr,
            template,
            limiter: RateLimiter::new(MAX_REQUESTS_GLOBAL, MAX_REQUESTS_PER_IP),
            metrics,
        }
    }

    /// Build the reply for one request, or `None` if it must be dropped
    pub fn respond(&self, datagram: &[u8], from: SocketAddr) -> Option<ResponseTemplate> {
        if datagram.len() != REQUEST_SIZE {
            return None;
        }
        if u16::from_be_bytes([datagram[0], datagram[1]]) != MAGIC {
            return None;
        }
        if !is_valid_endpoint(from) {
            return None;
        }
        let IpAddr::V4(ip) = from.ip().to_canonical() else {
            return None;
        };
        if !self.limiter.allow(from.ip()) {
            return None;
        }

        let mut reply = self.template;
        reply[0..4].copy_from_slice(&ip.octets());
        reply[4..6].copy_from_slice(&from.port().to_be_bytes());
        for byte in &mut reply[0..6] {
            *byte ^= XOR_MASK;
        }
        Some(reply)
    }

    /// Start a new rate limiting window
    pub fn reset(&self) {
        self.limiter.reset();
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<(), TunnelError> {
        let addr = self.addr;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TunnelError::Bind { addr, source })?;
        self.serve(socket, shutdown).await
    }

    /// Answer requests on `socket` until shutdown, resetting the limiter on
    /// its own fixed interval.
    pub async fn serve(
        self: Arc<Self>,
        socket: UdpSocket,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        let socket = Arc::new(socket);
        let permits = Arc::new(Semaphore::new(MAX_PENDING_REPLIES));
        let mut buf = [0u8; REQUEST_SIZE + 1];
        let mut reset = tokio::time::interval(RESET_INTERVAL);
        reset.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(addr = %socket.local_addr()?, "NAT discovery responder listening");

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = reset.tick() => {
                    self.reset();
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            debug!(error = %e, "NAT discovery receive failed");
                            continue;
                        }
                    };
                    self.metrics.record_received(Service::Stun);

                    let Some(reply) = self.respond(&buf[..len], from) else {
                        trace!(%from, len, "NAT discovery request dropped");
                        self.metrics.record_drop(Service::Stun, "rejected");
                        continue;
                    };
                    let Ok(permit) = permits.clone().try_acquire_owned() else {
                        debug!(%from, "NAT discovery reply limit reached, dropping request");
                        self.metrics.record_drop(Service::Stun, "saturated");
                        continue;
                    };

                    let socket = socket.clone();
                    let metrics = self.metrics.clone();
                    tokio::spawn(async move {
                        match socket.send_to(&reply, from).await {
                            Ok(_) => metrics.record_reply(Service::Stun),
                            Err(e) => debug!(%from, error = %e, "NAT discovery reply failed"),
                        }
                        drop(permit);
                    });
                }
            }
        }

        info!(port = self.addr.port(), "NAT discovery responder stopped");
        Ok(())
    }
}
