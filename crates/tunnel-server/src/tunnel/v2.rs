//! V2 tunnel: 16-bit ids reserved through the lobby HTTP endpoint

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{answer_ping, route, screen, DropReason, Protocol, TunnelState, Verdict};
use crate::metrics::Service;
use crate::packet::{decode_v2, PacketHeader, V2_ID_SIZE};
use crate::rate_limit::RateLimiter;
use crate::registry::BindOutcome;

/// Distinct addresses allowed to call the HTTP endpoints per heartbeat
pub const MAX_REQUESTS_GLOBAL: usize = 1000;

pub struct V2 {
    /// HTTP request limiter, cleared on every heartbeat
    pub request_limiter: RateLimiter,
    maintenance_password: Option<String>,
}

impl V2 {
    pub fn new(ip_limit: u32, maintenance_password: Option<&str>) -> Self {
        Self {
            request_limiter: RateLimiter::new(MAX_REQUESTS_GLOBAL, ip_limit),
            maintenance_password: maintenance_password
                .filter(|password| !password.is_empty())
                .map(str::to_string),
        }
    }

    /// True only when a password is configured and `candidate` equals it
    pub fn check_maintenance_password(&self, candidate: &str) -> bool {
        self.maintenance_password
            .as_deref()
            .map_or(false, |password| password == candidate)
    }
}

impl Protocol for V2 {
    const VERSION: u8 = 2;
    const SERVICE: Service = Service::V2;
    const MIN_PACKET_SIZE: usize = V2_ID_SIZE * 2;

    fn decode_header(datagram: &[u8]) -> Option<PacketHeader> {
        decode_v2(datagram)
    }

    fn handle(
        &self,
        state: &TunnelState,
        header: PacketHeader,
        datagram: &Bytes,
        from: SocketAddr,
        now: Instant,
    ) -> Verdict {
        if let Err(reason) = screen(&header, from) {
            return Verdict::Drop(reason);
        }
        if header.sender_id == 0 {
            if header.receiver_id == 0 {
                return answer_ping(state, datagram, from);
            }
            return Verdict::Drop(DropReason::ReservedSender);
        }

        match state.registry.bind_or_touch(header.sender_id, from, now) {
            BindOutcome::Bound(_) => {
                info!(id = header.sender_id, %from, "reserved client bound");
                state.metrics.record_admission(Self::SERVICE);
            }
            BindOutcome::Touched(_) => {}
            BindOutcome::Mismatch(bound) => {
                debug!(id = header.sender_id, %from, %bound, "sender endpoint does not match reservation");
                return Verdict::Drop(DropReason::EndpointMismatch);
            }
            BindOutcome::Unknown => return Verdict::Drop(DropReason::UnknownSender),
        }

        route(state, header.receiver_id, from, datagram)
    }

    fn on_sweep(&self, _state: &TunnelState) {
        self.request_limiter.reset();
    }
}
