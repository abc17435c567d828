//! V3 tunnel: 32-bit ids, self-registering clients, maintenance command

use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{answer_ping, route, screen, DropReason, Protocol, TunnelState, Verdict};
use crate::metrics::Service;
use crate::packet::{
    decode_v3, same_endpoint, CommandPacket, PacketHeader, TunnelCommand, COMMAND_DIGEST_SIZE,
    COMMAND_PACKET_SIZE, COMMAND_RECEIVER_ID, V3_ID_SIZE,
};
use crate::registry::{Admission, AdmissionError, TunnelClient};

/// Minimum spacing between accepted maintenance command attempts
pub const COMMAND_RATE_LIMIT: Duration = Duration::from_secs(60);

pub struct V3 {
    maintenance_digest: Option<[u8; COMMAND_DIGEST_SIZE]>,
    last_command: Mutex<Instant>,
}

impl V3 {
    /// An empty password disables the command channel.
    pub fn new(maintenance_password: Option<&str>) -> Self {
        let maintenance_digest = maintenance_password
            .filter(|password| !password.is_empty())
            .map(|password| Sha1::digest(password.as_bytes()).into());

        Self {
            maintenance_digest,
            last_command: Mutex::new(Instant::now()),
        }
    }

    /// Run a command datagram addressed `0 -> 0xFFFFFFFF`.
    ///
    /// The cooldown advances for every attempt that reaches the digest
    /// check, whether or not the digest matches.
    fn execute_command(&self, state: &TunnelState, datagram: &[u8], from: SocketAddr, now: Instant) {
        let Some(command) = CommandPacket::parse(datagram) else {
            return;
        };

        let Some(expected) = self.maintenance_digest else {
            debug!(%from, "command channel disabled, no maintenance password");
            return;
        };

        {
            let mut last = self
                .last_command
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if now.saturating_duration_since(*last) < COMMAND_RATE_LIMIT {
                debug!(%from, "command ignored during cooldown");
                return;
            }
            *last = now;
        }

        if command.digest != expected {
            warn!(%from, "tunnel command with invalid maintenance password");
            return;
        }

        match TunnelCommand::try_from(command.code) {
            Ok(TunnelCommand::MaintenanceMode) => {
                let enabled = state.toggle_maintenance();
                warn!(%from, enabled, "maintenance mode toggled");
            }
            Err(code) => {
                warn!(%from, code, "unknown tunnel command");
            }
        }
    }

    /// Sender already registered: accept it from its bound endpoint, or move
    /// it when the old mapping has timed out.
    fn refresh(
        &self,
        state: &TunnelState,
        id: u32,
        existing: Option<TunnelClient>,
        from: SocketAddr,
        now: Instant,
    ) -> Result<(), DropReason> {
        let maintenance = state.maintenance();
        match state.registry.rebind(id, from, now, maintenance, &state.connections) {
            Ok(_) => {
                let moved = existing
                    .and_then(|client| client.endpoint)
                    .map_or(false, |previous| !same_endpoint(previous, from));
                if moved {
                    info!(id, %from, "client reconnected from new endpoint");
                }
                Ok(())
            }
            Err(AdmissionError::Live) => {
                debug!(id, %from, "sender endpoint does not match live client");
                Err(DropReason::EndpointMismatch)
            }
            Err(AdmissionError::NotFound) => Err(DropReason::UnknownSender),
            Err(reason) => {
                info!(id, %from, %reason, "reconnection refused");
                Err(DropReason::AdmissionDenied)
            }
        }
    }
}

impl Protocol for V3 {
    const VERSION: u8 = 3;
    const SERVICE: Service = Service::V3;
    const MIN_PACKET_SIZE: usize = V3_ID_SIZE * 2;

    fn decode_header(datagram: &[u8]) -> Option<PacketHeader> {
        decode_v3(datagram)
    }

    fn handle(
        &self,
        state: &TunnelState,
        header: PacketHeader,
        datagram: &Bytes,
        from: SocketAddr,
        now: Instant,
    ) -> Verdict {
        if header.sender_id == 0 {
            if header.receiver_id == COMMAND_RECEIVER_ID && datagram.len() >= COMMAND_PACKET_SIZE {
                self.execute_command(state, datagram, from, now);
                return Verdict::Drop(DropReason::Command);
            }
            if header.receiver_id != 0 {
                return Verdict::Drop(DropReason::ReservedSender);
            }
        }

        if let Err(reason) = screen(&header, from) {
            return Verdict::Drop(reason);
        }
        if header.is_ping() {
            return answer_ping(state, datagram, from);
        }

        let sender = header.sender_id;
        let result = match state.registry.get(sender) {
            Some(existing) => self.refresh(state, sender, Some(existing), from, now),
            None => match state.registry.try_admit(
                sender,
                from,
                now,
                state.maintenance(),
                &state.connections,
            ) {
                Admission::Admitted(_) => {
                    info!(id = sender, %from, clients = state.registry.len(), "client admitted");
                    state.metrics.record_admission(Self::SERVICE);
                    Ok(())
                }
                Admission::Exists => self.refresh(state, sender, None, from, now),
                Admission::Denied(reason) => {
                    info!(id = sender, %from, %reason, "admission refused");
                    Err(DropReason::AdmissionDenied)
                }
            },
        };

        match result {
            Ok(()) => route(state, header.receiver_id, from, datagram),
            Err(reason) => Verdict::Drop(reason),
        }
    }

    fn on_evict(&self, state: &TunnelState, id: u32, client: &TunnelClient) {
        if let Some(endpoint) = client.endpoint {
            state.connections.release(endpoint.ip());
        }
        info!(id, endpoint = ?client.endpoint, "client timed out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ServerMetrics;
    use crate::tunnel::tests::{addr, settings};
    use crate::tunnel::Tunnel;
    use std::sync::Arc;

    const PASSWORD: &str = "letmein";

    fn tunnel(password: Option<&str>) -> Tunnel<V3> {
        let metrics = Arc::new(ServerMetrics::new().unwrap());
        Tunnel::new(V3::new(password), settings(), metrics)
    }

    fn packet(sender: u32, receiver: u32, payload: &[u8]) -> Bytes {
        let mut datagram = Vec::with_capacity(8 + payload.len());
        datagram.extend_from_slice(&sender.to_le_bytes());
        datagram.extend_from_slice(&receiver.to_le_bytes());
        datagram.extend_from_slice(payload);
        Bytes::from(datagram)
    }

    fn command(code: u8, password: &str) -> Bytes {
        let mut body = vec![code];
        body.extend_from_slice(&Sha1::digest(password.as_bytes()));
        packet(0, COMMAND_RECEIVER_ID, &body)
    }

    #[test]
    fn test_forward_between_registered_clients() {
        let tunnel = tunnel(None);
        let a = addr("203.0.113.1:1000");
        let b = addr("198.51.100.2:2000");
        let now = Instant::now();

        // Receiver not registered yet: sender is admitted, nothing to route to
        assert_eq!(
            tunnel.process(&packet(5, 7, b"hello"), a, now),
            Verdict::Drop(DropReason::NoRoute)
        );

        let from_b = packet(7, 5, b"hi back");
        assert_eq!(
            tunnel.process(&from_b, b, now),
            Verdict::Forward { to: a, payload: from_b.clone() }
        );

        let from_a = packet(5, 7, b"hello again");
        assert_eq!(
            tunnel.process(&from_a, a, now),
            Verdict::Forward { to: b, payload: from_a.clone() }
        );
        assert_eq!(tunnel.state().registry.len(), 2);
    }

    #[test]
    fn test_ping_never_registers() {
        let tunnel = tunnel(None);
        let from = addr("203.0.113.1:1000");

        let ping = packet(0, 0, &[0xaa; 42]);
        assert!(matches!(
            tunnel.process(&ping, from, Instant::now()),
            Verdict::Reply { payload, .. } if payload.len() == 12
        ));

        let long_ping = packet(0, 0, &[0xaa; 43]);
        assert_eq!(
            tunnel.process(&long_ping, from, Instant::now()),
            Verdict::Drop(DropReason::InvalidPing)
        );
        assert!(tunnel.state().registry.is_empty());
    }

    #[test]
    fn test_sender_zero_to_other_receiver_dropped() {
        let tunnel = tunnel(None);
        assert_eq!(
            tunnel.process(&packet(0, 9, b"x"), addr("203.0.113.1:1000"), Instant::now()),
            Verdict::Drop(DropReason::ReservedSender)
        );
        // Short command datagram falls through to the same rule
        assert_eq!(
            tunnel.process(&packet(0, COMMAND_RECEIVER_ID, &[0]), addr("203.0.113.1:1000"), Instant::now()),
            Verdict::Drop(DropReason::ReservedSender)
        );
    }

    #[test]
    fn test_invalid_source_not_admitted() {
        let tunnel = tunnel(None);
        assert_eq!(
            tunnel.process(&packet(5, 7, b"x"), addr("127.0.0.1:1000"), Instant::now()),
            Verdict::Drop(DropReason::InvalidEndpoint)
        );
        assert_eq!(
            tunnel.process(&packet(5, 5, b"x"), addr("203.0.113.1:1000"), Instant::now()),
            Verdict::Drop(DropReason::SelfAddressed)
        );
        assert!(tunnel.state().registry.is_empty());
    }

    #[test]
    fn test_live_client_cannot_be_hijacked() {
        let tunnel = tunnel(None);
        let owner = addr("203.0.113.1:1000");
        let attacker = addr("198.51.100.66:4000");
        let start = Instant::now();

        tunnel.process(&packet(5, 7, b"x"), owner, start);
        assert_eq!(
            tunnel.process(&packet(5, 7, b"x"), attacker, start + Duration::from_secs(10)),
            Verdict::Drop(DropReason::EndpointMismatch)
        );
        assert_eq!(tunnel.state().registry.get(5).unwrap().endpoint, Some(owner));
    }

    #[test]
    fn test_timed_out_client_reconnects_from_new_ip() {
        let tunnel = tunnel(None);
        let old = addr("203.0.113.1:1000");
        let new = addr("198.51.100.2:3000");
        let start = Instant::now();
        let timeout = tunnel.settings().client_timeout;

        tunnel.process(&packet(5, 7, b"x"), old, start);
        tunnel.process(&packet(5, 7, b"x"), new, start + timeout);

        let state = tunnel.state();
        assert_eq!(state.registry.get(5).unwrap().endpoint, Some(new));
        assert_eq!(state.connections.count(old.ip()), 0);
        assert_eq!(state.connections.count(new.ip()), 1);
    }

    #[test]
    fn test_admission_limits() {
        let tunnel = tunnel(None);
        let now = Instant::now();

        // ip_limit is 2
        tunnel.process(&packet(1, 9, b"x"), addr("203.0.113.1:1"), now);
        tunnel.process(&packet(2, 9, b"x"), addr("203.0.113.1:2"), now);
        assert_eq!(
            tunnel.process(&packet(3, 9, b"x"), addr("203.0.113.1:3"), now),
            Verdict::Drop(DropReason::AdmissionDenied)
        );

        // max_clients is 4
        tunnel.process(&packet(3, 9, b"x"), addr("198.51.100.1:1"), now);
        tunnel.process(&packet(4, 9, b"x"), addr("198.51.100.1:2"), now);
        assert_eq!(
            tunnel.process(&packet(5, 9, b"x"), addr("192.0.2.1:1"), now),
            Verdict::Drop(DropReason::AdmissionDenied)
        );
        assert_eq!(tunnel.state().registry.len(), 4);
    }

    #[test]
    fn test_maintenance_blocks_new_clients_only() {
        let tunnel = tunnel(None);
        let a = addr("203.0.113.1:1000");
        let b = addr("198.51.100.2:2000");
        let now = Instant::now();

        tunnel.process(&packet(5, 7, b"x"), a, now);
        tunnel.process(&packet(7, 5, b"x"), b, now);
        tunnel.state().set_maintenance(true);

        assert_eq!(
            tunnel.process(&packet(8, 5, b"x"), addr("192.0.2.1:1"), now),
            Verdict::Drop(DropReason::AdmissionDenied)
        );
        assert!(matches!(tunnel.process(&packet(5, 7, b"x"), a, now), Verdict::Forward { .. }));
    }

    #[test]
    fn test_maintenance_command_toggles_once_per_cooldown() {
        let tunnel = tunnel(Some(PASSWORD));
        let from = addr("203.0.113.1:1000");
        let later = Instant::now() + COMMAND_RATE_LIMIT;

        assert_eq!(
            tunnel.process(&command(0, PASSWORD), from, later),
            Verdict::Drop(DropReason::Command)
        );
        assert!(tunnel.state().maintenance());

        // Second valid command inside the cooldown is ignored
        tunnel.process(&command(0, PASSWORD), from, later + Duration::from_secs(1));
        assert!(tunnel.state().maintenance());

        tunnel.process(&command(0, PASSWORD), from, later + COMMAND_RATE_LIMIT);
        assert!(!tunnel.state().maintenance());
    }

    #[test]
    fn test_command_cooldown_starts_at_creation() {
        let tunnel = tunnel(Some(PASSWORD));
        tunnel.process(&command(0, PASSWORD), addr("203.0.113.1:1000"), Instant::now());
        assert!(!tunnel.state().maintenance());
    }

    #[test]
    fn test_wrong_digest_never_toggles_but_consumes_cooldown() {
        let tunnel = tunnel(Some(PASSWORD));
        let from = addr("203.0.113.1:1000");
        let later = Instant::now() + COMMAND_RATE_LIMIT;

        tunnel.process(&command(0, "guess"), from, later);
        assert!(!tunnel.state().maintenance());

        tunnel.process(&command(0, PASSWORD), from, later + Duration::from_secs(1));
        assert!(!tunnel.state().maintenance());
    }

    #[test]
    fn test_command_without_password_ignored() {
        let tunnel = tunnel(Some(""));
        let later = Instant::now() + COMMAND_RATE_LIMIT;

        tunnel.process(&command(0, ""), addr("203.0.113.1:1000"), later);
        assert!(!tunnel.state().maintenance());
    }

    #[test]
    fn test_unknown_command_ignored() {
        let tunnel = tunnel(Some(PASSWORD));
        let later = Instant::now() + COMMAND_RATE_LIMIT;

        assert_eq!(
            tunnel.process(&command(7, PASSWORD), addr("203.0.113.1:1000"), later),
            Verdict::Drop(DropReason::Command)
        );
        assert!(!tunnel.state().maintenance());
    }

    #[test]
    fn test_sweep_releases_ip_count_once() {
        let tunnel = tunnel(None);
        let from = addr("203.0.113.1:1000");
        let start = Instant::now();
        let timeout = tunnel.settings().client_timeout;

        tunnel.process(&packet(5, 7, b"x"), from, start);
        assert_eq!(tunnel.state().connections.count(from.ip()), 1);

        assert_eq!(tunnel.sweep(start + timeout - Duration::from_secs(1)), 0);
        assert_eq!(tunnel.sweep(start + timeout), 1);
        assert_eq!(tunnel.sweep(start + timeout), 0);
        assert_eq!(tunnel.state().connections.count(from.ip()), 0);
        assert!(tunnel.state().registry.get(5).is_none());
    }

    #[test]
    fn test_announcement_snapshot() {
        let tunnel = tunnel(None);
        tunnel.process(&packet(5, 7, b"x"), addr("203.0.113.1:1000"), Instant::now());

        let announcement = tunnel.announcement();
        assert_eq!(announcement.version, 3);
        assert_eq!(announcement.clients, 1);
        assert_eq!(announcement.max_clients, 4);
        assert_eq!(announcement.port, 50001);
        assert!(!announcement.maintenance);
    }
}
