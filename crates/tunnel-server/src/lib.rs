//! tunnel-server: UDP tunnel relay for game matchmaking
//!
//! Relays datagrams between game clients that cannot reach each other
//! directly. Two wire versions are served side by side (V2 with lobby
//! reservations over HTTP, V3 with self-registering clients), together with
//! a small NAT discovery responder that echoes a caller's public endpoint.

pub mod announce;
pub mod cli;
pub mod config;
pub mod heartbeat;
pub mod lobby;
pub mod metrics;
pub mod packet;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod stun;
pub mod tunnel;

pub use cli::Cli;
pub use config::{ConfigError, ServerConfig};
pub use server::TunnelServer;
pub use tunnel::{Protocol, Tunnel, TunnelError, V2, V3};
