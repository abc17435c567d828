//! Command line arguments
//!
//! Every setting is optional here: values left unset fall back to the TOML
//! file given with `--config`, then to the built-in defaults.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

/// UDP tunnel relay server
#[derive(Parser, Debug, Default)]
#[command(name = "tunnel-server")]
#[command(version, about = "UDP tunnel relay server for game matchmaking")]
pub struct Cli {
    /// TOML config file path
    #[arg(long, short = 'c', env = "TUNNEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Name of the server, shown in the master server list
    #[arg(long, short = 'n', env = "TUNNEL_NAME")]
    pub name: Option<String>,

    /// UDP port of the V3 tunnel
    #[arg(long = "port", short = 'p', env = "TUNNEL_PORT")]
    pub tunnel_port: Option<u16>,

    /// UDP and HTTP port of the V2 tunnel
    #[arg(long = "portv2", env = "TUNNEL_V2_PORT")]
    pub tunnel_v2_port: Option<u16>,

    /// Address every listener binds to
    #[arg(long = "bind", env = "TUNNEL_BIND_ADDRESS")]
    pub bind_address: Option<IpAddr>,

    /// Maximum number of clients per tunnel
    #[arg(long = "maxclients", short = 'm', env = "TUNNEL_MAX_CLIENTS")]
    pub max_clients: Option<usize>,

    /// Maximum clients (V3) or lobby requests per heartbeat (V2) from one IP
    #[arg(long = "iplimit", env = "TUNNEL_IP_LIMIT")]
    pub ip_limit: Option<u32>,

    /// Seconds without traffic before a client slot can be reclaimed
    #[arg(long = "client-timeout", env = "TUNNEL_CLIENT_TIMEOUT")]
    pub client_timeout_secs: Option<u64>,

    #[arg(long = "max-packet-size", env = "TUNNEL_MAX_PACKET_SIZE")]
    pub max_packet_size: Option<usize>,

    /// Distinct pinging addresses allowed per heartbeat
    #[arg(long = "max-pings-global")]
    pub max_pings_global: Option<usize>,

    /// Pings allowed per address per heartbeat
    #[arg(long = "max-pings-per-ip")]
    pub max_pings_per_ip: Option<u32>,

    /// Seconds between heartbeats
    #[arg(long = "announce-interval")]
    pub master_announce_interval_secs: Option<u64>,

    /// Do not register with the master server
    #[arg(long = "nomaster")]
    pub no_master_announce: bool,

    /// Master server password
    #[arg(long = "masterpw", env = "TUNNEL_MASTER_PASSWORD")]
    pub master_password: Option<String>,

    /// Maintenance password, enables the maintenance command and endpoint
    #[arg(long = "maintpw", env = "TUNNEL_MAINTENANCE_PASSWORD")]
    pub maintenance_password: Option<String>,

    /// Master server announce URL
    #[arg(long = "master", env = "TUNNEL_MASTER_URL")]
    pub master_server_url: Option<String>,

    /// Send master server announcements over IPv4 only
    #[arg(long = "announce-ipv4-only")]
    pub announce_ipv4_only: bool,

    /// Disable the V3 tunnel
    #[arg(long = "no-v3")]
    pub no_tunnel_v3: bool,

    /// Disable the V2 tunnel and its HTTP endpoints
    #[arg(long = "no-v2")]
    pub no_tunnel_v2: bool,

    /// Disable the NAT discovery responders
    #[arg(long = "nop2p")]
    pub no_peer_to_peer: bool,

    /// NAT discovery ports (comma separated)
    #[arg(long = "p2p-ports", value_delimiter = ',')]
    pub peer_to_peer_ports: Vec<u16>,

    /// Maximum datagrams handled concurrently per tunnel
    #[arg(long = "max-in-flight")]
    pub max_in_flight: Option<usize>,

    /// Address of the /health and /metrics listener
    #[arg(long = "metrics-addr", env = "TUNNEL_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Log level for this crate
    #[arg(long = "log-level", env = "TUNNEL_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log level for dependencies
    #[arg(long = "system-log-level", env = "TUNNEL_SYSTEM_LOG_LEVEL")]
    pub system_log_level: Option<String>,
}
