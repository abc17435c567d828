//! Configuration management

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cli::Cli;

pub const MIN_PORT: u16 = 1024;
pub const MAX_PORT: u16 = 65534;
pub const MIN_CLIENTS: usize = 2;
pub const MIN_CLIENT_TIMEOUT_SECS: u64 = 30;
pub const MIN_PACKET_SIZE: usize = 512;
/// Largest payload a single UDP datagram can carry over IPv4
pub const MAX_PACKET_SIZE: usize = 65_507;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub tunnel_port: u16,
    pub tunnel_v2_port: u16,
    pub bind_address: IpAddr,
    pub max_clients: usize,
    pub ip_limit: u32,
    pub client_timeout_secs: u64,
    pub max_packet_size: usize,
    pub max_pings_global: usize,
    pub max_pings_per_ip: u32,
    pub master_announce_interval_secs: u64,
    pub no_master_announce: bool,
    pub master_password: Option<String>,
    pub maintenance_password: Option<String>,
    pub master_server_url: String,
    pub announce_ipv4_only: bool,
    pub tunnel_v3_enabled: bool,
    pub tunnel_v2_enabled: bool,
    pub no_peer_to_peer: bool,
    pub peer_to_peer_ports: Vec<u16>,
    pub max_in_flight: usize,
    pub metrics_addr: Option<SocketAddr>,
    pub log_level: String,
    pub system_log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "Unnamed server".to_string(),
            tunnel_port: 50001,
            tunnel_v2_port: 50000,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_clients: 200,
            ip_limit: 8,
            client_timeout_secs: 60,
            max_packet_size: 2048,
            max_pings_global: 1024,
            max_pings_per_ip: 20,
            master_announce_interval_secs: 60,
            no_master_announce: false,
            master_password: None,
            maintenance_password: None,
            master_server_url: "https://cncnet.org/api/v1/master-announce".to_string(),
            announce_ipv4_only: false,
            tunnel_v3_enabled: true,
            tunnel_v2_enabled: true,
            no_peer_to_peer: false,
            peer_to_peer_ports: vec![8054, 3478],
            max_in_flight: 1024,
            metrics_addr: None,
            log_level: "info".to_string(),
            system_log_level: "warn".to_string(),
        }
    }
}

impl ServerConfig {
    /// Build the effective configuration: defaults, then the TOML file named
    /// by `--config` (if any), then command line flags and environment.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };

        config.apply_cli(cli);
        config.validate()?;

        Ok(config)
    }

    /// Load from a TOML file. Missing keys keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Override fields with every value given on the command line
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(name) = &cli.name {
            self.name = name.clone();
        }
        if let Some(port) = cli.tunnel_port {
            self.tunnel_port = port;
        }
        if let Some(port) = cli.tunnel_v2_port {
            self.tunnel_v2_port = port;
        }
        if let Some(addr) = cli.bind_address {
            self.bind_address = addr;
        }
        if let Some(max) = cli.max_clients {
            self.max_clients = max;
        }
        if let Some(limit) = cli.ip_limit {
            self.ip_limit = limit;
        }
        if let Some(secs) = cli.client_timeout_secs {
            self.client_timeout_secs = secs;
        }
        if let Some(size) = cli.max_packet_size {
            self.max_packet_size = size;
        }
        if let Some(max) = cli.max_pings_global {
            self.max_pings_global = max;
        }
        if let Some(max) = cli.max_pings_per_ip {
            self.max_pings_per_ip = max;
        }
        if let Some(secs) = cli.master_announce_interval_secs {
            self.master_announce_interval_secs = secs;
        }
        if cli.no_master_announce {
            self.no_master_announce = true;
        }
        if let Some(password) = &cli.master_password {
            self.master_password = Some(password.clone());
        }
        if let Some(password) = &cli.maintenance_password {
            self.maintenance_password = Some(password.clone());
        }
        if let Some(url) = &cli.master_server_url {
            self.master_server_url = url.clone();
        }
        if cli.announce_ipv4_only {
            self.announce_ipv4_only = true;
        }
        if cli.no_tunnel_v3 {
            self.tunnel_v3_enabled = false;
        }
        if cli.no_tunnel_v2 {
            self.tunnel_v2_enabled = false;
        }
        if cli.no_peer_to_peer {
            self.no_peer_to_peer = true;
        }
        if !cli.peer_to_peer_ports.is_empty() {
            self.peer_to_peer_ports = cli.peer_to_peer_ports.clone();
        }
        if let Some(max) = cli.max_in_flight {
            self.max_in_flight = max;
        }
        if let Some(addr) = cli.metrics_addr {
            self.metrics_addr = Some(addr);
        }
        if let Some(level) = &cli.log_level {
            self.log_level = level.clone();
        }
        if let Some(level) = &cli.system_log_level {
            self.system_log_level = level.clone();
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".to_string()));
        }
        if self.name.contains(';') {
            return Err(ConfigError::Invalid("name must not contain ';'".to_string()));
        }

        for (field, port) in [
            ("tunnel_port", self.tunnel_port),
            ("tunnel_v2_port", self.tunnel_v2_port),
        ] {
            if !(MIN_PORT..=MAX_PORT).contains(&port) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be within {}..={}, got {}",
                    field, MIN_PORT, MAX_PORT, port
                )));
            }
        }
        if self.tunnel_v3_enabled && self.tunnel_v2_enabled && self.tunnel_port == self.tunnel_v2_port {
            return Err(ConfigError::Invalid(
                "tunnel_port and tunnel_v2_port must differ".to_string(),
            ));
        }

        if self.max_clients < MIN_CLIENTS {
            return Err(ConfigError::Invalid(format!(
                "max_clients must be >= {}",
                MIN_CLIENTS
            )));
        }
        if self.ip_limit == 0 {
            return Err(ConfigError::Invalid("ip_limit must be > 0".to_string()));
        }
        if self.client_timeout_secs < MIN_CLIENT_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "client_timeout_secs must be >= {}",
                MIN_CLIENT_TIMEOUT_SECS
            )));
        }
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&self.max_packet_size) {
            return Err(ConfigError::Invalid(format!(
                "max_packet_size must be within {}..={}",
                MIN_PACKET_SIZE, MAX_PACKET_SIZE
            )));
        }
        if self.max_pings_global == 0 || self.max_pings_per_ip == 0 {
            return Err(ConfigError::Invalid("ping limits must be > 0".to_string()));
        }
        if self.master_announce_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "master_announce_interval_secs must be > 0".to_string(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid("max_in_flight must be > 0".to_string()));
        }
        if !self.no_master_announce {
            reqwest::Url::parse(&self.master_server_url).map_err(|e| {
                ConfigError::Invalid(format!("Invalid master_server_url: {}", e))
            })?;
        }
        if !self.no_peer_to_peer && self.peer_to_peer_ports.contains(&0) {
            return Err(ConfigError::Invalid(
                "peer_to_peer_ports must not contain 0".to_string(),
            ));
        }

        if !self.tunnel_v3_enabled && !self.tunnel_v2_enabled && !self.peer_to_peer_enabled() {
            return Err(ConfigError::Invalid(
                "at least one of the V3 tunnel, V2 tunnel or NAT discovery must be enabled"
                    .to_string(),
            ));
        }

        Ok(())
    }

    pub fn peer_to_peer_enabled(&self) -> bool {
        !self.no_peer_to_peer && !self.peer_to_peer_ports.is_empty()
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.master_announce_interval_secs)
    }

    pub fn tunnel_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.tunnel_port)
    }

    pub fn tunnel_v2_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.tunnel_v2_port)
    }

    /// Tracing filter used when `RUST_LOG` is unset
    pub fn log_directive(&self) -> String {
        format!(
            "{},{}={}",
            self.system_log_level,
            env!("CARGO_CRATE_NAME"),
            self.log_level
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tunnel_addr().port(), 50001);
        assert_eq!(config.tunnel_v2_addr().port(), 50000);
        assert_eq!(config.client_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_toml_partial_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "name = \"Tunnel A\"\nmax_clients = 50\nmaintenance_password = \"secret\"\npeer_to_peer_ports = [9000]"
        )
        .unwrap();

        let config = ServerConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.name, "Tunnel A");
        assert_eq!(config.max_clients, 50);
        assert_eq!(config.maintenance_password.as_deref(), Some("secret"));
        assert_eq!(config.peer_to_peer_ports, vec![9000]);
        assert_eq!(config.tunnel_port, 50001);
        assert_eq!(config.ip_limit, 8);
    }

    #[test]
    fn test_toml_parse_error() {
        let result = ServerConfig::from_toml_str("max_clients = \"many\"");
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_cli_overrides_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name = \"From file\"\ntunnel_port = 50101").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let cli = Cli::try_parse_from([
            "tunnel-server",
            "--config",
            path.as_str(),
            "--name",
            "From flag",
            "--nop2p",
        ])
        .unwrap();
        let config = ServerConfig::load(&cli).unwrap();

        assert_eq!(config.name, "From flag");
        assert_eq!(config.tunnel_port, 50101);
        assert!(config.no_peer_to_peer);
        assert!(!config.peer_to_peer_enabled());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases: Vec<fn(&mut ServerConfig)> = vec![
            |c| c.name = "a;b".to_string(),
            |c| c.name = "  ".to_string(),
            |c| c.tunnel_port = 80,
            |c| c.tunnel_v2_port = 65535,
            |c| c.tunnel_v2_port = c.tunnel_port,
            |c| c.max_clients = 1,
            |c| c.ip_limit = 0,
            |c| c.client_timeout_secs = 10,
            |c| c.max_packet_size = 100,
            |c| c.max_packet_size = MAX_PACKET_SIZE + 1,
            |c| c.max_packet_size = usize::MAX,
            |c| c.master_server_url = "not a url".to_string(),
            |c| {
                c.tunnel_v3_enabled = false;
                c.tunnel_v2_enabled = false;
                c.no_peer_to_peer = true;
            },
        ];

        for mutate in cases {
            let mut config = ServerConfig::default();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "accepted {:?}",
                config
            );
        }
    }

    #[test]
    fn test_largest_udp_payload_is_valid() {
        let config = ServerConfig {
            max_packet_size: MAX_PACKET_SIZE,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nat_only_is_valid() {
        let config = ServerConfig {
            tunnel_v3_enabled: false,
            tunnel_v2_enabled: false,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_directive() {
        let config = ServerConfig {
            log_level: "debug".to_string(),
            ..ServerConfig::default()
        };
        assert_eq!(config.log_directive(), "warn,tunnel_server=debug");
    }
}
