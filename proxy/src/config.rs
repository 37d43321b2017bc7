//! Command-line arguments and the runtime configuration derived from them

use crate::error::ProxyError;
use clap::Parser;
use protocol::EndpointConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line arguments of the relay binary
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// IP address to listen on
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    pub host: String,
    /// UDP port to listen on
    #[clap(short, long, default_value = "19132")]
    pub port: u16,
    /// Maximum number of concurrently relayed players
    #[clap(short, long, default_value = "100")]
    pub max_players: usize,
    /// First status line shown in the server list
    #[clap(long, default_value = "RakNet Relay")]
    pub motd: String,
    /// Second status line shown in the server list
    #[clap(long, default_value = "relay")]
    pub sub_motd: String,
    /// Game protocol number advertised in the status line
    #[clap(long, default_value = "594")]
    pub game_protocol: u32,
    /// Game version advertised in the status line
    #[clap(long, default_value = "1.20.10")]
    pub game_version: String,
    /// Tick rate (endpoint flushes per second)
    #[clap(short, long, default_value = "100")]
    pub tick_rate: u32,
    /// Seconds without traffic before a peer is dropped
    #[clap(long, default_value = "15")]
    pub idle_timeout: u64,
    /// Seconds an unacknowledged bundle stays retransmittable
    #[clap(long, default_value = "5")]
    pub retention_ttl: u64,
    /// Unacknowledged bundles kept per endpoint
    #[clap(long, default_value = "1024")]
    pub retention_capacity: usize,
    /// Milliseconds allowed for one backend lookup
    #[clap(long, default_value = "3000")]
    pub discovery_timeout: u64,
    /// Service class new players are routed to
    #[clap(short, long, default_value = "lobby")]
    pub service_class: String,
    /// Backend mapping, repeatable (CLASS=IP:PORT)
    #[clap(short, long = "backend", value_parser = parse_backend)]
    pub backends: Vec<(String, SocketAddr)>,
    /// JSON file with additional backend mappings
    #[clap(long)]
    pub backends_file: Option<PathBuf>,
    /// Log level used when RUST_LOG is unset
    #[clap(long, default_value = "info")]
    pub log_level: String,
}

fn parse_backend(value: &str) -> Result<(String, SocketAddr), String> {
    let (class, addr) = value
        .split_once('=')
        .ok_or_else(|| format!("expected CLASS=IP:PORT, got {:?}", value))?;
    let addr = addr
        .parse::<SocketAddr>()
        .map_err(|e| format!("invalid backend address {:?}: {}", addr, e))?;
    Ok((class.to_string(), addr))
}

/// Layout of the `--backends-file` JSON document
#[derive(Debug, Deserialize)]
struct BackendsFile {
    #[serde(default)]
    default_service: Option<String>,
    backends: HashMap<String, SocketAddr>,
}

/// Runtime configuration of one proxy instance
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_address: SocketAddr,
    pub max_players: usize,
    pub motd: String,
    pub sub_motd: String,
    pub game_protocol: u32,
    pub game_version: String,
    pub tick_duration: Duration,
    pub idle_timeout: Duration,
    pub discovery_timeout: Duration,
    pub default_service: String,
    pub backends: HashMap<String, SocketAddr>,
    pub endpoint: EndpointConfig,
    /// Identity token used in pongs and handshake replies, random per process
    pub server_guid: i64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 19132)),
            max_players: 100,
            motd: "RakNet Relay".to_string(),
            sub_motd: "relay".to_string(),
            game_protocol: 594,
            game_version: "1.20.10".to_string(),
            tick_duration: Duration::from_millis(10),
            idle_timeout: Duration::from_secs(15),
            discovery_timeout: Duration::from_secs(3),
            default_service: "lobby".to_string(),
            backends: HashMap::new(),
            endpoint: EndpointConfig::default(),
            server_guid: rand::random(),
        }
    }
}

impl ProxyConfig {
    /// Whole ticks covered by `duration`, at least one
    pub fn ticks(&self, duration: Duration) -> u64 {
        let tick = self.tick_duration.as_nanos().max(1);
        ((duration.as_nanos() / tick) as u64).max(1)
    }

    pub fn idle_timeout_ticks(&self) -> u64 {
        self.ticks(self.idle_timeout)
    }

    /// Merges the backend mappings of a JSON file into this configuration
    pub fn load_backends_file(&mut self, path: &Path) -> Result<(), ProxyError> {
        let content = std::fs::read_to_string(path)?;
        let file: BackendsFile = serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("{}: {}", path.display(), e)))?;
        if let Some(default_service) = file.default_service {
            self.default_service = default_service;
        }
        self.backends.extend(file.backends);
        Ok(())
    }
}

impl TryFrom<Args> for ProxyConfig {
    type Error = ProxyError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let bind_address = format!("{}:{}", args.host, args.port)
            .parse::<SocketAddr>()
            .map_err(|e| ProxyError::Config(format!("invalid listen address: {}", e)))?;
        if args.tick_rate == 0 {
            return Err(ProxyError::Config("tick rate must be positive".to_string()));
        }

        let mut config = ProxyConfig {
            bind_address,
            max_players: args.max_players,
            motd: args.motd,
            sub_motd: args.sub_motd,
            game_protocol: args.game_protocol,
            game_version: args.game_version,
            tick_duration: Duration::from_secs_f64(1.0 / args.tick_rate as f64),
            idle_timeout: Duration::from_secs(args.idle_timeout),
            discovery_timeout: Duration::from_millis(args.discovery_timeout),
            default_service: args.service_class,
            ..ProxyConfig::default()
        };

        if let Some(path) = &args.backends_file {
            config.load_backends_file(path)?;
        }
        config.backends.extend(args.backends);

        let retention_ttl = config.ticks(Duration::from_secs(args.retention_ttl));
        config.endpoint.retention_ttl_ticks = retention_ttl;
        config.endpoint.reassembly_ttl_ticks = retention_ttl;
        config.endpoint.retention_capacity = args.retention_capacity;

        if !config.backends.contains_key(&config.default_service) {
            return Err(ProxyError::Config(format!(
                "no backend configured for default service class {:?}",
                config.default_service
            )));
        }

        Ok(config)
    }
}
