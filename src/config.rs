//! Engine tuning and application configuration
//!
//! The optional YAML file looks like:
//! ```yaml
//! node_id: scheduler
//! bind: 0.0.0.0:5683
//! peers:
//!   alias_udp_valve: 192.168.1.40:5683
//! engine:
//!   sweep_interval_ms: 1000
//!   response_timeout_ms: 3000
//!   max_retransmits: 3
//!   disconnect_delay_ms: 15000
//!   peer_retention_ms: 300000
//!   queue_capacity: 256
//! ```
//! Every key is optional. CLI flags override the file.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use valvelink_shared::timing;

use crate::store::PacketFlags;

/// Tuning knobs of the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Sweeper tick, also the schedule tolerance
    pub sweep_interval: Duration,
    /// How long a packet may wait for its confirmations before a resend
    pub response_timeout: Duration,
    /// Resends before a packet expires (at most the 2-bit field maximum)
    pub max_retransmits: u8,
    /// Silence after which a peer counts as disconnected
    pub disconnect_delay: Duration,
    /// How long a peer stays unavailable before it is forgotten
    pub peer_retention: Duration,
    pub queue_capacity: usize,
    /// Half-width of the window in which a schedule instant counts as due
    pub schedule_tolerance: Duration,
    /// Name put in the header of outbound envelopes
    pub node_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(timing::SWEEP_INTERVAL_MS),
            response_timeout: Duration::from_millis(timing::RESPONSE_TIMEOUT_MS),
            max_retransmits: timing::MAX_RETRANSMITS,
            disconnect_delay: Duration::from_millis(timing::MAX_DELAY_FOR_DISCONNECT_MS),
            peer_retention: Duration::from_millis(timing::PEER_RETENTION_MS),
            queue_capacity: 256,
            schedule_tolerance: Duration::from_millis(timing::SWEEP_INTERVAL_MS),
            node_id: "scheduler".into(),
        }
    }
}

/// Command line of the `valve-engine` binary
#[derive(Debug, Default, Parser)]
#[command(name = "valve-engine", about = "Valve command delivery and monitoring engine")]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// UDP address to listen on
    #[arg(short = 'b', long = "bind")]
    pub bind: Option<SocketAddr>,

    /// Field controller address, as alias=host:port (repeatable)
    #[arg(short = 'p', long = "peer", value_parser = parse_peer)]
    pub peers: Vec<(String, SocketAddr)>,

    /// Name used as sender in outbound envelopes
    #[arg(short = 'n', long = "node-id")]
    pub node_id: Option<String>,
}

/// Parse an `alias=host:port` pair
pub fn parse_peer(s: &str) -> Result<(String, SocketAddr)> {
    let (alias, addr) = s
        .split_once('=')
        .with_context(|| format!("expected alias=host:port, got '{}'", s))?;
    if alias.is_empty() {
        bail!("empty alias in '{}'", s);
    }
    let addr = addr
        .parse()
        .with_context(|| format!("invalid address for '{}'", alias))?;
    Ok((alias.to_string(), addr))
}

/// Everything the binary needs to run
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: SocketAddr,
    /// alias -> field controller address
    pub peers: HashMap<String, SocketAddr>,
    pub engine: EngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5683)),
            peers: HashMap::new(),
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    node_id: Option<String>,
    bind: Option<SocketAddr>,
    #[serde(default)]
    peers: HashMap<String, SocketAddr>,
    #[serde(default)]
    engine: EngineSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EngineSection {
    sweep_interval_ms: Option<u64>,
    response_timeout_ms: Option<u64>,
    max_retransmits: Option<u8>,
    disconnect_delay_ms: Option<u64>,
    peer_retention_ms: Option<u64>,
    queue_capacity: Option<usize>,
}

impl AppConfig {
    /// Parse YAML text on top of the defaults
    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: ConfigFile = if content.trim().is_empty() {
            ConfigFile::default()
        } else {
            serde_yaml::from_str(content).context("Failed to parse YAML configuration")?
        };

        let mut config = AppConfig::default();
        if let Some(bind) = file.bind {
            config.bind = bind;
        }
        if let Some(node_id) = file.node_id {
            config.engine.node_id = node_id;
        }
        config.peers = file.peers;

        let engine = &mut config.engine;
        if let Some(ms) = file.engine.sweep_interval_ms {
            engine.sweep_interval = Duration::from_millis(ms);
            engine.schedule_tolerance = engine.sweep_interval;
        }
        if let Some(ms) = file.engine.response_timeout_ms {
            engine.response_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = file.engine.max_retransmits {
            engine.max_retransmits = n;
        }
        if let Some(ms) = file.engine.disconnect_delay_ms {
            engine.disconnect_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = file.engine.peer_retention_ms {
            engine.peer_retention = Duration::from_millis(ms);
        }
        if let Some(n) = file.engine.queue_capacity {
            engine.queue_capacity = n;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No configuration at {}, using defaults", path.display());
            return Ok(AppConfig::default());
        }
        info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open configuration file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Invalid configuration file: {}", path.display()))
    }

    /// Resolve the effective configuration from the command line
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => AppConfig::default(),
        };
        if let Some(bind) = cli.bind {
            config.bind = bind;
        }
        if let Some(node_id) = &cli.node_id {
            config.engine.node_id = node_id.clone();
        }
        for (alias, addr) in &cli.peers {
            config.peers.insert(alias.clone(), *addr);
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.max_retransmits > PacketFlags::MAX_RETRANSMITS {
            bail!(
                "max_retransmits {} exceeds the field maximum {}",
                engine.max_retransmits,
                PacketFlags::MAX_RETRANSMITS
            );
        }
        if engine.sweep_interval.is_zero() {
            bail!("sweep_interval_ms must be positive");
        }
        if engine.queue_capacity == 0 {
            bail!("queue_capacity must be positive");
        }
        if engine.node_id.is_empty() {
            bail!("node_id must not be empty");
        }
        Ok(())
    }
}
