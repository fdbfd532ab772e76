use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;

// Broker service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // TCP listener bind address.
    pub listen: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Max bytes of a single command line, LF included.
    pub max_line_bytes: usize,
    // Per-session outbound queue depth; a session that overflows it is dropped.
    pub outbound_queue_depth: usize,
    // Interval for the periodic stats log line; 0 disables it.
    pub stats_interval_secs: u64,
    // Log each accepted connection at info level.
    pub log_connections: bool,
}

const DEFAULT_CONFIG_PATH: &str = "/usr/local/relay/config.yml";
const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;
const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 1024;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Deserialize)]
struct ServerConfigOverride {
    listen: Option<String>,
    metrics_bind: Option<String>,
    max_line_bytes: Option<usize>,
    outbound_queue_depth: Option<usize>,
    stats_interval_secs: Option<u64>,
    log_connections: Option<bool>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let listen = std::env::var("RELAY_LISTEN")
            .unwrap_or_else(|_| "0.0.0.0:9092".to_string())
            .parse()
            .with_context(|| "parse RELAY_LISTEN")?;
        let metrics_bind = std::env::var("RELAY_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse RELAY_METRICS_BIND")?;
        let max_line_bytes = std::env::var("RELAY_MAX_LINE_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_LINE_BYTES);
        let outbound_queue_depth = std::env::var("RELAY_OUTBOUND_QUEUE_DEPTH")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_OUTBOUND_QUEUE_DEPTH);
        let stats_interval_secs = std::env::var("RELAY_STATS_INTERVAL_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_STATS_INTERVAL_SECS);
        let log_connections = std::env::var("RELAY_LOG_CONNECTIONS")
            .ok()
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(true);
        Ok(Self {
            listen,
            metrics_bind,
            max_line_bytes,
            outbound_queue_depth,
            stats_interval_secs,
            log_connections,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = std::env::var("RELAY_BROKER_CONFIG").ok();
        let config_path = override_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if override_path.is_some() {
                    return Err(err)
                        .with_context(|| format!("read RELAY_BROKER_CONFIG: {config_path}"));
                }
                None
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read broker config: {config_path}"));
            }
        };
        if let Some(contents) = contents {
            // YAML overrides allow ops-friendly config files.
            let override_cfg: ServerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse broker config yaml")?;
            config.apply_override(override_cfg)?;
        }
        Ok(config)
    }

    fn apply_override(&mut self, override_cfg: ServerConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.listen {
            self.listen = value.parse().with_context(|| "parse listen")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.max_line_bytes
            && value > 0
        {
            self.max_line_bytes = value;
        }
        if let Some(value) = override_cfg.outbound_queue_depth
            && value > 0
        {
            self.outbound_queue_depth = value;
        }
        if let Some(value) = override_cfg.stats_interval_secs {
            self.stats_interval_secs = value;
        }
        if let Some(value) = override_cfg.log_connections {
            self.log_connections = value;
        }
        Ok(())
    }
}
