//! Server configuration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::registry::{RegistryConfig, TranscoderConfig};

/// Pattern accepted when none is configured
pub const DEFAULT_PATTERN: &str = "/live/{app}/{username}";

/// Server configuration options
///
/// Loaded once at startup and not changed afterwards.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the ingest protocol adapter listens on
    pub ingest_addr: SocketAddr,

    /// Address the HTTP delivery router listens on
    pub delivery_addr: SocketAddr,

    /// Base directory for per-identity output
    pub output_dir: PathBuf,

    /// How long a session survives its publisher disconnecting
    pub reconnect_grace: Duration,

    /// How long a stopping transcoder may take before it is killed
    pub termination_timeout: Duration,

    /// Delay before a terminated session's directory is removed
    pub cleanup_delay: Duration,

    /// Authorized connect path patterns, in match order
    pub authorized_patterns: Vec<String>,

    /// Transcoder program and arguments
    pub transcoder: TranscoderConfig,

    /// First path segment of delivery URLs
    pub delivery_prefix: String,

    /// File served when a delivery URL names only the identity
    pub playlist_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ingest_addr: SocketAddr::from(([0, 0, 0, 0], 1935)),
            delivery_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            output_dir: PathBuf::from("./streams"),
            reconnect_grace: Duration::from_secs(5),
            termination_timeout: Duration::from_secs(2),
            cleanup_delay: Duration::from_secs(2),
            authorized_patterns: vec![DEFAULT_PATTERN.to_string()],
            transcoder: TranscoderConfig::default(),
            delivery_prefix: "stream".to_string(),
            playlist_name: "live.m3u8".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parse a TOML configuration; missing keys keep their defaults
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(s)?;
        file.into_config()
    }

    /// Load a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config = Self::from_toml_str(&contents)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Registry settings derived from this configuration
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::default()
            .output_dir(self.output_dir.clone())
            .termination_timeout(self.termination_timeout)
            .cleanup_delay(self.cleanup_delay)
            .transcoder(self.transcoder.clone())
    }

    /// Set the ingest address
    pub fn ingest(mut self, addr: SocketAddr) -> Self {
        self.ingest_addr = addr;
        self
    }

    /// Set the delivery address
    pub fn delivery(mut self, addr: SocketAddr) -> Self {
        self.delivery_addr = addr;
        self
    }

    /// Set the output base directory
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Set the reconnect grace delay
    pub fn reconnect_grace(mut self, grace: Duration) -> Self {
        self.reconnect_grace = grace;
        self
    }

    /// Set the forced-termination timeout
    pub fn termination_timeout(mut self, timeout: Duration) -> Self {
        self.termination_timeout = timeout;
        self
    }

    /// Set the directory cleanup delay
    pub fn cleanup_delay(mut self, delay: Duration) -> Self {
        self.cleanup_delay = delay;
        self
    }

    /// Replace the authorized patterns
    pub fn patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authorized_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Set the transcoder command
    pub fn transcoder(mut self, transcoder: TranscoderConfig) -> Self {
        self.transcoder = transcoder;
        self
    }

    /// Set the delivery URL prefix
    pub fn delivery_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.delivery_prefix = prefix.into();
        self
    }
}

/// On-disk form of [`ServerConfig`]
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    ingest_addr: Option<String>,
    delivery_addr: Option<String>,
    output_dir: Option<PathBuf>,
    reconnect_grace_ms: Option<u64>,
    termination_timeout_ms: Option<u64>,
    cleanup_delay_ms: Option<u64>,
    authorized_patterns: Option<Vec<String>>,
    transcoder: Option<TranscoderConfig>,
    delivery_prefix: Option<String>,
    playlist_name: Option<String>,
}

impl ConfigFile {
    fn into_config(self) -> Result<ServerConfig, ConfigError> {
        let mut config = ServerConfig::default();

        if let Some(addr) = self.ingest_addr {
            config.ingest_addr = parse_addr(&addr)?;
        }
        if let Some(addr) = self.delivery_addr {
            config.delivery_addr = parse_addr(&addr)?;
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if let Some(ms) = self.reconnect_grace_ms {
            config.reconnect_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = self.termination_timeout_ms {
            config.termination_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.cleanup_delay_ms {
            config.cleanup_delay = Duration::from_millis(ms);
        }
        if let Some(patterns) = self.authorized_patterns {
            config.authorized_patterns = patterns;
        }
        if let Some(transcoder) = self.transcoder {
            config.transcoder = transcoder;
        }
        if let Some(prefix) = self.delivery_prefix {
            config.delivery_prefix = prefix;
        }
        if let Some(name) = self.playlist_name {
            config.playlist_name = name;
        }

        Ok(config)
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.parse()
        .map_err(|_| ConfigError::InvalidAddr(addr.to_string()))
}
