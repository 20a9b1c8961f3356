//! Configuration resolution for Livecast.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Config file (explicit path, or ~/.config/livecast/settings.json)
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// Complete Livecast configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub downstream: DownstreamConfig,
    #[serde(default)]
    pub transcoder: TranscoderConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// HTTP/WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Host name advertised in generated ingest/playback URLs.
    pub public_host: String,
    /// Largest WebSocket message accepted from a producer.
    pub max_message_bytes: usize,
    /// Secret mixed into stream key derivation.
    pub stream_key_secret: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_host: "localhost".to_string(),
            max_message_bytes: 4 * 1024 * 1024, // 4 MiB
            stream_key_secret: String::new(),
        }
    }
}

/// Downstream broadcast endpoint (RTMP ingest) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownstreamConfig {
    pub host: String,
    pub port: u16,
    /// RTMP application name, e.g. `live` in `rtmp://host:1935/live/<key>`.
    pub app: String,
    pub readiness_max_attempts: u32,
    pub readiness_retry_delay_ms: u64,
    pub readiness_connect_timeout_ms: u64,
    /// Port serving HLS playback, used only for generated URLs.
    pub playback_port: u16,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1935,
            app: "live".to_string(),
            readiness_max_attempts: 5,
            readiness_retry_delay_ms: 1000,
            readiness_connect_timeout_ms: 2000,
            playback_port: 8080,
        }
    }
}

impl DownstreamConfig {
    /// `host:port` of the downstream endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub const fn readiness_retry_delay(&self) -> Duration {
        Duration::from_millis(self.readiness_retry_delay_ms)
    }

    pub const fn readiness_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_connect_timeout_ms)
    }
}

/// External encoder process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub program: PathBuf,
    pub video_codec: String,
    pub audio_codec: String,
    pub format: String,
    /// Extra arguments inserted before the output address.
    pub extra_args: Vec<String>,
    /// Grace period between SIGINT and SIGKILL.
    pub terminate_timeout_ms: u64,
    /// How long teardown waits for buffered input to reach the encoder.
    pub drain_timeout_ms: u64,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            video_codec: "copy".to_string(),
            audio_codec: "copy".to_string(),
            format: "flv".to_string(),
            extra_args: Vec::new(),
            terminate_timeout_ms: 5000,
            drain_timeout_ms: 2000,
        }
    }
}

impl TranscoderConfig {
    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Relay pipe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Maximum number of chunks buffered between socket and encoder stdin.
    pub capacity_chunks: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            capacity_chunks: 256,
        }
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicit `path` must exist; the default global path is optional.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => match global_config_path() {
            Some(global_path) if global_path.exists() => load_config_file(&global_path)?,
            _ => Config::default(),
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/livecast/settings.json"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("livecast").join("settings.json"))
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let config = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    debug!(path = %path.display(), "Loaded config file");
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("LIVECAST_BIND_ADDR")
        && let Ok(addr) = val.parse()
    {
        config.server.bind_addr = addr;
    }
    if let Some(val) = lookup("LIVECAST_PUBLIC_HOST") {
        config.server.public_host = val;
    }
    if let Some(val) = lookup("LIVECAST_STREAM_KEY_SECRET") {
        config.server.stream_key_secret = val;
    }
    if let Some(val) = lookup("LIVECAST_DOWNSTREAM_HOST") {
        config.downstream.host = val;
    }
    if let Some(val) = lookup("LIVECAST_DOWNSTREAM_PORT")
        && let Ok(n) = val.parse()
    {
        config.downstream.port = n;
    }
    if let Some(val) = lookup("LIVECAST_READINESS_MAX_ATTEMPTS")
        && let Ok(n) = val.parse()
    {
        config.downstream.readiness_max_attempts = n;
    }
    if let Some(val) = lookup("LIVECAST_FFMPEG_BIN") {
        config.transcoder.program = PathBuf::from(val);
    }
    if let Some(val) = lookup("LIVECAST_RELAY_CAPACITY")
        && let Ok(n) = val.parse()
    {
        config.relay.capacity_chunks = n;
    }
}

/// Reject values the media server cannot run with.
pub fn validate(config: &Config) -> Result<()> {
    if config.downstream.readiness_max_attempts == 0 {
        return Err(Error::Config(
            "downstream.readiness_max_attempts must be at least 1".to_string(),
        ));
    }
    if config.relay.capacity_chunks == 0 {
        return Err(Error::Config(
            "relay.capacity_chunks must be at least 1".to_string(),
        ));
    }
    if config.transcoder.program.as_os_str().is_empty() {
        return Err(Error::Config("transcoder.program is empty".to_string()));
    }
    Ok(())
}
