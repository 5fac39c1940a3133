use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming the TOML config file.
pub const CONFIG_PATH_ENV: &str = "RADAR_FEED_CONFIG";
/// Environment variable overriding the operating mode.
pub const MODE_ENV: &str = "RADAR_FEED_MODE";
/// Environment variable overriding the CSV source path.
pub const CSV_PATH_ENV: &str = "RADAR_FEED_CSV";

const DEFAULT_CONFIG_PATH: &str = "radar-feed.toml";
const DEFAULT_CSV_PATH: &str = "trks.csv";
const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 1337;
pub const DEFAULT_PLAYBACK_INTERVAL_MS: u64 = 50;
pub const DEFAULT_DEBOUNCE_MS: u64 = 50;
pub const DEFAULT_WATCHER_RETRY_MS: u64 = 1_000;

/// Which ingestion engine runs for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Loop through a finished recording.
    #[default]
    #[serde(alias = "dev", alias = "development")]
    Replay,
    /// Follow a file that is still being written.
    #[serde(alias = "prod", alias = "production")]
    Live,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Replay => f.write_str("replay"),
            Mode::Live => f.write_str("live"),
        }
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "replay" | "dev" | "development" => Ok(Mode::Replay),
            "live" | "prod" | "production" => Ok(Mode::Live),
            other => anyhow::bail!("unknown mode {other:?}; expected replay or live"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_csv_path")]
    pub csv_path: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub tail: TailConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplayConfig {
    /// Time between timestamp buckets during playback.
    #[serde(default = "default_playback_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TailConfig {
    /// Quiet period after the last change notification before the file is read.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Backoff before re-arming a file watch that failed.
    #[serde(default = "default_watcher_retry_ms")]
    pub watcher_retry_ms: u64,
}

fn default_csv_path() -> String {
    DEFAULT_CSV_PATH.to_string()
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_playback_interval_ms() -> u64 {
    DEFAULT_PLAYBACK_INTERVAL_MS
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_watcher_retry_ms() -> u64 {
    DEFAULT_WATCHER_RETRY_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            csv_path: default_csv_path(),
            server: ServerConfig::default(),
            replay: ReplayConfig::default(),
            tail: TailConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_playback_interval_ms(),
        }
    }
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            watcher_retry_ms: default_watcher_retry_ms(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration the binary runs with.
    ///
    /// An explicitly named config file must exist. Without one, `radar-feed.toml` in the
    /// working directory is used when present and built-in defaults otherwise. Mode and CSV
    /// path can then be overridden from the environment.
    pub fn from_env() -> Result<Self> {
        let config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load(&path)
                .with_context(|| format!("failed to load config from {path}"))?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH)
                .with_context(|| format!("failed to load config from {DEFAULT_CONFIG_PATH}"))?,
            Err(_) => Self::default(),
        };

        config.with_overrides(
            std::env::var(MODE_ENV).ok().as_deref(),
            std::env::var(CSV_PATH_ENV).ok().as_deref(),
        )
    }

    pub fn with_overrides(mut self, mode: Option<&str>, csv_path: Option<&str>) -> Result<Self> {
        if let Some(mode) = mode.map(str::trim).filter(|m| !m.is_empty()) {
            self.mode = mode
                .parse()
                .with_context(|| format!("invalid {MODE_ENV} value"))?;
        }
        if let Some(path) = csv_path.map(str::trim).filter(|p| !p.is_empty()) {
            self.csv_path = path.to_string();
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.csv_path.trim().is_empty() {
            anyhow::bail!("csv_path cannot be empty");
        }
        if self.replay.interval_ms == 0 {
            anyhow::bail!("replay.interval_ms must be greater than zero");
        }
        if self.tail.debounce_ms == 0 {
            anyhow::bail!("tail.debounce_ms must be greater than zero");
        }
        if self.tail.watcher_retry_ms == 0 {
            anyhow::bail!("tail.watcher_retry_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn csv_path(&self) -> PathBuf {
        let expanded = shellexpand::tilde(&self.csv_path);
        PathBuf::from(expanded.as_ref())
    }

    pub fn playback_interval(&self) -> Duration {
        Duration::from_millis(self.replay.interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.tail.debounce_ms)
    }

    pub fn watcher_retry(&self) -> Duration {
        Duration::from_millis(self.tail.watcher_retry_ms)
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("invalid server address {}:{}", self.bind, self.port))
    }
}
