//! Service configuration
//!
//! Layered lowest to highest: built-in defaults, the YAML file, `ARQUEBUS_*`
//! environment variables, then command line flags.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::attack::AttackConfig;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "ARQUEBUS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value `{value}` for {key}")]
    InvalidEnv { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Arquebus - scheduled HTTP load testing service
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "arquebus", author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to a YAML config file
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// HTTP API port
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// SQLite database path, ":memory:" for a throwaway store
    #[arg(long = "database")]
    pub database: Option<String>,

    /// Log level or filter directive, e.g. "debug" or "arquebus=trace"
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Interval between scheduler ticks, e.g. "60s"
    #[arg(long = "interval")]
    pub interval: Option<humantime::Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub timer: TimerConfig,
    pub attack: AttackSettings,
    /// Upper bound on graceful shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
            timer: TimerConfig::default(),
            attack: AttackSettings::default(),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "arquebus.db".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.path == ":memory:"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Capacity in bytes
    pub size: u64,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: 1_000_000,
            ttl: crate::cache::DEFAULT_TTL,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Time between ticks
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Wait before the first tick
    #[serde(with = "humantime_serde")]
    pub startup_delay: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            startup_delay: Duration::from_secs(5),
        }
    }
}

/// File form of [`AttackConfig`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttackSettings {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub keepalive: bool,
    pub connections: usize,
    pub redirects: i32,
    pub insecure: bool,
    pub http2: bool,
    pub max_in_flight: Option<usize>,
    #[serde(with = "humantime_serde")]
    pub cancel_grace: Duration,
}

impl Default for AttackSettings {
    fn default() -> Self {
        AttackConfig::default().into()
    }
}

impl From<AttackConfig> for AttackSettings {
    fn from(config: AttackConfig) -> Self {
        Self {
            timeout: config.timeout,
            keepalive: config.keepalive,
            connections: config.connections,
            redirects: config.redirects,
            insecure: config.insecure,
            http2: config.http2,
            max_in_flight: config.max_in_flight,
            cancel_grace: config.cancel_grace,
        }
    }
}

impl From<&AttackSettings> for AttackConfig {
    fn from(settings: &AttackSettings) -> Self {
        Self {
            timeout: settings.timeout,
            keepalive: settings.keepalive,
            connections: settings.connections,
            redirects: settings.redirects,
            insecure: settings.insecure,
            http2: settings.http2,
            max_in_flight: settings.max_in_flight,
            cancel_grace: settings.cancel_grace,
        }
    }
}

impl Config {
    /// Resolve the effective configuration for a command line
    pub fn load(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        // An empty document means all defaults
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `ARQUEBUS_*` overrides using `lookup` to read variables
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            let key = format!("{ENV_PREFIX}_{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = var("PORT") {
            self.server.port = value
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { key, value })?;
        }
        if let Some((_, value)) = var("BIND") {
            self.server.bind = value;
        }
        if let Some((_, value)) = var("DATABASE") {
            self.database.path = value;
        }
        if let Some((_, value)) = var("LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some((key, value)) = var("CACHE_SIZE") {
            self.cache.size = value
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { key, value })?;
        }
        if let Some((key, value)) = var("TIMER_INTERVAL") {
            self.timer.interval = humantime::parse_duration(&value)
                .map_err(|_| ConfigError::InvalidEnv { key, value })?;
        }
        Ok(())
    }

    fn apply_args(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(database) = &args.database {
            self.database.path = database.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if let Some(interval) = args.interval {
            self.timer.interval = interval.into();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timer.interval.is_zero() {
            return Err(ConfigError::Invalid("timer.interval must be greater than zero".into()));
        }
        if self.cache.size == 0 {
            return Err(ConfigError::Invalid("cache.size must be greater than zero".into()));
        }
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::Invalid("database.path must not be empty".into()));
        }
        if self.attack.max_in_flight == Some(0) {
            return Err(ConfigError::Invalid("attack.max_in_flight must be greater than zero".into()));
        }
        Ok(())
    }
}
