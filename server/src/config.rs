use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Command line options for the chat server.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Print a bearer token for the given user id and exit.
    #[arg(long, value_name = "USER_ID")]
    pub issue_token: Option<uuid::Uuid>,
    /// Display name embedded in an issued token.
    #[arg(long, default_value = "user")]
    pub name: String,
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Directory holding the SQLite journal and generated secrets.
    pub data_dir: PathBuf,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    /// A user without heartbeat for this long is offline.
    pub heartbeat_timeout: Duration,
    pub typing_ttl: Duration,
    /// Minimum gap between re-announcements of an ongoing typing indicator.
    pub typing_debounce: Duration,
    /// Unanswered calls become `no_answer` after this long.
    pub ring_timeout: Duration,
    /// How often expired typing indicators and ringing calls are swept.
    pub sweep_interval: Duration,
    /// Base64 HS256 secret shared with the identity service. Generated and
    /// stored in the data dir when absent.
    pub jwt_secret: Option<String>,
    pub media_token_ttl: Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("data_dir", &self.data_dir)
            .field("logging_enabled", &self.logging_enabled)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("typing_ttl", &self.typing_ttl)
            .field("ring_timeout", &self.ring_timeout)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    presence: FilePresence,
    #[serde(default)]
    typing: FileTyping,
    #[serde(default)]
    calls: FileCalls,
    #[serde(default)]
    auth: FileAuth,
    #[serde(default)]
    media: FileMedia,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize)]
struct FilePresence {
    #[serde(default = "default_heartbeat_timeout")]
    heartbeat_timeout_secs: u64,
}

#[derive(Deserialize)]
struct FileTyping {
    #[serde(default = "default_typing_ttl")]
    ttl_secs: u64,
}

#[derive(Deserialize)]
struct FileCalls {
    #[serde(default = "default_ring_timeout")]
    ring_timeout_secs: u64,
}

#[derive(Deserialize, Default)]
struct FileAuth {
    #[serde(default)]
    jwt_secret: Option<String>,
}

#[derive(Deserialize)]
struct FileMedia {
    #[serde(default = "default_media_ttl")]
    token_ttl_secs: u64,
}

fn default_port() -> u16 {
    8787
}

fn default_logging() -> bool {
    true
}

fn default_heartbeat_timeout() -> u64 {
    60
}

fn default_typing_ttl() -> u64 {
    5
}

fn default_ring_timeout() -> u64 {
    45
}

fn default_media_ttl() -> u64 {
    3600
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Default for FilePresence {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
        }
    }
}

impl Default for FileTyping {
    fn default() -> Self {
        Self {
            ttl_secs: default_typing_ttl(),
        }
    }
}

impl Default for FileCalls {
    fn default() -> Self {
        Self {
            ring_timeout_secs: default_ring_timeout(),
        }
    }
}

impl Default for FileMedia {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_media_ttl(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Defaults for the given bind address and data dir, without reading any
    /// file or environment.
    pub fn new(bind: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind: bind.into(),
            data_dir: data_dir.into(),
            logging_enabled: default_logging(),
            heartbeat_timeout: Duration::from_secs(default_heartbeat_timeout()),
            typing_ttl: Duration::from_secs(default_typing_ttl()),
            typing_debounce: Duration::from_secs(2),
            ring_timeout: Duration::from_secs(default_ring_timeout()),
            sweep_interval: Duration::from_secs(1),
            jwt_secret: None,
            media_token_ttl: Duration::from_secs(default_media_ttl()),
        }
    }

    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("CHAT_SERVER_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/chat_server.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str::<FileConfig>(&contents).context("invalid config file")?
            }
            Err(_) => FileConfig::default(),
        };
        let mut port = file_cfg.server.port;
        let mut logging = file_cfg.logging.enabled;
        let mut jwt_secret = file_cfg.auth.jwt_secret;

        // environment overrides
        if let Some(p) = env_parse::<u16>("CHAT_SERVER_PORT") {
            port = p;
        }
        if let Some(l) = env_parse::<bool>("CHAT_SERVER_LOGGING") {
            logging = l;
        }
        if let Ok(secret) = std::env::var("CHAT_JWT_SECRET") {
            jwt_secret = Some(secret);
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        // validate port range
        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }
        if file_cfg.typing.ttl_secs == 0 || file_cfg.presence.heartbeat_timeout_secs == 0 {
            anyhow::bail!("timeouts must be positive");
        }

        // bind address precedence for host override
        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        let typing_ttl = Duration::from_secs(file_cfg.typing.ttl_secs);
        Ok(Self {
            bind,
            data_dir,
            logging_enabled: logging,
            heartbeat_timeout: Duration::from_secs(file_cfg.presence.heartbeat_timeout_secs),
            typing_ttl,
            typing_debounce: typing_ttl / 2,
            ring_timeout: Duration::from_secs(file_cfg.calls.ring_timeout_secs),
            sweep_interval: Duration::from_secs(1),
            jwt_secret,
            media_token_ttl: Duration::from_secs(file_cfg.media.token_ttl_secs),
        })
    }
}

/// Determine the default data directory for the server.
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "chat_server")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./chat_server_data"))
}
