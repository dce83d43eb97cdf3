//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.caduceus/config.json`) and environment.
//! It is read once at startup and handed to the gateway; nothing is reconfigured at runtime.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder left in example configs; a token containing it is treated as unset.
const PLACEHOLDER_MARKER: &str = "CHANGE-ME";

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Root of the orders tree and the event log (default ~/.caduceus/work).
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// Identity store and token settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Channel settings (Telegram, web socket).
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Filesystem bridge timing.
    #[serde(default)]
    pub executor: ExecutorConfig,
}

/// Identity store path and token signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// User store file. Defaults to `users.json` next to the config file.
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    /// Secret for signing tokens. Overridden by CADUCEUS_AUTH_SECRET env.
    #[serde(default)]
    pub secret: Option<String>,

    /// Token lifetime in hours (default 24).
    #[serde(default = "default_token_expiry_hours")]
    pub token_expiry_hours: u64,
}

fn default_token_expiry_hours() -> u64 {
    24
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            secret: None,
            token_expiry_hours: default_token_expiry_hours(),
        }
    }
}

/// Per-channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramChannelConfig,
    #[serde(default)]
    pub web: WebChannelConfig,
}

/// Telegram channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannelConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// Telegram user ids allowed to send orders. Users linked in the identity store are allowed too.
    #[serde(default)]
    pub authorized_users: Vec<i64>,
    /// Bot API base URL (default https://api.telegram.org). Overridden by TELEGRAM_API_BASE env.
    pub api_base: Option<String>,
}

/// Web socket channel config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_web_bind")]
    pub bind: String,
    /// Port for login and WebSocket (default 8080).
    #[serde(default = "default_web_port")]
    pub port: u16,
    /// Mark the auth cookie Secure (set when served behind TLS).
    #[serde(default)]
    pub secure_cookies: bool,
}

fn default_web_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_web_port() -> u16 {
    8080
}

impl Default for WebChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_web_bind(),
            port: default_web_port(),
            secure_cookies: false,
        }
    }
}

/// Order bridge timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    /// Give up waiting for a result after this many seconds (default 180).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// How often to look for the result artifact (default 1000 ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Interval between worker heartbeat markers (default 60 s).
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// A claim with no liveness for this long is reported as orphaned (default 300 s).
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,
}

fn default_timeout_secs() -> u64 {
    180
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

fn default_orphan_grace_secs() -> u64 {
    300
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            orphan_grace_secs: default_orphan_grace_secs(),
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config. Placeholder tokens resolve to None.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    non_empty_env("TELEGRAM_BOT_TOKEN")
        .or_else(|| non_empty(config.channels.telegram.bot_token.as_ref()))
        .filter(|t| !t.contains(PLACEHOLDER_MARKER))
}

/// Resolve the Telegram API base: env TELEGRAM_API_BASE overrides config.
pub fn resolve_telegram_api_base(config: &Config) -> Option<String> {
    non_empty_env("TELEGRAM_API_BASE").or_else(|| non_empty(config.channels.telegram.api_base.as_ref()))
}

/// Resolve the token signing secret: env CADUCEUS_AUTH_SECRET overrides config.
pub fn resolve_auth_secret(config: &Config) -> Option<String> {
    let secret = non_empty_env("CADUCEUS_AUTH_SECRET").or_else(|| non_empty(config.auth.secret.as_ref()));
    if let Some(ref s) = secret {
        if s.contains(PLACEHOLDER_MARKER) {
            log::warn!("auth secret contains a placeholder value; tokens will be insecure");
        }
    }
    secret
}

/// Token lifetime from `auth.tokenExpiryHours`. Zero or values chrono cannot represent are
/// config errors.
pub fn resolve_token_ttl(config: &Config) -> Result<chrono::Duration> {
    let hours = config.auth.token_expiry_hours;
    if hours == 0 {
        anyhow::bail!("auth.tokenExpiryHours must be at least 1");
    }
    i64::try_from(hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .with_context(|| format!("auth.tokenExpiryHours out of range: {}", hours))
}

/// Directory containing the config file (falls back to ".").
pub fn config_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf()
}

/// Resolve the identity store file: `auth.storePath` if set (relative to the config dir), else `users.json` beside the config.
pub fn resolve_store_path(config: &Config, config_path: &Path) -> PathBuf {
    match &config.auth.store_path {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                p.clone()
            } else {
                config_dir(config_path).join(p)
            }
        }
        _ => config_dir(config_path).join("users.json"),
    }
}

/// Resolve the work directory: `workDir` if set (relative to the config dir), else ~/.caduceus/work.
pub fn resolve_work_dir(config: &Config, config_path: &Path) -> PathBuf {
    match &config.work_dir {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                config_dir(config_path).join(d)
            }
        }
        _ => config_dir(config_path).join("work"),
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CADUCEUS_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".caduceus").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path or the default (CADUCEUS_CONFIG_PATH, ~/.caduceus/config.json).
/// Missing file => default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
