//! Relay configuration: TOML file + CLI overrides.
//!
//! The resolved [`RelayConfig`] is built once at startup and handed to the
//! store, authenticator, upstream connector and reporter factories. Nothing
//! reads configuration after that.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use zone_core::{DeviceBinding, ZoneError, ZoneResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub monitor: MonitorSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub auth_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
            max_sessions: default_max_sessions(),
            liveness_interval_ms: default_liveness_interval_ms(),
            auth_timeout_secs: default_timeout_secs(),
        }
    }
}

/// `[upstream]` section: the device event broker.
#[derive(Clone, Deserialize)]
pub struct UpstreamSection {
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            org: String::new(),
            api_key: String::new(),
            auth_token: String::new(),
            host: None,
            port: default_mqtt_port(),
            tls: true,
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_timeout_secs(),
        }
    }
}

impl fmt::Debug for UpstreamSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamSection")
            .field("org", &self.org)
            .field("api_key", &self.api_key)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// Which credential store backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Couch,
}

/// A registration seeded into the in-memory store.
#[derive(Clone, Deserialize)]
pub struct UserSeed {
    pub identifier: String,
    pub secret: String,
    pub device: DeviceBinding,
}

impl fmt::Debug for UserSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSeed")
            .field("identifier", &self.identifier)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// `[store]` section: where credential records live.
#[derive(Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub users: Vec<UserSeed>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: None,
            database: default_database(),
            username: String::new(),
            password: String::new(),
            timeout_secs: default_timeout_secs(),
            users: Vec::new(),
        }
    }
}

impl fmt::Debug for StoreSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSection")
            .field("backend", &self.backend)
            .field("url", &self.url)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("users", &self.users.len())
            .finish_non_exhaustive()
    }
}

/// `[monitor]` section: where unexpected failures are reported.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_source")]
    pub source: String,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            webhook_url: None,
            source: default_source(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_path() -> String {
    "/websocket".to_string()
}
fn default_max_sessions() -> usize {
    1000
}
fn default_liveness_interval_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_mqtt_port() -> u16 {
    8883
}
fn default_keep_alive_secs() -> u64 {
    60
}
fn default_database() -> String {
    "iotfzonesample".to_string()
}
fn default_source() -> String {
    "zone-relay".to_string()
}
fn default_true() -> bool {
    true
}

/// CLI values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub max_sessions: Option<usize>,
    pub liveness_interval_ms: Option<u64>,
}

/// Resolved upstream broker settings.
#[derive(Clone)]
pub struct UpstreamConfig {
    pub org: String,
    pub api_key: String,
    pub auth_token: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("org", &self.org)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// Resolved relay configuration (CLI overrides applied, durations typed).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub max_sessions: usize,
    pub liveness_interval: Duration,
    pub auth_timeout: Duration,
    pub upstream: UpstreamConfig,
    pub store: StoreSection,
    pub monitor: MonitorSection,
}

impl RelayConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: CliOverrides) -> ZoneResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    ConfigFile::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed file with CLI overrides.
    pub fn resolve(file: ConfigFile, overrides: CliOverrides) -> ZoneResult<Self> {
        let path = overrides.path.unwrap_or(file.server.path);
        if !path.starts_with('/') {
            return Err(ZoneError::Config(format!(
                "server.path must start with '/': {path}"
            )));
        }

        let liveness_ms = overrides
            .liveness_interval_ms
            .unwrap_or(file.server.liveness_interval_ms);
        if liveness_ms == 0 {
            return Err(ZoneError::Config(
                "server.liveness_interval_ms must be positive".into(),
            ));
        }
        if file.server.auth_timeout_secs == 0 {
            return Err(ZoneError::Config(
                "server.auth_timeout_secs must be positive".into(),
            ));
        }
        if file.upstream.connect_timeout_secs == 0 {
            return Err(ZoneError::Config(
                "upstream.connect_timeout_secs must be positive".into(),
            ));
        }

        let upstream = file.upstream;
        let upstream_host = upstream
            .host
            .clone()
            .unwrap_or_else(|| format!("{}.messaging.internetofthings.ibmcloud.com", upstream.org));

        Ok(Self {
            host: overrides.host.unwrap_or(file.server.host),
            port: overrides.port.unwrap_or(file.server.port),
            path,
            max_sessions: overrides.max_sessions.unwrap_or(file.server.max_sessions),
            liveness_interval: Duration::from_millis(liveness_ms),
            auth_timeout: Duration::from_secs(file.server.auth_timeout_secs),
            upstream: UpstreamConfig {
                org: upstream.org,
                api_key: upstream.api_key,
                auth_token: upstream.auth_token,
                host: upstream_host,
                port: upstream.port,
                tls: upstream.tls,
                keep_alive: Duration::from_secs(upstream.keep_alive_secs),
                connect_timeout: Duration::from_secs(upstream.connect_timeout_secs),
            },
            store: file.store,
            monitor: file.monitor,
        })
    }

    /// `host:port` string for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ConfigFile {
    /// Parse config TOML.
    pub fn parse(content: &str) -> ZoneResult<Self> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| ZoneError::Config(format!("config parse error: {e}")))
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
