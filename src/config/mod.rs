use std::sync::OnceLock;

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use tokio::sync::watch;

mod log_config;
pub use log_config::LogConfig;

pub static CONFIG: OnceLock<GatewayConfig> = OnceLock::new();
static RELOAD_TX: OnceLock<watch::Sender<GatewayConfig>> = OnceLock::new();

/// Loads config once at startup from `config.toml` (or `$APP_CONFIG`) merged
/// with `APP_`-prefixed environment variables over serde defaults, then
/// stashes it in the process-wide static.
pub fn init() {
    let config = load().unwrap_or_else(|e| {
        eprintln!(
            "It looks like your config is invalid. The following error occurred: {e}"
        );
        std::process::exit(1);
    });
    let (tx, _rx) = watch::channel(config.clone());
    RELOAD_TX.set(tx).expect("config reload channel should be set once");
    CONFIG.set(config).expect("config should be set");
}

fn load() -> Result<GatewayConfig, figment::Error> {
    Figment::new()
        .merge(Toml::file(
            Env::var("APP_CONFIG").as_deref().unwrap_or("config.toml"),
        ))
        .merge(Env::prefixed("APP_").global())
        .extract()
}

pub fn get() -> &'static GatewayConfig {
    CONFIG.get().expect("config should be set")
}

/// Subscribe to config change sets published by [`reload`].
pub fn subscribe() -> watch::Receiver<GatewayConfig> {
    RELOAD_TX
        .get()
        .expect("config should be initialized before subscribing")
        .subscribe()
}

/// Re-reads the configuration source and publishes the new value to every
/// subscriber. Returns the new config, or the reload error without touching
/// the currently-served config.
pub fn reload() -> Result<GatewayConfig, figment::Error> {
    let fresh = load()?;
    if let Some(tx) = RELOAD_TX.get() {
        let _ = tx.send(fresh.clone());
    }
    Ok(fresh)
}

#[derive(Deserialize, Clone, Debug)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_http_port")]
    pub listen_http_port: u16,
    #[serde(default = "default_listen_https_port")]
    pub listen_https_port: u16,
    pub domain: Option<String>,
    pub log: LogConfig,
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub neo4j: Neo4jConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct TlsConfig {
    pub cert: String,
    pub key: String,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: usize,
    pub min_size: usize,
    pub max_age_minutes: u64,
    pub max_uses: u64,
    pub health_interval_s: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_size: 2,
            max_age_minutes: 60,
            max_uses: 100,
            health_interval_s: 300,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SessionsConfig {
    pub max: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self { max: 1000 }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub default_ttl_s: u64,
    pub compression_threshold_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl_s: 300,
            compression_threshold_bytes: 1024,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RateConfig {
    pub requests_per_minute: u32,
    pub burst_size: u32,
    pub cleanup_interval_s: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_size: 10,
            cleanup_interval_s: 300,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_s: u64,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_s: 60,
            success_threshold: 2,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct TurnConfig {
    pub deadline_s: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self { deadline_s: 300 }
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct Neo4jConfig {
    pub uri: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

impl Neo4jConfig {
    /// Memory integration is disabled gracefully whenever the password is
    /// absent, rather than failing startup.
    pub fn enabled(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Options for spawning the upstream agent CLI process, mirroring
/// `ClaudeAgentOptions` in `original_source/core/claude_handler.py`
/// (`system_prompt`/`allowed_tools`/`permission_mode`/`cwd` minus the
/// per-session fields, which the pool's connections don't carry — see
/// `crate::turn`'s design note on pool connections being session-agnostic).
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AgentConfig {
    pub command: String,
    pub model: String,
    pub permission_mode: String,
    pub connect_timeout_s: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".into(),
            model: "claude-3-5-sonnet-20241022".into(),
            permission_mode: "bypassPermissions".into(),
            connect_timeout_s: 20,
        }
    }
}

#[allow(dead_code)]
pub fn default_false() -> bool {
    false
}
#[allow(dead_code)]
pub fn default_true() -> bool {
    true
}

fn default_listen_addr() -> String {
    "127.0.0.1".into()
}

fn default_listen_http_port() -> u16 {
    8080
}

fn default_listen_https_port() -> u16 {
    8443
}
