use anyhow::{Context, Result};
use serde::Deserialize;

// Re-export config types living next to the code they tune
pub use crate::oauth::ProviderEndpoints;
pub use crate::store::RefreshPolicy;

/// Complete Stagepass configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StagepassConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub provider: ProviderEndpoints,
    #[serde(default)]
    pub refresh: RefreshPolicy,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally reachable base URL; the OAuth redirect URI derives from it
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_public_base_url() -> String {
    "http://localhost:8000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_base_url: default_public_base_url(),
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String {
    "stagepass.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Session table configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Sessions idle longer than this are evicted (seconds)
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
    /// How often the sweep task runs (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_session_ttl() -> u64 {
    // 30 days: MCP clients reconnect rarely
    2_592_000
}

fn default_sweep_interval() -> u64 {
    3600
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// OAuth state parameter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    /// How long an issued state stays valid (seconds)
    #[serde(default = "default_state_ttl")]
    pub ttl_secs: i64,
    /// How often consumed-nonce records are pruned (seconds)
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
}

fn default_state_ttl() -> i64 {
    600
}

fn default_prune_interval() -> u64 {
    300
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_state_ttl(),
            prune_interval_secs: default_prune_interval(),
        }
    }
}

/// Shared fallback token configuration. Disabled by default; enabling it
/// reintroduces a deliberately narrow single-session compatibility path.
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Idle seconds before the fallback lease may move to another session
    #[serde(default = "default_lease_idle")]
    pub lease_idle_secs: i64,
}

fn default_lease_idle() -> i64 {
    60
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lease_idle_secs: default_lease_idle(),
        }
    }
}

impl Default for StagepassConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            provider: ProviderEndpoints::default(),
            refresh: RefreshPolicy::default(),
            sessions: SessionConfig::default(),
            state: StateConfig::default(),
            fallback: FallbackConfig::default(),
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &str) -> Result<StagepassConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: StagepassConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}
