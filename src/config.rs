use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::CacheServerResult;

/// A custom (user-configured) upstream candidate, always ranked ahead of
/// pool-derived candidates in the remote controller's candidate list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomServer {
    pub name: String,
    pub ip: String,
    pub port: u16,
}

/// How this server reaches upstream, mirroring the enabled-remote choice an
/// operator makes: a shared pool, a specific server inside a pool, an
/// explicit custom list, or no upstream at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EnabledRemote {
    None,
    Pool { pool_id: u64 },
    PoolServer { pool_id: u64, server_id: u64 },
    Custom,
}

impl Default for EnabledRemote {
    fn default() -> Self {
        EnabledRemote::None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub remote: RemoteConfig,
    pub shared_directory: SharedDirectoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Cache-root folder (contains `cache.dat` and the per-entry directories).
    pub folder: PathBuf,
    pub max_storage_size_bytes: u64,
    pub max_items_in_memory: usize,
    pub auto_save_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub listen_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub enabled: EnabledRemote,
    pub custom_servers: Vec<CustomServer>,
    pub connect_timeout_secs: u64,
    pub reattempt_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedDirectoryConfig {
    pub base_url: Option<String>,
    pub refresh_interval_secs: u64,
    pub own_server_name: String,
    /// This server's id in the shared directory, once registered.
    pub own_server_id: Option<u64>,
    pub own_pool_id: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                folder: PathBuf::from("./cache"),
                max_storage_size_bytes: 10 * 1024 * 1024 * 1024, // 10 GiB
                max_items_in_memory: 64,
                auto_save_timeout_ms: 30_000,
            },
            network: NetworkConfig { listen_port: 7654 },
            remote: RemoteConfig {
                enabled: EnabledRemote::None,
                custom_servers: Vec::new(),
                connect_timeout_secs: 1,
                reattempt_wait_secs: 5,
            },
            shared_directory: SharedDirectoryConfig {
                base_url: None,
                refresh_interval_secs: 3,
                own_server_name: "acserver".to_string(),
                own_server_id: None,
                own_pool_id: None,
            },
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults.
    pub fn load_or_default(config_path: Option<PathBuf>) -> CacheServerResult<Self> {
        if let Some(path) = config_path {
            if path.exists() {
                let config_str = std::fs::read_to_string(&path)?;
                let config: Config = toml::from_str(&config_str)?;
                tracing::info!("loaded configuration from {:?}", path);
                return Ok(config);
            }
        }

        tracing::info!("using default configuration");
        Ok(Config::default())
    }

    /// Save configuration to file.
    pub fn save(&self, config_path: &PathBuf) -> CacheServerResult<()> {
        let config_str = toml::to_string_pretty(self)?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(config_path, config_str)?;
        tracing::info!("configuration saved to {:?}", config_path);
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.connect_timeout_secs)
    }

    pub fn reattempt_wait(&self) -> Duration {
        Duration::from_secs(self.remote.reattempt_wait_secs)
    }

    pub fn shared_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.shared_directory.refresh_interval_secs)
    }

    pub fn auto_save_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.auto_save_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = Config::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.network.listen_port, cfg.network.listen_port);
        assert_eq!(back.storage.max_storage_size_bytes, cfg.storage.max_storage_size_bytes);
    }

    #[test]
    fn load_or_default_falls_back_when_path_missing() {
        let cfg = Config::load_or_default(Some(PathBuf::from("/nonexistent/path/acserver.toml"))).unwrap();
        assert_eq!(cfg.network.listen_port, Config::default().network.listen_port);
    }
}
