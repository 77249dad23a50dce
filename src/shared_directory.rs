//! Client for the shared pool/server directory that the remote controller
//! consults to derive upstream candidates. Only the HTTP/JSON shapes this
//! crate consumes are modeled -- registration into the directory is a
//! separate, explicit action, not part of the periodic refresh.

use serde::{Deserialize, Serialize};

use crate::config::{CustomServer, EnabledRemote};
use crate::error::{CacheServerError, CacheServerResult};

#[derive(Debug, Clone, Deserialize)]
pub struct PoolEntry {
    pub key: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SharedServerEntry {
    pub key: String,
    #[serde(rename = "poolKey")]
    pub pool_key: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
struct RegisterRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct RegisterResponse {
    key: String,
}

/// Parse a `{"pools": [...]}` body; a missing or malformed array is logged
/// and treated as empty rather than failing the refresh.
pub fn parse_pools(body: &str) -> Vec<PoolEntry> {
    parse_named_array(body, "pools")
}

/// Parse a `{"shared servers": [...]}` body with the same tolerant rules.
pub fn parse_servers(body: &str) -> Vec<SharedServerEntry> {
    parse_named_array(body, "shared servers")
}

fn parse_named_array<T: for<'de> Deserialize<'de>>(body: &str, field: &str) -> Vec<T> {
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!("failed to parse shared directory response: {}", e);
            return Vec::new();
        }
    };
    match value.get(field) {
        Some(array) => serde_json::from_value(array.clone()).unwrap_or_else(|e| {
            tracing::error!("malformed '{}' array in shared directory response: {}", field, e);
            Vec::new()
        }),
        None => {
            tracing::error!("shared directory response missing '{}'", field);
            Vec::new()
        }
    }
}

/// Resolve the effective candidate list from the configured remote mode
/// against a freshly fetched pool/server directory. `Pool`/`PoolServer`
/// modes only yield candidates while their `pool_id` still appears in
/// `pools` -- a pool that's been deleted upstream drops its servers even
/// if a stale `SharedServerEntry` for it is still floating around.
pub fn candidates_for(
    enabled: &EnabledRemote,
    custom_servers: &[CustomServer],
    pools: &[PoolEntry],
    servers: &[SharedServerEntry],
) -> Vec<CustomServer> {
    match enabled {
        EnabledRemote::None => Vec::new(),
        EnabledRemote::Custom => custom_servers.to_vec(),
        EnabledRemote::Pool { pool_id } => {
            let pool_key = pool_id.to_string();
            if !pools.iter().any(|p| p.key == pool_key) {
                return Vec::new();
            }
            servers
                .iter()
                .filter(|s| s.pool_key == pool_key)
                .map(to_custom_server)
                .collect()
        }
        EnabledRemote::PoolServer { pool_id, server_id } => {
            let pool_key = pool_id.to_string();
            if !pools.iter().any(|p| p.key == pool_key) {
                return Vec::new();
            }
            let key = server_id.to_string();
            servers
                .iter()
                .find(|s| s.key == key)
                .map(to_custom_server)
                .into_iter()
                .collect()
        }
    }
}

fn to_custom_server(entry: &SharedServerEntry) -> CustomServer {
    CustomServer {
        name: entry.name.clone(),
        ip: entry.ip.clone(),
        port: entry.port,
    }
}

pub struct SharedDirectoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl SharedDirectoryClient {
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    pub async fn fetch_pools(&self) -> CacheServerResult<Vec<PoolEntry>> {
        let body = self
            .http
            .get(self.url("pools"))
            .send()
            .await
            .map_err(|e| CacheServerError::SharedDirectory(e.to_string()))?
            .text()
            .await
            .map_err(|e| CacheServerError::SharedDirectory(e.to_string()))?;
        Ok(parse_pools(&body))
    }

    pub async fn fetch_servers(&self) -> CacheServerResult<Vec<SharedServerEntry>> {
        let body = self
            .http
            .get(self.url("servers"))
            .send()
            .await
            .map_err(|e| CacheServerError::SharedDirectory(e.to_string()))?
            .text()
            .await
            .map_err(|e| CacheServerError::SharedDirectory(e.to_string()))?;
        Ok(parse_servers(&body))
    }

    /// Register this server into the pool directory. An explicit user
    /// action, never called by the periodic refresh.
    pub async fn register(&self, server_name: &str) -> CacheServerResult<u64> {
        let response: RegisterResponse = self
            .http
            .post(self.url("register"))
            .json(&RegisterRequest { name: server_name })
            .send()
            .await
            .map_err(|e| CacheServerError::SharedDirectory(e.to_string()))?
            .json()
            .await
            .map_err(|e| CacheServerError::SharedDirectory(e.to_string()))?;
        response
            .key
            .parse()
            .map_err(|_| CacheServerError::SharedDirectory(format!("non-numeric server key {:?}", response.key)))
    }
}
