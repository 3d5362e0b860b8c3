use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Public HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub max_concurrency: usize,
    /// Per-request stream timeout, milliseconds.
    pub default_timeout_ms: u64,
    /// How long a request may wait for a concurrency slot, milliseconds.
    pub wait_timeout_ms: u64,
    /// Empty disables bearer authentication.
    pub api_key: String,
    /// Reported as `owned_by` in `/models`.
    pub owner: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_concurrency: 10,
            default_timeout_ms: 60_000,
            wait_timeout_ms: 5_000,
            api_key: String::new(),
            owner: "infergate".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Cluster role settings shared by master and worker sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub enable_cluster: bool,
    /// Empty generates `<hostname>-<8 hex>` at startup.
    pub worker_id: String,
    /// A worker whose last heartbeat is older than this is evicted.
    pub worker_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enable_cluster: true,
            worker_id: String::new(),
            worker_timeout_ms: 30_000,
            heartbeat_interval_ms: 5_000,
        }
    }
}

impl ClusterConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Full node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl NodeConfig {
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.gateway.max_concurrency, 10);
        assert_eq!(cfg.gateway.default_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.gateway.wait_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.cluster.worker_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.cluster.heartbeat_interval(), Duration::from_secs(5));
        assert!(cfg.cluster.enable_cluster);
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: NodeConfig = toml::from_str(
            r#"
            [gateway]
            host = "127.0.0.1"
            port = 9000
            max_concurrency = 4
            default_timeout_ms = 10000
            wait_timeout_ms = 1000
            api_key = "secret"
            owner = "acme"

            [cluster]
            enable_cluster = false
            worker_id = "w1"
            worker_timeout_ms = 5000
            heartbeat_interval_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.gateway.port, 9000);
        assert_eq!(cfg.gateway.api_key, "secret");
        assert!(!cfg.cluster.enable_cluster);
    }
}
