//! Application configuration: YAML file plus environment overrides.
//!
//! ```yaml
//! database: ./recycle.db
//! evm:
//!   rpc_url: ws://127.0.0.1:8545
//!   contract_address: "0x5FbDB2315678afecb367f032d93F642f64180aa3"
//! indexer:
//!   start_block: 0
//!   resync_on_start: true
//! log:
//!   level: info
//!   components:
//!     recycleindex-core: debug
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use recycleindex_core::IndexerConfig;
use recycleindex_evm::EvmFeedConfig;

use crate::logging::LogConfig;

pub const ENV_RPC_URL: &str = "RECYCLEINDEX_RPC_URL";
pub const ENV_CONTRACT: &str = "RECYCLEINDEX_CONTRACT";
pub const ENV_DATABASE: &str = "RECYCLEINDEX_DATABASE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// SQLite file path or `sqlite:` URL.
    pub database: String,
    pub evm: EvmFeedConfig,
    pub indexer: IndexerConfig,
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: "recycleindex.db".into(),
            evm: EvmFeedConfig::default(),
            indexer: IndexerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from `path` (defaults when `None`), then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Self::from_yaml(&text)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        Ok(config.with_env(|key| std::env::var(key).ok()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Override fields from variables resolved by `lookup`.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENV_RPC_URL) {
            self.evm.rpc_url = url;
        }
        if let Some(address) = lookup(ENV_CONTRACT) {
            self.evm.contract_address = address;
        }
        if let Some(database) = lookup(ENV_DATABASE) {
            self.database = database;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = AppConfig::from_yaml(
            r#"
evm:
  contract_address: "0x5FbDB2315678afecb367f032d93F642f64180aa3"
indexer:
  start_block: 42
  toxic_retry:
    max_attempts: 3
log:
  json: true
"#,
        )
        .unwrap();

        assert_eq!(config.database, "recycleindex.db");
        assert_eq!(config.evm.rpc_url, "ws://127.0.0.1:8545");
        assert_eq!(config.indexer.start_block, 42);
        assert_eq!(config.indexer.toxic_retry.max_attempts, 3);
        assert_eq!(config.indexer.toxic_retry.delay_ms, 1_000);
        assert!(config.log.json);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_RPC_URL, "wss://node.example/ws"),
            (ENV_DATABASE, "sqlite::memory:"),
        ]
        .into_iter()
        .collect();

        let config = AppConfig::default().with_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.evm.rpc_url, "wss://node.example/ws");
        assert_eq!(config.database, "sqlite::memory:");
        assert!(config.evm.contract_address.is_empty());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(AppConfig::load(Some(Path::new("/nonexistent/recycleindex.yaml"))).is_err());
    }
}
