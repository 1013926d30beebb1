// Layered application configuration
//
// Sources, lowest precedence first:
// 1. Built-in defaults (serde defaults below)
// 2. `cipherdash.toml` in the working directory, or an explicit file
// 3. Environment variables `CIPHERDASH__<FIELD>` (nested with `__`)

use crate::deployments::{ChainDeployment, Deployments};
use crate::errors::ConfigError;
use crate::types::{ChainId, LOCAL_CHAIN_ID, MAINNET_CHAIN_ID, SEPOLIA_CHAIN_ID};
use config::{Config, Environment, File, FileFormat};
use ethers_core::types::Address;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_CONFIG_FILE: &str = "cipherdash";
pub const ENV_PREFIX: &str = "CIPHERDASH";

/// Default validity window of a decryption signature.
pub const DEFAULT_SIGNATURE_DURATION_DAYS: u64 = 365;

/// Most records a session reads when listing elections or rating entries.
pub const DEFAULT_LIST_LIMIT: u64 = 256;

/// One JSON-RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: ChainId,
    pub name: String,
    pub rpc_url: String,
}

/// Per-chain address override; missing fields keep the built-in value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub chain_name: Option<String>,
    pub fhe_counter: Option<String>,
    pub anonymous_election: Option<String>,
    pub rating_system: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub poll_interval_secs: u64,
    pub scan_blocks: u64,
    pub max_transactions: usize,
    pub block_time_window: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        DashboardConfig {
            poll_interval_secs: 10,
            scan_blocks: 100,
            max_transactions: 20,
            block_time_window: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub walletconnect_project_id: String,
    pub networks: Vec<NetworkConfig>,
    /// Keyed by decimal chain id.
    pub deployments: BTreeMap<String, DeploymentConfig>,
    pub signature_duration_days: u64,
    /// Where decryption signatures are persisted; memory only when unset.
    pub storage_path: Option<PathBuf>,
    /// Upper bound on records scanned by list operations.
    pub list_limit: u64,
    /// Seconds before a cached contract proxy is rebuilt; never when unset.
    pub contract_ttl_secs: Option<u64>,
    pub dashboard: DashboardConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            walletconnect_project_id: "fhe-crypto-demo".to_string(),
            networks: vec![
                NetworkConfig {
                    chain_id: LOCAL_CHAIN_ID,
                    name: "Hardhat Local".to_string(),
                    rpc_url: "http://localhost:8545".to_string(),
                },
                NetworkConfig {
                    chain_id: SEPOLIA_CHAIN_ID,
                    name: "Sepolia".to_string(),
                    rpc_url: "https://rpc.sepolia.org".to_string(),
                },
                NetworkConfig {
                    chain_id: MAINNET_CHAIN_ID,
                    name: "Ethereum".to_string(),
                    rpc_url: "https://cloudflare-eth.com".to_string(),
                },
            ],
            deployments: BTreeMap::new(),
            signature_duration_days: DEFAULT_SIGNATURE_DURATION_DAYS,
            storage_path: None,
            list_limit: DEFAULT_LIST_LIMIT,
            contract_ttl_secs: None,
            dashboard: DashboardConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load defaults, then the config file, then the environment.
    ///
    /// With `path == None` a missing `cipherdash.toml` is not an error; an
    /// explicit path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config: AppConfig = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        debug!("Loaded configuration with {} networks", config.networks.len());
        Ok(config)
    }

    /// Parse a TOML document layered over the defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signature_duration_days == 0 {
            return Err(ConfigError::InvalidValue {
                field: "signature_duration_days".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        if self.list_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "list_limit".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        if self.contract_ttl_secs == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "contract_ttl_secs".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        if self.dashboard.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "dashboard.poll_interval_secs".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        // Surface bad addresses at load time rather than on first use
        self.deployments()?;
        Ok(())
    }

    pub fn network(&self, chain_id: ChainId) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.chain_id == chain_id)
    }

    pub fn rpc_url(&self, chain_id: ChainId) -> Option<&str> {
        self.network(chain_id).map(|n| n.rpc_url.as_str())
    }

    /// Built-in table with the configured overrides applied.
    pub fn deployments(&self) -> Result<Deployments, ConfigError> {
        let mut table = Deployments::builtin();

        for (key, entry) in &self.deployments {
            let chain_id: ChainId = key.parse().map_err(|_| ConfigError::InvalidChainId(key.clone()))?;

            let mut deployment = table
                .get(chain_id)
                .cloned()
                .unwrap_or_else(|| ChainDeployment::undeployed(format!("chain {}", chain_id)));

            if let Some(name) = &entry.chain_name {
                deployment.chain_name = name.clone();
            }
            if let Some(addr) = &entry.fhe_counter {
                deployment.fhe_counter = parse_address(&format!("deployments.{}.fhe_counter", key), addr)?;
            }
            if let Some(addr) = &entry.anonymous_election {
                deployment.anonymous_election =
                    parse_address(&format!("deployments.{}.anonymous_election", key), addr)?;
            }
            if let Some(addr) = &entry.rating_system {
                deployment.rating_system = parse_address(&format!("deployments.{}.rating_system", key), addr)?;
            }

            table.insert(chain_id, deployment);
        }

        Ok(table)
    }
}

fn parse_address(field: &str, value: &str) -> Result<Address, ConfigError> {
    Address::from_str(value).map_err(|_| ConfigError::InvalidAddress {
        field: field.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployments::{ContractKind, LOCAL_FHE_COUNTER};
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.signature_duration_days, 365);
        assert_eq!(config.dashboard.poll_interval_secs, 10);
        assert_eq!(config.list_limit, DEFAULT_LIST_LIMIT);
        assert_eq!(config.rpc_url(LOCAL_CHAIN_ID), Some("http://localhost:8545"));
        assert!(config.rpc_url(137).is_none());

        let table = config.deployments().unwrap();
        assert_eq!(
            table.resolve(ContractKind::FheCounter, Some(LOCAL_CHAIN_ID)).address,
            Some(LOCAL_FHE_COUNTER)
        );
    }

    #[test]
    fn test_toml_overrides_deployment() {
        let config = AppConfig::from_toml_str(
            r#"
            signature_duration_days = 7

            list_limit = 32

            [deployments.11155111]
            fhe_counter = "0x1111111111111111111111111111111111111111"
            rating_system = "0x2222222222222222222222222222222222222222"

            [dashboard]
            poll_interval_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.signature_duration_days, 7);
        assert_eq!(config.dashboard.poll_interval_secs, 30);
        assert_eq!(config.dashboard.scan_blocks, 100);

        let table = config.deployments().unwrap();
        let counter = table.resolve(ContractKind::FheCounter, Some(SEPOLIA_CHAIN_ID));
        assert_eq!(counter.address, Some(Address::repeat_byte(0x11)));
        assert_eq!(counter.chain_name.as_deref(), Some("Sepolia"));
        assert!(!table.is_deployed(ContractKind::AnonymousElection, Some(SEPOLIA_CHAIN_ID)));
        assert_eq!(
            table.resolve(ContractKind::RatingSystem, Some(SEPOLIA_CHAIN_ID)).address,
            Some(Address::repeat_byte(0x22))
        );
        assert_eq!(config.list_limit, 32);
    }

    #[test]
    fn test_invalid_address_rejected() {
        let result = AppConfig::from_toml_str(
            r#"
            [deployments.31337]
            fhe_counter = "not-an-address"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidAddress { .. })));
    }

    #[test]
    fn test_zero_duration_rejected() {
        let result = AppConfig::from_toml_str("signature_duration_days = 0");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_zero_list_limit_rejected() {
        let result = AppConfig::from_toml_str("list_limit = 0");
        assert!(matches!(result, Err(ConfigError::InvalidValue { ref field, .. }) if field == "list_limit"));
    }

    #[test]
    fn test_contract_ttl() {
        assert_eq!(AppConfig::default().contract_ttl_secs, None);
        let config = AppConfig::from_toml_str("contract_ttl_secs = 600").unwrap();
        assert_eq!(config.contract_ttl_secs, Some(600));
        let result = AppConfig::from_toml_str("contract_ttl_secs = 0");
        assert!(matches!(result, Err(ConfigError::InvalidValue { ref field, .. }) if field == "contract_ttl_secs"));
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "walletconnect_project_id = \"abc123\"").unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.walletconnect_project_id, "abc123");
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let result = AppConfig::load(Some(Path::new("/nonexistent/cipherdash-test.toml")));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
