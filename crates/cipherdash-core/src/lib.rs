//! Core data model shared by every cipherdash crate: ciphertext handles,
//! decrypted values, staleness tokens, the per-chain deployment table,
//! layered configuration and election and rating input validation.

pub mod clock;
pub mod config;
pub mod deployments;
pub mod errors;
pub mod types;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock, SECONDS_PER_DAY};
pub use config::{AppConfig, DashboardConfig, NetworkConfig, DEFAULT_LIST_LIMIT};
pub use deployments::{
    ChainDeployment, ContractInfo, ContractKind, Deployments, LOCAL_ANONYMOUS_ELECTION, LOCAL_FHE_COUNTER,
    LOCAL_RATING_SYSTEM,
};
pub use errors::{ConfigError, ValidationError};
pub use types::{
    address_key, ChainId, CiphertextHandle, ClearValue, StalenessToken, LOCAL_CHAIN_ID, MAINNET_CHAIN_ID, SEPOLIA_CHAIN_ID,
};

/// Re-exported so downstream crates share one `Address`/`H256` definition.
pub use ethers_core::types::{Address, H256, U256};
