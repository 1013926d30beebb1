//! cipherdash: client core for an FHEVM dApp.
//!
//! Re-exports the workspace crates under one roof:
//!
//! - [`core`]: handles, clear values, deployments, configuration, validation
//! - [`crypto`]: the encryption capability and the mock coprocessor
//! - [`wallet`]: signers, storage and the decryption signature cache
//! - [`interop`]: chain client, contract proxies, ethers backend, devnet
//! - [`state`]: live context and the counter, election and rating sessions
//! - [`indexer`]: dashboard snapshots and the poller

pub use cipherdash_core as core;
pub use cipherdash_crypto as crypto;
pub use cipherdash_indexer as indexer;
pub use cipherdash_interop as interop;
pub use cipherdash_state as state;
pub use cipherdash_wallet_core as wallet;

pub mod prelude {
    pub use cipherdash_core::{AppConfig, CiphertextHandle, ClearValue, Deployments, LOCAL_CHAIN_ID};
    pub use cipherdash_crypto::{EncryptionCapability, MockCoprocessor};
    pub use cipherdash_indexer::{fetch_dashboard, DashboardPoller, DashboardSnapshot};
    pub use cipherdash_interop::{CachedContracts, ChainClient, ContractProvider, LocalDevnet};
    pub use cipherdash_state::{
        CounterSession, ElectionSession, LiveContext, Outcome, RatingScope, RatingSession, SessionDeps,
    };
    pub use cipherdash_wallet_core::{DecryptionSignatureCache, LocalKeySigner, MemoryStorage, WalletSigner};
}
