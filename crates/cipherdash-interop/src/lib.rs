//! Chain access for cipherdash: the chain client and contract proxy traits,
//! a single-flight proxy cache, an ethers JSON-RPC backend and an in-memory
//! FHEVM development chain.

pub mod chain;
pub mod contract_cache;
pub mod contracts;
pub mod devnet;
pub mod ethers_backend;

pub use chain::{BlockSummary, ChainClient, ChainError, LogEntry, PendingTx, Receipt, TransactionSummary};
pub use contract_cache::{CachedContracts, ContractCache};
pub use contracts::{
    created_election_id, ContractProvider, ElectionContract, ElectionInfo, EncryptedStats, FheCounterContract,
    RatingContract, RatingEntry, RatingStats,
};
pub use devnet::{Devnet, LocalDevnet, HARDHAT_ACCOUNTS, HARDHAT_DEPLOYER};
pub use ethers_backend::{EthersChainClient, EthersContracts, EthersRatingSystem, HttpClient, SignedHttpClient};
