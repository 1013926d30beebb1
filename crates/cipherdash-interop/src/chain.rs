// Chain client abstraction
//
// Everything the client needs from a JSON-RPC node, expressed as a trait so
// the ethers backend and the in-memory devnet are interchangeable.
//
// INVARIANTS:
// 1. No call is retried; every failure surfaces to the caller once
// 2. A write resolves to a PendingTx whose receipt is awaited separately

use async_trait::async_trait;
use cipherdash_core::{Address, ChainId, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("RPC connectivity error: {0}")]
    Connectivity(String),

    #[error("Execution reverted: {0}")]
    Reverted(String),

    #[error("Malformed RPC response: {0}")]
    Malformed(String),

    #[error("{0}")]
    NotDeployed(String),

    #[error("Transaction {0:#x} not found")]
    UnknownTransaction(H256),
}

impl ChainError {
    /// True when the failure means "feature unavailable" rather than a fault.
    pub fn is_not_deployed(&self) -> bool {
        matches!(self, ChainError::NotDeployed(_))
    }
}

/// One transaction as seen in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub hash: H256,
    pub from: Address,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub input: Vec<u8>,
    pub value: U256,
    pub block_number: u64,
}

impl TransactionSummary {
    /// First four bytes of the calldata.
    pub fn selector(&self) -> Option<[u8; 4]> {
        let bytes = self.input.get(..4)?;
        let mut selector = [0u8; 4];
        selector.copy_from_slice(bytes);
        Some(selector)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub number: u64,
    pub hash: H256,
    /// Unix seconds.
    pub timestamp: u64,
    pub transactions: Vec<TransactionSummary>,
}

/// An event emitted by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: Address,
    /// `topics[0]` is the event signature hash.
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_hash: H256,
    pub block_number: u64,
    pub success: bool,
    pub gas_used: u64,
    /// Decoded `Error(string)` when the node reports one.
    pub revert_reason: Option<String>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl Receipt {
    pub fn status_label(&self) -> &'static str {
        if self.success {
            "Success"
        } else {
            "Failed"
        }
    }

    /// `Ok(())` for a successful receipt, `Reverted` otherwise.
    pub fn ensure_success(&self) -> Result<(), ChainError> {
        if self.success {
            return Ok(());
        }
        Err(ChainError::Reverted(
            self.revert_reason.clone().unwrap_or_else(|| "transaction reverted".to_string()),
        ))
    }
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<ChainId, ChainError>;

    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Balance in wei.
    async fn balance(&self, address: Address) -> Result<U256, ChainError>;

    /// Full block with transactions; `None` when the node has no such block.
    async fn block_with_transactions(&self, number: u64) -> Result<Option<BlockSummary>, ChainError>;

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<Receipt>, ChainError>;

    /// Wait until `hash` is mined and return its receipt.
    async fn wait_for_receipt(&self, hash: H256) -> Result<Receipt, ChainError>;
}

/// A submitted write: its hash now, its receipt on `wait`.
#[derive(Clone)]
pub struct PendingTx {
    hash: H256,
    client: Arc<dyn ChainClient>,
}

impl PendingTx {
    pub fn new(hash: H256, client: Arc<dyn ChainClient>) -> Self {
        PendingTx { hash, client }
    }

    pub fn hash(&self) -> H256 {
        self.hash
    }

    /// First 10 characters of the hash, as shown in status lines.
    pub fn short_hash(&self) -> String {
        let full = format!("{:#x}", self.hash);
        full[..10].to_string()
    }

    pub async fn wait(&self) -> Result<Receipt, ChainError> {
        self.client.wait_for_receipt(self.hash).await
    }
}

impl fmt::Debug for PendingTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTx").field("hash", &self.hash).finish()
    }
}
