// Dashboard snapshot
//
// One pass over the chain: head block and RPC latency, balances, the most
// recent counter transactions with their receipts, average block time and
// 24 hourly activity buckets.
//
// INVARIANTS:
// 1. fetch_dashboard never fails; without a head block number or chain id it
//    yields the default snapshot, later read errors only degrade the fields
//    they feed
// 2. Blocks are scanned newest first and the scan stops at max_transactions
// 3. Activity buckets are anchored on the head block's timestamp, oldest first

use chrono::{DateTime, Utc};
use cipherdash_core::{Address, ChainId, ContractKind, DashboardConfig, Deployments, H256};
use cipherdash_interop::contracts::{selector, DECREMENT_SIGNATURE, INCREMENT_SIGNATURE};
use cipherdash_interop::{ChainClient, ChainError, Receipt, TransactionSummary};
use ethers_core::utils::format_ether;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub const ACTIVITY_BUCKETS: usize = 24;
const SECONDS_PER_HOUR: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Increment,
    Decrement,
    Other,
}

impl TransactionKind {
    /// Classify calldata by its 4-byte selector.
    pub fn classify(input: &[u8]) -> Self {
        let Some(head) = input.get(..4) else {
            return TransactionKind::Other;
        };
        if head == selector(INCREMENT_SIGNATURE) {
            TransactionKind::Increment
        } else if head == selector(DECREMENT_SIGNATURE) {
            TransactionKind::Decrement
        } else {
            TransactionKind::Other
        }
    }

    /// Increments and decrements each carry one encrypted input.
    pub fn is_encryption(&self) -> bool {
        matches!(self, TransactionKind::Increment | TransactionKind::Decrement)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Success,
    Failed,
    /// No receipt yet.
    Pending,
}

impl From<Option<&Receipt>> for TransactionStatus {
    fn from(receipt: Option<&Receipt>) -> Self {
        match receipt {
            Some(r) if r.success => TransactionStatus::Success,
            Some(_) => TransactionStatus::Failed,
            None => TransactionStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardTransaction {
    pub hash: H256,
    pub kind: TransactionKind,
    pub block_number: u64,
    /// Unix seconds of the enclosing block.
    pub timestamp: u64,
    pub status: TransactionStatus,
    pub gas_used: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityBucket {
    /// `HH:00`, UTC.
    pub time: String,
    pub operations: u64,
    pub encryptions: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub chain_id: Option<ChainId>,
    pub block_number: u64,
    pub network_latency_ms: u64,
    /// Formatted ether; "0" when unknown.
    pub contract_balance: String,
    pub account_balance: String,
    pub total_operations: u64,
    pub total_encryptions: u64,
    pub total_gas_used: u64,
    pub average_block_time_secs: f64,
    pub recent_transactions: Vec<DashboardTransaction>,
    pub activity: Vec<ActivityBucket>,
    pub is_loading: bool,
}

impl DashboardSnapshot {
    /// Placeholder published before the first fetch completes.
    pub fn loading() -> Self {
        DashboardSnapshot { is_loading: true, ..DashboardSnapshot::unavailable() }
    }

    /// Values reported when the chain cannot be read.
    pub fn unavailable() -> Self {
        DashboardSnapshot {
            contract_balance: "0".to_string(),
            account_balance: "0".to_string(),
            ..DashboardSnapshot::default()
        }
    }
}

/// Build a snapshot of `client`'s chain. Never fails.
pub async fn fetch_dashboard(
    client: &dyn ChainClient,
    deployments: &Deployments,
    account: Option<Address>,
    config: &DashboardConfig,
) -> DashboardSnapshot {
    match collect(client, deployments, account, config).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Error fetching dashboard data: {}", e);
            DashboardSnapshot::unavailable()
        }
    }
}

async fn collect(
    client: &dyn ChainClient,
    deployments: &Deployments,
    account: Option<Address>,
    config: &DashboardConfig,
) -> Result<DashboardSnapshot, ChainError> {
    let started = Instant::now();
    let block_number = client.block_number().await?;
    let network_latency_ms = started.elapsed().as_millis() as u64;

    let chain_id = client.chain_id().await?;
    let counter = deployments.resolve(ContractKind::FheCounter, Some(chain_id));

    let account_balance = match account {
        Some(account) => balance_of(client, account).await,
        None => "0".to_string(),
    };

    let (contract_balance, recent_transactions) = match counter.address.filter(|a| !a.is_zero()) {
        Some(address) => (
            balance_of(client, address).await,
            scan_transactions(client, address, block_number, config).await,
        ),
        None => {
            debug!("{}", counter.not_deployed_message());
            ("0".to_string(), Vec::new())
        }
    };

    let head_timestamp = match client.block_with_transactions(block_number).await {
        Ok(Some(block)) => Some(block.timestamp),
        Ok(None) => {
            warn!("Head block {} missing", block_number);
            None
        }
        Err(e) => {
            warn!("Error reading head block {}: {}", block_number, e);
            None
        }
    };
    let average_block_time_secs = match head_timestamp {
        Some(timestamp) => average_block_time(client, block_number, timestamp, config.block_time_window)
            .await
            .unwrap_or_else(|e| {
                warn!("Error computing average block time: {}", e);
                0.0
            }),
        None => 0.0,
    };
    let now = head_timestamp
        .or_else(|| recent_transactions.first().map(|t| t.timestamp))
        .unwrap_or_default();

    let total_operations = recent_transactions.len() as u64;
    let total_encryptions = recent_transactions.iter().filter(|t| t.kind.is_encryption()).count() as u64;
    let total_gas_used = recent_transactions.iter().filter_map(|t| t.gas_used).sum();

    Ok(DashboardSnapshot {
        chain_id: Some(chain_id),
        block_number,
        network_latency_ms,
        contract_balance,
        account_balance,
        total_operations,
        total_encryptions,
        total_gas_used,
        average_block_time_secs,
        activity: activity_buckets(&recent_transactions, now),
        recent_transactions,
        is_loading: false,
    })
}

async fn balance_of(client: &dyn ChainClient, address: Address) -> String {
    match client.balance(address).await {
        Ok(wei) => format_ether(wei),
        Err(e) => {
            warn!("Error reading balance of {:#x}: {}", address, e);
            "0".to_string()
        }
    }
}

/// Transactions sent to `contract` in the last `scan_blocks` blocks. A read
/// error ends the scan with what was found so far.
async fn scan_transactions(
    client: &dyn ChainClient,
    contract: Address,
    head: u64,
    config: &DashboardConfig,
) -> Vec<DashboardTransaction> {
    let mut found = Vec::new();
    if let Err(e) = scan_into(client, contract, head, config, &mut found).await {
        warn!("Transaction scan stopped after {} transaction(s): {}", found.len(), e);
    }
    found
}

async fn scan_into(
    client: &dyn ChainClient,
    contract: Address,
    head: u64,
    config: &DashboardConfig,
    found: &mut Vec<DashboardTransaction>,
) -> Result<(), ChainError> {
    if config.scan_blocks == 0 || config.max_transactions == 0 {
        return Ok(());
    }
    let oldest = head.saturating_sub(config.scan_blocks - 1);

    for number in (oldest..=head).rev() {
        let Some(block) = client.block_with_transactions(number).await? else {
            continue;
        };
        for tx in block.transactions.iter().filter(|tx| tx.to == Some(contract)) {
            found.push(describe(client, tx, block.timestamp).await?);
            if found.len() >= config.max_transactions {
                return Ok(());
            }
        }
    }
    Ok(())
}

async fn describe(
    client: &dyn ChainClient,
    tx: &TransactionSummary,
    timestamp: u64,
) -> Result<DashboardTransaction, ChainError> {
    let receipt = client.transaction_receipt(tx.hash).await?;
    Ok(DashboardTransaction {
        hash: tx.hash,
        kind: TransactionKind::classify(&tx.input),
        block_number: tx.block_number,
        timestamp,
        status: TransactionStatus::from(receipt.as_ref()),
        gas_used: receipt.map(|r| r.gas_used),
    })
}

/// Mean seconds per block over the last `window` blocks; 0 on a fresh chain.
async fn average_block_time(
    client: &dyn ChainClient,
    head: u64,
    head_timestamp: u64,
    window: u64,
) -> Result<f64, ChainError> {
    let base = head.saturating_sub(window);
    if base == head {
        return Ok(0.0);
    }
    let Some(base_block) = client.block_with_transactions(base).await? else {
        return Ok(0.0);
    };
    let elapsed = head_timestamp.saturating_sub(base_block.timestamp);
    Ok(elapsed as f64 / (head - base) as f64)
}

/// Hourly counts over the 24 hours ending with the hour of `now`.
pub fn activity_buckets(transactions: &[DashboardTransaction], now: u64) -> Vec<ActivityBucket> {
    let current_hour = now - now % SECONDS_PER_HOUR;
    let first_hour = current_hour.saturating_sub((ACTIVITY_BUCKETS as u64 - 1) * SECONDS_PER_HOUR);

    let mut buckets: Vec<ActivityBucket> = (0..ACTIVITY_BUCKETS as u64)
        .map(|i| ActivityBucket { time: hour_label(first_hour + i * SECONDS_PER_HOUR), operations: 0, encryptions: 0 })
        .collect();

    for tx in transactions {
        if tx.timestamp < first_hour || tx.timestamp >= current_hour + SECONDS_PER_HOUR {
            continue;
        }
        let index = ((tx.timestamp - first_hour) / SECONDS_PER_HOUR) as usize;
        if let Some(bucket) = buckets.get_mut(index) {
            bucket.operations += 1;
            if tx.kind.is_encryption() {
                bucket.encryptions += 1;
            }
        }
    }
    buckets
}

fn hour_label(timestamp: u64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp as i64, 0)
        .map(|t| t.format("%H:00").to_string())
        .unwrap_or_else(|| "00:00".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipherdash_interop::contracts::encode_call;

    fn tx(kind: TransactionKind, timestamp: u64) -> DashboardTransaction {
        DashboardTransaction {
            hash: H256::zero(),
            kind,
            block_number: 1,
            timestamp,
            status: TransactionStatus::Success,
            gas_used: Some(1),
        }
    }

    #[test]
    fn test_classify_by_selector() {
        let increment = encode_call(INCREMENT_SIGNATURE, &[]);
        let decrement = encode_call(DECREMENT_SIGNATURE, &[]);
        assert_eq!(TransactionKind::classify(&increment), TransactionKind::Increment);
        assert_eq!(TransactionKind::classify(&decrement), TransactionKind::Decrement);
        assert_eq!(TransactionKind::classify(&[0xde, 0xad, 0xbe, 0xef]), TransactionKind::Other);
        assert_eq!(TransactionKind::classify(&[]), TransactionKind::Other);
        assert_eq!(TransactionKind::classify(&increment[..3]), TransactionKind::Other);
    }

    #[test]
    fn test_status_from_receipt() {
        let receipt = |success| Receipt {
            transaction_hash: H256::zero(),
            block_number: 1,
            success,
            gas_used: 21_000,
            revert_reason: None,
            logs: Vec::new(),
        };
        assert_eq!(TransactionStatus::from(Some(&receipt(true))), TransactionStatus::Success);
        assert_eq!(TransactionStatus::from(Some(&receipt(false))), TransactionStatus::Failed);
        assert_eq!(TransactionStatus::from(None), TransactionStatus::Pending);
    }

    #[test]
    fn test_activity_buckets() {
        // 2023-11-14 22:13:20 UTC
        let now = 1_700_000_000;
        let transactions = vec![
            tx(TransactionKind::Increment, now - 60),
            tx(TransactionKind::Other, now - 120),
            tx(TransactionKind::Decrement, now - 2 * 3600),
            // outside the window
            tx(TransactionKind::Increment, now - 30 * 3600),
        ];

        let buckets = activity_buckets(&transactions, now);
        assert_eq!(buckets.len(), ACTIVITY_BUCKETS);
        assert_eq!(buckets[0].time, "23:00");
        assert_eq!(buckets[23].time, "22:00");
        assert_eq!((buckets[23].operations, buckets[23].encryptions), (2, 1));
        assert_eq!(buckets[21].time, "20:00");
        assert_eq!((buckets[21].operations, buckets[21].encryptions), (1, 1));
        assert_eq!(buckets.iter().map(|b| b.operations).sum::<u64>(), 3);
    }

    #[test]
    fn test_unavailable_snapshot() {
        let snapshot = DashboardSnapshot::unavailable();
        assert_eq!(snapshot.contract_balance, "0");
        assert!(snapshot.recent_transactions.is_empty());
        assert!(DashboardSnapshot::loading().is_loading);
    }
}
