// In-memory development chain
//
// An automining chain in the manner of a local hardhat node: every
// transaction is mined into its own block, failed calls are mined with
// status 0 and their revert reason, and time only moves through the shared
// ManualClock. FHE state lives in a MockCoprocessor on the same clock.
//
// SAFETY INVARIANTS:
// 1. Block numbers are contiguous from 0 and timestamps strictly increase
// 2. Contract state changes only when the enclosing transaction succeeds
// 3. Lock order is contract state, then chain state

mod election;
mod fhe_counter;
mod rating;

pub use election::DevElection;
pub use fhe_counter::DevFheCounter;
pub use rating::DevRatingSystem;

use crate::chain::{BlockSummary, ChainClient, ChainError, LogEntry, Receipt, TransactionSummary};
use crate::contracts::{ContractProvider, ElectionContract, FheCounterContract, RatingContract};
use async_trait::async_trait;
use cipherdash_core::deployments::{LOCAL_ANONYMOUS_ELECTION, LOCAL_FHE_COUNTER, LOCAL_RATING_SYSTEM};
use cipherdash_core::{Address, ChainId, Clock, ManualClock, H256, LOCAL_CHAIN_ID, U256};
use cipherdash_crypto::MockCoprocessor;
use ethers::utils::{get_contract_address, keccak256, parse_ether};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Default hardhat account #0, deployer of the local contracts.
pub const HARDHAT_DEPLOYER: Address = ethers::types::H160([
    0xf3, 0x9f, 0xd6, 0xe5, 0x1a, 0xad, 0x88, 0xf6, 0xf4, 0xce, 0x6a, 0xb8, 0x82, 0x72, 0x79, 0xcf, 0xff, 0xb9,
    0x22, 0x66,
]);

/// Hardhat accounts #0..#4, funded at genesis.
pub const HARDHAT_ACCOUNTS: [&str; 5] = [
    "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266",
    "0x70997970C51812dc3A010C7d01b50e0d17dc79C8",
    "0x3C44CdDdB6a900fa2b585dd299e03d12FA4293BC",
    "0x90F79bf6EB2c4f870365E785982E1f101E93b906",
    "0x15d34AAf54267DB7D7c367839AAf71A00a2C6A65",
];

const GENESIS_BALANCE_ETH: &str = "10000";
const GAS_PRICE_WEI: u64 = 1_000_000_000;
const DEPLOY_GAS: u64 = 1_200_000;

#[derive(Debug, Default)]
struct ChainState {
    blocks: Vec<BlockSummary>,
    receipts: HashMap<H256, Receipt>,
    balances: HashMap<Address, U256>,
    nonces: HashMap<Address, u64>,
}

pub struct Devnet {
    chain_id: ChainId,
    clock: Arc<ManualClock>,
    coprocessor: Arc<MockCoprocessor>,
    state: Mutex<ChainState>,
}

impl Devnet {
    /// Chain with a genesis block at the clock's current time.
    pub fn new(chain_id: ChainId, clock: Arc<ManualClock>) -> Arc<Self> {
        let coprocessor = Arc::new(MockCoprocessor::with_clock(chain_id, clock.clone()));

        let mut state = ChainState::default();
        let genesis_balance = parse_ether(GENESIS_BALANCE_ETH).unwrap_or_default();
        for account in HARDHAT_ACCOUNTS.iter().filter_map(|a| a.parse::<Address>().ok()) {
            state.balances.insert(account, genesis_balance);
        }
        state.blocks.push(BlockSummary {
            number: 0,
            hash: H256::from(keccak256(chain_id.to_be_bytes())),
            timestamp: clock.now(),
            transactions: Vec::new(),
        });

        Arc::new(Devnet { chain_id, clock, coprocessor, state: Mutex::new(state) })
    }

    pub fn chain_id_value(&self) -> ChainId {
        self.chain_id
    }

    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    pub fn coprocessor(&self) -> &Arc<MockCoprocessor> {
        &self.coprocessor
    }

    pub fn latest_timestamp(&self) -> u64 {
        self.state.lock().blocks.last().map(|b| b.timestamp).unwrap_or_default()
    }

    /// `evm_increaseTime`
    pub fn increase_time(&self, seconds: u64) {
        self.clock.advance(seconds);
    }

    /// `evm_mine`: an empty block at the current time.
    pub fn mine(&self) -> u64 {
        let mut state = self.state.lock();
        self.push_block(&mut state, Vec::new())
    }

    pub fn set_balance(&self, account: Address, wei: U256) {
        self.state.lock().balances.insert(account, wei);
    }

    fn next_timestamp(&self, state: &ChainState) -> u64 {
        let previous = state.blocks.last().map(|b| b.timestamp).unwrap_or_default();
        self.clock.now().max(previous + 1)
    }

    fn push_block(&self, state: &mut ChainState, transactions: Vec<TransactionSummary>) -> u64 {
        let number = state.blocks.len() as u64;
        let timestamp = self.next_timestamp(state);
        let parent = state.blocks.last().map(|b| b.hash).unwrap_or_default();

        let mut preimage = parent.as_bytes().to_vec();
        preimage.extend_from_slice(&number.to_be_bytes());
        preimage.extend_from_slice(&timestamp.to_be_bytes());
        for tx in &transactions {
            preimage.extend_from_slice(tx.hash.as_bytes());
        }

        state.blocks.push(BlockSummary { number, hash: H256::from(keccak256(preimage)), timestamp, transactions });
        number
    }

    fn take_nonce(state: &mut ChainState, from: Address) -> u64 {
        let nonce = state.nonces.entry(from).or_insert(0);
        let current = *nonce;
        *nonce += 1;
        current
    }

    fn transaction_hash(&self, from: Address, nonce: u64, input: &[u8]) -> H256 {
        let mut preimage = self.chain_id.to_be_bytes().to_vec();
        preimage.extend_from_slice(from.as_bytes());
        preimage.extend_from_slice(&nonce.to_be_bytes());
        preimage.extend_from_slice(input);
        H256::from(keccak256(preimage))
    }

    /// Mine one transaction. `apply` runs with the new block's timestamp and
    /// must leave contract state untouched when it returns an error.
    pub(crate) fn execute<F>(&self, from: Address, to: Option<Address>, input: Vec<u8>, gas: u64, apply: F) -> H256
    where
        F: FnOnce(u64) -> Result<(), String>,
    {
        self.execute_logged(from, to, input, gas, |now| apply(now).map(|()| Vec::new()))
    }

    /// `execute` for a call that emits events. Logs of a reverted call are
    /// dropped.
    pub(crate) fn execute_logged<F>(&self, from: Address, to: Option<Address>, input: Vec<u8>, gas: u64, apply: F) -> H256
    where
        F: FnOnce(u64) -> Result<Vec<LogEntry>, String>,
    {
        let mut state = self.state.lock();
        let timestamp = self.next_timestamp(&state);
        let outcome = apply(timestamp);

        let nonce = Devnet::take_nonce(&mut state, from);
        let hash = self.transaction_hash(from, nonce, &input);
        let number = state.blocks.len() as u64;

        let fee = U256::from(gas) * U256::from(GAS_PRICE_WEI);
        let balance = state.balances.entry(from).or_default();
        *balance = balance.saturating_sub(fee);

        let (logs, revert_reason) = match outcome {
            Ok(logs) => (logs, None),
            Err(reason) => {
                warn!("Transaction {:#x} from {:#x} reverted: {}", hash, from, reason);
                (Vec::new(), Some(reason))
            }
        };
        state.receipts.insert(
            hash,
            Receipt {
                transaction_hash: hash,
                block_number: number,
                success: revert_reason.is_none(),
                gas_used: gas,
                revert_reason,
                logs,
            },
        );

        let tx = TransactionSummary { hash, from, to, input, value: U256::zero(), block_number: number };
        self.push_block(&mut state, vec![tx]);
        debug!("Mined block {} with transaction {:#x}", number, hash);
        hash
    }

    /// Record a contract creation and return the new contract's address.
    pub(crate) fn deploy(&self, from: Address, bytecode_tag: &str) -> Address {
        let nonce = self.state.lock().nonces.get(&from).copied().unwrap_or(0);
        let address = get_contract_address(from, nonce);
        self.execute(from, None, bytecode_tag.as_bytes().to_vec(), DEPLOY_GAS, |_| Ok(()));
        debug!("Deployed {} at {:#x}", bytecode_tag, address);
        address
    }
}

#[async_trait]
impl ChainClient for Devnet {
    async fn chain_id(&self) -> Result<ChainId, ChainError> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let state = self.state.lock();
        Ok(state.blocks.len().saturating_sub(1) as u64)
    }

    async fn balance(&self, address: Address) -> Result<U256, ChainError> {
        Ok(self.state.lock().balances.get(&address).copied().unwrap_or_default())
    }

    async fn block_with_transactions(&self, number: u64) -> Result<Option<BlockSummary>, ChainError> {
        Ok(self.state.lock().blocks.get(number as usize).cloned())
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<Receipt>, ChainError> {
        Ok(self.state.lock().receipts.get(&hash).cloned())
    }

    async fn wait_for_receipt(&self, hash: H256) -> Result<Receipt, ChainError> {
        self.state
            .lock()
            .receipts
            .get(&hash)
            .cloned()
            .ok_or(ChainError::UnknownTransaction(hash))
    }
}

/// A devnet with `FHECounter`, `AnonymousElection` and
/// `EncryptedRatingSystem` deployed by the hardhat deployer at nonces 0..=2.
#[derive(Clone)]
pub struct LocalDevnet {
    chain: Arc<Devnet>,
    counter: Arc<DevFheCounter>,
    election: Arc<DevElection>,
    rating: Arc<DevRatingSystem>,
}

impl LocalDevnet {
    /// Chain 31337 starting at the current wall-clock time.
    pub fn start() -> Self {
        LocalDevnet::with_clock(Arc::new(ManualClock::starting_now()))
    }

    pub fn with_clock(clock: Arc<ManualClock>) -> Self {
        let chain = Devnet::new(LOCAL_CHAIN_ID, clock);
        let counter = Arc::new(DevFheCounter::deploy(chain.clone(), HARDHAT_DEPLOYER));
        let election = Arc::new(DevElection::deploy(chain.clone(), HARDHAT_DEPLOYER));
        let rating = Arc::new(DevRatingSystem::deploy(chain.clone(), HARDHAT_DEPLOYER));
        debug_assert_eq!(counter.address(), LOCAL_FHE_COUNTER);
        debug_assert_eq!(election.address(), LOCAL_ANONYMOUS_ELECTION);
        debug_assert_eq!(rating.address(), LOCAL_RATING_SYSTEM);
        LocalDevnet { chain, counter, election, rating }
    }

    pub fn chain(&self) -> &Arc<Devnet> {
        &self.chain
    }

    /// The chain as a trait object, for dashboards and pending transactions.
    pub fn client(&self) -> Arc<dyn ChainClient> {
        self.chain.clone()
    }

    pub fn coprocessor(&self) -> Arc<MockCoprocessor> {
        self.chain.coprocessor().clone()
    }

    pub fn clock(&self) -> Arc<ManualClock> {
        self.chain.clock().clone()
    }

    pub fn counter(&self) -> &Arc<DevFheCounter> {
        &self.counter
    }

    pub fn election(&self) -> &Arc<DevElection> {
        &self.election
    }

    pub fn rating(&self) -> &Arc<DevRatingSystem> {
        &self.rating
    }

    fn not_deployed(&self, name: &str, chain_id: ChainId, address: Address) -> ChainError {
        ChainError::NotDeployed(format!(
            "{} not deployed at {:#x} on chain {}",
            name, address, chain_id
        ))
    }
}

#[async_trait]
impl ContractProvider for LocalDevnet {
    async fn fhe_counter(&self, chain_id: ChainId, address: Address) -> Result<Arc<dyn FheCounterContract>, ChainError> {
        if chain_id == self.chain.chain_id_value() && address == self.counter.address() {
            Ok(self.counter.clone())
        } else {
            Err(self.not_deployed("FHECounter", chain_id, address))
        }
    }

    async fn election(&self, chain_id: ChainId, address: Address) -> Result<Arc<dyn ElectionContract>, ChainError> {
        if chain_id == self.chain.chain_id_value() && address == self.election.address() {
            Ok(self.election.clone())
        } else {
            Err(self.not_deployed("AnonymousElection", chain_id, address))
        }
    }

    async fn rating_system(&self, chain_id: ChainId, address: Address) -> Result<Arc<dyn RatingContract>, ChainError> {
        if chain_id == self.chain.chain_id_value() && address == self.rating.address() {
            Ok(self.rating.clone())
        } else {
            Err(self.not_deployed("EncryptedRatingSystem", chain_id, address))
        }
    }
}
