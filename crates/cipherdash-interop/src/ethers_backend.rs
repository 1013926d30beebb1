// ethers JSON-RPC backend
//
// ChainClient over any ethers Middleware, and contract proxies generated
// with abigen from human-readable ABIs. Writes go through the middleware:
// a SignerMiddleware<Provider<Http>, LocalWallet> signs locally, a bare
// Provider<Http> relies on node-managed accounts.

use crate::chain::{BlockSummary, ChainClient, ChainError, LogEntry, PendingTx, Receipt, TransactionSummary};
use crate::contracts::{
    ContractProvider, ElectionContract, ElectionInfo, EncryptedStats, FheCounterContract, RatingContract, RatingEntry,
    RatingStats,
};
use async_trait::async_trait;
use cipherdash_core::{Address, ChainId, CiphertextHandle, H256, LOCAL_CHAIN_ID, U256};
use ethers::contract::{abigen, ContractError};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, PendingTransaction, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{BlockNumber, Bytes};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

abigen!(
    FheCounterBinding,
    r#"[
        function getCount() external view returns (bytes32)
        function increment(bytes32 inputEuint32, bytes inputProof) external
        function decrement(bytes32 inputEuint32, bytes inputProof) external
    ]"#
);

abigen!(
    AnonymousElectionBinding,
    r#"[
        function getElectionCount() external view returns (uint256)
        function getElection(uint256 electionId) external view returns (string, string, uint256, string[], uint256, bool, bool, address, uint256)
        function hasUserVoted(uint256 electionId, address voter) external view returns (bool)
        function getEncryptedVoteSum(uint256 electionId) external view returns (bytes32)
        function getDecryptedVoteSum(uint256 electionId) external view returns (uint32)
        function createElection(string title, string description, string[] candidateNames, uint256 durationInHours) external returns (uint256)
        function vote(uint256 electionId, bytes32 encryptedVote, bytes inputProof) external
        function endElection(uint256 electionId) external
        function finalizeElection(uint256 electionId) external
    ]"#
);

abigen!(
    RatingSystemBinding,
    r#"[
        function hasSubmitted(address user) external view returns (bool)
        function hasSubmittedForSubject(address user, string subject) external view returns (bool)
        function getEntryCount() external view returns (uint256)
        function getEntry(uint256 entryId) external view returns (string, uint256, address, bool)
        function getActiveEntryCount() external view returns (uint256)
        function getEncryptedGlobalStats() external view returns (bytes32, uint32)
        function getEncryptedSubjectStats(string subject) external view returns (bytes32, uint32)
        function getSubjectEntryCount(string subject) external view returns (uint256)
        function isGlobalStatsFinalized() external view returns (bool)
        function getGlobalStats() external view returns (uint32, uint32)
        function isSubjectStatsFinalized(string subject) external view returns (bool)
        function getSubjectStats(string subject) external view returns (uint32, uint32)
        function submitRating(bytes32 encryptedRating, bytes inputProof, string subject) external
        function updateRating(bytes32 encryptedRating, bytes inputProof, string newSubject) external
        function deleteRating() external
        function requestGlobalStats() external
        function requestSubjectStats(string subject) external
        function allowUserToDecrypt(address user, string[] subjects) external
    ]"#
);

/// Local nodes fail gas estimation for FHE calls; send with a fixed limit.
pub const LOCAL_WRITE_GAS_LIMIT: u64 = 1_000_000;
pub const LOCAL_FINALIZE_GAS_LIMIT: u64 = 2_000_000;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub type HttpClient = Provider<Http>;
pub type SignedHttpClient = SignerMiddleware<Provider<Http>, LocalWallet>;

fn rpc_error(e: impl std::fmt::Display) -> ChainError {
    ChainError::Connectivity(e.to_string())
}

fn contract_error<M: Middleware>(e: ContractError<M>) -> ChainError {
    if let Some(reason) = e.decode_revert::<String>() {
        return ChainError::Reverted(reason);
    }
    if e.is_revert() {
        return ChainError::Reverted("execution reverted".to_string());
    }
    ChainError::Connectivity(e.to_string())
}

fn to_u64(value: U256, field: &str) -> Result<u64, ChainError> {
    if value > U256::from(u64::MAX) {
        return Err(ChainError::Malformed(format!("{} does not fit in u64", field)));
    }
    Ok(value.as_u64())
}

/// Provider for `rpc_url`.
pub fn http_provider(rpc_url: &str) -> Result<HttpClient, ChainError> {
    Provider::<Http>::try_from(rpc_url).map_err(|e| ChainError::Connectivity(format!("{}: {}", rpc_url, e)))
}

/// Provider for `rpc_url` that signs writes with `wallet`.
pub fn signed_http_provider(rpc_url: &str, wallet: LocalWallet, chain_id: ChainId) -> Result<SignedHttpClient, ChainError> {
    let provider = http_provider(rpc_url)?;
    Ok(SignerMiddleware::new(provider, wallet.with_chain_id(chain_id)))
}

pub struct EthersChainClient<M> {
    client: Arc<M>,
}

impl<M: Middleware> EthersChainClient<M> {
    pub fn new(client: Arc<M>) -> Self {
        EthersChainClient { client }
    }

    pub fn middleware(&self) -> &Arc<M> {
        &self.client
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainClient for EthersChainClient<M> {
    async fn chain_id(&self) -> Result<ChainId, ChainError> {
        let id = self.client.get_chainid().await.map_err(rpc_error)?;
        to_u64(id, "chain id")
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.client.get_block_number().await.map_err(rpc_error)?.as_u64())
    }

    async fn balance(&self, address: Address) -> Result<U256, ChainError> {
        self.client.get_balance(address, None).await.map_err(rpc_error)
    }

    async fn block_with_transactions(&self, number: u64) -> Result<Option<BlockSummary>, ChainError> {
        let Some(block) = self
            .client
            .get_block_with_txs(BlockNumber::Number(number.into()))
            .await
            .map_err(rpc_error)?
        else {
            return Ok(None);
        };

        let transactions = block
            .transactions
            .into_iter()
            .map(|tx| TransactionSummary {
                hash: tx.hash,
                from: tx.from,
                to: tx.to,
                input: tx.input.to_vec(),
                value: tx.value,
                block_number: tx.block_number.map(|n| n.as_u64()).unwrap_or(number),
            })
            .collect();

        Ok(Some(BlockSummary {
            number,
            hash: block.hash.unwrap_or_default(),
            timestamp: to_u64(block.timestamp, "block timestamp")?,
            transactions,
        }))
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<Receipt>, ChainError> {
        let receipt = self.client.get_transaction_receipt(hash).await.map_err(rpc_error)?;
        receipt.map(convert_receipt).transpose()
    }

    async fn wait_for_receipt(&self, hash: H256) -> Result<Receipt, ChainError> {
        let pending = PendingTransaction::new(hash, self.client.provider()).interval(RECEIPT_POLL_INTERVAL);
        match pending.await.map_err(rpc_error)? {
            Some(receipt) => convert_receipt(receipt),
            None => Err(ChainError::UnknownTransaction(hash)),
        }
    }
}

fn convert_receipt(receipt: ethers::types::TransactionReceipt) -> Result<Receipt, ChainError> {
    let block_number = receipt
        .block_number
        .ok_or_else(|| ChainError::Malformed("receipt without block number".to_string()))?
        .as_u64();
    Ok(Receipt {
        transaction_hash: receipt.transaction_hash,
        block_number,
        success: receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false),
        gas_used: receipt.gas_used.map(|g| g.low_u64()).unwrap_or_default(),
        revert_reason: None,
        logs: receipt
            .logs
            .into_iter()
            .map(|log| LogEntry { address: log.address, topics: log.topics, data: log.data.to_vec() })
            .collect(),
    })
}

/// `FHECounter` proxy over middleware `M`.
pub struct EthersFheCounter<M> {
    binding: FheCounterBinding<M>,
    chain: Arc<dyn ChainClient>,
    chain_id: ChainId,
}

impl<M: Middleware + 'static> EthersFheCounter<M> {
    pub fn new(address: Address, client: Arc<M>, chain_id: ChainId) -> Self {
        EthersFheCounter {
            binding: FheCounterBinding::new(address, client.clone()),
            chain: Arc::new(EthersChainClient::new(client)),
            chain_id,
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> FheCounterContract for EthersFheCounter<M> {
    fn address(&self) -> Address {
        self.binding.address()
    }

    async fn get_count(&self) -> Result<CiphertextHandle, ChainError> {
        let raw = self.binding.get_count().call().await.map_err(contract_error)?;
        Ok(CiphertextHandle::from_bytes(raw))
    }

    async fn increment(&self, from: Address, input: CiphertextHandle, proof: Vec<u8>) -> Result<PendingTx, ChainError> {
        let mut call = self.binding.increment(input.to_fixed_bytes(), Bytes::from(proof)).from(from);
        if self.chain_id == LOCAL_CHAIN_ID {
            call = call.gas(LOCAL_WRITE_GAS_LIMIT);
        }
        let pending = call.send().await.map_err(contract_error)?;
        debug!("increment sent as {:#x}", pending.tx_hash());
        Ok(PendingTx::new(pending.tx_hash(), self.chain.clone()))
    }

    async fn decrement(&self, from: Address, input: CiphertextHandle, proof: Vec<u8>) -> Result<PendingTx, ChainError> {
        let mut call = self.binding.decrement(input.to_fixed_bytes(), Bytes::from(proof)).from(from);
        if self.chain_id == LOCAL_CHAIN_ID {
            call = call.gas(LOCAL_WRITE_GAS_LIMIT);
        }
        let pending = call.send().await.map_err(contract_error)?;
        debug!("decrement sent as {:#x}", pending.tx_hash());
        Ok(PendingTx::new(pending.tx_hash(), self.chain.clone()))
    }
}

/// `AnonymousElection` proxy over middleware `M`.
pub struct EthersElection<M> {
    binding: AnonymousElectionBinding<M>,
    chain: Arc<dyn ChainClient>,
    chain_id: ChainId,
}

impl<M: Middleware + 'static> EthersElection<M> {
    pub fn new(address: Address, client: Arc<M>, chain_id: ChainId) -> Self {
        EthersElection {
            binding: AnonymousElectionBinding::new(address, client.clone()),
            chain: Arc::new(EthersChainClient::new(client)),
            chain_id,
        }
    }

    fn gas_limit(&self, limit: u64) -> Option<u64> {
        (self.chain_id == LOCAL_CHAIN_ID).then_some(limit)
    }
}

#[async_trait]
impl<M: Middleware + 'static> ElectionContract for EthersElection<M> {
    fn address(&self) -> Address {
        self.binding.address()
    }

    async fn election_count(&self) -> Result<u64, ChainError> {
        let count = self.binding.get_election_count().call().await.map_err(contract_error)?;
        to_u64(count, "election count")
    }

    async fn get_election(&self, election_id: u64) -> Result<ElectionInfo, ChainError> {
        let (title, description, _candidate_count, candidate_names, end_time, is_active, is_finalized, admin, total_voters) =
            self.binding
                .get_election(U256::from(election_id))
                .call()
                .await
                .map_err(contract_error)?;

        Ok(ElectionInfo {
            id: election_id,
            title,
            description,
            candidate_names,
            end_time: to_u64(end_time, "end time")?,
            is_active,
            is_finalized,
            admin,
            total_voters: to_u64(total_voters, "total voters")?,
        })
    }

    async fn has_user_voted(&self, election_id: u64, voter: Address) -> Result<bool, ChainError> {
        self.binding
            .has_user_voted(U256::from(election_id), voter)
            .call()
            .await
            .map_err(contract_error)
    }

    async fn encrypted_vote_sum(&self, election_id: u64) -> Result<CiphertextHandle, ChainError> {
        let raw = self
            .binding
            .get_encrypted_vote_sum(U256::from(election_id))
            .call()
            .await
            .map_err(contract_error)?;
        Ok(CiphertextHandle::from_bytes(raw))
    }

    async fn decrypted_vote_sum(&self, election_id: u64) -> Result<u64, ChainError> {
        let sum = self
            .binding
            .get_decrypted_vote_sum(U256::from(election_id))
            .call()
            .await
            .map_err(contract_error)?;
        Ok(u64::from(sum))
    }

    async fn create_election(
        &self,
        from: Address,
        title: &str,
        description: &str,
        candidates: &[String],
        duration_hours: u64,
    ) -> Result<PendingTx, ChainError> {
        let mut call = self
            .binding
            .create_election(
                title.to_string(),
                description.to_string(),
                candidates.to_vec(),
                U256::from(duration_hours),
            )
            .from(from);
        if let Some(limit) = self.gas_limit(LOCAL_WRITE_GAS_LIMIT) {
            call = call.gas(limit);
        }
        let pending = call.send().await.map_err(contract_error)?;
        Ok(PendingTx::new(pending.tx_hash(), self.chain.clone()))
    }

    async fn vote(
        &self,
        from: Address,
        election_id: u64,
        encrypted_vote: CiphertextHandle,
        proof: Vec<u8>,
    ) -> Result<PendingTx, ChainError> {
        let mut call = self
            .binding
            .vote(U256::from(election_id), encrypted_vote.to_fixed_bytes(), Bytes::from(proof))
            .from(from);
        if let Some(limit) = self.gas_limit(LOCAL_WRITE_GAS_LIMIT) {
            call = call.gas(limit);
        }
        let pending = call.send().await.map_err(contract_error)?;
        Ok(PendingTx::new(pending.tx_hash(), self.chain.clone()))
    }

    async fn end_election(&self, from: Address, election_id: u64) -> Result<PendingTx, ChainError> {
        let mut call = self.binding.end_election(U256::from(election_id)).from(from);
        if let Some(limit) = self.gas_limit(LOCAL_WRITE_GAS_LIMIT) {
            call = call.gas(limit);
        }
        let pending = call.send().await.map_err(contract_error)?;
        Ok(PendingTx::new(pending.tx_hash(), self.chain.clone()))
    }

    async fn finalize_election(&self, from: Address, election_id: u64) -> Result<PendingTx, ChainError> {
        let mut call = self.binding.finalize_election(U256::from(election_id)).from(from);
        if let Some(limit) = self.gas_limit(LOCAL_FINALIZE_GAS_LIMIT) {
            call = call.gas(limit);
        }
        let pending = call.send().await.map_err(contract_error)?;
        Ok(PendingTx::new(pending.tx_hash(), self.chain.clone()))
    }
}

/// `EncryptedRatingSystem` proxy over middleware `M`.
pub struct EthersRatingSystem<M> {
    binding: RatingSystemBinding<M>,
    chain: Arc<dyn ChainClient>,
    chain_id: ChainId,
}

impl<M: Middleware + 'static> EthersRatingSystem<M> {
    pub fn new(address: Address, client: Arc<M>, chain_id: ChainId) -> Self {
        EthersRatingSystem {
            binding: RatingSystemBinding::new(address, client.clone()),
            chain: Arc::new(EthersChainClient::new(client)),
            chain_id,
        }
    }

    async fn send(&self, call: ethers::contract::ContractCall<M, ()>, from: Address) -> Result<PendingTx, ChainError> {
        let mut call = call.from(from);
        if self.chain_id == LOCAL_CHAIN_ID {
            call = call.gas(LOCAL_WRITE_GAS_LIMIT);
        }
        let pending = call.send().await.map_err(contract_error)?;
        Ok(PendingTx::new(pending.tx_hash(), self.chain.clone()))
    }
}

#[async_trait]
impl<M: Middleware + 'static> RatingContract for EthersRatingSystem<M> {
    fn address(&self) -> Address {
        self.binding.address()
    }

    async fn has_submitted(&self, user: Address) -> Result<bool, ChainError> {
        self.binding.has_submitted(user).call().await.map_err(contract_error)
    }

    async fn has_submitted_for_subject(&self, user: Address, subject: &str) -> Result<bool, ChainError> {
        self.binding
            .has_submitted_for_subject(user, subject.to_string())
            .call()
            .await
            .map_err(contract_error)
    }

    async fn entry_count(&self) -> Result<u64, ChainError> {
        let count = self.binding.get_entry_count().call().await.map_err(contract_error)?;
        to_u64(count, "entry count")
    }

    async fn get_entry(&self, entry_id: u64) -> Result<RatingEntry, ChainError> {
        let (subject, timestamp, submitter, is_active) = self
            .binding
            .get_entry(U256::from(entry_id))
            .call()
            .await
            .map_err(contract_error)?;
        Ok(RatingEntry { id: entry_id, subject, timestamp: to_u64(timestamp, "entry timestamp")?, submitter, is_active })
    }

    async fn active_entry_count(&self) -> Result<u64, ChainError> {
        let count = self.binding.get_active_entry_count().call().await.map_err(contract_error)?;
        to_u64(count, "active entry count")
    }

    async fn encrypted_global_stats(&self) -> Result<EncryptedStats, ChainError> {
        let (sum, count) = self.binding.get_encrypted_global_stats().call().await.map_err(contract_error)?;
        Ok(EncryptedStats { sum: CiphertextHandle::from_bytes(sum), count: u64::from(count) })
    }

    async fn encrypted_subject_stats(&self, subject: &str) -> Result<EncryptedStats, ChainError> {
        let (sum, count) = self
            .binding
            .get_encrypted_subject_stats(subject.to_string())
            .call()
            .await
            .map_err(contract_error)?;
        Ok(EncryptedStats { sum: CiphertextHandle::from_bytes(sum), count: u64::from(count) })
    }

    async fn subject_entry_count(&self, subject: &str) -> Result<u64, ChainError> {
        let count = self
            .binding
            .get_subject_entry_count(subject.to_string())
            .call()
            .await
            .map_err(contract_error)?;
        to_u64(count, "subject entry count")
    }

    async fn is_global_stats_finalized(&self) -> Result<bool, ChainError> {
        self.binding.is_global_stats_finalized().call().await.map_err(contract_error)
    }

    async fn global_stats(&self) -> Result<RatingStats, ChainError> {
        let (average, count) = self.binding.get_global_stats().call().await.map_err(contract_error)?;
        Ok(RatingStats { average: u64::from(average), count: u64::from(count), finalized: true })
    }

    async fn is_subject_stats_finalized(&self, subject: &str) -> Result<bool, ChainError> {
        self.binding
            .is_subject_stats_finalized(subject.to_string())
            .call()
            .await
            .map_err(contract_error)
    }

    async fn subject_stats(&self, subject: &str) -> Result<RatingStats, ChainError> {
        let (average, count) = self
            .binding
            .get_subject_stats(subject.to_string())
            .call()
            .await
            .map_err(contract_error)?;
        Ok(RatingStats { average: u64::from(average), count: u64::from(count), finalized: true })
    }

    async fn submit_rating(
        &self,
        from: Address,
        rating: CiphertextHandle,
        proof: Vec<u8>,
        subject: &str,
    ) -> Result<PendingTx, ChainError> {
        let call = self
            .binding
            .submit_rating(rating.to_fixed_bytes(), Bytes::from(proof), subject.to_string());
        self.send(call, from).await
    }

    async fn update_rating(
        &self,
        from: Address,
        rating: CiphertextHandle,
        proof: Vec<u8>,
        subject: &str,
    ) -> Result<PendingTx, ChainError> {
        let call = self
            .binding
            .update_rating(rating.to_fixed_bytes(), Bytes::from(proof), subject.to_string());
        self.send(call, from).await
    }

    async fn delete_rating(&self, from: Address) -> Result<PendingTx, ChainError> {
        self.send(self.binding.delete_rating(), from).await
    }

    async fn request_global_stats(&self, from: Address) -> Result<PendingTx, ChainError> {
        self.send(self.binding.request_global_stats(), from).await
    }

    async fn request_subject_stats(&self, from: Address, subject: &str) -> Result<PendingTx, ChainError> {
        self.send(self.binding.request_subject_stats(subject.to_string()), from).await
    }

    async fn allow_user_to_decrypt(&self, from: Address, user: Address, subjects: &[String]) -> Result<PendingTx, ChainError> {
        self.send(self.binding.allow_user_to_decrypt(user, subjects.to_vec()), from).await
    }
}

/// Connects ethers proxies on one chain, checking for deployed code first.
pub struct EthersContracts<M> {
    client: Arc<M>,
    chain_id: ChainId,
}

impl<M: Middleware + 'static> EthersContracts<M> {
    pub fn new(client: Arc<M>, chain_id: ChainId) -> Self {
        EthersContracts { client, chain_id }
    }

    async fn ensure_code(&self, name: &str, chain_id: ChainId, address: Address) -> Result<(), ChainError> {
        if chain_id != self.chain_id {
            return Err(ChainError::NotDeployed(format!(
                "{} requested on chain {} but the provider serves chain {}",
                name, chain_id, self.chain_id
            )));
        }
        let code = self.client.get_code(address, None).await.map_err(rpc_error)?;
        if code.is_empty() {
            return Err(ChainError::NotDeployed(format!(
                "{} has no code at {:#x} on chain {}",
                name, address, chain_id
            )));
        }
        info!("Connected {} at {:#x} on chain {}", name, address, chain_id);
        Ok(())
    }
}

#[async_trait]
impl<M: Middleware + 'static> ContractProvider for EthersContracts<M> {
    async fn fhe_counter(&self, chain_id: ChainId, address: Address) -> Result<Arc<dyn FheCounterContract>, ChainError> {
        self.ensure_code("FHECounter", chain_id, address).await?;
        Ok(Arc::new(EthersFheCounter::new(address, self.client.clone(), chain_id)))
    }

    async fn election(&self, chain_id: ChainId, address: Address) -> Result<Arc<dyn ElectionContract>, ChainError> {
        self.ensure_code("AnonymousElection", chain_id, address).await?;
        Ok(Arc::new(EthersElection::new(address, self.client.clone(), chain_id)))
    }

    async fn rating_system(&self, chain_id: ChainId, address: Address) -> Result<Arc<dyn RatingContract>, ChainError> {
        self.ensure_code("EncryptedRatingSystem", chain_id, address).await?;
        Ok(Arc::new(EthersRatingSystem::new(address, self.client.clone(), chain_id)))
    }
}
