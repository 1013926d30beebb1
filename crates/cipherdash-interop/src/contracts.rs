//! Contract proxy traits for `FHECounter`, `AnonymousElection` and
//! `EncryptedRatingSystem`, plus the function signatures shared by every
//! backend.

use crate::chain::{ChainError, PendingTx, Receipt};
use async_trait::async_trait;
use cipherdash_core::{Address, ChainId, CiphertextHandle, H256};
use ethers::abi::{encode, Token};
use ethers::utils::{id, keccak256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const INCREMENT_SIGNATURE: &str = "increment(bytes32,bytes)";
pub const DECREMENT_SIGNATURE: &str = "decrement(bytes32,bytes)";
pub const CREATE_ELECTION_SIGNATURE: &str = "createElection(string,string,string[],uint256)";
pub const VOTE_SIGNATURE: &str = "vote(uint256,bytes32,bytes)";
pub const END_ELECTION_SIGNATURE: &str = "endElection(uint256)";
pub const FINALIZE_ELECTION_SIGNATURE: &str = "finalizeElection(uint256)";
pub const ELECTION_CREATED_EVENT: &str = "ElectionCreated(uint256,address,string,uint256)";

pub const SUBMIT_RATING_SIGNATURE: &str = "submitRating(bytes32,bytes,string)";
pub const UPDATE_RATING_SIGNATURE: &str = "updateRating(bytes32,bytes,string)";
pub const DELETE_RATING_SIGNATURE: &str = "deleteRating()";
pub const REQUEST_GLOBAL_STATS_SIGNATURE: &str = "requestGlobalStats()";
pub const REQUEST_SUBJECT_STATS_SIGNATURE: &str = "requestSubjectStats(string)";
pub const ALLOW_USER_TO_DECRYPT_SIGNATURE: &str = "allowUserToDecrypt(address,string[])";

/// 4-byte function selector of a canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
    id(signature)
}

/// Selector followed by the ABI-encoded arguments.
pub fn encode_call(signature: &str, args: &[Token]) -> Vec<u8> {
    let mut calldata = selector(signature).to_vec();
    calldata.extend(encode(args));
    calldata
}

/// topic0 of an event signature.
pub fn event_topic(signature: &str) -> H256 {
    H256::from(keccak256(signature))
}

/// Id of the election created by the transaction behind `receipt`, read from
/// the `ElectionCreated` log that `contract` emitted.
pub fn created_election_id(receipt: &Receipt, contract: Address) -> Option<u64> {
    let topic = event_topic(ELECTION_CREATED_EVENT);
    receipt
        .logs
        .iter()
        .filter(|log| log.address == contract && log.topics.first() == Some(&topic))
        .find_map(|log| {
            let id = log.topics.get(1)?.as_bytes();
            // uint256 topic; ids beyond u64 are not ours
            if id[..24].iter().any(|b| *b != 0) {
                return None;
            }
            let mut low = [0u8; 8];
            low.copy_from_slice(&id[24..]);
            Some(u64::from_be_bytes(low))
        })
}

/// Calldata of `increment`/`decrement`.
pub fn encrypted_input_args(handle: &CiphertextHandle, proof: &[u8]) -> Vec<Token> {
    vec![Token::FixedBytes(handle.as_bytes().to_vec()), Token::Bytes(proof.to_vec())]
}

/// Election record as returned by `getElection`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionInfo {
    pub id: u64,
    pub title: String,
    pub description: String,
    pub candidate_names: Vec<String>,
    /// Unix seconds.
    pub end_time: u64,
    pub is_active: bool,
    pub is_finalized: bool,
    pub admin: Address,
    pub total_voters: u64,
}

impl ElectionInfo {
    pub fn candidate_count(&self) -> usize {
        self.candidate_names.len()
    }

    /// Voting is open at `now`.
    pub fn accepts_votes(&self, now: u64) -> bool {
        self.is_active && now < self.end_time
    }

    pub fn has_ended(&self, now: u64) -> bool {
        now >= self.end_time
    }
}

/// One row of `getEntry`. A user has at most one active entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingEntry {
    pub id: u64,
    pub subject: String,
    /// Unix seconds of the last submit or update.
    pub timestamp: u64,
    pub submitter: Address,
    pub is_active: bool,
}

/// Encrypted running sum of ratings and the number of ratings in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedStats {
    pub sum: CiphertextHandle,
    pub count: u64,
}

/// Published statistics; `average` is the floored mean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingStats {
    pub average: u64,
    pub count: u64,
    pub finalized: bool,
}

impl RatingStats {
    /// Floored mean of `sum` over `count`; zero when there are no ratings.
    pub fn from_sum(sum: u64, count: u64, finalized: bool) -> Self {
        let average = sum.checked_div(count).unwrap_or(0);
        RatingStats { average, count, finalized }
    }
}

#[async_trait]
pub trait FheCounterContract: Send + Sync {
    fn address(&self) -> Address;

    /// Handle of the encrypted count; `ZERO` before the first write.
    async fn get_count(&self) -> Result<CiphertextHandle, ChainError>;

    async fn increment(&self, from: Address, input: CiphertextHandle, proof: Vec<u8>) -> Result<PendingTx, ChainError>;

    async fn decrement(&self, from: Address, input: CiphertextHandle, proof: Vec<u8>) -> Result<PendingTx, ChainError>;
}

#[async_trait]
pub trait ElectionContract: Send + Sync {
    fn address(&self) -> Address;

    async fn election_count(&self) -> Result<u64, ChainError>;

    async fn get_election(&self, election_id: u64) -> Result<ElectionInfo, ChainError>;

    async fn has_user_voted(&self, election_id: u64, voter: Address) -> Result<bool, ChainError>;

    /// Handle of the running sum of encrypted choices.
    async fn encrypted_vote_sum(&self, election_id: u64) -> Result<CiphertextHandle, ChainError>;

    /// Cleartext sum, available once the election is finalized.
    async fn decrypted_vote_sum(&self, election_id: u64) -> Result<u64, ChainError>;

    async fn create_election(
        &self,
        from: Address,
        title: &str,
        description: &str,
        candidates: &[String],
        duration_hours: u64,
    ) -> Result<PendingTx, ChainError>;

    async fn vote(
        &self,
        from: Address,
        election_id: u64,
        encrypted_vote: CiphertextHandle,
        proof: Vec<u8>,
    ) -> Result<PendingTx, ChainError>;

    async fn end_election(&self, from: Address, election_id: u64) -> Result<PendingTx, ChainError>;

    async fn finalize_election(&self, from: Address, election_id: u64) -> Result<PendingTx, ChainError>;
}

#[async_trait]
pub trait RatingContract: Send + Sync {
    fn address(&self) -> Address;

    /// The user holds an active entry.
    async fn has_submitted(&self, user: Address) -> Result<bool, ChainError>;

    async fn has_submitted_for_subject(&self, user: Address, subject: &str) -> Result<bool, ChainError>;

    /// Entries ever created, active or not.
    async fn entry_count(&self) -> Result<u64, ChainError>;

    async fn get_entry(&self, entry_id: u64) -> Result<RatingEntry, ChainError>;

    async fn active_entry_count(&self) -> Result<u64, ChainError>;

    async fn encrypted_global_stats(&self) -> Result<EncryptedStats, ChainError>;

    async fn encrypted_subject_stats(&self, subject: &str) -> Result<EncryptedStats, ChainError>;

    async fn subject_entry_count(&self, subject: &str) -> Result<u64, ChainError>;

    async fn is_global_stats_finalized(&self) -> Result<bool, ChainError>;

    /// Reverts until `requestGlobalStats` has published a result.
    async fn global_stats(&self) -> Result<RatingStats, ChainError>;

    async fn is_subject_stats_finalized(&self, subject: &str) -> Result<bool, ChainError>;

    async fn subject_stats(&self, subject: &str) -> Result<RatingStats, ChainError>;

    async fn submit_rating(
        &self,
        from: Address,
        rating: CiphertextHandle,
        proof: Vec<u8>,
        subject: &str,
    ) -> Result<PendingTx, ChainError>;

    async fn update_rating(
        &self,
        from: Address,
        rating: CiphertextHandle,
        proof: Vec<u8>,
        subject: &str,
    ) -> Result<PendingTx, ChainError>;

    async fn delete_rating(&self, from: Address) -> Result<PendingTx, ChainError>;

    async fn request_global_stats(&self, from: Address) -> Result<PendingTx, ChainError>;

    async fn request_subject_stats(&self, from: Address, subject: &str) -> Result<PendingTx, ChainError>;

    /// Owner only: grant `user` the global sum and the sums of `subjects`.
    async fn allow_user_to_decrypt(&self, from: Address, user: Address, subjects: &[String]) -> Result<PendingTx, ChainError>;
}

/// Connects contract proxies by chain and address.
///
/// An address with no code behind it resolves to `ChainError::NotDeployed`.
#[async_trait]
pub trait ContractProvider: Send + Sync {
    async fn fhe_counter(&self, chain_id: ChainId, address: Address) -> Result<Arc<dyn FheCounterContract>, ChainError>;

    async fn election(&self, chain_id: ChainId, address: Address) -> Result<Arc<dyn ElectionContract>, ChainError>;

    async fn rating_system(&self, chain_id: ChainId, address: Address) -> Result<Arc<dyn RatingContract>, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::LogEntry;
    use cipherdash_core::U256;

    #[test]
    fn test_selectors_are_distinct() {
        let inc = selector(INCREMENT_SIGNATURE);
        let dec = selector(DECREMENT_SIGNATURE);
        assert_ne!(inc, dec);

        let calldata = encode_call(INCREMENT_SIGNATURE, &encrypted_input_args(&CiphertextHandle::ZERO, &[1, 2]));
        assert_eq!(calldata[..4], inc);
        // selector + bytes32 + offset + length + one padded word
        assert_eq!(calldata.len(), 4 + 32 * 4);
    }

    #[test]
    fn test_election_window() {
        let election = ElectionInfo {
            id: 0,
            title: "t".into(),
            description: "d".into(),
            candidate_names: vec!["a".into(), "b".into()],
            end_time: 100,
            is_active: true,
            is_finalized: false,
            admin: Address::zero(),
            total_voters: 0,
        };
        assert_eq!(election.candidate_count(), 2);
        assert!(election.accepts_votes(99));
        assert!(!election.accepts_votes(100));
        assert!(election.has_ended(100));
    }

    fn created_log(contract: Address, id: U256) -> LogEntry {
        let mut id_topic = [0u8; 32];
        id.to_big_endian(&mut id_topic);
        LogEntry {
            address: contract,
            topics: vec![event_topic(ELECTION_CREATED_EVENT), H256::from(id_topic), H256::zero()],
            data: Vec::new(),
        }
    }

    fn receipt_with(logs: Vec<LogEntry>) -> Receipt {
        Receipt {
            transaction_hash: H256::zero(),
            block_number: 1,
            success: true,
            gas_used: 0,
            revert_reason: None,
            logs,
        }
    }

    #[test]
    fn test_created_election_id_from_log() {
        let contract = Address::repeat_byte(0xe1);
        let other = Address::repeat_byte(0x0f);

        let receipt = receipt_with(vec![created_log(other, U256::from(9)), created_log(contract, U256::from(4))]);
        assert_eq!(created_election_id(&receipt, contract), Some(4));
        assert_eq!(created_election_id(&receipt, Address::zero()), None);
        assert_eq!(created_election_id(&receipt_with(Vec::new()), contract), None);

        let huge = receipt_with(vec![created_log(contract, U256::MAX)]);
        assert_eq!(created_election_id(&huge, contract), None);
    }

    #[test]
    fn test_rating_average_floors() {
        assert_eq!(RatingStats::from_sum(11, 3, true).average, 3);
        assert_eq!(RatingStats::from_sum(0, 0, false), RatingStats::default());
    }
}
