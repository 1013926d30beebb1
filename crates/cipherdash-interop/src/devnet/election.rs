use super::Devnet;
use crate::chain::{ChainError, LogEntry, PendingTx};
use crate::contracts::{
    encode_call, event_topic, ElectionContract, ElectionInfo, CREATE_ELECTION_SIGNATURE, ELECTION_CREATED_EVENT,
    END_ELECTION_SIGNATURE, FINALIZE_ELECTION_SIGNATURE, VOTE_SIGNATURE,
};
use async_trait::async_trait;
use cipherdash_core::{Address, CiphertextHandle, H256, U256};
use ethers::abi::{encode, Token};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

pub const MIN_CANDIDATES: usize = 2;
pub const MAX_CANDIDATES: usize = 10;
const SECONDS_PER_HOUR: u64 = 3_600;

const CREATE_GAS: u64 = 320_000;
const VOTE_GAS: u64 = 210_000;
const END_GAS: u64 = 45_000;
const FINALIZE_GAS: u64 = 120_000;

struct ElectionRecord {
    info: ElectionInfo,
    vote_sum: CiphertextHandle,
    voters: HashSet<Address>,
    decrypted_sum: Option<u64>,
}

/// Anonymous election: each voter adds an encrypted choice to a per-election
/// encrypted sum, which the admin may decrypt and publish after the end time.
pub struct DevElection {
    address: Address,
    chain: Arc<Devnet>,
    elections: Mutex<Vec<ElectionRecord>>,
}

fn missing() -> String {
    "Election does not exist".to_string()
}

/// `ElectionCreated(uint256 indexed electionId, address indexed admin, string title, uint256 endTime)`
fn election_created(contract: Address, id: u64, admin: Address, title: &str, end_time: u64) -> LogEntry {
    LogEntry {
        address: contract,
        topics: vec![
            event_topic(ELECTION_CREATED_EVENT),
            H256::from_low_u64_be(id),
            H256::from(admin),
        ],
        data: encode(&[Token::String(title.to_string()), Token::Uint(U256::from(end_time))]),
    }
}

impl DevElection {
    pub(crate) fn deploy(chain: Arc<Devnet>, deployer: Address) -> Self {
        let address = chain.deploy(deployer, "AnonymousElection");
        DevElection { address, chain, elections: Mutex::new(Vec::new()) }
    }

    fn pending(&self, hash: cipherdash_core::H256) -> PendingTx {
        PendingTx::new(hash, self.chain.clone())
    }

    fn with_record<T>(&self, election_id: u64, read: impl FnOnce(&ElectionRecord) -> T) -> Result<T, ChainError> {
        let elections = self.elections.lock();
        elections
            .get(election_id as usize)
            .map(read)
            .ok_or_else(|| ChainError::Reverted(missing()))
    }
}

#[async_trait]
impl ElectionContract for DevElection {
    fn address(&self) -> Address {
        self.address
    }

    async fn election_count(&self) -> Result<u64, ChainError> {
        Ok(self.elections.lock().len() as u64)
    }

    async fn get_election(&self, election_id: u64) -> Result<ElectionInfo, ChainError> {
        self.with_record(election_id, |r| r.info.clone())
    }

    async fn has_user_voted(&self, election_id: u64, voter: Address) -> Result<bool, ChainError> {
        self.with_record(election_id, |r| r.voters.contains(&voter))
    }

    async fn encrypted_vote_sum(&self, election_id: u64) -> Result<CiphertextHandle, ChainError> {
        self.with_record(election_id, |r| r.vote_sum)
    }

    async fn decrypted_vote_sum(&self, election_id: u64) -> Result<u64, ChainError> {
        self.with_record(election_id, |r| r.decrypted_sum)?
            .ok_or_else(|| ChainError::Reverted("Election not finalized yet".to_string()))
    }

    async fn create_election(
        &self,
        from: Address,
        title: &str,
        description: &str,
        candidates: &[String],
        duration_hours: u64,
    ) -> Result<PendingTx, ChainError> {
        let calldata = encode_call(
            CREATE_ELECTION_SIGNATURE,
            &[
                Token::String(title.to_string()),
                Token::String(description.to_string()),
                Token::Array(candidates.iter().cloned().map(Token::String).collect()),
                Token::Uint(U256::from(duration_hours)),
            ],
        );
        let coprocessor = self.chain.coprocessor().clone();
        let contract = self.address;

        let mut elections = self.elections.lock();
        let hash = self.chain.execute_logged(from, Some(contract), calldata, CREATE_GAS, |now| {
            if candidates.len() < MIN_CANDIDATES {
                return Err("Must have at least 2 candidates".to_string());
            }
            if candidates.len() > MAX_CANDIDATES {
                return Err("Cannot have more than 10 candidates".to_string());
            }
            if duration_hours == 0 {
                return Err("Duration must be greater than 0".to_string());
            }

            let vote_sum = coprocessor.trivial_encrypt(contract, 0);
            coprocessor.allow(contract, &vote_sum, from).map_err(|e| e.to_string())?;

            let id = elections.len() as u64;
            let end_time = now + duration_hours * SECONDS_PER_HOUR;
            elections.push(ElectionRecord {
                info: ElectionInfo {
                    id,
                    title: title.to_string(),
                    description: description.to_string(),
                    candidate_names: candidates.to_vec(),
                    end_time,
                    is_active: true,
                    is_finalized: false,
                    admin: from,
                    total_voters: 0,
                },
                vote_sum,
                voters: HashSet::new(),
                decrypted_sum: None,
            });
            Ok(vec![election_created(contract, id, from, title, end_time)])
        });

        Ok(self.pending(hash))
    }

    async fn vote(
        &self,
        from: Address,
        election_id: u64,
        encrypted_vote: CiphertextHandle,
        proof: Vec<u8>,
    ) -> Result<PendingTx, ChainError> {
        let calldata = encode_call(
            VOTE_SIGNATURE,
            &[
                Token::Uint(U256::from(election_id)),
                Token::FixedBytes(encrypted_vote.as_bytes().to_vec()),
                Token::Bytes(proof.clone()),
            ],
        );
        let coprocessor = self.chain.coprocessor().clone();
        let contract = self.address;

        let mut elections = self.elections.lock();
        let hash = self.chain.execute(from, Some(contract), calldata, VOTE_GAS, |now| {
            let record = elections.get_mut(election_id as usize).ok_or_else(missing)?;
            if !record.info.is_active {
                return Err("Election is not active".to_string());
            }
            if now >= record.info.end_time {
                return Err("Election has ended".to_string());
            }
            if record.voters.contains(&from) {
                return Err("Already voted in this election".to_string());
            }

            let choice = coprocessor
                .verify_input(contract, from, encrypted_vote, &proof)
                .map_err(|e| e.to_string())?;
            let sum = coprocessor.add(contract, &record.vote_sum, &choice).map_err(|e| e.to_string())?;
            coprocessor.allow(contract, &sum, record.info.admin).map_err(|e| e.to_string())?;

            record.vote_sum = sum;
            record.voters.insert(from);
            record.info.total_voters += 1;
            Ok(())
        });

        Ok(self.pending(hash))
    }

    async fn end_election(&self, from: Address, election_id: u64) -> Result<PendingTx, ChainError> {
        let calldata = encode_call(END_ELECTION_SIGNATURE, &[Token::Uint(U256::from(election_id))]);

        let mut elections = self.elections.lock();
        let hash = self.chain.execute(from, Some(self.address), calldata, END_GAS, |now| {
            let record = elections.get_mut(election_id as usize).ok_or_else(missing)?;
            if !record.info.is_active {
                return Err("Election is not active".to_string());
            }
            if now < record.info.end_time {
                return Err("Election has not ended yet".to_string());
            }
            record.info.is_active = false;
            Ok(())
        });

        Ok(self.pending(hash))
    }

    async fn finalize_election(&self, from: Address, election_id: u64) -> Result<PendingTx, ChainError> {
        let calldata = encode_call(FINALIZE_ELECTION_SIGNATURE, &[Token::Uint(U256::from(election_id))]);
        let coprocessor = self.chain.coprocessor().clone();
        let contract = self.address;

        let mut elections = self.elections.lock();
        let hash = self.chain.execute(from, Some(contract), calldata, FINALIZE_GAS, |now| {
            let record = elections.get_mut(election_id as usize).ok_or_else(missing)?;
            if from != record.info.admin {
                return Err("Only admin can perform this action".to_string());
            }
            if now < record.info.end_time {
                return Err("Election has not ended yet".to_string());
            }
            if record.info.is_finalized {
                return Err("Election already finalized".to_string());
            }

            coprocessor
                .make_publicly_decryptable(contract, &record.vote_sum)
                .map_err(|e| e.to_string())?;
            let sum = coprocessor.public_decrypt(&record.vote_sum).map_err(|e| e.to_string())?;

            record.decrypted_sum = Some(sum);
            record.info.is_finalized = true;
            record.info.is_active = false;
            Ok(())
        });

        Ok(self.pending(hash))
    }
}
