use super::Devnet;
use crate::chain::{ChainError, PendingTx};
use crate::contracts::{
    encode_call, EncryptedStats, RatingContract, RatingEntry, RatingStats, ALLOW_USER_TO_DECRYPT_SIGNATURE,
    DELETE_RATING_SIGNATURE, REQUEST_GLOBAL_STATS_SIGNATURE, REQUEST_SUBJECT_STATS_SIGNATURE, SUBMIT_RATING_SIGNATURE,
    UPDATE_RATING_SIGNATURE,
};
use async_trait::async_trait;
use cipherdash_core::{Address, CiphertextHandle, H256};
use cipherdash_crypto::MockCoprocessor;
use ethers::abi::Token;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const SUBMIT_GAS: u64 = 260_000;
const UPDATE_GAS: u64 = 300_000;
const DELETE_GAS: u64 = 150_000;
const REQUEST_GAS: u64 = 120_000;
const ALLOW_GAS: u64 = 60_000;

struct Entry {
    info: RatingEntry,
    rating: CiphertextHandle,
}

/// Encrypted sum and count of one scope, plus the average once published.
#[derive(Clone, Copy, Default)]
struct Aggregate {
    sum: CiphertextHandle,
    count: u64,
    published: Option<u64>,
}

impl Aggregate {
    fn encrypted(&self) -> EncryptedStats {
        EncryptedStats { sum: self.sum, count: self.count }
    }

    fn stats(&self) -> Option<RatingStats> {
        self.published.map(|average| RatingStats { average, count: self.count, finalized: true })
    }

    fn changed(sum: CiphertextHandle, count: u64) -> Self {
        Aggregate { sum, count, published: None }
    }
}

#[derive(Default)]
struct RatingState {
    entries: Vec<Entry>,
    active: HashMap<Address, usize>,
    global: Aggregate,
    subjects: HashMap<String, Aggregate>,
}

impl RatingState {
    fn subject(&self, subject: &str) -> Aggregate {
        self.subjects.get(subject).copied().unwrap_or_default()
    }
}

/// Coprocessor calls made by the rating contract, with errors as revert
/// reasons.
struct Fhe<'a> {
    coprocessor: &'a MockCoprocessor,
    contract: Address,
}

impl Fhe<'_> {
    fn add(&self, a: &CiphertextHandle, b: &CiphertextHandle) -> Result<CiphertextHandle, String> {
        self.coprocessor.add(self.contract, a, b).map_err(|e| e.to_string())
    }

    fn sub(&self, a: &CiphertextHandle, b: &CiphertextHandle) -> Result<CiphertextHandle, String> {
        self.coprocessor.sub(self.contract, a, b).map_err(|e| e.to_string())
    }

    fn allow(&self, handle: &CiphertextHandle, account: Address) -> Result<(), String> {
        self.coprocessor.allow(self.contract, handle, account).map_err(|e| e.to_string())
    }

    /// Publish the floored mean of `aggregate`.
    fn average(&self, aggregate: &Aggregate) -> Result<u64, String> {
        self.coprocessor
            .make_publicly_decryptable(self.contract, &aggregate.sum)
            .map_err(|e| e.to_string())?;
        let sum = self.coprocessor.public_decrypt(&aggregate.sum).map_err(|e| e.to_string())?;
        Ok(RatingStats::from_sum(sum, aggregate.count, true).average)
    }
}

/// Encrypted ratings with one active entry per user. Every write folds the
/// rating into a global and a per-subject encrypted sum; the new sums are
/// readable by the contract and the caller, and any write withdraws the
/// published averages it touched.
pub struct DevRatingSystem {
    address: Address,
    owner: Address,
    chain: Arc<Devnet>,
    state: Mutex<RatingState>,
}

impl DevRatingSystem {
    pub(crate) fn deploy(chain: Arc<Devnet>, deployer: Address) -> Self {
        let address = chain.deploy(deployer, "EncryptedRatingSystem");
        DevRatingSystem { address, owner: deployer, chain, state: Mutex::new(RatingState::default()) }
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    fn pending(&self, hash: H256) -> PendingTx {
        PendingTx::new(hash, self.chain.clone())
    }

    fn rating_args(rating: &CiphertextHandle, proof: &[u8], subject: &str) -> Vec<Token> {
        vec![
            Token::FixedBytes(rating.as_bytes().to_vec()),
            Token::Bytes(proof.to_vec()),
            Token::String(subject.to_string()),
        ]
    }
}

#[async_trait]
impl RatingContract for DevRatingSystem {
    fn address(&self) -> Address {
        self.address
    }

    async fn has_submitted(&self, user: Address) -> Result<bool, ChainError> {
        Ok(self.state.lock().active.contains_key(&user))
    }

    async fn has_submitted_for_subject(&self, user: Address, subject: &str) -> Result<bool, ChainError> {
        let state = self.state.lock();
        Ok(state
            .active
            .get(&user)
            .and_then(|index| state.entries.get(*index))
            .map(|entry| entry.info.subject == subject)
            .unwrap_or(false))
    }

    async fn entry_count(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().entries.len() as u64)
    }

    async fn get_entry(&self, entry_id: u64) -> Result<RatingEntry, ChainError> {
        self.state
            .lock()
            .entries
            .get(entry_id as usize)
            .map(|entry| entry.info.clone())
            .ok_or_else(|| ChainError::Reverted("Entry does not exist".to_string()))
    }

    async fn active_entry_count(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().global.count)
    }

    async fn encrypted_global_stats(&self) -> Result<EncryptedStats, ChainError> {
        Ok(self.state.lock().global.encrypted())
    }

    async fn encrypted_subject_stats(&self, subject: &str) -> Result<EncryptedStats, ChainError> {
        Ok(self.state.lock().subject(subject).encrypted())
    }

    async fn subject_entry_count(&self, subject: &str) -> Result<u64, ChainError> {
        Ok(self.state.lock().subject(subject).count)
    }

    async fn is_global_stats_finalized(&self) -> Result<bool, ChainError> {
        Ok(self.state.lock().global.published.is_some())
    }

    async fn global_stats(&self) -> Result<RatingStats, ChainError> {
        self.state
            .lock()
            .global
            .stats()
            .ok_or_else(|| ChainError::Reverted("Global stats not finalized".to_string()))
    }

    async fn is_subject_stats_finalized(&self, subject: &str) -> Result<bool, ChainError> {
        Ok(self.state.lock().subject(subject).published.is_some())
    }

    async fn subject_stats(&self, subject: &str) -> Result<RatingStats, ChainError> {
        self.state
            .lock()
            .subject(subject)
            .stats()
            .ok_or_else(|| ChainError::Reverted("Subject stats not finalized".to_string()))
    }

    async fn submit_rating(
        &self,
        from: Address,
        rating: CiphertextHandle,
        proof: Vec<u8>,
        subject: &str,
    ) -> Result<PendingTx, ChainError> {
        let calldata = encode_call(SUBMIT_RATING_SIGNATURE, &Self::rating_args(&rating, &proof, subject));
        let coprocessor = self.chain.coprocessor().clone();
        let fhe = Fhe { coprocessor: &coprocessor, contract: self.address };

        let mut state = self.state.lock();
        let hash = self.chain.execute(from, Some(self.address), calldata, SUBMIT_GAS, |now| {
            if subject.trim().is_empty() {
                return Err("Subject cannot be empty".to_string());
            }
            if let Some(entry) = state.active.get(&from).and_then(|index| state.entries.get(*index)) {
                return Err(if entry.info.subject == subject {
                    "Already submitted for this subject".to_string()
                } else {
                    "Already have an active rating".to_string()
                });
            }

            let value = coprocessor
                .verify_input(self.address, from, rating, &proof)
                .map_err(|e| e.to_string())?;
            let previous = state.subject(subject);
            let global = fhe.add(&state.global.sum, &value)?;
            let scoped = fhe.add(&previous.sum, &value)?;
            fhe.allow(&global, from)?;
            fhe.allow(&scoped, from)?;

            let id = state.entries.len();
            state.entries.push(Entry {
                info: RatingEntry {
                    id: id as u64,
                    subject: subject.to_string(),
                    timestamp: now,
                    submitter: from,
                    is_active: true,
                },
                rating: value,
            });
            state.active.insert(from, id);
            state.global = Aggregate::changed(global, state.global.count + 1);
            state.subjects.insert(subject.to_string(), Aggregate::changed(scoped, previous.count + 1));
            Ok(())
        });

        Ok(self.pending(hash))
    }

    async fn update_rating(
        &self,
        from: Address,
        rating: CiphertextHandle,
        proof: Vec<u8>,
        subject: &str,
    ) -> Result<PendingTx, ChainError> {
        let calldata = encode_call(UPDATE_RATING_SIGNATURE, &Self::rating_args(&rating, &proof, subject));
        let coprocessor = self.chain.coprocessor().clone();
        let fhe = Fhe { coprocessor: &coprocessor, contract: self.address };

        let mut state = self.state.lock();
        let hash = self.chain.execute(from, Some(self.address), calldata, UPDATE_GAS, |now| {
            let Some(index) = state.active.get(&from).copied() else {
                return Err("No entry to update".to_string());
            };
            if subject.trim().is_empty() {
                return Err("Subject cannot be empty".to_string());
            }
            let (old_subject, old_rating) = {
                let entry = &state.entries[index];
                (entry.info.subject.clone(), entry.rating)
            };

            let value = coprocessor
                .verify_input(self.address, from, rating, &proof)
                .map_err(|e| e.to_string())?;
            let global = fhe.add(&fhe.sub(&state.global.sum, &old_rating)?, &value)?;
            fhe.allow(&global, from)?;

            let mut scopes = Vec::with_capacity(2);
            if old_subject == subject {
                let same = state.subject(subject);
                let sum = fhe.add(&fhe.sub(&same.sum, &old_rating)?, &value)?;
                fhe.allow(&sum, from)?;
                scopes.push((old_subject, Aggregate::changed(sum, same.count)));
            } else {
                let left = state.subject(&old_subject);
                let joined = state.subject(subject);
                let left_sum = fhe.sub(&left.sum, &old_rating)?;
                let joined_sum = fhe.add(&joined.sum, &value)?;
                fhe.allow(&left_sum, from)?;
                fhe.allow(&joined_sum, from)?;
                scopes.push((old_subject, Aggregate::changed(left_sum, left.count.saturating_sub(1))));
                scopes.push((subject.to_string(), Aggregate::changed(joined_sum, joined.count + 1)));
            }

            let entry = &mut state.entries[index];
            entry.info.subject = subject.to_string();
            entry.info.timestamp = now;
            entry.rating = value;
            state.global = Aggregate::changed(global, state.global.count);
            state.subjects.extend(scopes);
            Ok(())
        });

        Ok(self.pending(hash))
    }

    async fn delete_rating(&self, from: Address) -> Result<PendingTx, ChainError> {
        let calldata = encode_call(DELETE_RATING_SIGNATURE, &[]);
        let coprocessor = self.chain.coprocessor().clone();
        let fhe = Fhe { coprocessor: &coprocessor, contract: self.address };

        let mut state = self.state.lock();
        let hash = self.chain.execute(from, Some(self.address), calldata, DELETE_GAS, |_| {
            let Some(index) = state.active.get(&from).copied() else {
                return Err("No entry to delete".to_string());
            };
            let (subject, rating) = {
                let entry = &state.entries[index];
                (entry.info.subject.clone(), entry.rating)
            };

            let scope = state.subject(&subject);
            let global = fhe.sub(&state.global.sum, &rating)?;
            let scoped = fhe.sub(&scope.sum, &rating)?;
            fhe.allow(&global, from)?;
            fhe.allow(&scoped, from)?;

            state.entries[index].info.is_active = false;
            state.active.remove(&from);
            state.global = Aggregate::changed(global, state.global.count.saturating_sub(1));
            state.subjects.insert(subject, Aggregate::changed(scoped, scope.count.saturating_sub(1)));
            Ok(())
        });

        Ok(self.pending(hash))
    }

    async fn request_global_stats(&self, from: Address) -> Result<PendingTx, ChainError> {
        let calldata = encode_call(REQUEST_GLOBAL_STATS_SIGNATURE, &[]);
        let coprocessor = self.chain.coprocessor().clone();
        let fhe = Fhe { coprocessor: &coprocessor, contract: self.address };

        let mut state = self.state.lock();
        let hash = self.chain.execute(from, Some(self.address), calldata, REQUEST_GAS, |_| {
            if state.global.count == 0 {
                return Err("No active entries".to_string());
            }
            let average = fhe.average(&state.global)?;
            state.global.published = Some(average);
            Ok(())
        });

        Ok(self.pending(hash))
    }

    async fn request_subject_stats(&self, from: Address, subject: &str) -> Result<PendingTx, ChainError> {
        let calldata = encode_call(REQUEST_SUBJECT_STATS_SIGNATURE, &[Token::String(subject.to_string())]);
        let coprocessor = self.chain.coprocessor().clone();
        let fhe = Fhe { coprocessor: &coprocessor, contract: self.address };

        let mut state = self.state.lock();
        let hash = self.chain.execute(from, Some(self.address), calldata, REQUEST_GAS, |_| {
            let scope = state.subject(subject);
            if scope.count == 0 {
                return Err("No entries for subject".to_string());
            }
            let average = fhe.average(&scope)?;
            state.subjects.insert(subject.to_string(), Aggregate { published: Some(average), ..scope });
            Ok(())
        });

        Ok(self.pending(hash))
    }

    async fn allow_user_to_decrypt(&self, from: Address, user: Address, subjects: &[String]) -> Result<PendingTx, ChainError> {
        let calldata = encode_call(
            ALLOW_USER_TO_DECRYPT_SIGNATURE,
            &[Token::Address(user), Token::Array(subjects.iter().cloned().map(Token::String).collect())],
        );
        let coprocessor = self.chain.coprocessor().clone();
        let fhe = Fhe { coprocessor: &coprocessor, contract: self.address };
        let owner = self.owner;

        let state = self.state.lock();
        let hash = self.chain.execute(from, Some(self.address), calldata, ALLOW_GAS, |_| {
            if from != owner {
                return Err("Only owner can grant access".to_string());
            }
            fhe.allow(&state.global.sum, user)?;
            // unknown subjects have nothing to grant
            for scope in subjects.iter().filter_map(|s| state.subjects.get(s)) {
                fhe.allow(&scope.sum, user)?;
            }
            Ok(())
        });

        Ok(self.pending(hash))
    }
}
