// Anonymous election session
//
// Reads and administrative writes go straight to the contract and report
// through a status message; votes go through a per-election tally
// reconciler so they get the same in-flight and staleness handling as the
// counter.
//
// INVARIANTS:
// 1. No error leaves the session; failures become the status message and a
//    false / None / default return
// 2. A vote is only encrypted after the candidate index is checked against
//    the election's candidate list
// 3. The encrypted plaintext of a vote is the candidate index plus one
// 4. A listing reads at most `list_limit` elections, whatever count the
//    contract reports
// 5. Tally reconcilers are kept for the current chain only

use crate::operation::{LoadingGuard, Outcome, SkipReason};
use crate::reconciler::{HandleSource, Reconciler, SessionDeps, Submission};
use async_trait::async_trait;
use cipherdash_core::validation::{validate_candidate_index, ElectionDraft};
use cipherdash_core::{Address, ChainId, CiphertextHandle, ContractInfo, ContractKind, DEFAULT_LIST_LIMIT};
use cipherdash_interop::{
    created_election_id, ChainError, ContractProvider, ElectionContract, ElectionInfo, PendingTx, Receipt,
};
use dashmap::DashMap;
use log::{info, warn};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const CONNECT_WALLET: &str = "Please connect your wallet or contract not deployed";
const CONNECT_FOR_VOTE: &str = "Please connect your wallet and wait for encryption to initialize";

/// Encrypted vote sum of one election.
#[derive(Debug, Clone, Copy)]
pub struct TallySource {
    pub election_id: u64,
}

#[async_trait]
impl HandleSource for TallySource {
    /// Candidate index.
    type Mutation = usize;

    fn kind(&self) -> ContractKind {
        ContractKind::AnonymousElection
    }

    fn read_label(&self) -> String {
        format!("AnonymousElection.getEncryptedVoteSum({})", self.election_id)
    }

    async fn read_handle(
        &self,
        contracts: &dyn ContractProvider,
        chain_id: ChainId,
        address: Address,
    ) -> Result<CiphertextHandle, ChainError> {
        contracts
            .election(chain_id, address)
            .await?
            .encrypted_vote_sum(self.election_id)
            .await
    }

    fn plaintext(&self, candidate_index: &usize) -> Result<u32, SkipReason> {
        candidate_index
            .checked_add(1)
            .and_then(|choice| u32::try_from(choice).ok())
            .ok_or_else(|| SkipReason::Invalid(format!("candidate index {} out of range", candidate_index)))
    }

    fn describe(&self, candidate_index: &usize) -> String {
        format!("vote({}, {})", self.election_id, candidate_index)
    }

    async fn submit(
        &self,
        contracts: &dyn ContractProvider,
        submission: Submission,
        _candidate_index: &usize,
    ) -> Result<PendingTx, ChainError> {
        let election = contracts.election(submission.chain_id, submission.contract).await?;
        election
            .vote(submission.from, self.election_id, submission.input, submission.proof)
            .await
    }
}

pub struct ElectionSession {
    deps: SessionDeps,
    list_limit: u64,
    tallies: DashMap<(Option<ChainId>, u64), Arc<Reconciler<TallySource>>>,
    message: Mutex<String>,
    loading: AtomicUsize,
}

impl ElectionSession {
    pub fn new(deps: SessionDeps) -> Self {
        ElectionSession::with_list_limit(deps, DEFAULT_LIST_LIMIT)
    }

    pub fn with_list_limit(deps: SessionDeps, list_limit: u64) -> Self {
        ElectionSession {
            deps,
            list_limit,
            tallies: DashMap::new(),
            message: Mutex::new(String::new()),
            loading: AtomicUsize::new(0),
        }
    }

    pub fn list_limit(&self) -> u64 {
        self.list_limit
    }

    pub fn contract_info(&self) -> ContractInfo {
        self.deps
            .deployments
            .resolve(ContractKind::AnonymousElection, self.deps.context.chain_id())
    }

    pub fn is_deployed(&self) -> bool {
        self.contract_info().is_deployed()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst) > 0
    }

    pub fn message(&self) -> String {
        self.message.lock().clone()
    }

    fn set_message(&self, message: impl Into<String>) {
        *self.message.lock() = message.into();
    }

    fn report(&self, message: String) {
        warn!("{}", message);
        self.set_message(message);
    }

    async fn contract(&self) -> Result<Arc<dyn ElectionContract>, ChainError> {
        let info = self.contract_info();
        match (info.chain_id, info.address) {
            (Some(chain_id), Some(address)) => self.deps.contracts.election(chain_id, address).await,
            _ => Err(ChainError::NotDeployed(info.not_deployed_message())),
        }
    }

    /// Send a write as the current signer and wait for it to succeed.
    /// `write` returns the pending transaction and anything it wants back.
    async fn send<F, Fut, T>(&self, write: F) -> Result<(Receipt, T), String>
    where
        F: FnOnce(Arc<dyn ElectionContract>, Address) -> Fut,
        Fut: Future<Output = Result<(PendingTx, T), ChainError>>,
    {
        let (Some(from), true) = (self.deps.context.signer_address(), self.is_deployed()) else {
            return Err(CONNECT_WALLET.to_string());
        };
        let contract = self.contract().await.map_err(|e| e.to_string())?;
        let (pending, extra) = write(contract, from).await.map_err(|e| e.to_string())?;
        let receipt = pending.wait().await.map_err(|e| e.to_string())?;
        receipt.ensure_success().map_err(|e| e.to_string())?;
        Ok((receipt, extra))
    }

    pub async fn election_count(&self) -> u64 {
        if !self.is_deployed() {
            return 0;
        }
        match self.contract().await {
            Ok(contract) => match contract.election_count().await {
                Ok(count) => count,
                Err(e) => {
                    self.report(format!("Error getting election count: {}", e));
                    0
                }
            },
            Err(e) => {
                self.report(format!("Error getting election count: {}", e));
                0
            }
        }
    }

    pub async fn get_election(&self, election_id: u64) -> Option<ElectionInfo> {
        if !self.is_deployed() {
            return None;
        }
        let result = match self.contract().await {
            Ok(contract) => contract.get_election(election_id).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(info) => Some(info),
            Err(e) => {
                self.report(format!("Error getting election {}: {}", election_id, e));
                None
            }
        }
    }

    /// Readable elections, oldest first, at most `list_limit` of them.
    pub async fn list_elections(&self) -> Vec<ElectionInfo> {
        let count = self.election_count().await;
        if count > self.list_limit {
            self.report(format!("Showing the first {} of {} elections", self.list_limit, count));
        }
        let mut elections = Vec::new();
        for id in 0..count.min(self.list_limit) {
            if let Some(info) = self.get_election(id).await {
                elections.push(info);
            }
        }
        elections
    }

    /// Whether the current signer has voted; false without a signer.
    pub async fn has_user_voted(&self, election_id: u64) -> bool {
        let Some(voter) = self.deps.context.signer_address() else {
            return false;
        };
        if !self.is_deployed() {
            return false;
        }
        let result = match self.contract().await {
            Ok(contract) => contract.has_user_voted(election_id, voter).await,
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| {
            self.report(format!("Error checking vote status: {}", e));
            false
        })
    }

    /// Validate and create an election; returns its id.
    pub async fn create_election(&self, draft: &ElectionDraft) -> Option<u64> {
        if let Err(e) = draft.validate() {
            self.set_message(e.to_string());
            return None;
        }

        let _loading = LoadingGuard::enter(&self.loading);
        let sent = self
            .send(|contract, from| async move {
                let address = contract.address();
                let pending = contract
                    .create_election(from, &draft.title, &draft.description, &draft.candidates, draft.duration_hours)
                    .await?;
                Ok((pending, address))
            })
            .await;
        let (receipt, address) = match sent {
            Ok(sent) => sent,
            Err(e) => {
                self.report(format!("Failed to create election: {}", e));
                return None;
            }
        };

        self.set_message("Election created successfully!");
        let id = created_election_id(&receipt, address);
        match id {
            Some(id) => info!("Created election {} \"{}\"", id, draft.title),
            None => warn!(
                "Election \"{}\" created in {:#x} but no ElectionCreated event was found",
                draft.title, receipt.transaction_hash
            ),
        }
        id
    }

    /// Cast an encrypted vote for `candidate_index`.
    pub async fn vote(&self, election_id: u64, candidate_index: usize) -> Outcome {
        if !self.is_deployed() {
            self.set_message(CONNECT_FOR_VOTE);
            return Outcome::Skipped(SkipReason::NotDeployed);
        }
        let Some(election) = self.get_election(election_id).await else {
            return Outcome::Failed(self.message());
        };
        if let Err(e) = validate_candidate_index(candidate_index, election.candidate_count()) {
            self.set_message(e.to_string());
            return Outcome::Skipped(SkipReason::Invalid(e.to_string()));
        }

        let _loading = LoadingGuard::enter(&self.loading);
        let outcome = self.tally(election_id).mutate(candidate_index).await;
        match &outcome {
            Outcome::Committed => self.set_message("Vote cast successfully!"),
            Outcome::Failed(message) => self.set_message(message.clone()),
            Outcome::Skipped(SkipReason::NotDeployed | SkipReason::NoSigner | SkipReason::NoCapability) => {
                self.set_message(CONNECT_FOR_VOTE)
            }
            Outcome::Skipped(_) | Outcome::Stale => {}
        }
        outcome
    }

    /// Close voting once the end time has passed. Anyone may call this.
    pub async fn end_election(&self, election_id: u64) -> bool {
        let _loading = LoadingGuard::enter(&self.loading);
        match self
            .send(|contract, from| async move { Ok((contract.end_election(from, election_id).await?, ())) })
            .await
        {
            Ok(_) => {
                self.set_message("Election ended successfully!");
                true
            }
            Err(e) => {
                self.report(format!("Failed to end election: {}", e));
                false
            }
        }
    }

    /// Publish the tally. Admin only, after the end time.
    pub async fn finalize_election(&self, election_id: u64) -> bool {
        let _loading = LoadingGuard::enter(&self.loading);
        match self
            .send(|contract, from| async move { Ok((contract.finalize_election(from, election_id).await?, ())) })
            .await
        {
            Ok(_) => {
                self.set_message("Finalization requested! Results will be available after decryption.");
                true
            }
            Err(e) => {
                self.report(format!("Failed to finalize election: {}", e));
                false
            }
        }
    }

    /// Sum of all choices, available once finalized.
    pub async fn decrypted_vote_sum(&self, election_id: u64) -> Option<u64> {
        if !self.is_deployed() {
            return None;
        }
        let result = match self.contract().await {
            Ok(contract) => contract.decrypted_vote_sum(election_id).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(sum) => Some(sum),
            Err(e) => {
                warn!("Error getting decrypted sum: {}", e);
                None
            }
        }
    }

    /// Tally reconciler for `election_id` on the current chain. Reconcilers
    /// of other chains are dropped.
    pub fn tally(&self, election_id: u64) -> Arc<Reconciler<TallySource>> {
        let chain_id = self.deps.context.chain_id();
        if let Some(tally) = self.tallies.get(&(chain_id, election_id)) {
            return tally.value().clone();
        }
        self.tallies.retain(|(chain, _), _| *chain == chain_id);
        self.tallies
            .entry((chain_id, election_id))
            .or_insert_with(|| Arc::new(Reconciler::new(TallySource { election_id }, self.deps.clone())))
            .value()
            .clone()
    }

    /// Number of tally reconcilers held.
    pub fn tally_count(&self) -> usize {
        self.tallies.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_encodes_index_plus_one() {
        let source = TallySource { election_id: 3 };
        assert_eq!(source.plaintext(&0), Ok(1));
        assert_eq!(source.plaintext(&2), Ok(3));
        assert!(matches!(source.plaintext(&usize::MAX), Err(SkipReason::Invalid(_))));
        assert_eq!(source.describe(&1), "vote(3, 1)");
        assert_eq!(source.read_label(), "AnonymousElection.getEncryptedVoteSum(3)");
    }

}
