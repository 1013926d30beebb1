// Encrypted rating session
//
// Ratings are encrypted writes against the global encrypted sum, so they go
// through a Reconciler like counter deltas and votes. Per-subject sums get
// their own reconcilers. Views and the stats requests go straight to the
// contract and report through a status message.
//
// INVARIANTS:
// 1. No error leaves the session; failures become the status message and a
//    false / None / default return
// 2. A rating is encrypted only after the rating and the subject validate
// 3. A decrypted average is derived from the sum and count the contract
//    reported for the very handle that was decrypted
// 4. An entry scan reads at most `list_limit` entries, newest first
// 5. Subject reconcilers are kept for the current chain only

use crate::operation::{LoadingGuard, Outcome, SkipReason};
use crate::reconciler::{HandleSource, Reconciler, SessionDeps, Submission};
use async_trait::async_trait;
use cipherdash_core::validation::{validate_rating, validate_subject};
use cipherdash_core::{Address, ChainId, CiphertextHandle, ContractInfo, ContractKind, DEFAULT_LIST_LIMIT};
use cipherdash_interop::{
    ChainError, ContractProvider, EncryptedStats, PendingTx, RatingContract, RatingEntry, RatingStats,
};
use dashmap::DashMap;
use log::{info, warn};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const CONNECT_WALLET: &str = "Please connect your wallet or contract not deployed";
const CONNECT_FOR_RATING: &str = "Please connect your wallet and wait for encryption to initialize";

/// Which encrypted sum a reconciler follows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RatingScope {
    Global,
    Subject(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatingWrite {
    Submit,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatingMutation {
    pub write: RatingWrite,
    pub rating: u32,
    pub subject: String,
}

/// Reads an encrypted rating sum; a mutation submits or replaces the
/// caller's rating.
#[derive(Debug, Clone)]
pub struct RatingSumSource {
    pub scope: RatingScope,
}

impl RatingSumSource {
    async fn stats(
        &self,
        contracts: &dyn ContractProvider,
        chain_id: ChainId,
        address: Address,
    ) -> Result<EncryptedStats, ChainError> {
        let contract = contracts.rating_system(chain_id, address).await?;
        match &self.scope {
            RatingScope::Global => contract.encrypted_global_stats().await,
            RatingScope::Subject(subject) => contract.encrypted_subject_stats(subject).await,
        }
    }
}

#[async_trait]
impl HandleSource for RatingSumSource {
    type Mutation = RatingMutation;

    fn kind(&self) -> ContractKind {
        ContractKind::RatingSystem
    }

    fn read_label(&self) -> String {
        match &self.scope {
            RatingScope::Global => "EncryptedRatingSystem.getEncryptedGlobalStats()".to_string(),
            RatingScope::Subject(subject) => format!("EncryptedRatingSystem.getEncryptedSubjectStats(\"{}\")", subject),
        }
    }

    async fn read_handle(
        &self,
        contracts: &dyn ContractProvider,
        chain_id: ChainId,
        address: Address,
    ) -> Result<CiphertextHandle, ChainError> {
        Ok(self.stats(contracts, chain_id, address).await?.sum)
    }

    fn plaintext(&self, mutation: &RatingMutation) -> Result<u32, SkipReason> {
        validate_rating(mutation.rating).map_err(|e| SkipReason::Invalid(e.to_string()))?;
        validate_subject(&mutation.subject).map_err(|e| SkipReason::Invalid(e.to_string()))?;
        Ok(mutation.rating)
    }

    fn describe(&self, mutation: &RatingMutation) -> String {
        let op = match mutation.write {
            RatingWrite::Submit => "submitRating",
            RatingWrite::Update => "updateRating",
        };
        format!("{}(\"{}\")", op, mutation.subject)
    }

    async fn submit(
        &self,
        contracts: &dyn ContractProvider,
        submission: Submission,
        mutation: &RatingMutation,
    ) -> Result<PendingTx, ChainError> {
        let contract = contracts.rating_system(submission.chain_id, submission.contract).await?;
        match mutation.write {
            RatingWrite::Submit => {
                contract
                    .submit_rating(submission.from, submission.input, submission.proof, &mutation.subject)
                    .await
            }
            RatingWrite::Update => {
                contract
                    .update_rating(submission.from, submission.input, submission.proof, &mutation.subject)
                    .await
            }
        }
    }
}

/// Friendlier text for the contract's well-known reverts.
fn explain(message: &str) -> String {
    if message.contains("Already submitted for this subject") {
        "You have already submitted a rating for this subject. Please choose a different subject or update your existing rating.".to_string()
    } else if message.contains("Already have an active rating") {
        "You already have an active rating. Update or delete it before rating another subject.".to_string()
    } else if message.contains("No entry to update") {
        "You don't have a rating entry to update. Please submit a rating first.".to_string()
    } else if message.contains("No entry to delete") {
        "You don't have a rating entry to delete.".to_string()
    } else {
        message.to_string()
    }
}

pub struct RatingSession {
    deps: SessionDeps,
    list_limit: u64,
    global: Arc<Reconciler<RatingSumSource>>,
    subjects: DashMap<(Option<ChainId>, String), Arc<Reconciler<RatingSumSource>>>,
    message: Mutex<String>,
    loading: AtomicUsize,
}

impl RatingSession {
    pub fn new(deps: SessionDeps) -> Self {
        RatingSession::with_list_limit(deps, DEFAULT_LIST_LIMIT)
    }

    pub fn with_list_limit(deps: SessionDeps, list_limit: u64) -> Self {
        let global = Arc::new(Reconciler::new(RatingSumSource { scope: RatingScope::Global }, deps.clone()));
        RatingSession {
            deps,
            list_limit,
            global,
            subjects: DashMap::new(),
            message: Mutex::new(String::new()),
            loading: AtomicUsize::new(0),
        }
    }

    pub fn contract_info(&self) -> ContractInfo {
        self.deps
            .deployments
            .resolve(ContractKind::RatingSystem, self.deps.context.chain_id())
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

    /// Reconciler of the global encrypted sum.
    pub fn global(&self) -> &Arc<Reconciler<RatingSumSource>> {
        &self.global
    }

    /// Reconciler of `subject`'s encrypted sum on the current chain.
    pub fn subject(&self, subject: &str) -> Arc<Reconciler<RatingSumSource>> {
        let key = (self.deps.context.chain_id(), subject.to_string());
        if let Some(reconciler) = self.subjects.get(&key) {
            return reconciler.value().clone();
        }
        self.subjects.retain(|(chain, _), _| *chain == key.0);
        self.subjects
            .entry(key)
            .or_insert_with(|| {
                let source = RatingSumSource { scope: RatingScope::Subject(subject.to_string()) };
                Arc::new(Reconciler::new(source, self.deps.clone()))
            })
            .value()
            .clone()
    }

    fn reconciler(&self, scope: &RatingScope) -> Arc<Reconciler<RatingSumSource>> {
        match scope {
            RatingScope::Global => self.global.clone(),
            RatingScope::Subject(subject) => self.subject(subject),
        }
    }

    async fn contract(&self) -> Result<Arc<dyn RatingContract>, ChainError> {
        let info = self.contract_info();
        match (info.chain_id, info.address) {
            (Some(chain_id), Some(address)) => self.deps.contracts.rating_system(chain_id, address).await,
            _ => Err(ChainError::NotDeployed(info.not_deployed_message())),
        }
    }

    /// Run a read; on failure report `what` and return `fallback`.
    async fn read<T, F, Fut>(&self, what: &str, fallback: T, read: F) -> T
    where
        F: FnOnce(Arc<dyn RatingContract>) -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        if !self.is_deployed() {
            return fallback;
        }
        let result = match self.contract().await {
            Ok(contract) => read(contract).await,
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| {
            self.report(format!("Error getting {}: {}", what, e));
            fallback
        })
    }

    /// Send a write as the current signer and wait for it to succeed.
    async fn send<F, Fut>(&self, write: F) -> Result<(), String>
    where
        F: FnOnce(Arc<dyn RatingContract>, Address) -> Fut,
        Fut: Future<Output = Result<PendingTx, ChainError>>,
    {
        let (Some(from), true) = (self.deps.context.signer_address(), self.is_deployed()) else {
            return Err(CONNECT_WALLET.to_string());
        };
        let contract = self.contract().await.map_err(|e| e.to_string())?;
        let pending = write(contract, from).await.map_err(|e| e.to_string())?;
        let receipt = pending.wait().await.map_err(|e| e.to_string())?;
        receipt.ensure_success().map_err(|e| e.to_string())
    }

    /// Whether the current signer holds an active rating.
    pub async fn has_submitted(&self) -> bool {
        let Some(user) = self.deps.context.signer_address() else {
            return false;
        };
        self.read("submission status", false, |c| async move { c.has_submitted(user).await })
            .await
    }

    pub async fn has_submitted_for_subject(&self, subject: &str) -> bool {
        let Some(user) = self.deps.context.signer_address() else {
            return false;
        };
        self.read("subject submission status", false, |c| async move {
            c.has_submitted_for_subject(user, subject).await
        })
        .await
    }

    /// The current signer's active entry, searched among the latest
    /// `list_limit` entries.
    pub async fn user_entry(&self) -> Option<RatingEntry> {
        let user = self.deps.context.signer_address()?;
        if !self.has_submitted().await {
            return None;
        }
        let count = self.read("entry count", 0, |c| async move { c.entry_count().await }).await;
        if count > self.list_limit {
            info!("Searching the latest {} of {} rating entries", self.list_limit, count);
        }
        let contract = self.contract().await.ok()?;
        for id in (count.saturating_sub(self.list_limit)..count).rev() {
            match contract.get_entry(id).await {
                Ok(entry) if entry.submitter == user && entry.is_active => return Some(entry),
                Ok(_) => {}
                Err(e) => {
                    self.report(format!("Error getting rating entry {}: {}", id, e));
                    return None;
                }
            }
        }
        None
    }

    /// Active ratings; falls back to the count beside the encrypted sum.
    pub async fn active_entry_count(&self) -> u64 {
        if !self.is_deployed() {
            return 0;
        }
        let contract = match self.contract().await {
            Ok(contract) => contract,
            Err(e) => {
                self.report(format!("Error getting active entry count: {}", e));
                return 0;
            }
        };
        match contract.active_entry_count().await {
            Ok(count) => count,
            Err(direct) => {
                warn!("getActiveEntryCount failed ({}); reading getEncryptedGlobalStats", direct);
                match contract.encrypted_global_stats().await {
                    Ok(stats) => stats.count,
                    Err(e) => {
                        self.report(format!("Error getting active entry count: {}", e));
                        0
                    }
                }
            }
        }
    }

    pub async fn subject_entry_count(&self, subject: &str) -> u64 {
        self.read("subject entry count", 0, |c| async move { c.subject_entry_count(subject).await })
            .await
    }

    /// Published global statistics; only the active count until finalized.
    pub async fn global_stats(&self) -> RatingStats {
        let count = self.active_entry_count().await;
        let finalized = self
            .read("global stats status", false, |c| async move { c.is_global_stats_finalized().await })
            .await;
        if !finalized {
            return RatingStats { average: 0, count, finalized: false };
        }
        self.read("global stats", RatingStats::default(), |c| async move { c.global_stats().await })
            .await
    }

    /// Published statistics of `subject`; default until finalized.
    pub async fn subject_stats(&self, subject: &str) -> RatingStats {
        let finalized = self
            .read("subject stats status", false, |c| async move { c.is_subject_stats_finalized(subject).await })
            .await;
        if !finalized {
            return RatingStats::default();
        }
        self.read("subject stats", RatingStats::default(), |c| async move { c.subject_stats(subject).await })
            .await
    }

    async fn write_rating(&self, write: RatingWrite, rating: u32, subject: &str) -> Outcome {
        if let Err(e) = validate_rating(rating).and_then(|()| validate_subject(subject)) {
            self.set_message(e.to_string());
            return Outcome::Skipped(SkipReason::Invalid(e.to_string()));
        }
        if !self.is_deployed() {
            self.set_message(CONNECT_FOR_RATING);
            return Outcome::Skipped(SkipReason::NotDeployed);
        }

        let _loading = LoadingGuard::enter(&self.loading);
        let mutation = RatingMutation { write, rating, subject: subject.to_string() };
        let outcome = self.global.mutate(mutation).await;
        match &outcome {
            Outcome::Committed => {
                self.set_message(match write {
                    RatingWrite::Submit => "Rating submitted successfully!",
                    RatingWrite::Update => "Rating updated successfully!",
                });
            }
            Outcome::Failed(message) => self.set_message(explain(message)),
            Outcome::Skipped(SkipReason::NotDeployed | SkipReason::NoSigner | SkipReason::NoCapability) => {
                self.set_message(CONNECT_FOR_RATING)
            }
            Outcome::Skipped(_) | Outcome::Stale => {}
        }
        outcome
    }

    /// Encrypt and submit a first rating.
    pub async fn submit_rating(&self, rating: u32, subject: &str) -> Outcome {
        self.write_rating(RatingWrite::Submit, rating, subject).await
    }

    /// Replace the current signer's rating, possibly moving it to another
    /// subject.
    pub async fn update_rating(&self, rating: u32, subject: &str) -> Outcome {
        self.write_rating(RatingWrite::Update, rating, subject).await
    }

    pub async fn delete_rating(&self) -> bool {
        let _loading = LoadingGuard::enter(&self.loading);
        match self.send(|contract, from| async move { contract.delete_rating(from).await }).await {
            Ok(()) => {
                self.set_message("Rating deleted successfully!");
                self.global.refresh_handle().await;
                true
            }
            Err(e) => {
                self.report(format!("Failed to delete rating: {}", explain(&e)));
                false
            }
        }
    }

    /// Ask the contract to publish the global average.
    pub async fn request_global_stats(&self) -> bool {
        let _loading = LoadingGuard::enter(&self.loading);
        match self.send(|contract, from| async move { contract.request_global_stats(from).await }).await {
            Ok(()) => {
                self.set_message("Global statistics published!");
                true
            }
            Err(e) => {
                self.report(format!("Failed to request global stats: {}", e));
                false
            }
        }
    }

    pub async fn request_subject_stats(&self, subject: &str) -> bool {
        let _loading = LoadingGuard::enter(&self.loading);
        match self
            .send(|contract, from| async move { contract.request_subject_stats(from, subject).await })
            .await
        {
            Ok(()) => {
                self.set_message(format!("Statistics for \"{}\" published!", subject));
                true
            }
            Err(e) => {
                self.report(format!("Failed to request subject stats: {}", e));
                false
            }
        }
    }

    /// Owner only: let `user` decrypt the global sum and the sums of
    /// `subjects`.
    pub async fn allow_user_to_decrypt(&self, user: Address, subjects: &[String]) -> bool {
        let _loading = LoadingGuard::enter(&self.loading);
        match self
            .send(|contract, from| async move { contract.allow_user_to_decrypt(from, user, subjects).await })
            .await
        {
            Ok(()) => {
                self.set_message("Decryption permission granted!");
                true
            }
            Err(e) => {
                self.report(format!("Failed to grant decryption permission: {}", e));
                false
            }
        }
    }

    /// Decrypt the sum of `scope` for the current signer and derive the
    /// average locally. The result is not published on chain.
    pub async fn decrypt_stats(&self, scope: &RatingScope) -> Option<RatingStats> {
        let before = self.encrypted_stats(scope).await?;
        if before.count == 0 {
            self.set_message(match scope {
                RatingScope::Global => "No active entries to decrypt".to_string(),
                RatingScope::Subject(subject) => format!("No entries for subject: {}", subject),
            });
            return None;
        }

        let reconciler = self.reconciler(scope);
        let refreshed = reconciler.refresh_handle().await;
        if reconciler.handle().is_none() {
            warn!("Refresh before decrypt returned {:?}", refreshed);
            self.set_message(reconciler.message());
            return None;
        }
        match reconciler.decrypt().await {
            Outcome::Committed | Outcome::Skipped(SkipReason::AlreadyDecrypted) => {}
            outcome => {
                warn!("Decrypting rating sum returned {:?}", outcome);
                self.set_message(reconciler.message());
                return None;
            }
        }
        let clear = reconciler.clear()?;

        // the count must belong to the decrypted sum
        let after = self.encrypted_stats(scope).await?;
        if after.sum != clear.handle {
            self.set_message("Ratings changed while decrypting; try again");
            return None;
        }
        let stats = RatingStats::from_sum(clear.value, after.count, false);
        self.set_message(format!("Average rating {} over {} rating(s)", stats.average, stats.count));
        Some(stats)
    }

    async fn encrypted_stats(&self, scope: &RatingScope) -> Option<EncryptedStats> {
        if !self.is_deployed() {
            self.set_message(self.contract_info().not_deployed_message());
            return None;
        }
        let result = match self.contract().await {
            Ok(contract) => match scope {
                RatingScope::Global => contract.encrypted_global_stats().await,
                RatingScope::Subject(subject) => contract.encrypted_subject_stats(subject).await,
            },
            Err(e) => Err(e),
        };
        match result {
            Ok(stats) => Some(stats),
            Err(e) => {
                self.report(format!("Error getting encrypted stats: {}", e));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mutation(rating: u32, subject: &str) -> RatingMutation {
        RatingMutation { write: RatingWrite::Submit, rating, subject: subject.to_string() }
    }

    #[test]
    fn test_rating_plaintext_is_validated() {
        let source = RatingSumSource { scope: RatingScope::Global };
        assert_eq!(source.plaintext(&mutation(4, "Coffee")), Ok(4));
        assert!(matches!(source.plaintext(&mutation(0, "Coffee")), Err(SkipReason::Invalid(_))));
        assert!(matches!(source.plaintext(&mutation(6, "Coffee")), Err(SkipReason::Invalid(_))));
        assert!(matches!(source.plaintext(&mutation(3, "  ")), Err(SkipReason::Invalid(_))));
        assert_eq!(source.describe(&mutation(4, "Coffee")), "submitRating(\"Coffee\")");
    }

    #[test]
    fn test_read_labels() {
        assert_eq!(
            RatingSumSource { scope: RatingScope::Global }.read_label(),
            "EncryptedRatingSystem.getEncryptedGlobalStats()"
        );
        assert_eq!(
            RatingSumSource { scope: RatingScope::Subject("Tea".into()) }.read_label(),
            "EncryptedRatingSystem.getEncryptedSubjectStats(\"Tea\")"
        );
    }

    #[test]
    fn test_revert_explanations() {
        assert!(explain("Execution reverted: Already submitted for this subject").starts_with("You have already"));
        assert_eq!(explain("Execution reverted: No entry to delete"), "You don't have a rating entry to delete.");
        assert_eq!(explain("boom"), "boom");
    }
}
