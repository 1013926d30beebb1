// Handle reconciliation
//
// A Reconciler tracks one encrypted value stored on chain: the latest
// ciphertext handle, the plaintext decrypted from it, and the writes that
// replace it. The contract specifics live behind HandleSource.
//
// SAFETY INVARIANTS:
// 1. A plaintext is shown only while it was decrypted from the current handle
// 2. At most one refresh, one decrypt and one mutate run at a time
// 3. A result is committed only if the context is unchanged since the
//    operation started (generation and staleness token both match)
// 4. Every suspension point races the snapshot's cancellation token
// 5. State locks are never held across an await
// 6. A handle belongs to the chain generation it was read under; a
//    plaintext to the full context generation it was decrypted under

use crate::context::{ContextSnapshot, LiveContext};
use crate::operation::{OperationFlags, OperationKind, Outcome, SkipReason};
use async_trait::async_trait;
use cipherdash_core::{
    Address, ChainId, CiphertextHandle, ClearValue, ContractInfo, ContractKind, Deployments, StalenessToken,
};
use cipherdash_crypto::HandleContractPair;
use cipherdash_interop::{ChainError, ContractProvider, PendingTx};
use cipherdash_wallet_core::DecryptionSignatureCache;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a session needs from the outside world.
#[derive(Clone)]
pub struct SessionDeps {
    pub contracts: Arc<dyn ContractProvider>,
    pub deployments: Arc<Deployments>,
    pub signatures: Arc<DecryptionSignatureCache>,
    pub context: Arc<LiveContext>,
}

/// An encrypted write, ready to send.
#[derive(Debug, Clone)]
pub struct Submission {
    pub chain_id: ChainId,
    pub contract: Address,
    pub from: Address,
    pub input: CiphertextHandle,
    pub proof: Vec<u8>,
}

/// Where a reconciled handle is read from and how it is changed.
#[async_trait]
pub trait HandleSource: Send + Sync + 'static {
    type Mutation: Send + Sync + fmt::Debug;

    fn kind(&self) -> ContractKind;

    /// Name of the read call, for status lines.
    fn read_label(&self) -> String;

    async fn read_handle(
        &self,
        contracts: &dyn ContractProvider,
        chain_id: ChainId,
        address: Address,
    ) -> Result<CiphertextHandle, ChainError>;

    /// The 32-bit plaintext to encrypt for `mutation`.
    fn plaintext(&self, mutation: &Self::Mutation) -> Result<u32, SkipReason>;

    /// Name of the write call, e.g. `increment(5)`.
    fn describe(&self, mutation: &Self::Mutation) -> String;

    async fn submit(
        &self,
        contracts: &dyn ContractProvider,
        submission: Submission,
        mutation: &Self::Mutation,
    ) -> Result<PendingTx, ChainError>;
}

#[derive(Default)]
struct HandleState {
    handle: Option<CiphertextHandle>,
    handle_epoch: u64,
    clear: Option<ClearValue>,
    clear_epoch: u64,
    message: String,
}

impl HandleState {
    fn handle_at(&self, target_generation: u64) -> Option<CiphertextHandle> {
        self.handle.filter(|_| self.handle_epoch == target_generation)
    }

    fn clear_at(&self, target_generation: u64, generation: u64) -> Option<ClearValue> {
        let handle = self.handle_at(target_generation);
        self.clear
            .filter(|c| self.clear_epoch == generation && c.matches(handle.as_ref()))
    }
}

async fn race<F: Future>(cancel: &CancellationToken, operation: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = operation => Some(output),
    }
}

pub struct Reconciler<S: HandleSource> {
    source: S,
    deps: SessionDeps,
    flags: OperationFlags,
    state: Mutex<HandleState>,
}

impl<S: HandleSource> Reconciler<S> {
    pub fn new(source: S, deps: SessionDeps) -> Self {
        Reconciler { source, deps, flags: OperationFlags::new(), state: Mutex::new(HandleState::default()) }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn deps(&self) -> &SessionDeps {
        &self.deps
    }

    /// The contract on the current chain.
    pub fn contract_info(&self) -> ContractInfo {
        self.deps.deployments.resolve(self.source.kind(), self.deps.context.chain_id())
    }

    /// Current handle, if one was read on the current chain.
    pub fn handle(&self) -> Option<CiphertextHandle> {
        let target = self.deps.context.target_generation();
        self.state.lock().handle_at(target)
    }

    /// Plaintext of the current handle, if decrypted under the current context.
    pub fn clear(&self) -> Option<ClearValue> {
        let (target, generation) = (self.deps.context.target_generation(), self.deps.context.generation());
        self.state.lock().clear_at(target, generation)
    }

    pub fn is_decrypted(&self) -> bool {
        self.clear().is_some()
    }

    pub fn message(&self) -> String {
        self.state.lock().message.clone()
    }

    pub fn is_running(&self, kind: OperationKind) -> bool {
        self.flags.is_set(kind)
    }

    pub fn view(&self) -> SessionView {
        let snapshot = self.deps.context.snapshot();
        let contract = self.deps.deployments.resolve(self.source.kind(), snapshot.chain_id);
        let (handle, clear, message) = {
            let state = self.state.lock();
            (
                state.handle_at(snapshot.target_generation),
                state.clear_at(snapshot.target_generation, snapshot.generation),
                state.message.clone(),
            )
        };

        SessionView::derive(ViewInput {
            contract,
            has_capability: snapshot.capability.is_some(),
            has_signer: snapshot.signer.is_some(),
            handle,
            clear,
            refreshing: self.flags.is_set(OperationKind::Refresh),
            decrypting: self.flags.is_set(OperationKind::Decrypt),
            mutating: self.flags.is_set(OperationKind::Mutate),
            message,
        })
    }

    fn set_message(&self, message: impl Into<String>) {
        self.state.lock().message = message.into();
    }

    fn fail(&self, message: String) -> Outcome {
        warn!("{}", message);
        self.set_message(message.clone());
        Outcome::Failed(message)
    }

    fn stale(&self, what: &str) -> Outcome {
        debug!("Ignore {} (stale)", what);
        Outcome::Stale
    }

    fn live_token(&self) -> StalenessToken {
        let snapshot = self.deps.context.snapshot();
        let contract = self.deps.deployments.resolve(self.source.kind(), snapshot.chain_id).address;
        snapshot.token(contract)
    }

    /// Chain and contract unchanged since `started`.
    fn same_target(&self, started: &ContextSnapshot, token: &StalenessToken) -> bool {
        self.deps.context.target_generation() == started.target_generation && self.live_token().same_target(token)
    }

    /// Whole context unchanged since `started`.
    fn is_current(&self, started: &ContextSnapshot, token: &StalenessToken) -> bool {
        self.deps.context.generation() == started.generation && self.live_token() == *token
    }

    /// Re-read the handle from the contract.
    pub async fn refresh_handle(&self) -> Outcome {
        let Some(_guard) = self.flags.try_acquire(OperationKind::Refresh) else {
            return Outcome::Skipped(SkipReason::InFlight(OperationKind::Refresh));
        };

        let started = self.deps.context.snapshot();
        let info = self.deps.deployments.resolve(self.source.kind(), started.chain_id);
        let (Some(chain_id), Some(address)) = (started.chain_id, info.address) else {
            let mut state = self.state.lock();
            state.handle = None;
            state.handle_epoch = started.target_generation;
            return Outcome::Skipped(SkipReason::NotDeployed);
        };
        let token = started.token(Some(address));
        let label = self.source.read_label();

        let read = self.source.read_handle(self.deps.contracts.as_ref(), chain_id, address);
        let Some(result) = race(&started.target_cancel, read).await else {
            return self.stale(&label);
        };
        if !self.same_target(&started, &token) {
            return self.stale(&label);
        }

        match result {
            Ok(handle) => {
                let mut state = self.state.lock();
                if state.handle_at(started.target_generation) != Some(handle) {
                    info!("{} returned handle {}", label, handle.short());
                }
                state.handle = Some(handle);
                state.handle_epoch = started.target_generation;
                Outcome::Committed
            }
            Err(e) => self.fail(format!("{} call failed! error={}", label, e)),
        }
    }

    /// Decrypt the current handle for the current signer.
    pub async fn decrypt(&self) -> Outcome {
        let started = self.deps.context.snapshot();
        let info = self.deps.deployments.resolve(self.source.kind(), started.chain_id);
        let (Some(chain_id), Some(address)) = (started.chain_id, info.address) else {
            return Outcome::Skipped(SkipReason::NotDeployed);
        };
        let Some(capability) = started.capability.clone() else {
            return Outcome::Skipped(SkipReason::NoCapability);
        };
        let Some(signer) = started.signer.clone() else {
            return Outcome::Skipped(SkipReason::NoSigner);
        };
        if self.flags.is_set(OperationKind::Refresh) {
            return Outcome::Skipped(SkipReason::Busy(OperationKind::Refresh));
        }
        let Some(_guard) = self.flags.try_acquire(OperationKind::Decrypt) else {
            return Outcome::Skipped(SkipReason::InFlight(OperationKind::Decrypt));
        };

        let (handle, clear) = {
            let state = self.state.lock();
            (
                state.handle_at(started.target_generation),
                state.clear_at(started.target_generation, started.generation),
            )
        };
        let Some(handle) = handle else {
            return Outcome::Skipped(SkipReason::NoHandle);
        };
        if clear.is_some() {
            return Outcome::Skipped(SkipReason::AlreadyDecrypted);
        }

        // Never written: nothing to ask the relayer.
        if handle.is_zero() {
            let mut state = self.state.lock();
            state.clear = Some(ClearValue::zero());
            state.clear_epoch = started.generation;
            return Outcome::Committed;
        }

        let token = started.token(Some(address));
        self.set_message("Start decrypt");

        let contracts = [address];
        let signing = self
            .deps
            .signatures
            .load_or_sign(capability.as_ref(), &contracts, signer.as_ref(), chain_id);
        let Some(signature) = race(&started.cancel, signing).await else {
            return self.stale("decryption signature");
        };
        if !self.is_current(&started, &token) {
            return self.stale("decryption signature");
        }
        let signature = match signature {
            Ok(signature) => signature,
            Err(e) => return self.fail(format!("Unable to build FHEVM decryption signature: {}", e)),
        };

        self.set_message("Call FHEVM userDecrypt...");
        let requests = [HandleContractPair::new(handle, address)];
        let Some(result) = race(&started.cancel, capability.user_decrypt(&requests, &signature)).await else {
            return self.stale("FHEVM userDecrypt");
        };
        if !self.is_current(&started, &token) {
            return self.stale("FHEVM userDecrypt");
        }

        let value = match result {
            Ok(values) => match values.get(&handle) {
                Some(value) => *value,
                None => return self.fail(format!("FHEVM userDecrypt failed! no value for {}", handle.short())),
            },
            Err(e) => return self.fail(format!("FHEVM userDecrypt failed! {}", e)),
        };

        let mut state = self.state.lock();
        state.clear = Some(ClearValue::new(handle, value));
        state.clear_epoch = started.generation;
        state.message = "FHEVM userDecrypt completed!".to_string();
        info!("Decrypted {} = {}", handle.short(), value);
        Outcome::Committed
    }

    /// Encrypt and send `mutation`, then re-read the handle once it is mined.
    pub async fn mutate(&self, mutation: S::Mutation) -> Outcome {
        let started = self.deps.context.snapshot();
        let info = self.deps.deployments.resolve(self.source.kind(), started.chain_id);
        let (Some(chain_id), Some(address)) = (started.chain_id, info.address) else {
            return Outcome::Skipped(SkipReason::NotDeployed);
        };
        let Some(capability) = started.capability.clone() else {
            return Outcome::Skipped(SkipReason::NoCapability);
        };
        let Some(from) = started.signer_address() else {
            return Outcome::Skipped(SkipReason::NoSigner);
        };
        let value = match self.source.plaintext(&mutation) {
            Ok(value) => value,
            Err(reason) => return Outcome::Skipped(reason),
        };
        if self.flags.is_set(OperationKind::Refresh) {
            return Outcome::Skipped(SkipReason::Busy(OperationKind::Refresh));
        }
        let Some(_guard) = self.flags.try_acquire(OperationKind::Mutate) else {
            return Outcome::Skipped(SkipReason::InFlight(OperationKind::Mutate));
        };

        let token = started.token(Some(address));
        let label = self.source.describe(&mutation);
        self.set_message(format!("Start {}...", label));

        let Some(encrypted) = race(&started.cancel, capability.encrypt(address, from, value)).await else {
            return self.stale(&label);
        };
        if !self.is_current(&started, &token) {
            return self.stale(&label);
        }
        let (input, proof) = match encrypted.and_then(|e| Ok((e.handle()?, e.proof))) {
            Ok(parts) => parts,
            Err(e) => return self.fail(format!("{} Failed! {}", label, e)),
        };

        self.set_message(format!("Call {}...", label));
        let submission = Submission { chain_id, contract: address, from, input, proof };
        let pending = match self.source.submit(self.deps.contracts.as_ref(), submission, &mutation).await {
            Ok(pending) => pending,
            Err(e) => return self.fail(format!("{} Failed! {}", label, e)),
        };

        self.set_message(format!("Wait for tx:{}...", pending.short_hash()));
        let Some(receipt) = race(&started.cancel, pending.wait()).await else {
            return self.stale(&label);
        };
        if !self.is_current(&started, &token) {
            return self.stale(&label);
        }
        let receipt = match receipt {
            Ok(receipt) => receipt,
            Err(e) => return self.fail(format!("{} Failed! {}", label, e)),
        };
        if let Err(e) = receipt.ensure_success() {
            return self.fail(format!("{} Failed! {}", label, e));
        }

        self.set_message(format!("Call {} completed! Status: {}", label, receipt.status_label()));
        info!("{} mined in block {}", label, receipt.block_number);

        let refreshed = self.refresh_handle().await;
        if !refreshed.is_committed() {
            debug!("Refresh after {} returned {:?}", label, refreshed);
        }
        Outcome::Committed
    }
}

/// Inputs of the derived session view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewInput {
    pub contract: ContractInfo,
    pub has_capability: bool,
    pub has_signer: bool,
    pub handle: Option<CiphertextHandle>,
    pub clear: Option<ClearValue>,
    pub refreshing: bool,
    pub decrypting: bool,
    pub mutating: bool,
    pub message: String,
}

/// What a UI renders for one reconciled value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub contract: ContractInfo,
    pub is_deployed: bool,
    pub can_refresh: bool,
    pub can_decrypt: bool,
    pub can_mutate: bool,
    pub is_decrypted: bool,
    pub is_refreshing: bool,
    pub is_decrypting: bool,
    pub is_mutating: bool,
    pub handle: Option<CiphertextHandle>,
    /// Only set while it belongs to `handle`.
    pub clear: Option<ClearValue>,
    pub message: String,
}

impl SessionView {
    pub fn derive(input: ViewInput) -> Self {
        let is_deployed = input.contract.is_deployed();
        let is_decrypted = input
            .clear
            .map(|c| c.matches(input.handle.as_ref()))
            .unwrap_or(false);
        let ready = is_deployed && input.has_capability && input.has_signer && !input.refreshing;
        let message = if is_deployed { input.message } else { input.contract.not_deployed_message() };

        SessionView {
            is_deployed,
            can_refresh: is_deployed && !input.refreshing,
            can_decrypt: ready && !input.decrypting && input.handle.is_some() && !is_decrypted,
            can_mutate: ready && !input.mutating,
            is_decrypted,
            is_refreshing: input.refreshing,
            is_decrypting: input.decrypting,
            is_mutating: input.mutating,
            handle: input.handle,
            clear: if is_decrypted { input.clear } else { None },
            contract: input.contract,
            message,
        }
    }
}
