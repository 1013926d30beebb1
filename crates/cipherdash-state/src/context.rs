// Live session context
//
// The chain, signer and encryption capability the sessions currently act
// on. Every asynchronous operation snapshots the context when it starts and
// re-checks it after each suspension point.
//
// INVARIANTS:
// 1. A chain change bumps both generations and cancels every in-flight
//    operation (the per-signer token is a child of the per-target token)
// 2. A signer change bumps only `generation` and cancels only decrypts and
//    mutations; handle refreshes keep running
// 3. Setting the same chain or the same signer address is a no-op
// 4. The state lock is never held across an await

use cipherdash_core::{Address, ChainId, StalenessToken};
use cipherdash_crypto::EncryptionCapability;
use cipherdash_wallet_core::WalletSigner;
use log::info;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct ContextState {
    chain_id: Option<ChainId>,
    signer: Option<Arc<dyn WalletSigner>>,
    capability: Option<Arc<dyn EncryptionCapability>>,
    /// Bumped on chain changes.
    target_generation: u64,
    /// Bumped on every change that invalidates decrypted values.
    generation: u64,
    target_cancel: CancellationToken,
    cancel: CancellationToken,
}

/// What an operation captured when it started.
#[derive(Clone)]
pub struct ContextSnapshot {
    pub chain_id: Option<ChainId>,
    pub signer: Option<Arc<dyn WalletSigner>>,
    pub capability: Option<Arc<dyn EncryptionCapability>>,
    pub target_generation: u64,
    pub generation: u64,
    /// Cancelled when the chain changes.
    pub target_cancel: CancellationToken,
    /// Cancelled when the chain or the signer changes.
    pub cancel: CancellationToken,
}

impl ContextSnapshot {
    pub fn signer_address(&self) -> Option<Address> {
        self.signer.as_ref().map(|s| s.address())
    }

    /// Staleness token for `contract` under this snapshot.
    pub fn token(&self, contract: Option<Address>) -> StalenessToken {
        StalenessToken::new(self.chain_id, contract, self.signer_address())
    }
}

pub struct LiveContext {
    state: Mutex<ContextState>,
}

impl LiveContext {
    pub fn new(chain_id: Option<ChainId>, signer: Option<Arc<dyn WalletSigner>>) -> Self {
        let target_cancel = CancellationToken::new();
        let cancel = target_cancel.child_token();
        LiveContext {
            state: Mutex::new(ContextState {
                chain_id,
                signer,
                capability: None,
                target_generation: 0,
                generation: 0,
                target_cancel,
                cancel,
            }),
        }
    }

    pub fn chain_id(&self) -> Option<ChainId> {
        self.state.lock().chain_id
    }

    pub fn signer(&self) -> Option<Arc<dyn WalletSigner>> {
        self.state.lock().signer.clone()
    }

    pub fn signer_address(&self) -> Option<Address> {
        self.state.lock().signer.as_ref().map(|s| s.address())
    }

    pub fn capability(&self) -> Option<Arc<dyn EncryptionCapability>> {
        self.state.lock().capability.clone()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn target_generation(&self) -> u64 {
        self.state.lock().target_generation
    }

    /// Switch networks. In-flight operations are cancelled.
    pub fn set_chain(&self, chain_id: Option<ChainId>) {
        let mut state = self.state.lock();
        if state.chain_id == chain_id {
            return;
        }

        state.target_cancel.cancel();
        state.target_cancel = CancellationToken::new();
        state.cancel = state.target_cancel.child_token();
        state.chain_id = chain_id;
        state.target_generation += 1;
        state.generation += 1;
        info!("Context switched to chain {:?} (generation {})", chain_id, state.generation);
    }

    /// Switch accounts. In-flight decrypts and mutations are cancelled.
    pub fn set_signer(&self, signer: Option<Arc<dyn WalletSigner>>) {
        let mut state = self.state.lock();
        let current = state.signer.as_ref().map(|s| s.address());
        let next = signer.as_ref().map(|s| s.address());
        if current == next {
            return;
        }

        state.cancel.cancel();
        state.cancel = state.target_cancel.child_token();
        state.signer = signer;
        state.generation += 1;
        info!("Context switched to signer {:?} (generation {})", next, state.generation);
    }

    /// Install or remove the encryption capability. Running operations keep
    /// the capability they started with.
    pub fn set_capability(&self, capability: Option<Arc<dyn EncryptionCapability>>) {
        self.state.lock().capability = capability;
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let state = self.state.lock();
        ContextSnapshot {
            chain_id: state.chain_id,
            signer: state.signer.clone(),
            capability: state.capability.clone(),
            target_generation: state.target_generation,
            generation: state.generation,
            target_cancel: state.target_cancel.child_token(),
            cancel: state.cancel.child_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipherdash_core::H256;
    use cipherdash_wallet_core::{Signature, SignerError};

    struct FixedSigner(Address);

    #[async_trait::async_trait]
    impl WalletSigner for FixedSigner {
        fn address(&self) -> Address {
            self.0
        }

        async fn sign_digest(&self, _digest: H256) -> Result<Signature, SignerError> {
            Err(SignerError::UserRejected)
        }
    }

    fn signer(byte: u8) -> Option<Arc<dyn WalletSigner>> {
        Some(Arc::new(FixedSigner(Address::repeat_byte(byte))))
    }

    #[test]
    fn test_chain_change_cancels_everything() {
        let context = LiveContext::new(Some(31337), signer(1));
        let before = context.snapshot();

        context.set_chain(Some(11155111));

        assert!(before.target_cancel.is_cancelled());
        assert!(before.cancel.is_cancelled());
        assert_eq!(context.target_generation(), 1);
        assert_eq!(context.generation(), 1);

        let after = context.snapshot();
        assert!(!after.cancel.is_cancelled());
        assert_ne!(after.token(None), before.token(None));
    }

    #[test]
    fn test_signer_change_keeps_refreshes() {
        let context = LiveContext::new(Some(31337), signer(1));
        let before = context.snapshot();

        context.set_signer(signer(2));

        assert!(!before.target_cancel.is_cancelled());
        assert!(before.cancel.is_cancelled());
        assert_eq!(context.target_generation(), 0);
        assert_eq!(context.generation(), 1);

        let contract = Some(Address::repeat_byte(9));
        assert!(before.token(contract).same_target(&context.snapshot().token(contract)));
    }

    #[test]
    fn test_same_values_are_noops() {
        let context = LiveContext::new(Some(31337), signer(1));
        let before = context.snapshot();

        context.set_chain(Some(31337));
        context.set_signer(signer(1));

        assert!(!before.cancel.is_cancelled());
        assert_eq!(context.generation(), 0);
    }

    #[test]
    fn test_cancel_after_signer_change_still_follows_chain() {
        let context = LiveContext::new(Some(31337), signer(1));
        context.set_signer(signer(2));
        let snapshot = context.snapshot();

        context.set_chain(None);
        assert!(snapshot.cancel.is_cancelled());
        assert_eq!(context.chain_id(), None);
    }
}
