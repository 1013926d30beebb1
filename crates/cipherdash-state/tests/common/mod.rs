#![allow(dead_code)]

use async_trait::async_trait;
use cipherdash_core::{Address, CiphertextHandle, Deployments, ManualClock, H256, LOCAL_CHAIN_ID};
use cipherdash_crypto::{
    DecryptionError, DecryptionSignature, EncryptedInput, EncryptionCapability, EncryptionError, FheKeypair,
    HandleContractPair, MockCoprocessor,
};
use cipherdash_interop::{CachedContracts, LocalDevnet};
use cipherdash_state::{LiveContext, SessionDeps};
use cipherdash_wallet_core::{
    dev_accounts, DecryptionSignatureCache, LocalKeySigner, MemoryStorage, Signature, SignerError, WalletSigner,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub const START: u64 = 1_700_000_000;

/// Wallet that counts prompts and can be told to refuse.
pub struct CountingSigner {
    inner: LocalKeySigner,
    prompts: AtomicUsize,
    reject: AtomicBool,
}

impl CountingSigner {
    pub fn new(private_key: &str) -> Arc<Self> {
        Arc::new(CountingSigner {
            inner: LocalKeySigner::from_hex(private_key).unwrap(),
            prompts: AtomicUsize::new(0),
            reject: AtomicBool::new(false),
        })
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl WalletSigner for CountingSigner {
    fn address(&self) -> Address {
        self.inner.address()
    }

    async fn sign_digest(&self, digest: H256) -> Result<Signature, SignerError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(SignerError::UserRejected);
        }
        self.inner.sign_digest(digest).await
    }
}

/// Capability that can pause `encrypt` or `user_decrypt` until released.
pub struct GatedCapability {
    inner: Arc<MockCoprocessor>,
    gate_encrypt: AtomicBool,
    gate_decrypt: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl GatedCapability {
    pub fn new(inner: Arc<MockCoprocessor>) -> Arc<Self> {
        Arc::new(GatedCapability {
            inner,
            gate_encrypt: AtomicBool::new(false),
            gate_decrypt: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }

    pub fn gate_encrypt(&self, on: bool) {
        self.gate_encrypt.store(on, Ordering::SeqCst);
    }

    pub fn gate_decrypt(&self, on: bool) {
        self.gate_decrypt.store(on, Ordering::SeqCst);
    }

    async fn pass(&self, gate: &AtomicBool) {
        if gate.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }
}

#[async_trait]
impl EncryptionCapability for GatedCapability {
    fn generate_keypair(&self) -> FheKeypair {
        self.inner.generate_keypair()
    }

    async fn encrypt(&self, contract: Address, user: Address, value: u32) -> Result<EncryptedInput, EncryptionError> {
        self.pass(&self.gate_encrypt).await;
        self.inner.encrypt(contract, user, value).await
    }

    async fn user_decrypt(
        &self,
        requests: &[HandleContractPair],
        signature: &DecryptionSignature,
    ) -> Result<HashMap<CiphertextHandle, u64>, DecryptionError> {
        self.pass(&self.gate_decrypt).await;
        self.inner.user_decrypt(requests, signature).await
    }
}

pub struct Harness {
    pub devnet: LocalDevnet,
    pub clock: Arc<ManualClock>,
    pub capability: Arc<GatedCapability>,
    pub deployer: Arc<CountingSigner>,
    pub alice: Arc<CountingSigner>,
    pub bob: Arc<CountingSigner>,
    pub deps: SessionDeps,
}

impl Harness {
    /// Devnet on chain 31337 with alice as the active signer.
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(START));
        let devnet = LocalDevnet::with_clock(clock.clone());
        let capability = GatedCapability::new(devnet.coprocessor());
        let alice = CountingSigner::new(dev_accounts::ALICE);

        let signer: Arc<dyn WalletSigner> = alice.clone();
        let context = Arc::new(LiveContext::new(Some(LOCAL_CHAIN_ID), Some(signer)));
        let shared: Arc<dyn EncryptionCapability> = capability.clone();
        context.set_capability(Some(shared));

        let signatures = DecryptionSignatureCache::with_clock(Arc::new(MemoryStorage::new()), clock.clone(), 365);
        let deps = SessionDeps {
            contracts: Arc::new(CachedContracts::new(devnet.clone())),
            deployments: Arc::new(Deployments::builtin()),
            signatures: Arc::new(signatures),
            context,
        };

        Harness {
            devnet,
            clock,
            capability,
            deployer: CountingSigner::new(dev_accounts::DEPLOYER),
            alice,
            bob: CountingSigner::new(dev_accounts::BOB),
            deps,
        }
    }

    pub fn context(&self) -> &Arc<LiveContext> {
        &self.deps.context
    }

    pub fn use_signer(&self, signer: &Arc<CountingSigner>) {
        let signer: Arc<dyn WalletSigner> = signer.clone();
        self.deps.context.set_signer(Some(signer));
    }

    pub fn decrypt_calls(&self) -> usize {
        self.devnet.coprocessor().decrypt_calls()
    }
}
