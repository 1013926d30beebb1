// Decryption signature cache
//
// One wallet prompt per (user, contract set, chain) per validity window.
//
// SAFETY INVARIANTS:
// 1. A cached signature is returned only while now < start + duration_days
// 2. A cached signature is returned only if it covers every requested contract
// 3. Concurrent callers for one key share a single prompt
// 4. Nothing is stored when the user declines
// 5. A per-key lock lives only while some caller holds it

use crate::signer::{SignerError, WalletSigner};
use crate::storage::{StorageError, StringStorage};
use cipherdash_core::config::DEFAULT_SIGNATURE_DURATION_DAYS;
use cipherdash_core::{address_key, Address, ChainId, Clock, SystemClock};
use cipherdash_crypto::{normalize_contracts, DecryptionRequest, DecryptionSignature, EncryptionCapability};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

const KEY_PREFIX: &str = "cipherdash.decryption-signature";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("Signature storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("Signature encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("No contract addresses to authorize")]
    NoContracts,
}

impl SignatureError {
    pub fn is_user_rejection(&self) -> bool {
        matches!(self, SignatureError::Signer(SignerError::UserRejected))
    }
}

/// Storage key for one (user, contract set, chain) triple.
pub fn cache_key(user: &Address, contracts: &[Address], chain_id: ChainId) -> String {
    let contracts: Vec<String> = normalize_contracts(contracts).iter().map(address_key).collect();
    format!("{}:{}:{}:{}", KEY_PREFIX, address_key(user), chain_id, contracts.join(","))
}

pub struct DecryptionSignatureCache {
    storage: Arc<dyn StringStorage>,
    clock: Arc<dyn Clock>,
    duration_days: u64,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DecryptionSignatureCache {
    pub fn new(storage: Arc<dyn StringStorage>) -> Self {
        DecryptionSignatureCache::with_clock(storage, Arc::new(SystemClock), DEFAULT_SIGNATURE_DURATION_DAYS)
    }

    pub fn with_clock(storage: Arc<dyn StringStorage>, clock: Arc<dyn Clock>, duration_days: u64) -> Self {
        DecryptionSignatureCache { storage, clock, duration_days, locks: DashMap::new() }
    }

    pub fn duration_days(&self) -> u64 {
        self.duration_days
    }

    /// Return a still-valid signature for `contract_addresses`, prompting
    /// `signer` only when none is cached.
    pub async fn load_or_sign(
        &self,
        capability: &dyn EncryptionCapability,
        contract_addresses: &[Address],
        signer: &dyn WalletSigner,
        chain_id: ChainId,
    ) -> Result<DecryptionSignature, SignatureError> {
        let contracts = normalize_contracts(contract_addresses);
        if contracts.is_empty() {
            return Err(SignatureError::NoContracts);
        }

        let key = cache_key(&signer.address(), &contracts, chain_id);
        let lock = self.locks.entry(key.clone()).or_default().value().clone();
        let result = {
            let _guard = lock.lock().await;
            self.load_or_sign_locked(capability, &key, &contracts, signer, chain_id).await
        };

        drop(lock);
        self.locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn load_or_sign_locked(
        &self,
        capability: &dyn EncryptionCapability,
        key: &str,
        contracts: &[Address],
        signer: &dyn WalletSigner,
        chain_id: ChainId,
    ) -> Result<DecryptionSignature, SignatureError> {
        let user = signer.address();
        if let Some(cached) = self.load(key).await? {
            if self.is_reusable(&cached, &user, contracts, chain_id) {
                debug!("Reusing decryption signature for {} until {}", address_key(&user), cached.expires_at());
                return Ok(cached);
            }
            debug!("Cached decryption signature for {} no longer usable", address_key(&user));
        }

        let keypair = capability.generate_keypair();
        let request = DecryptionRequest::new(
            keypair.public_key.clone(),
            contracts,
            chain_id,
            self.clock.now(),
            self.duration_days,
        );

        let signature = match signer.sign_digest(request.digest()).await {
            Ok(signature) => signature,
            Err(e) => {
                warn!("Decryption signature not created: {}", e);
                return Err(e.into());
            }
        };

        let record = DecryptionSignature::new(keypair, request, user, &signature);
        self.storage.set_item(key, &serde_json::to_string(&record)?).await?;
        info!(
            "Created decryption signature for {} covering {} contract(s) on chain {}",
            address_key(&user),
            contracts.len(),
            chain_id
        );
        Ok(record)
    }

    /// Keys with a signing attempt in progress.
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }

    /// Drop the stored signature for this key, if any.
    pub async fn invalidate(
        &self,
        user: &Address,
        contract_addresses: &[Address],
        chain_id: ChainId,
    ) -> Result<(), SignatureError> {
        let key = cache_key(user, contract_addresses, chain_id);
        self.storage.remove_item(&key).await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<DecryptionSignature>, SignatureError> {
        let Some(raw) = self.storage.get_item(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<DecryptionSignature>(&raw) {
            Ok(mut signature) => {
                signature.contract_addresses = normalize_contracts(&signature.contract_addresses);
                Ok(Some(signature))
            }
            Err(e) => {
                warn!("Discarding corrupt decryption signature entry {}: {}", key, e);
                self.storage.remove_item(key).await?;
                Ok(None)
            }
        }
    }

    fn is_reusable(&self, cached: &DecryptionSignature, user: &Address, contracts: &[Address], chain_id: ChainId) -> bool {
        cached.user_address == *user
            && cached.chain_id == chain_id
            && cached.covers(contracts)
            && cached.is_valid_at(self.clock.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::{dev_accounts, LocalKeySigner};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use cipherdash_core::{ManualClock, H256, SECONDS_PER_DAY};
    use cipherdash_crypto::MockCoprocessor;
    use ethers::types::Signature;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const CHAIN: ChainId = 31337;

    struct CountingSigner {
        inner: LocalKeySigner,
        prompts: AtomicUsize,
        reject: bool,
    }

    impl CountingSigner {
        fn new(reject: bool) -> Self {
            CountingSigner {
                inner: LocalKeySigner::from_hex(dev_accounts::ALICE).unwrap(),
                prompts: AtomicUsize::new(0),
                reject,
            }
        }

        fn prompts(&self) -> usize {
            self.prompts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WalletSigner for CountingSigner {
        fn address(&self) -> Address {
            self.inner.address()
        }

        async fn sign_digest(&self, digest: H256) -> Result<Signature, SignerError> {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.reject {
                return Err(SignerError::UserRejected);
            }
            self.inner.sign_digest(digest).await
        }
    }

    fn setup(start: u64) -> (Arc<MemoryStorage>, Arc<ManualClock>, DecryptionSignatureCache, MockCoprocessor) {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(start));
        let cache = DecryptionSignatureCache::with_clock(storage.clone(), clock.clone(), 1);
        (storage, clock, cache, MockCoprocessor::new(CHAIN))
    }

    #[test]
    fn test_cache_key_ignores_contract_order() {
        let user = Address::repeat_byte(0x01);
        let a = Address::repeat_byte(0xaa);
        let b = Address::repeat_byte(0xbb);
        assert_eq!(cache_key(&user, &[a, b], CHAIN), cache_key(&user, &[b, a], CHAIN));
        assert_ne!(cache_key(&user, &[a, b], CHAIN), cache_key(&user, &[a, b], 1));
    }

    #[tokio::test]
    async fn test_reuse_within_window() {
        let (_, clock, cache, mock) = setup(1_000);
        let signer = CountingSigner::new(false);
        let contract = Address::repeat_byte(0xc0);

        let first = cache.load_or_sign(&mock, &[contract], &signer, CHAIN).await.unwrap();
        clock.advance(SECONDS_PER_DAY - 1);
        let second = cache.load_or_sign(&mock, &[contract], &signer, CHAIN).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(signer.prompts(), 1);
        assert!(first.verify().is_ok());
    }

    #[tokio::test]
    async fn test_expired_signature_reprompts() {
        let (_, clock, cache, mock) = setup(1_000);
        let signer = CountingSigner::new(false);
        let contract = Address::repeat_byte(0xc0);

        let first = cache.load_or_sign(&mock, &[contract], &signer, CHAIN).await.unwrap();
        clock.advance(SECONDS_PER_DAY);
        let second = cache.load_or_sign(&mock, &[contract], &signer, CHAIN).await.unwrap();

        assert_eq!(signer.prompts(), 2);
        assert_ne!(first.public_key, second.public_key);
        assert_eq!(second.start_timestamp, 1_000 + SECONDS_PER_DAY);
    }

    #[tokio::test]
    async fn test_rejection_stores_nothing() {
        let (storage, _, cache, mock) = setup(1_000);
        let signer = CountingSigner::new(true);

        let err = cache
            .load_or_sign(&mock, &[Address::repeat_byte(0xc0)], &signer, CHAIN)
            .await
            .unwrap_err();
        assert!(err.is_user_rejection());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_prompt() {
        let (_, _, cache, mock) = setup(1_000);
        let signer = CountingSigner::new(false);
        let contract = Address::repeat_byte(0xc0);
        let contracts = [contract];

        let (a, b) = tokio::join!(
            cache.load_or_sign(&mock, &contracts, &signer, CHAIN),
            cache.load_or_sign(&mock, &contracts, &signer, CHAIN),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(signer.prompts(), 1);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_locks_pruned_after_each_key() {
        let (_, _, cache, mock) = setup(1_000);
        let signer = CountingSigner::new(false);

        for byte in 1..=5u8 {
            cache
                .load_or_sign(&mock, &[Address::repeat_byte(byte)], &signer, CHAIN)
                .await
                .unwrap();
        }
        assert_eq!(signer.prompts(), 5);
        assert_eq!(cache.in_flight(), 0);

        let rejecting = CountingSigner::new(true);
        assert!(cache.load_or_sign(&mock, &[Address::repeat_byte(9)], &rejecting, CHAIN).await.is_err());
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_stored_record_with_unsorted_contracts_is_reused() {
        let (storage, _, cache, mock) = setup(1_000);
        let signer = CountingSigner::new(false);
        let low = Address::repeat_byte(0x11);
        let high = Address::repeat_byte(0x99);

        let first = cache.load_or_sign(&mock, &[low, high], &signer, CHAIN).await.unwrap();

        // rewrite the record the way an external tool might
        let key = cache_key(&signer.address(), &[low, high], CHAIN);
        let mut edited = first.clone();
        edited.contract_addresses = vec![high, low];
        storage.set_item(&key, &serde_json::to_string(&edited).unwrap()).await.unwrap();

        let second = cache.load_or_sign(&mock, &[high, low], &signer, CHAIN).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(signer.prompts(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_entry_treated_as_missing() {
        let (storage, _, cache, mock) = setup(1_000);
        let signer = CountingSigner::new(false);
        let contract = Address::repeat_byte(0xc0);
        let key = cache_key(&signer.address(), &[contract], CHAIN);
        storage.set_item(&key, "{not json").await.unwrap();

        let signature = cache.load_or_sign(&mock, &[contract], &signer, CHAIN).await.unwrap();
        assert_eq!(signer.prompts(), 1);
        assert_eq!(signature.contract_addresses, vec![contract]);
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_prompt() {
        let (_, _, cache, mock) = setup(1_000);
        let signer = CountingSigner::new(false);
        let contract = Address::repeat_byte(0xc0);

        cache.load_or_sign(&mock, &[contract], &signer, CHAIN).await.unwrap();
        cache.invalidate(&signer.address(), &[contract], CHAIN).await.unwrap();
        cache.load_or_sign(&mock, &[contract], &signer, CHAIN).await.unwrap();
        assert_eq!(signer.prompts(), 2);
    }

    #[tokio::test]
    async fn test_empty_contract_list_rejected() {
        let (_, _, cache, mock) = setup(1_000);
        let signer = CountingSigner::new(false);
        assert!(matches!(
            cache.load_or_sign(&mock, &[], &signer, CHAIN).await,
            Err(SignatureError::NoContracts)
        ));
        assert_eq!(signer.prompts(), 0);
    }
}
