mod common;

use async_trait::async_trait;
use cipherdash_core::{Address, ChainId, CiphertextHandle, ClearValue, LOCAL_CHAIN_ID, SECONDS_PER_DAY, SEPOLIA_CHAIN_ID};
use cipherdash_interop::{
    ChainClient, ChainError, ContractProvider, ElectionContract, FheCounterContract, PendingTx, RatingContract,
};
use cipherdash_state::{CounterSession, OperationKind, Outcome, SkipReason};
use common::Harness;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_test::assert_ok;

#[test_log::test(tokio::test)]
async fn test_counter_end_to_end() {
    let h = Harness::new();
    let session = CounterSession::new(h.deps.clone());

    assert!(session.connect().await.is_committed());
    assert_eq!(session.handle(), Some(CiphertextHandle::ZERO));

    // never written: decrypts to zero without the relayer or the wallet
    assert!(session.decrypt_count_handle().await.is_committed());
    assert_eq!(session.clear(), Some(ClearValue::zero()));
    assert_eq!(h.decrypt_calls(), 0);
    assert_eq!(h.alice.prompts(), 0);

    assert!(session.increment(5).await.is_committed());
    let h0 = session.handle().unwrap();
    assert!(!h0.is_zero());
    assert!(session.view().can_decrypt);

    assert!(session.decrypt_count_handle().await.is_committed());
    assert_eq!(session.clear(), Some(ClearValue::new(h0, 5)));
    assert_eq!(session.message(), "FHEVM userDecrypt completed!");

    assert!(session.increment(1).await.is_committed());
    let h1 = session.handle().unwrap();
    assert_ne!(h0, h1);
    assert!(!session.view().is_decrypted);
    assert_eq!(session.view().clear, None);

    assert!(session.decrypt_count_handle().await.is_committed());
    assert_eq!(session.clear(), Some(ClearValue::new(h1, 6)));

    assert!(session.decrement(2).await.is_committed());
    assert!(session.decrypt_count_handle().await.is_committed());
    assert_eq!(session.clear().map(|c| c.value), Some(4));

    // one signature covers every decrypt in the window
    assert_eq!(h.alice.prompts(), 1);
    assert_eq!(h.decrypt_calls(), 3);
}

#[tokio::test]
async fn test_no_redundant_decrypt() {
    let h = Harness::new();
    let session = CounterSession::new(h.deps.clone());
    session.connect().await;
    assert!(session.increment(2).await.is_committed());

    assert!(session.decrypt_count_handle().await.is_committed());
    assert_eq!(
        session.decrypt_count_handle().await,
        Outcome::Skipped(SkipReason::AlreadyDecrypted)
    );
    assert_eq!(h.decrypt_calls(), 1);
}

#[tokio::test]
async fn test_chain_switch_discards_pending_decrypt() {
    let h = Harness::new();
    let session = CounterSession::new(h.deps.clone());
    session.connect().await;
    assert!(session.increment(5).await.is_committed());

    h.capability.gate_decrypt(true);
    let (outcome, _) = tokio::join!(session.decrypt_count_handle(), async {
        h.capability.entered.notified().await;
        h.context().set_chain(Some(SEPOLIA_CHAIN_ID));
    });

    assert_eq!(outcome, Outcome::Stale);
    assert_eq!(h.decrypt_calls(), 0);
    assert_eq!(session.clear(), None);
    assert!(!session.view().is_decrypting);

    // back on the local chain the old handle is gone until re-read
    h.context().set_chain(Some(LOCAL_CHAIN_ID));
    assert_eq!(session.handle(), None);

    h.capability.gate_decrypt(false);
    assert!(session.connect().await.is_committed());
    assert!(session.decrypt_count_handle().await.is_committed());
    assert_eq!(session.clear().map(|c| c.value), Some(5));
}

#[tokio::test]
async fn test_signer_switch_discards_pending_decrypt() {
    let h = Harness::new();
    let session = CounterSession::new(h.deps.clone());
    session.connect().await;
    assert!(session.increment(5).await.is_committed());
    let handle = session.handle();

    h.capability.gate_decrypt(true);
    let (outcome, _) = tokio::join!(session.decrypt_count_handle(), async {
        h.capability.entered.notified().await;
        h.use_signer(&h.bob);
    });

    assert_eq!(outcome, Outcome::Stale);
    assert_eq!(session.clear(), None);
    // the handle is public; only the plaintext belonged to alice
    assert_eq!(session.handle(), handle);
}

#[tokio::test]
async fn test_signer_switch_drops_plaintext_only() {
    let h = Harness::new();
    let session = CounterSession::new(h.deps.clone());
    session.connect().await;
    assert!(session.increment(7).await.is_committed());
    assert!(session.decrypt_count_handle().await.is_committed());
    let handle = session.handle();

    h.use_signer(&h.bob);
    assert_eq!(session.handle(), handle);
    assert_eq!(session.clear(), None);
    assert!(session.view().can_decrypt);

    // bob never touched the counter, so the ACL refuses him
    let outcome = session.decrypt_count_handle().await;
    assert!(matches!(outcome, Outcome::Failed(ref m) if m.starts_with("FHEVM userDecrypt failed!")));
    assert_eq!(session.clear(), None);
}

#[tokio::test]
async fn test_reentrant_mutate_is_dropped() {
    let h = Harness::new();
    let session = CounterSession::new(h.deps.clone());
    session.connect().await;
    let blocks_before = h.devnet.chain().block_number().await.unwrap();

    h.capability.gate_encrypt(true);
    let (first, second) = tokio::join!(session.increment(1), async {
        h.capability.entered.notified().await;
        assert!(session.view().is_mutating);
        let second = session.increment(1).await;
        h.capability.release.notify_one();
        second
    });

    assert!(first.is_committed());
    assert_eq!(second, Outcome::Skipped(SkipReason::InFlight(OperationKind::Mutate)));
    assert_eq!(h.devnet.chain().block_number().await.unwrap(), blocks_before + 1);

    h.capability.gate_encrypt(false);
    assert!(session.decrypt_count_handle().await.is_committed());
    assert_eq!(session.clear().map(|c| c.value), Some(1));
}

#[tokio::test]
async fn test_chain_switch_before_send_sends_nothing() {
    let h = Harness::new();
    let session = CounterSession::new(h.deps.clone());
    session.connect().await;
    let blocks_before = h.devnet.chain().block_number().await.unwrap();

    h.capability.gate_encrypt(true);
    let (outcome, _) = tokio::join!(session.increment(3), async {
        h.capability.entered.notified().await;
        h.context().set_chain(Some(SEPOLIA_CHAIN_ID));
    });

    assert_eq!(outcome, Outcome::Stale);
    assert_eq!(h.devnet.chain().block_number().await.unwrap(), blocks_before);
}

#[tokio::test]
async fn test_expired_signature_reprompts_and_rejection_is_reported() {
    let h = Harness::new();
    let session = CounterSession::new(h.deps.clone());
    session.connect().await;
    assert!(session.increment(3).await.is_committed());
    assert!(session.decrypt_count_handle().await.is_committed());
    assert_eq!(h.alice.prompts(), 1);

    assert!(session.increment(1).await.is_committed());
    h.clock.advance(366 * SECONDS_PER_DAY);
    h.alice.set_reject(true);

    let outcome = session.decrypt_count_handle().await;
    assert!(matches!(outcome, Outcome::Failed(ref m) if m.starts_with("Unable to build FHEVM decryption signature")));
    assert_eq!(h.alice.prompts(), 2);
    assert_eq!(session.clear(), None);
    assert!(!session.view().is_decrypting);

    h.alice.set_reject(false);
    assert!(session.decrypt_count_handle().await.is_committed());
    assert_eq!(session.clear().map(|c| c.value), Some(4));
    assert_eq!(h.alice.prompts(), 3);
}

#[tokio::test]
async fn test_preconditions() {
    let h = Harness::new();
    let session = CounterSession::new(h.deps.clone());

    assert_eq!(session.decrypt_count_handle().await, Outcome::Skipped(SkipReason::NoHandle));
    assert_eq!(session.inc_or_dec(0).await, Outcome::Skipped(SkipReason::ZeroMagnitude));

    h.context().set_signer(None);
    assert_eq!(session.increment(1).await, Outcome::Skipped(SkipReason::NoSigner));
    assert!(!session.view().can_mutate);

    h.use_signer(&h.alice);
    h.context().set_capability(None);
    assert_eq!(session.increment(1).await, Outcome::Skipped(SkipReason::NoCapability));
    assert_eq!(session.decrypt_count_handle().await, Outcome::Skipped(SkipReason::NoCapability));
}

#[tokio::test]
async fn test_not_deployed_chain() {
    let h = Harness::new();
    let session = CounterSession::new(h.deps.clone());
    h.context().set_chain(Some(SEPOLIA_CHAIN_ID));

    let view = session.view();
    assert!(!view.is_deployed);
    assert!(!view.can_refresh && !view.can_decrypt && !view.can_mutate);
    assert_eq!(view.message, "FHECounter deployment not found for chainId=11155111.");

    assert_eq!(session.connect().await, Outcome::Skipped(SkipReason::NotDeployed));
    assert_eq!(session.increment(1).await, Outcome::Skipped(SkipReason::NotDeployed));
    assert_eq!(session.decrypt_count_handle().await, Outcome::Skipped(SkipReason::NotDeployed));
    assert_eq!(session.handle(), None);
}

/// Counter proxy that counts `getCount` calls. `getCount` can be paused
/// until released or made to fail; `increment` can be sent with a broken
/// proof.
struct CountingCounter {
    inner: Arc<dyn FheCounterContract>,
    reads: AtomicUsize,
    gate_read: AtomicBool,
    fail_read: AtomicBool,
    break_proof: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl CountingCounter {
    fn new(inner: Arc<dyn FheCounterContract>) -> Arc<Self> {
        Arc::new(CountingCounter {
            inner,
            reads: AtomicUsize::new(0),
            gate_read: AtomicBool::new(false),
            fail_read: AtomicBool::new(false),
            break_proof: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FheCounterContract for CountingCounter {
    fn address(&self) -> Address {
        self.inner.address()
    }

    async fn get_count(&self) -> Result<CiphertextHandle, ChainError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.gate_read.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        if self.fail_read.load(Ordering::SeqCst) {
            return Err(ChainError::Connectivity("node unreachable".to_string()));
        }
        self.inner.get_count().await
    }

    async fn increment(&self, from: Address, input: CiphertextHandle, proof: Vec<u8>) -> Result<PendingTx, ChainError> {
        let proof = if self.break_proof.load(Ordering::SeqCst) { vec![0u8; proof.len()] } else { proof };
        self.inner.increment(from, input, proof).await
    }

    async fn decrement(&self, from: Address, input: CiphertextHandle, proof: Vec<u8>) -> Result<PendingTx, ChainError> {
        self.inner.decrement(from, input, proof).await
    }
}

struct CountingProvider {
    inner: Arc<dyn ContractProvider>,
    counter: Arc<CountingCounter>,
}

#[async_trait]
impl ContractProvider for CountingProvider {
    async fn fhe_counter(&self, chain_id: ChainId, address: Address) -> Result<Arc<dyn FheCounterContract>, ChainError> {
        self.inner.fhe_counter(chain_id, address).await?;
        Ok(self.counter.clone())
    }

    async fn election(&self, chain_id: ChainId, address: Address) -> Result<Arc<dyn ElectionContract>, ChainError> {
        self.inner.election(chain_id, address).await
    }

    async fn rating_system(&self, chain_id: ChainId, address: Address) -> Result<Arc<dyn RatingContract>, ChainError> {
        self.inner.rating_system(chain_id, address).await
    }
}

/// Session whose counter proxy is a `CountingCounter` over the devnet.
fn counting_session(h: &mut Harness) -> (CounterSession, Arc<CountingCounter>) {
    let counter = CountingCounter::new(h.devnet.counter().clone());
    h.deps.contracts = Arc::new(CountingProvider { inner: Arc::new(h.devnet.clone()), counter: counter.clone() });
    (CounterSession::new(h.deps.clone()), counter)
}

#[tokio::test]
async fn test_successful_mutate_refreshes_once() {
    let mut h = Harness::new();
    let (session, counter) = counting_session(&mut h);

    session.connect().await;
    assert_eq!(counter.reads(), 1);
    let before = session.handle();

    assert!(session.increment(4).await.is_committed());
    assert_eq!(counter.reads(), 2);
    assert_ne!(session.handle(), before);
    assert_eq!(session.message(), "Call increment(4) completed! Status: Success");
}

#[tokio::test]
async fn test_failed_refresh_keeps_handle() {
    let mut h = Harness::new();
    let (session, counter) = counting_session(&mut h);
    session.connect().await;
    assert!(session.increment(2).await.is_committed());
    let handle = session.handle();
    assert!(handle.is_some());

    counter.fail_read.store(true, Ordering::SeqCst);
    let expected = "FHECounter.getCount() call failed! error=RPC connectivity error: node unreachable";
    assert_eq!(session.refresh_count_handle().await, Outcome::Failed(expected.to_string()));
    assert_eq!(session.message(), expected);
    assert_eq!(session.handle(), handle);
    assert!(!session.view().is_refreshing);
}

#[tokio::test]
async fn test_refresh_in_flight_blocks_other_operations() {
    let mut h = Harness::new();
    let (session, counter) = counting_session(&mut h);
    session.connect().await;
    let blocks_before = assert_ok!(h.devnet.chain().block_number().await);

    counter.gate_read.store(true, Ordering::SeqCst);
    let (first, (second, decrypt, increment)) = tokio::join!(session.refresh_count_handle(), async {
        counter.entered.notified().await;
        assert!(session.view().is_refreshing);
        let second = session.refresh_count_handle().await;
        let decrypt = session.decrypt_count_handle().await;
        let increment = session.increment(1).await;
        counter.release.notify_one();
        (second, decrypt, increment)
    });

    assert!(first.is_committed());
    assert_eq!(second, Outcome::Skipped(SkipReason::InFlight(OperationKind::Refresh)));
    assert_eq!(decrypt, Outcome::Skipped(SkipReason::Busy(OperationKind::Refresh)));
    assert_eq!(increment, Outcome::Skipped(SkipReason::Busy(OperationKind::Refresh)));
    assert_eq!(counter.reads(), 2);
    assert_eq!(h.devnet.coprocessor().encrypt_calls(), 0);
    assert_eq!(assert_ok!(h.devnet.chain().block_number().await), blocks_before);
}

#[tokio::test]
async fn test_reverted_increment_keeps_handle() {
    let mut h = Harness::new();
    let (session, counter) = counting_session(&mut h);
    session.connect().await;
    assert!(session.increment(2).await.is_committed());
    let handle = session.handle();
    let reads = counter.reads();

    counter.break_proof.store(true, Ordering::SeqCst);
    let expected = "increment(3) Failed! Execution reverted: Invalid input proof";
    assert_eq!(session.increment(3).await, Outcome::Failed(expected.to_string()));
    assert_eq!(session.message(), expected);
    assert_eq!(session.handle(), handle);
    assert_eq!(counter.reads(), reads);

    counter.break_proof.store(false, Ordering::SeqCst);
    assert!(session.decrypt_count_handle().await.is_committed());
    assert_eq!(session.clear().map(|c| c.value), Some(2));
}
