// Single-flight contract proxy cache
//
// SAFETY INVARIANTS:
// 1. At most one successful connect per (chain_id, address)
// 2. Concurrent callers for one key await the same initialization
// 3. A failed connect is not cached; the next caller tries again
// 4. The zero address never reaches the connector
// 5. With a TTL, a proxy older than the TTL is never handed out; the first
//    caller after expiry reconnects and the others share that attempt

use crate::chain::ChainError;
use crate::contracts::{ContractProvider, ElectionContract, FheCounterContract, RatingContract};
use async_trait::async_trait;
use cipherdash_core::{Address, ChainId, Clock};
use dashmap::DashMap;
use log::debug;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

type Key = (ChainId, Address);

struct Connected<C: ?Sized> {
    contract: Arc<C>,
    connected_at: u64,
}

struct Ttl {
    seconds: u64,
    clock: Arc<dyn Clock>,
}

pub struct ContractCache<C: ?Sized> {
    entries: DashMap<Key, Arc<OnceCell<Connected<C>>>>,
    ttl: Option<Ttl>,
}

impl<C: ?Sized> Default for ContractCache<C> {
    fn default() -> Self {
        ContractCache { entries: DashMap::new(), ttl: None }
    }
}

impl<C: ?Sized + Send + Sync> ContractCache<C> {
    /// Cache whose proxies never expire.
    pub fn new() -> Self {
        ContractCache::default()
    }

    /// Cache that reconnects a proxy once it is `seconds` old.
    pub fn with_ttl(seconds: u64, clock: Arc<dyn Clock>) -> Self {
        ContractCache { entries: DashMap::new(), ttl: Some(Ttl { seconds, clock }) }
    }

    fn now(&self) -> u64 {
        self.ttl.as_ref().map(|ttl| ttl.clock.now()).unwrap_or_default()
    }

    fn is_fresh(&self, connected: &Connected<C>) -> bool {
        match &self.ttl {
            Some(ttl) => ttl.clock.now().saturating_sub(connected.connected_at) < ttl.seconds,
            None => true,
        }
    }

    /// Cell for `key`, replacing one whose proxy has expired.
    fn cell(&self, key: Key) -> Arc<OnceCell<Connected<C>>> {
        let cell = self.entries.entry(key).or_default().value().clone();
        match cell.get() {
            Some(connected) if !self.is_fresh(connected) => {
                debug!("Contract {:#x} on chain {} expired", key.1, key.0);
                self.entries.remove_if(&key, |_, current| Arc::ptr_eq(current, &cell));
                self.entries.entry(key).or_default().value().clone()
            }
            _ => cell,
        }
    }

    /// Cached proxy for `(chain_id, address)`, connecting on first use.
    pub async fn get_or_connect<F, Fut>(&self, chain_id: ChainId, address: Address, connect: F) -> Result<Arc<C>, ChainError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<C>, ChainError>>,
    {
        if address.is_zero() {
            return Err(ChainError::NotDeployed(format!(
                "no contract at the zero address on chain {}",
                chain_id
            )));
        }

        let cell = self.cell((chain_id, address));
        if let Some(connected) = cell.get() {
            return Ok(connected.contract.clone());
        }

        let connected_at = self.now();
        let connected = cell
            .get_or_try_init(|| async move {
                debug!("Connecting contract {:#x} on chain {}", address, chain_id);
                let contract = connect().await?;
                Ok::<_, ChainError>(Connected { contract, connected_at })
            })
            .await?;
        Ok(connected.contract.clone())
    }

    /// Already-connected, unexpired proxy, without connecting.
    pub fn get(&self, chain_id: ChainId, address: Address) -> Option<Arc<C>> {
        self.entries
            .get(&(chain_id, address))
            .and_then(|cell| cell.get().filter(|c| self.is_fresh(c)).map(|c| c.contract.clone()))
    }

    pub fn invalidate(&self, chain_id: ChainId, address: Address) {
        self.entries.remove(&(chain_id, address));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of connected proxies.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value().initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wraps a provider so each proxy is connected once (or once per TTL).
pub struct CachedContracts<P> {
    inner: P,
    counters: ContractCache<dyn FheCounterContract>,
    elections: ContractCache<dyn ElectionContract>,
    ratings: ContractCache<dyn RatingContract>,
}

impl<P: ContractProvider> CachedContracts<P> {
    pub fn new(inner: P) -> Self {
        CachedContracts {
            inner,
            counters: ContractCache::new(),
            elections: ContractCache::new(),
            ratings: ContractCache::new(),
        }
    }

    /// Proxies are reconnected once `seconds` old.
    pub fn with_ttl(inner: P, seconds: u64, clock: Arc<dyn Clock>) -> Self {
        CachedContracts {
            inner,
            counters: ContractCache::with_ttl(seconds, clock.clone()),
            elections: ContractCache::with_ttl(seconds, clock.clone()),
            ratings: ContractCache::with_ttl(seconds, clock),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn counters(&self) -> &ContractCache<dyn FheCounterContract> {
        &self.counters
    }

    pub fn elections(&self) -> &ContractCache<dyn ElectionContract> {
        &self.elections
    }

    pub fn ratings(&self) -> &ContractCache<dyn RatingContract> {
        &self.ratings
    }
}

#[async_trait]
impl<P: ContractProvider> ContractProvider for CachedContracts<P> {
    async fn fhe_counter(&self, chain_id: ChainId, address: Address) -> Result<Arc<dyn FheCounterContract>, ChainError> {
        self.counters
            .get_or_connect(chain_id, address, || self.inner.fhe_counter(chain_id, address))
            .await
    }

    async fn election(&self, chain_id: ChainId, address: Address) -> Result<Arc<dyn ElectionContract>, ChainError> {
        self.elections
            .get_or_connect(chain_id, address, || self.inner.election(chain_id, address))
            .await
    }

    async fn rating_system(&self, chain_id: ChainId, address: Address) -> Result<Arc<dyn RatingContract>, ChainError> {
        self.ratings
            .get_or_connect(chain_id, address, || self.inner.rating_system(chain_id, address))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipherdash_core::ManualClock;
    use tokio_test::assert_ok;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct Dummy(u32);

    #[tokio::test]
    async fn test_concurrent_connect_is_single_flight() {
        let cache: ContractCache<Dummy> = ContractCache::new();
        let connects = AtomicUsize::new(0);
        let counter = &connects;
        let address = Address::repeat_byte(0x11);

        let connect = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, ChainError>(Arc::new(Dummy(7)))
        };

        let (a, b, c) = tokio::join!(
            cache.get_or_connect(1, address, connect),
            cache.get_or_connect(1, address, connect),
            cache.get_or_connect(1, address, connect),
        );

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
        assert_eq!(a.0, 7);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_keys_are_per_chain() {
        let cache: ContractCache<Dummy> = ContractCache::new();
        let address = Address::repeat_byte(0x11);

        cache.get_or_connect(1, address, || async { Ok(Arc::new(Dummy(1))) }).await.unwrap();
        let other = cache
            .get_or_connect(2, address, || async { Ok(Arc::new(Dummy(2))) })
            .await
            .unwrap();
        assert_eq!(other.0, 2);
        assert_eq!(cache.get(1, address).map(|d| d.0), Some(1));
    }

    #[tokio::test]
    async fn test_failed_connect_not_cached() {
        let cache: ContractCache<Dummy> = ContractCache::new();
        let address = Address::repeat_byte(0x11);

        let first = cache
            .get_or_connect(1, address, || async { Err(ChainError::Connectivity("down".into())) })
            .await;
        assert!(first.is_err());
        assert!(cache.is_empty());

        let second = cache.get_or_connect(1, address, || async { Ok(Arc::new(Dummy(3))) }).await;
        assert_eq!(second.unwrap().0, 3);
    }

    #[tokio::test]
    async fn test_zero_address_rejected() {
        let cache: ContractCache<Dummy> = ContractCache::new();
        let result = cache
            .get_or_connect(1, Address::zero(), || async { Ok(Arc::new(Dummy(0))) })
            .await;
        assert!(matches!(result, Err(ChainError::NotDeployed(_))));
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache: ContractCache<Dummy> = ContractCache::new();
        let address = Address::repeat_byte(0x11);
        cache.get_or_connect(1, address, || async { Ok(Arc::new(Dummy(1))) }).await.unwrap();
        cache.invalidate(1, address);
        assert!(cache.get(1, address).is_none());
    }

    #[tokio::test]
    async fn test_expired_proxy_reconnects() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache: ContractCache<Dummy> = ContractCache::with_ttl(60, clock.clone());
        let connects = AtomicUsize::new(0);
        let counter = &connects;
        let address = Address::repeat_byte(0x11);

        let connect = move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) as u32;
            Ok::<_, ChainError>(Arc::new(Dummy(n)))
        };

        let first = assert_ok!(cache.get_or_connect(1, address, connect).await);
        clock.advance(59);
        let still = assert_ok!(cache.get_or_connect(1, address, connect).await);
        assert!(Arc::ptr_eq(&first, &still));
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        clock.advance(1);
        assert!(cache.get(1, address).is_none());
        let (a, b) = tokio::join!(
            cache.get_or_connect(1, address, connect),
            cache.get_or_connect(1, address, connect),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.0, 1);
        assert_eq!(cache.get(1, address).map(|d| d.0), Some(1));
    }
}
