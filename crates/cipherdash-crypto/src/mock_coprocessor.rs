// Local FHEVM mock coprocessor
//
// Plaintexts live in memory next to an access-control list per handle. The
// client side implements EncryptionCapability; the contract side is called
// by devnet contracts to verify inputs, compute on handles and grant access.
//
// SAFETY INVARIANTS:
// 1. Every computation yields a fresh handle; stored handles are never mutated
// 2. An input handle is usable only by the contract and user it was encrypted for
// 3. A user decrypts a handle only when both the user and the owning contract are on its ACL
// 4. The ZERO handle is readable by anyone and always holds 0

use crate::authorization::{DecryptionSignature, FheKeypair};
use crate::capability::{EncryptedInput, EncryptionCapability, HandleContractPair};
use crate::errors::{CoprocessorError, DecryptionError, EncryptionError};
use async_trait::async_trait;
use cipherdash_core::{Address, ChainId, CiphertextHandle, Clock, SystemClock};
use dashmap::DashMap;
use ethers_core::utils::keccak256;
use log::{debug, warn};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct StoredCiphertext {
    value: u32,
    acl: HashSet<Address>,
    publicly_decryptable: bool,
}

#[derive(Debug, Clone)]
struct PendingInput {
    value: u32,
    contract: Address,
    user: Address,
    proof: Vec<u8>,
}

pub struct MockCoprocessor {
    chain_id: ChainId,
    clock: Arc<dyn Clock>,
    proof_key: [u8; 32],
    nonce: AtomicU64,
    ciphertexts: DashMap<CiphertextHandle, StoredCiphertext>,
    pending_inputs: DashMap<CiphertextHandle, PendingInput>,
    /// Handles consumed by `verify_input`; replaying a proof is rejected.
    consumed_inputs: Mutex<HashSet<CiphertextHandle>>,
    encrypt_calls: AtomicUsize,
    decrypt_calls: AtomicUsize,
}

impl MockCoprocessor {
    pub fn new(chain_id: ChainId) -> Self {
        MockCoprocessor::with_clock(chain_id, Arc::new(SystemClock))
    }

    pub fn with_clock(chain_id: ChainId, clock: Arc<dyn Clock>) -> Self {
        let mut proof_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut proof_key);

        MockCoprocessor {
            chain_id,
            clock,
            proof_key,
            nonce: AtomicU64::new(1),
            ciphertexts: DashMap::new(),
            pending_inputs: DashMap::new(),
            consumed_inputs: Mutex::new(HashSet::new()),
            encrypt_calls: AtomicUsize::new(0),
            decrypt_calls: AtomicUsize::new(0),
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Number of `encrypt` calls served so far.
    pub fn encrypt_calls(&self) -> usize {
        self.encrypt_calls.load(Ordering::SeqCst)
    }

    /// Number of `user_decrypt` calls served so far, including failed ones.
    pub fn decrypt_calls(&self) -> usize {
        self.decrypt_calls.load(Ordering::SeqCst)
    }

    fn next_handle(&self, tag: &[u8]) -> CiphertextHandle {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let mut preimage = Vec::with_capacity(tag.len() + 40);
        preimage.extend_from_slice(&self.chain_id.to_be_bytes());
        preimage.extend_from_slice(&nonce.to_be_bytes());
        preimage.extend_from_slice(tag);
        CiphertextHandle::from_bytes(keccak256(preimage))
    }

    fn input_proof(&self, handle: &CiphertextHandle, contract: &Address, user: &Address) -> Vec<u8> {
        let mut preimage = Vec::with_capacity(104);
        preimage.extend_from_slice(&self.proof_key);
        preimage.extend_from_slice(handle.as_bytes());
        preimage.extend_from_slice(contract.as_bytes());
        preimage.extend_from_slice(user.as_bytes());
        keccak256(preimage).to_vec()
    }

    fn store(&self, value: u32, acl: impl IntoIterator<Item = Address>, tag: &[u8]) -> CiphertextHandle {
        let handle = self.next_handle(tag);
        self.ciphertexts.insert(
            handle,
            StoredCiphertext { value, acl: acl.into_iter().collect(), publicly_decryptable: false },
        );
        handle
    }

    /// Read a handle as `contract`, enforcing the ACL.
    fn read_as(&self, contract: &Address, handle: &CiphertextHandle) -> Result<u32, CoprocessorError> {
        if handle.is_zero() {
            return Ok(0);
        }
        let stored = self
            .ciphertexts
            .get(handle)
            .ok_or(CoprocessorError::UnknownHandle(*handle))?;
        if !stored.acl.contains(contract) {
            return Err(CoprocessorError::AclDenied(*contract));
        }
        Ok(stored.value)
    }

    // ---- contract side ----

    /// Accept an external input inside `contract` called by `user`.
    ///
    /// The returned handle is readable by `contract` only.
    pub fn verify_input(
        &self,
        contract: Address,
        user: Address,
        handle: CiphertextHandle,
        proof: &[u8],
    ) -> Result<CiphertextHandle, CoprocessorError> {
        let pending = self
            .pending_inputs
            .get(&handle)
            .map(|p| p.value().clone())
            .ok_or(CoprocessorError::InvalidProof)?;

        if pending.proof != proof {
            return Err(CoprocessorError::InvalidProof);
        }
        if pending.contract != contract || pending.user != user {
            return Err(CoprocessorError::InputBindingMismatch);
        }
        if !self.consumed_inputs.lock().insert(handle) {
            return Err(CoprocessorError::InvalidProof);
        }

        self.pending_inputs.remove(&handle);
        self.ciphertexts.insert(
            handle,
            StoredCiphertext { value: pending.value, acl: HashSet::from([contract]), publicly_decryptable: false },
        );
        Ok(handle)
    }

    /// `a + b` (wrapping) computed by `contract`.
    pub fn add(
        &self,
        contract: Address,
        a: &CiphertextHandle,
        b: &CiphertextHandle,
    ) -> Result<CiphertextHandle, CoprocessorError> {
        let sum = self.read_as(&contract, a)?.wrapping_add(self.read_as(&contract, b)?);
        Ok(self.store(sum, [contract], b"add"))
    }

    /// `a - b` (wrapping) computed by `contract`.
    pub fn sub(
        &self,
        contract: Address,
        a: &CiphertextHandle,
        b: &CiphertextHandle,
    ) -> Result<CiphertextHandle, CoprocessorError> {
        let diff = self.read_as(&contract, a)?.wrapping_sub(self.read_as(&contract, b)?);
        Ok(self.store(diff, [contract], b"sub"))
    }

    /// Encrypt a public constant inside `contract`.
    pub fn trivial_encrypt(&self, contract: Address, value: u32) -> CiphertextHandle {
        self.store(value, [contract], b"trivial")
    }

    /// Grant `account` access to `handle`; `contract` must already hold it.
    pub fn allow(&self, contract: Address, handle: &CiphertextHandle, account: Address) -> Result<(), CoprocessorError> {
        if handle.is_zero() {
            return Ok(());
        }
        let mut stored = self
            .ciphertexts
            .get_mut(handle)
            .ok_or(CoprocessorError::UnknownHandle(*handle))?;
        if !stored.acl.contains(&contract) {
            return Err(CoprocessorError::AclDenied(contract));
        }
        stored.acl.insert(account);
        Ok(())
    }

    pub fn is_allowed(&self, handle: &CiphertextHandle, account: &Address) -> bool {
        handle.is_zero()
            || self
                .ciphertexts
                .get(handle)
                .map(|s| s.acl.contains(account))
                .unwrap_or(false)
    }

    /// Mark `handle` as decryptable by anyone; `contract` must hold it.
    pub fn make_publicly_decryptable(&self, contract: Address, handle: &CiphertextHandle) -> Result<(), CoprocessorError> {
        if handle.is_zero() {
            return Ok(());
        }
        let mut stored = self
            .ciphertexts
            .get_mut(handle)
            .ok_or(CoprocessorError::UnknownHandle(*handle))?;
        if !stored.acl.contains(&contract) {
            return Err(CoprocessorError::AclDenied(contract));
        }
        stored.publicly_decryptable = true;
        Ok(())
    }

    /// Cleartext of a handle previously marked publicly decryptable.
    pub fn public_decrypt(&self, handle: &CiphertextHandle) -> Result<u64, CoprocessorError> {
        if handle.is_zero() {
            return Ok(0);
        }
        let stored = self
            .ciphertexts
            .get(handle)
            .ok_or(CoprocessorError::UnknownHandle(*handle))?;
        if !stored.publicly_decryptable {
            return Err(CoprocessorError::AclDenied(Address::zero()));
        }
        Ok(u64::from(stored.value))
    }

    fn check_signature(&self, signature: &DecryptionSignature) -> Result<(), DecryptionError> {
        signature.verify()?;

        if signature.chain_id != self.chain_id {
            return Err(DecryptionError::WrongChain { signed: signature.chain_id, served: self.chain_id });
        }
        if !signature.is_valid_at(self.clock.now()) {
            return Err(DecryptionError::SignatureExpired { expired_at: signature.expires_at() });
        }
        if !keypair_matches(&signature.public_key, &signature.private_key) {
            return Err(DecryptionError::KeypairMismatch);
        }
        Ok(())
    }
}

#[async_trait]
impl EncryptionCapability for MockCoprocessor {
    fn generate_keypair(&self) -> FheKeypair {
        let mut private_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private_key);
        let public_key = keccak256(private_key);

        FheKeypair {
            public_key: format!("0x{}", hex::encode(public_key)),
            private_key: format!("0x{}", hex::encode(private_key)),
        }
    }

    async fn encrypt(&self, contract: Address, user: Address, value: u32) -> Result<EncryptedInput, EncryptionError> {
        self.encrypt_calls.fetch_add(1, Ordering::SeqCst);
        if contract.is_zero() {
            return Err(EncryptionError::InvalidInput("contract address is zero".to_string()));
        }

        let handle = self.next_handle(b"input");
        let proof = self.input_proof(&handle, &contract, &user);
        self.pending_inputs.insert(handle, PendingInput { value, contract, user, proof: proof.clone() });

        debug!("Encrypted input {} for contract {:#x}", handle.short(), contract);
        Ok(EncryptedInput { handles: vec![handle], proof })
    }

    async fn user_decrypt(
        &self,
        requests: &[HandleContractPair],
        signature: &DecryptionSignature,
    ) -> Result<HashMap<CiphertextHandle, u64>, DecryptionError> {
        self.decrypt_calls.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = self.check_signature(signature) {
            warn!("Rejected user decryption: {}", e);
            return Err(e);
        }

        let user = signature.user_address;
        let mut cleartexts = HashMap::with_capacity(requests.len());

        for request in requests {
            if !signature.authorizes(&request.contract) {
                return Err(DecryptionError::ContractNotAuthorized(request.contract));
            }
            if request.handle.is_zero() {
                cleartexts.insert(request.handle, 0);
                continue;
            }

            let stored = self
                .ciphertexts
                .get(&request.handle)
                .ok_or(DecryptionError::UnknownHandle(request.handle))?;
            if !stored.acl.contains(&user) || !stored.acl.contains(&request.contract) {
                return Err(DecryptionError::Unauthorized { user, handle: request.handle });
            }
            cleartexts.insert(request.handle, u64::from(stored.value));
        }

        Ok(cleartexts)
    }
}

fn keypair_matches(public_key: &str, private_key: &str) -> bool {
    let decode = |v: &str| hex::decode(v.strip_prefix("0x").unwrap_or(v)).ok();
    match (decode(public_key), decode(private_key)) {
        (Some(public), Some(private)) => keccak256(private).as_slice() == public.as_slice(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::DecryptionRequest;
    use cipherdash_core::{ManualClock, SECONDS_PER_DAY};
    use ethers_signers::{LocalWallet, Signer};

    const CHAIN: ChainId = 31337;

    fn wallet() -> LocalWallet {
        "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d"
            .parse::<LocalWallet>()
            .unwrap()
    }

    fn sign_for(
        mock: &MockCoprocessor,
        wallet: &LocalWallet,
        contracts: &[Address],
        chain_id: ChainId,
        start: u64,
    ) -> DecryptionSignature {
        let keypair = mock.generate_keypair();
        let request = DecryptionRequest::new(keypair.public_key.clone(), contracts, chain_id, start, 1);
        let sig = wallet.sign_hash(request.digest()).unwrap();
        DecryptionSignature::new(keypair, request, wallet.address(), &sig)
    }

    /// Encrypt `value`, accept it in `contract` and grant the user access.
    async fn stored_for_user(mock: &MockCoprocessor, contract: Address, user: Address, value: u32) -> CiphertextHandle {
        let input = mock.encrypt(contract, user, value).await.unwrap();
        let handle = mock.verify_input(contract, user, input.handle().unwrap(), &input.proof).unwrap();
        let result = mock.add(contract, &CiphertextHandle::ZERO, &handle).unwrap();
        mock.allow(contract, &result, user).unwrap();
        result
    }

    #[tokio::test]
    async fn test_encrypt_compute_decrypt() {
        let clock = Arc::new(ManualClock::new(10_000));
        let mock = MockCoprocessor::with_clock(CHAIN, clock.clone());
        let wallet = wallet();
        let contract = Address::repeat_byte(0xc0);

        let five = stored_for_user(&mock, contract, wallet.address(), 5).await;
        let one = mock.trivial_encrypt(contract, 1);
        let six = mock.add(contract, &five, &one).unwrap();
        mock.allow(contract, &six, wallet.address()).unwrap();
        assert_ne!(five, six);

        let sig = sign_for(&mock, &wallet, &[contract], CHAIN, clock.now());
        let out = mock
            .user_decrypt(
                &[HandleContractPair::new(five, contract), HandleContractPair::new(six, contract)],
                &sig,
            )
            .await
            .unwrap();
        assert_eq!(out[&five], 5);
        assert_eq!(out[&six], 6);
        assert_eq!(mock.decrypt_calls(), 1);
    }

    #[tokio::test]
    async fn test_sub_wraps() {
        let mock = MockCoprocessor::new(CHAIN);
        let contract = Address::repeat_byte(0xc0);
        let one = mock.trivial_encrypt(contract, 1);
        let result = mock.sub(contract, &CiphertextHandle::ZERO, &one).unwrap();
        mock.make_publicly_decryptable(contract, &result).unwrap();
        assert_eq!(mock.public_decrypt(&result).unwrap(), u64::from(u32::MAX));
    }

    #[tokio::test]
    async fn test_input_bound_to_contract_and_user() {
        let mock = MockCoprocessor::new(CHAIN);
        let contract = Address::repeat_byte(0xc0);
        let user = Address::repeat_byte(0x01);
        let input = mock.encrypt(contract, user, 3).await.unwrap();
        let handle = input.handle().unwrap();

        assert_eq!(
            mock.verify_input(Address::repeat_byte(0xc1), user, handle, &input.proof),
            Err(CoprocessorError::InputBindingMismatch)
        );
        assert_eq!(
            mock.verify_input(contract, user, handle, b"bogus"),
            Err(CoprocessorError::InvalidProof)
        );
        assert!(mock.verify_input(contract, user, handle, &input.proof).is_ok());
        // replay
        assert_eq!(
            mock.verify_input(contract, user, handle, &input.proof),
            Err(CoprocessorError::InvalidProof)
        );
    }

    #[tokio::test]
    async fn test_acl_enforced() {
        let mock = MockCoprocessor::new(CHAIN);
        let contract = Address::repeat_byte(0xc0);
        let other = Address::repeat_byte(0xc1);
        let handle = mock.trivial_encrypt(contract, 9);

        assert_eq!(mock.add(other, &handle, &handle), Err(CoprocessorError::AclDenied(other)));
        assert_eq!(mock.allow(other, &handle, other), Err(CoprocessorError::AclDenied(other)));
        assert!(mock.public_decrypt(&handle).is_err());
    }

    #[tokio::test]
    async fn test_user_not_on_acl_rejected() {
        let mock = MockCoprocessor::new(CHAIN);
        let wallet = wallet();
        let contract = Address::repeat_byte(0xc0);
        let handle = mock.trivial_encrypt(contract, 9);

        let sig = sign_for(&mock, &wallet, &[contract], CHAIN, SystemClock.now());
        let err = mock
            .user_decrypt(&[HandleContractPair::new(handle, contract)], &sig)
            .await
            .unwrap_err();
        assert_eq!(err, DecryptionError::Unauthorized { user: wallet.address(), handle });
    }

    #[tokio::test]
    async fn test_signature_checks() {
        let clock = Arc::new(ManualClock::new(50_000));
        let mock = MockCoprocessor::with_clock(CHAIN, clock.clone());
        let wallet = wallet();
        let contract = Address::repeat_byte(0xc0);
        let handle = stored_for_user(&mock, contract, wallet.address(), 2).await;
        let request = [HandleContractPair::new(handle, contract)];

        // contract outside the signed list
        let sig = sign_for(&mock, &wallet, &[Address::repeat_byte(0xdd)], CHAIN, clock.now());
        assert_eq!(
            mock.user_decrypt(&request, &sig).await.unwrap_err(),
            DecryptionError::ContractNotAuthorized(contract)
        );

        // signed for another chain
        let sig = sign_for(&mock, &wallet, &[contract], 1, clock.now());
        assert!(matches!(
            mock.user_decrypt(&request, &sig).await,
            Err(DecryptionError::WrongChain { signed: 1, served: CHAIN })
        ));

        // forged user
        let mut sig = sign_for(&mock, &wallet, &[contract], CHAIN, clock.now());
        sig.user_address = Address::repeat_byte(0x42);
        assert!(matches!(
            mock.user_decrypt(&request, &sig).await,
            Err(DecryptionError::InvalidSignature { .. })
        ));

        // swapped reencryption key
        let mut sig = sign_for(&mock, &wallet, &[contract], CHAIN, clock.now());
        sig.private_key = mock.generate_keypair().private_key;
        assert_eq!(mock.user_decrypt(&request, &sig).await.unwrap_err(), DecryptionError::KeypairMismatch);

        // expiry
        let sig = sign_for(&mock, &wallet, &[contract], CHAIN, clock.now());
        assert!(mock.user_decrypt(&request, &sig).await.is_ok());
        clock.advance(SECONDS_PER_DAY);
        assert!(matches!(
            mock.user_decrypt(&request, &sig).await,
            Err(DecryptionError::SignatureExpired { .. })
        ));
    }

    #[tokio::test]
    async fn test_zero_and_unknown_handles() {
        let mock = MockCoprocessor::new(CHAIN);
        let wallet = wallet();
        let contract = Address::repeat_byte(0xc0);
        let sig = sign_for(&mock, &wallet, &[contract], CHAIN, SystemClock.now());

        let zero = mock
            .user_decrypt(&[HandleContractPair::new(CiphertextHandle::ZERO, contract)], &sig)
            .await
            .unwrap();
        assert_eq!(zero[&CiphertextHandle::ZERO], 0);

        let unknown = CiphertextHandle::from_bytes([7u8; 32]);
        assert_eq!(
            mock.user_decrypt(&[HandleContractPair::new(unknown, contract)], &sig).await.unwrap_err(),
            DecryptionError::UnknownHandle(unknown)
        );
    }
}
