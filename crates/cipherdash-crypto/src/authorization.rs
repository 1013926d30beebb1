// User-decryption authorization
//
// A DecryptionSignature proves that `user_address` allowed decryption of
// handles owned by `contract_addresses`, on one chain, for a bounded window.
// The signed payload is an EIP-712 style typed-struct digest.
//
// INVARIANTS:
// 1. contract_addresses is kept sorted and deduplicated
// 2. The signature is never valid at or after start_timestamp + duration_days
// 3. The signature never authorizes a contract outside contract_addresses

use crate::errors::DecryptionError;
use cipherdash_core::{Address, ChainId, SECONDS_PER_DAY, H256, U256};
use ethers_core::abi::{encode, Token};
use ethers_core::types::Signature;
use ethers_core::utils::keccak256;
use serde::{Deserialize, Serialize};

const DOMAIN_TYPE: &str = "EIP712Domain(string name,string version,uint256 chainId)";
const DOMAIN_NAME: &str = "Decryption";
const DOMAIN_VERSION: &str = "1";
const REQUEST_TYPE: &str = "UserDecryptRequestVerification(bytes publicKey,address[] contractAddresses,uint256 contractsChainId,uint256 startTimestamp,uint256 durationDays)";

/// Reencryption keypair generated for one decryption signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FheKeypair {
    /// `0x`-prefixed hex
    pub public_key: String,
    /// `0x`-prefixed hex
    pub private_key: String,
}

/// The fields the wallet signs over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionRequest {
    pub public_key: String,
    pub contract_addresses: Vec<Address>,
    pub chain_id: ChainId,
    pub start_timestamp: u64,
    pub duration_days: u64,
}

impl DecryptionRequest {
    pub fn new(
        public_key: String,
        contract_addresses: &[Address],
        chain_id: ChainId,
        start_timestamp: u64,
        duration_days: u64,
    ) -> Self {
        DecryptionRequest {
            public_key,
            contract_addresses: normalize_contracts(contract_addresses),
            chain_id,
            start_timestamp,
            duration_days,
        }
    }

    /// Digest the wallet is asked to sign.
    pub fn digest(&self) -> H256 {
        let domain_separator = keccak256(encode(&[
            Token::FixedBytes(keccak256(DOMAIN_TYPE).to_vec()),
            Token::FixedBytes(keccak256(DOMAIN_NAME).to_vec()),
            Token::FixedBytes(keccak256(DOMAIN_VERSION).to_vec()),
            Token::Uint(U256::from(self.chain_id)),
        ]));

        let public_key_bytes = decode_hex(&self.public_key);
        let packed_contracts: Vec<u8> = self
            .contract_addresses
            .iter()
            .flat_map(|a| {
                let mut word = [0u8; 32];
                word[12..].copy_from_slice(a.as_bytes());
                word
            })
            .collect();

        let struct_hash = keccak256(encode(&[
            Token::FixedBytes(keccak256(REQUEST_TYPE).to_vec()),
            Token::FixedBytes(keccak256(public_key_bytes).to_vec()),
            Token::FixedBytes(keccak256(packed_contracts).to_vec()),
            Token::Uint(U256::from(self.chain_id)),
            Token::Uint(U256::from(self.start_timestamp)),
            Token::Uint(U256::from(self.duration_days)),
        ]));

        let mut preimage = Vec::with_capacity(66);
        preimage.extend_from_slice(&[0x19, 0x01]);
        preimage.extend_from_slice(&domain_separator);
        preimage.extend_from_slice(&struct_hash);
        H256::from(keccak256(preimage))
    }
}

/// Wallet-signed capability to decrypt handles of the listed contracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionSignature {
    pub public_key: String,
    pub private_key: String,
    /// `0x`-prefixed 65-byte r||s||v
    pub signature: String,
    pub contract_addresses: Vec<Address>,
    pub user_address: Address,
    pub chain_id: ChainId,
    pub start_timestamp: u64,
    pub duration_days: u64,
}

impl DecryptionSignature {
    pub fn new(keypair: FheKeypair, request: DecryptionRequest, user_address: Address, signature: &Signature) -> Self {
        DecryptionSignature {
            public_key: keypair.public_key,
            private_key: keypair.private_key,
            signature: format!("0x{}", hex::encode(signature.to_vec())),
            contract_addresses: request.contract_addresses,
            user_address,
            chain_id: request.chain_id,
            start_timestamp: request.start_timestamp,
            duration_days: request.duration_days,
        }
    }

    pub fn request(&self) -> DecryptionRequest {
        DecryptionRequest::new(
            self.public_key.clone(),
            &self.contract_addresses,
            self.chain_id,
            self.start_timestamp,
            self.duration_days,
        )
    }

    pub fn expires_at(&self) -> u64 {
        self.start_timestamp.saturating_add(self.duration_days.saturating_mul(SECONDS_PER_DAY))
    }

    pub fn is_valid_at(&self, now: u64) -> bool {
        now < self.expires_at()
    }

    /// Records read back from storage may list contracts in any order.
    pub fn authorizes(&self, contract: &Address) -> bool {
        self.contract_addresses.contains(contract)
    }

    /// True when this signature covers every contract in `contracts`.
    pub fn covers(&self, contracts: &[Address]) -> bool {
        contracts.iter().all(|c| self.authorizes(c))
    }

    /// Check that `signature` was produced by `user_address` over `request()`.
    pub fn verify(&self) -> Result<(), DecryptionError> {
        let invalid = || DecryptionError::InvalidSignature { expected: self.user_address };

        let bytes = decode_hex(&self.signature);
        let signature = Signature::try_from(bytes.as_slice()).map_err(|_| invalid())?;
        let recovered = signature.recover(self.request().digest()).map_err(|_| invalid())?;

        if recovered == self.user_address {
            Ok(())
        } else {
            Err(invalid())
        }
    }
}

/// Sorted, deduplicated contract list.
pub fn normalize_contracts(contracts: &[Address]) -> Vec<Address> {
    let mut sorted = contracts.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

fn decode_hex(value: &str) -> Vec<u8> {
    hex::decode(value.strip_prefix("0x").unwrap_or(value)).unwrap_or_default()
}
