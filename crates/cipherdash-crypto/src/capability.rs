//! Interface to the external FHE capability: input encryption, keypair
//! generation and user decryption through a relayer.

use crate::authorization::{DecryptionSignature, FheKeypair};
use crate::errors::{DecryptionError, EncryptionError};
use async_trait::async_trait;
use cipherdash_core::{Address, CiphertextHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ciphertext handles plus the proof binding them to one (contract, user) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedInput {
    pub handles: Vec<CiphertextHandle>,
    pub proof: Vec<u8>,
}

impl EncryptedInput {
    /// Handle of the first encrypted value; inputs here always carry one.
    pub fn handle(&self) -> Result<CiphertextHandle, EncryptionError> {
        self.handles
            .first()
            .copied()
            .ok_or_else(|| EncryptionError::InvalidInput("encrypted input carries no handle".to_string()))
    }
}

/// One handle to decrypt together with the contract that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleContractPair {
    pub handle: CiphertextHandle,
    pub contract: Address,
}

impl HandleContractPair {
    pub fn new(handle: CiphertextHandle, contract: Address) -> Self {
        HandleContractPair { handle, contract }
    }
}

#[async_trait]
pub trait EncryptionCapability: Send + Sync {
    /// Fresh reencryption keypair for a new decryption signature.
    fn generate_keypair(&self) -> FheKeypair;

    /// Encrypt `value` as a 32-bit input for `contract`, usable only by `user`.
    async fn encrypt(&self, contract: Address, user: Address, value: u32) -> Result<EncryptedInput, EncryptionError>;

    /// Decrypt every requested handle on behalf of `signature.user_address`.
    ///
    /// Either every handle is decrypted or the call fails as a whole.
    async fn user_decrypt(
        &self,
        requests: &[HandleContractPair],
        signature: &DecryptionSignature,
    ) -> Result<HashMap<CiphertextHandle, u64>, DecryptionError>;
}
