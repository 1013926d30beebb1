use async_trait::async_trait;
use cipherdash_core::{Address, H256};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Signature;
use thiserror::Error;

// 🚀 Signer Error Handling
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignerError {
    #[error("User rejected the signature request")]
    UserRejected,
    #[error("Invalid private key: {0}")]
    InvalidKey(String),
    #[error("Signing failed: {0}")]
    Signing(String),
}

/// The account that authorizes decryptions and sends transactions.
#[async_trait]
pub trait WalletSigner: Send + Sync {
    fn address(&self) -> Address;

    /// Sign a prehashed 32-byte digest; a wallet UI would prompt here.
    async fn sign_digest(&self, digest: H256) -> Result<Signature, SignerError>;
}

/// Signer backed by a private key held in memory.
#[derive(Debug, Clone)]
pub struct LocalKeySigner {
    wallet: LocalWallet,
}

impl LocalKeySigner {
    pub fn new(wallet: LocalWallet) -> Self {
        LocalKeySigner { wallet }
    }

    /// Parse a hex private key, with or without `0x`.
    pub fn from_hex(private_key: &str) -> Result<Self, SignerError> {
        let stripped = private_key.strip_prefix("0x").unwrap_or(private_key);
        let wallet = stripped
            .parse::<LocalWallet>()
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(LocalKeySigner::new(wallet))
    }

    pub fn wallet(&self) -> &LocalWallet {
        &self.wallet
    }
}

#[async_trait]
impl WalletSigner for LocalKeySigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign_digest(&self, digest: H256) -> Result<Signature, SignerError> {
        self.wallet.sign_hash(digest).map_err(|e| SignerError::Signing(e.to_string()))
    }
}

/// Well-known hardhat development accounts (mnemonic "test test ... junk").
pub mod dev_accounts {
    pub const DEPLOYER: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    pub const ALICE: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
    pub const BOB: &str = "0x5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn test_local_key_signer_recovers() {
        let signer = LocalKeySigner::from_hex(dev_accounts::DEPLOYER).unwrap();
        assert_eq!(
            signer.address(),
            Address::from_str("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266").unwrap()
        );

        let digest = H256::repeat_byte(0x42);
        let signature = signer.sign_digest(digest).await.unwrap();
        assert_eq!(signature.recover(digest).unwrap(), signer.address());
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(matches!(
            LocalKeySigner::from_hex("0xnothex"),
            Err(SignerError::InvalidKey(_))
        ));
    }
}
