//! Wallet-side services for the cipherdash client: the signer that
//! authorizes decryptions, persisted string storage, and the decryption
//! signature cache that keeps wallet prompts to one per validity window.

pub mod signature_cache;
pub mod signer;
pub mod storage;

pub use signature_cache::{cache_key, DecryptionSignatureCache, SignatureError};
pub use signer::{dev_accounts, LocalKeySigner, SignerError, WalletSigner};
pub use storage::{JsonFileStorage, MemoryStorage, StorageError, StringStorage};

/// Signature type produced by `WalletSigner`, re-exported for implementors.
pub use ethers::types::Signature;
