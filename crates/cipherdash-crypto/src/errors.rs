use cipherdash_core::{Address, CiphertextHandle};
use thiserror::Error;

/// Failures of the user-decryption path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("Malformed handle: {0}")]
    MalformedHandle(String),

    #[error("Unknown handle {0}")]
    UnknownHandle(CiphertextHandle),

    #[error("Decryption signature does not recover to {expected:#x}")]
    InvalidSignature { expected: Address },

    #[error("Decryption signature expired at {expired_at}")]
    SignatureExpired { expired_at: u64 },

    #[error("Decryption signature issued for chain {signed} but coprocessor serves chain {served}")]
    WrongChain { signed: u64, served: u64 },

    #[error("Contract {0:#x} is not in the signature's authorized list")]
    ContractNotAuthorized(Address),

    #[error("User {user:#x} is not allowed to decrypt {handle}")]
    Unauthorized { user: Address, handle: CiphertextHandle },

    #[error("Reencryption keypair mismatch")]
    KeypairMismatch,

    #[error("Relayer error: {0}")]
    Relayer(String),
}

/// Failures while building an encrypted input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("Encryption capability unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid encryption input: {0}")]
    InvalidInput(String),
}

/// Contract-side coprocessor failures, surfaced as reverts by the devnet.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoprocessorError {
    #[error("Invalid input proof")]
    InvalidProof,

    #[error("Input was encrypted for another contract or user")]
    InputBindingMismatch,

    #[error("Unknown handle {0}")]
    UnknownHandle(CiphertextHandle),

    #[error("Sender {0:#x} is not allowed to use this handle")]
    AclDenied(Address),
}
