//! Encryption capability for cipherdash: the relayer-facing trait, the
//! wallet-signed decryption authorization it consumes, and a local mock
//! coprocessor that stands in for the FHEVM on a development chain.

pub mod authorization;
pub mod capability;
pub mod errors;
pub mod mock_coprocessor;

pub use authorization::{normalize_contracts, DecryptionRequest, DecryptionSignature, FheKeypair};
pub use capability::{EncryptedInput, EncryptionCapability, HandleContractPair};
pub use errors::{CoprocessorError, DecryptionError, EncryptionError};
pub use mock_coprocessor::MockCoprocessor;
