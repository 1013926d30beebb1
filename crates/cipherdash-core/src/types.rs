// Shared client-side data model
//
// INVARIANTS:
// 1. A ciphertext handle is immutable; every mutation of the encrypted state yields a new one
// 2. A ClearValue is only trusted while its handle equals the handle currently held
// 3. The all-zero handle is the "never written" sentinel and always decrypts to zero

use ethers_core::types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// EVM chain identifier (31337 = hardhat, 11155111 = sepolia).
pub type ChainId = u64;

pub const LOCAL_CHAIN_ID: ChainId = 31337;
pub const SEPOLIA_CHAIN_ID: ChainId = 11155111;
pub const MAINNET_CHAIN_ID: ChainId = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandleParseError {
    #[error("Handle is not valid hex: {0}")]
    InvalidHex(String),
    #[error("Handle must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// Opaque reference to an encrypted value stored on-chain.
///
/// Not secret by itself; only the referenced plaintext is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct CiphertextHandle(H256);

impl CiphertextHandle {
    /// The "zero" sentinel returned for an uninitialized encrypted value.
    pub const ZERO: CiphertextHandle = CiphertextHandle(H256([0u8; 32]));

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        CiphertextHandle(H256(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_fixed_bytes()
    }

    pub fn to_fixed_bytes(self) -> [u8; 32] {
        self.0.to_fixed_bytes()
    }

    pub fn as_h256(&self) -> H256 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Full `0x`-prefixed lowercase hex.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0.as_bytes()))
    }

    /// First 10 characters of the hex form, for status lines.
    pub fn short(&self) -> String {
        let full = self.to_hex();
        full[..10].to_string()
    }
}

impl From<H256> for CiphertextHandle {
    fn from(value: H256) -> Self {
        CiphertextHandle(value)
    }
}

impl From<[u8; 32]> for CiphertextHandle {
    fn from(value: [u8; 32]) -> Self {
        CiphertextHandle::from_bytes(value)
    }
}

impl fmt::Display for CiphertextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for CiphertextHandle {
    type Err = HandleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped).map_err(|e| HandleParseError::InvalidHex(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(HandleParseError::InvalidLength(bytes.len()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(CiphertextHandle::from_bytes(out))
    }
}

/// A decrypted plaintext together with the handle it was decrypted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearValue {
    pub handle: CiphertextHandle,
    pub value: u64,
}

impl ClearValue {
    pub fn new(handle: CiphertextHandle, value: u64) -> Self {
        ClearValue { handle, value }
    }

    /// Sentinel decryption result for the zero handle.
    pub fn zero() -> Self {
        ClearValue::new(CiphertextHandle::ZERO, 0)
    }

    /// True while this plaintext still describes `current`.
    pub fn matches(&self, current: Option<&CiphertextHandle>) -> bool {
        current.map(|h| *h == self.handle).unwrap_or(false)
    }
}

/// Context snapshot captured when an asynchronous operation starts.
///
/// The operation's result is only applied if the live context still equals
/// the snapshot when the operation resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StalenessToken {
    pub chain_id: Option<ChainId>,
    pub contract: Option<Address>,
    pub signer: Option<Address>,
}

impl StalenessToken {
    pub fn new(chain_id: Option<ChainId>, contract: Option<Address>, signer: Option<Address>) -> Self {
        StalenessToken { chain_id, contract, signer }
    }

    /// Staleness check used by handle refreshes, which never involve the signer.
    pub fn same_target(&self, other: &StalenessToken) -> bool {
        self.chain_id == other.chain_id && self.contract == other.contract
    }
}

/// Lowercase `0x` hex of an address, the canonical form used for cache keys.
pub fn address_key(address: &Address) -> String {
    format!("{:#x}", address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_handle_sentinel() {
        assert!(CiphertextHandle::ZERO.is_zero());
        assert!(CiphertextHandle::default().is_zero());
        assert!(!CiphertextHandle::from_bytes([1u8; 32]).is_zero());
    }

    #[test]
    fn test_handle_hex_parse() {
        let handle = CiphertextHandle::from_bytes([0xab; 32]);
        let parsed: CiphertextHandle = handle.to_hex().parse().unwrap();
        assert_eq!(parsed, handle);
        assert_eq!(handle.short(), "0xabababab");

        assert_eq!(
            "0x1234".parse::<CiphertextHandle>(),
            Err(HandleParseError::InvalidLength(2))
        );
        assert!(matches!(
            "0xzz".parse::<CiphertextHandle>(),
            Err(HandleParseError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_clear_value_matches_current_handle() {
        let h0 = CiphertextHandle::from_bytes([1u8; 32]);
        let h1 = CiphertextHandle::from_bytes([2u8; 32]);
        let clear = ClearValue::new(h0, 5);

        assert!(clear.matches(Some(&h0)));
        assert!(!clear.matches(Some(&h1)));
        assert!(!clear.matches(None));
    }

    #[test]
    fn test_staleness_token_target() {
        let contract = Address::repeat_byte(0x11);
        let a = StalenessToken::new(Some(31337), Some(contract), Some(Address::repeat_byte(1)));
        let b = StalenessToken::new(Some(31337), Some(contract), Some(Address::repeat_byte(2)));
        let c = StalenessToken::new(Some(1), Some(contract), Some(Address::repeat_byte(1)));

        assert!(a.same_target(&b));
        assert_ne!(a, b);
        assert!(!a.same_target(&c));
    }

    #[test]
    fn test_address_key_lowercase() {
        let address = Address::repeat_byte(0xAB);
        assert_eq!(address_key(&address), format!("0x{}", "ab".repeat(20)));
    }
}
