// Per-chain contract address table
//
// A contract counts as deployed on a chain only when the table has an entry
// for that chain and the entry's address is not the zero address.

use crate::types::{ChainId, LOCAL_CHAIN_ID, SEPOLIA_CHAIN_ID};
use ethers_core::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// First contract deployed by the default hardhat account (nonce 0).
pub const LOCAL_FHE_COUNTER: Address = ethers_core::types::H160([
    0x5f, 0xbd, 0xb2, 0x31, 0x56, 0x78, 0xaf, 0xec, 0xb3, 0x67, 0xf0, 0x32, 0xd9, 0x3f, 0x64, 0x2f, 0x64, 0x18,
    0x0a, 0xa3,
]);

/// Second contract deployed by the default hardhat account (nonce 1).
pub const LOCAL_ANONYMOUS_ELECTION: Address = ethers_core::types::H160([
    0xe7, 0xf1, 0x72, 0x5e, 0x77, 0x34, 0xce, 0x28, 0x8f, 0x83, 0x67, 0xe1, 0xbb, 0x14, 0x3e, 0x90, 0xbb, 0x3f,
    0x05, 0x12,
]);

/// Third contract deployed by the default hardhat account (nonce 2).
pub const LOCAL_RATING_SYSTEM: Address = ethers_core::types::H160([
    0x9f, 0xe4, 0x67, 0x36, 0x67, 0x9d, 0x2d, 0x9a, 0x65, 0xf0, 0x99, 0x2f, 0x22, 0x72, 0xde, 0x9f, 0x3c, 0x7f,
    0xa6, 0xe0,
]);

/// Contracts the client knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractKind {
    FheCounter,
    AnonymousElection,
    RatingSystem,
}

impl ContractKind {
    pub const ALL: [ContractKind; 3] =
        [ContractKind::FheCounter, ContractKind::AnonymousElection, ContractKind::RatingSystem];

    pub fn name(&self) -> &'static str {
        match self {
            ContractKind::FheCounter => "FHECounter",
            ContractKind::AnonymousElection => "AnonymousElection",
            ContractKind::RatingSystem => "EncryptedRatingSystem",
        }
    }
}

/// Addresses of every known contract on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainDeployment {
    pub chain_name: String,
    pub fhe_counter: Address,
    pub anonymous_election: Address,
    pub rating_system: Address,
}

impl ChainDeployment {
    /// A chain with nothing deployed yet.
    pub fn undeployed(chain_name: impl Into<String>) -> Self {
        ChainDeployment {
            chain_name: chain_name.into(),
            fhe_counter: Address::zero(),
            anonymous_election: Address::zero(),
            rating_system: Address::zero(),
        }
    }

    pub fn address_of(&self, kind: ContractKind) -> Address {
        match kind {
            ContractKind::FheCounter => self.fhe_counter,
            ContractKind::AnonymousElection => self.anonymous_election,
            ContractKind::RatingSystem => self.rating_system,
        }
    }
}

/// Resolution result for one contract on one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractInfo {
    pub kind: ContractKind,
    pub address: Option<Address>,
    pub chain_id: Option<ChainId>,
    pub chain_name: Option<String>,
}

impl ContractInfo {
    pub fn is_deployed(&self) -> bool {
        matches!(self.address, Some(a) if !a.is_zero())
    }

    /// Status line surfaced when the contract is missing on the current chain.
    pub fn not_deployed_message(&self) -> String {
        match self.chain_id {
            Some(id) => format!("{} deployment not found for chainId={}.", self.kind.name(), id),
            None => format!("{} deployment not found for chainId=undefined.", self.kind.name()),
        }
    }
}

/// Static chain-id → deployment table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Deployments {
    entries: BTreeMap<ChainId, ChainDeployment>,
}

impl Deployments {
    pub fn empty() -> Self {
        Deployments { entries: BTreeMap::new() }
    }

    /// Hardhat addresses for the local chain; sepolia listed but not deployed.
    pub fn builtin() -> Self {
        let mut table = Deployments::empty();
        table.insert(
            LOCAL_CHAIN_ID,
            ChainDeployment {
                chain_name: "Hardhat Local".to_string(),
                fhe_counter: LOCAL_FHE_COUNTER,
                anonymous_election: LOCAL_ANONYMOUS_ELECTION,
                rating_system: LOCAL_RATING_SYSTEM,
            },
        );
        table.insert(SEPOLIA_CHAIN_ID, ChainDeployment::undeployed("Sepolia"));
        table
    }

    pub fn insert(&mut self, chain_id: ChainId, deployment: ChainDeployment) {
        self.entries.insert(chain_id, deployment);
    }

    pub fn get(&self, chain_id: ChainId) -> Option<&ChainDeployment> {
        self.entries.get(&chain_id)
    }

    pub fn chains(&self) -> impl Iterator<Item = (&ChainId, &ChainDeployment)> {
        self.entries.iter()
    }

    /// Resolve `kind` on `chain_id`.
    ///
    /// Unknown chain or zero address resolves to `address: None` so callers
    /// surface a "not deployed" state instead of failing.
    pub fn resolve(&self, kind: ContractKind, chain_id: Option<ChainId>) -> ContractInfo {
        let Some(id) = chain_id else {
            return ContractInfo { kind, address: None, chain_id: None, chain_name: None };
        };

        match self.entries.get(&id) {
            Some(entry) if !entry.address_of(kind).is_zero() => ContractInfo {
                kind,
                address: Some(entry.address_of(kind)),
                chain_id: Some(id),
                chain_name: Some(entry.chain_name.clone()),
            },
            _ => ContractInfo { kind, address: None, chain_id: Some(id), chain_name: None },
        }
    }

    pub fn is_deployed(&self, kind: ContractKind, chain_id: Option<ChainId>) -> bool {
        self.resolve(kind, chain_id).is_deployed()
    }
}
