use super::Devnet;
use crate::chain::{ChainError, PendingTx};
use crate::contracts::{encode_call, encrypted_input_args, FheCounterContract, DECREMENT_SIGNATURE, INCREMENT_SIGNATURE};
use async_trait::async_trait;
use cipherdash_core::{Address, CiphertextHandle};
use parking_lot::Mutex;
use std::sync::Arc;

const MUTATE_GAS: u64 = 180_000;

/// Encrypted u32 counter. The latest handle is readable by the contract and
/// by whoever last changed it.
pub struct DevFheCounter {
    address: Address,
    chain: Arc<Devnet>,
    count: Mutex<CiphertextHandle>,
}

impl DevFheCounter {
    pub(crate) fn deploy(chain: Arc<Devnet>, deployer: Address) -> Self {
        let address = chain.deploy(deployer, "FHECounter");
        DevFheCounter { address, chain, count: Mutex::new(CiphertextHandle::ZERO) }
    }

    fn apply(&self, from: Address, input: CiphertextHandle, proof: Vec<u8>, increment: bool) -> PendingTx {
        let signature = if increment { INCREMENT_SIGNATURE } else { DECREMENT_SIGNATURE };
        let calldata = encode_call(signature, &encrypted_input_args(&input, &proof));
        let coprocessor = self.chain.coprocessor().clone();
        let contract = self.address;

        let mut count = self.count.lock();
        let hash = self.chain.execute(from, Some(contract), calldata, MUTATE_GAS, |_| {
            let value = coprocessor
                .verify_input(contract, from, input, &proof)
                .map_err(|e| e.to_string())?;
            let next = if increment {
                coprocessor.add(contract, &count, &value)
            } else {
                coprocessor.sub(contract, &count, &value)
            }
            .map_err(|e| e.to_string())?;
            coprocessor.allow(contract, &next, from).map_err(|e| e.to_string())?;
            *count = next;
            Ok(())
        });

        PendingTx::new(hash, self.chain.clone())
    }
}

#[async_trait]
impl FheCounterContract for DevFheCounter {
    fn address(&self) -> Address {
        self.address
    }

    async fn get_count(&self) -> Result<CiphertextHandle, ChainError> {
        Ok(*self.count.lock())
    }

    async fn increment(&self, from: Address, input: CiphertextHandle, proof: Vec<u8>) -> Result<PendingTx, ChainError> {
        Ok(self.apply(from, input, proof, true))
    }

    async fn decrement(&self, from: Address, input: CiphertextHandle, proof: Vec<u8>) -> Result<PendingTx, ChainError> {
        Ok(self.apply(from, input, proof, false))
    }
}
