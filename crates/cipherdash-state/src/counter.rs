//! Session over the `FHECounter` contract.

use crate::operation::{Outcome, SkipReason};
use crate::reconciler::{HandleSource, Reconciler, SessionDeps, SessionView, Submission};
use async_trait::async_trait;
use cipherdash_core::{Address, ChainId, CiphertextHandle, ClearValue, ContractKind};
use cipherdash_interop::{ChainError, ContractProvider, PendingTx};

/// Reads `getCount()`; a mutation is a signed delta, sent as `increment` when
/// positive and `decrement` when negative.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSource;

#[async_trait]
impl HandleSource for CounterSource {
    type Mutation = i32;

    fn kind(&self) -> ContractKind {
        ContractKind::FheCounter
    }

    fn read_label(&self) -> String {
        "FHECounter.getCount()".to_string()
    }

    async fn read_handle(
        &self,
        contracts: &dyn ContractProvider,
        chain_id: ChainId,
        address: Address,
    ) -> Result<CiphertextHandle, ChainError> {
        contracts.fhe_counter(chain_id, address).await?.get_count().await
    }

    fn plaintext(&self, delta: &i32) -> Result<u32, SkipReason> {
        match delta.unsigned_abs() {
            0 => Err(SkipReason::ZeroMagnitude),
            magnitude => Ok(magnitude),
        }
    }

    fn describe(&self, delta: &i32) -> String {
        let op = if *delta > 0 { "increment" } else { "decrement" };
        format!("{}({})", op, delta.unsigned_abs())
    }

    async fn submit(
        &self,
        contracts: &dyn ContractProvider,
        submission: Submission,
        delta: &i32,
    ) -> Result<PendingTx, ChainError> {
        let counter = contracts.fhe_counter(submission.chain_id, submission.contract).await?;
        if *delta > 0 {
            counter.increment(submission.from, submission.input, submission.proof).await
        } else {
            counter.decrement(submission.from, submission.input, submission.proof).await
        }
    }
}

pub struct CounterSession {
    reconciler: Reconciler<CounterSource>,
}

impl CounterSession {
    pub fn new(deps: SessionDeps) -> Self {
        CounterSession { reconciler: Reconciler::new(CounterSource, deps) }
    }

    pub fn reconciler(&self) -> &Reconciler<CounterSource> {
        &self.reconciler
    }

    /// Read the initial handle.
    pub async fn connect(&self) -> Outcome {
        self.reconciler.refresh_handle().await
    }

    pub async fn refresh_count_handle(&self) -> Outcome {
        self.reconciler.refresh_handle().await
    }

    pub async fn decrypt_count_handle(&self) -> Outcome {
        self.reconciler.decrypt().await
    }

    pub async fn increment(&self, value: u32) -> Outcome {
        match i32::try_from(value) {
            Ok(delta) => self.inc_or_dec(delta).await,
            Err(_) => Outcome::Skipped(SkipReason::Invalid(format!("{} exceeds the supported step", value))),
        }
    }

    pub async fn decrement(&self, value: u32) -> Outcome {
        match i32::try_from(value) {
            Ok(delta) => self.inc_or_dec(-delta).await,
            Err(_) => Outcome::Skipped(SkipReason::Invalid(format!("{} exceeds the supported step", value))),
        }
    }

    pub async fn inc_or_dec(&self, delta: i32) -> Outcome {
        self.reconciler.mutate(delta).await
    }

    pub fn handle(&self) -> Option<CiphertextHandle> {
        self.reconciler.handle()
    }

    pub fn clear(&self) -> Option<ClearValue> {
        self.reconciler.clear()
    }

    pub fn message(&self) -> String {
        self.reconciler.message()
    }

    pub fn view(&self) -> SessionView {
        self.reconciler.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_encoding() {
        let source = CounterSource;
        assert_eq!(source.plaintext(&5), Ok(5));
        assert_eq!(source.plaintext(&-3), Ok(3));
        assert_eq!(source.plaintext(&0), Err(SkipReason::ZeroMagnitude));
        assert_eq!(source.plaintext(&i32::MIN), Ok(2_147_483_648));

        assert_eq!(source.describe(&5), "increment(5)");
        assert_eq!(source.describe(&-3), "decrement(3)");
    }
}
