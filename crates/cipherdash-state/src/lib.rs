//! Reconciliation core of the cipherdash client.
//!
//! Sessions read ciphertext handles, decrypt them through the encryption
//! capability and send encrypted writes, committing results only while the
//! live context (chain, contract, signer) is the one the operation started
//! under.

pub mod context;
pub mod counter;
pub mod election;
pub mod operation;
pub mod rating;
pub mod reconciler;

pub use context::{ContextSnapshot, LiveContext};
pub use counter::{CounterSession, CounterSource};
pub use election::{ElectionSession, TallySource};
pub use operation::{FlagGuard, OperationFlags, OperationKind, Outcome, SkipReason};
pub use rating::{RatingMutation, RatingScope, RatingSession, RatingSumSource, RatingWrite};
pub use reconciler::{HandleSource, Reconciler, SessionDeps, SessionView, Submission, ViewInput};
