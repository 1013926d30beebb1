//! In-flight flags and operation outcomes.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Refresh,
    Decrypt,
    Mutate,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Refresh => write!(f, "refresh"),
            OperationKind::Decrypt => write!(f, "decrypt"),
            OperationKind::Mutate => write!(f, "mutate"),
        }
    }
}

/// Why an operation returned without doing anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotDeployed,
    NoCapability,
    NoSigner,
    /// Another call of the same kind is running.
    InFlight(OperationKind),
    /// A conflicting operation is running.
    Busy(OperationKind),
    NoHandle,
    AlreadyDecrypted,
    ZeroMagnitude,
    Invalid(String),
}

/// Result of one reconciling operation. Sessions never return errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    Skipped(SkipReason),
    /// The context changed while the operation was suspended; nothing applied.
    Stale,
    Failed(String),
}

impl Outcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Outcome::Committed)
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Outcome::Stale)
    }
}

/// One flag per operation kind; acquisition is compare-and-swap so
/// re-entrant calls are dropped, never queued.
#[derive(Debug, Default)]
pub struct OperationFlags {
    refreshing: AtomicBool,
    decrypting: AtomicBool,
    mutating: AtomicBool,
}

impl OperationFlags {
    pub fn new() -> Self {
        OperationFlags::default()
    }

    fn flag(&self, kind: OperationKind) -> &AtomicBool {
        match kind {
            OperationKind::Refresh => &self.refreshing,
            OperationKind::Decrypt => &self.decrypting,
            OperationKind::Mutate => &self.mutating,
        }
    }

    pub fn is_set(&self, kind: OperationKind) -> bool {
        self.flag(kind).load(Ordering::SeqCst)
    }

    pub fn try_acquire(&self, kind: OperationKind) -> Option<FlagGuard<'_>> {
        let flag = self.flag(kind);
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| FlagGuard { flag })
    }
}

/// Clears its flag on drop, on every exit path.
#[must_use]
pub struct FlagGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Counts a running write for a session's loading indicator.
pub(crate) struct LoadingGuard<'a>(&'a AtomicUsize);

impl<'a> LoadingGuard<'a> {
    pub(crate) fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        LoadingGuard(counter)
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
