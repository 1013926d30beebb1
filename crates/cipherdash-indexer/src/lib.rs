//! Dashboard data for cipherdash: recent counter transactions, balances,
//! block timing and hourly activity, fetched once or polled periodically.

pub mod dashboard;
pub mod poller;

pub use dashboard::{
    activity_buckets, fetch_dashboard, ActivityBucket, DashboardSnapshot, DashboardTransaction, TransactionKind,
    TransactionStatus, ACTIVITY_BUCKETS,
};
pub use poller::{DashboardPoller, PollerHandle};
