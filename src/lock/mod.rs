//! Cluster-wide mutual exclusion
//!
//! A [`LockCoordinator`] hands out [`Lease`]s on named keys from a shared
//! [`LockStore`](crate::storage::LockStore). Leases carry a TTL so a crashed
//! holder never blocks the cluster for longer than one lifetime.

mod coordinator;
mod lease;

pub use coordinator::{LockCoordinator, LockOptions, DEFAULT_LOCK_TTL, DEFAULT_RETRY_DELAY};
pub use lease::{KeepAlive, Lease};
