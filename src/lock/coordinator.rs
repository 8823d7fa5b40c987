//! LockCoordinator: named, TTL-bounded mutual exclusion across nodes

use super::lease::Lease;
use crate::error::{ManagerError, ManagerResult};
use crate::shutdown::ShutdownSignal;
use crate::storage::{LockRecord, LockStore};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default lease lifetime when not renewed
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// Default pause between acquisition attempts when retrying
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// How a lock should be acquired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Extra attempts after the first. Zero means a single non-blocking try.
    pub retry_count: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
    /// Lease lifetime if not renewed
    pub ttl: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            retry_count: 0,
            retry_delay: DEFAULT_RETRY_DELAY,
            ttl: DEFAULT_LOCK_TTL,
        }
    }
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_retries(mut self, retry_count: u32, retry_delay: Duration) -> Self {
        self.retry_count = retry_count;
        self.retry_delay = retry_delay;
        self
    }
}

/// Acquires leases from a shared [`LockStore`] on behalf of one node.
///
/// Every acquisition gets its own holder token (`<node>/<uuid>`), so two
/// acquisitions in the same process exclude each other just like two
/// acquisitions on different nodes.
#[derive(Clone)]
pub struct LockCoordinator {
    store: Arc<dyn LockStore>,
    node_id: String,
}

impl LockCoordinator {
    /// Create a coordinator with a random node id
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self::with_node_id(store, format!("node-{}", Uuid::new_v4()))
    }

    pub fn with_node_id(store: Arc<dyn LockStore>, node_id: impl Into<String>) -> Self {
        Self {
            store,
            node_id: node_id.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Acquire every key, in the given order.
    ///
    /// With `retry_count = 0` this is a single attempt that fails immediately
    /// with `LockUnavailable` when any key is held elsewhere. Keys won before
    /// a failure are released again.
    pub async fn acquire<I, K>(&self, keys: I, options: &LockOptions) -> ManagerResult<Lease>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        let mut attempt = 0;
        loop {
            if let Some(lease) = self.try_acquire_all(&keys, options.ttl)? {
                return Ok(lease);
            }
            if attempt >= options.retry_count {
                return Err(ManagerError::LockUnavailable(keys.join(",")));
            }
            attempt += 1;
            tokio::time::sleep(options.retry_delay).await;
        }
    }

    /// Run `body` while holding `keys`; the lease is released on every exit path.
    ///
    /// The lease is kept alive while `body` runs. `body` receives a child of
    /// `signal` that also fires if the lease is lost, and should wind down
    /// when it does.
    pub async fn run_exclusive<I, K, F, Fut, T>(
        &self,
        keys: I,
        options: &LockOptions,
        signal: &ShutdownSignal,
        body: F,
    ) -> ManagerResult<T>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ManagerResult<T>>,
    {
        let lease = self.acquire(keys, options).await?;
        let guarded = signal.child();
        let keep_alive = lease.keep_alive(guarded.clone());
        let result = body(guarded).await;
        let lost = keep_alive.is_lost();
        drop(keep_alive);
        if lost {
            warn!(keys = ?lease.keys(), holder = %lease.holder_id(), "exclusive work finished after its lease was lost");
        }
        let released = lease.release();
        // A body error takes precedence over a release error
        let value = result?;
        released?;
        Ok(value)
    }

    fn try_acquire_all(&self, keys: &[String], ttl: Duration) -> ManagerResult<Option<Lease>> {
        let now = Utc::now();
        let holder_id = format!("{}/{}", self.node_id, Uuid::new_v4());
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);

        let mut held: Vec<String> = Vec::with_capacity(keys.len());
        for key in keys {
            let record = LockRecord::new(key.clone(), holder_id.clone(), now, ttl_ms);
            let won = match self.store.try_acquire(&record) {
                Ok(won) => won,
                Err(e) => {
                    self.rollback(&held, &holder_id);
                    return Err(e.into());
                }
            };
            if !won {
                debug!(key = %key, node = %self.node_id, "lock held by another holder");
                self.rollback(&held, &holder_id);
                return Ok(None);
            }
            held.push(key.clone());
        }

        debug!(keys = ?held, holder = %holder_id, "lock acquired");
        Ok(Some(Lease::new(
            self.store.clone(),
            held,
            holder_id,
            ttl,
            now,
        )))
    }

    fn rollback(&self, held: &[String], holder_id: &str) {
        for key in held.iter().rev() {
            if let Err(e) = self.store.release(key, holder_id) {
                warn!(key = %key, error = %e, "failed to roll back partial acquisition");
            }
        }
    }
}

impl std::fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("node_id", &self.node_id)
            .finish()
    }
}
