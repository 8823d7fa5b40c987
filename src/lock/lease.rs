//! Held leases: renewal, keep-alive and scoped release

use crate::error::{ManagerError, ManagerResult};
use crate::shutdown::ShutdownSignal;
use crate::storage::LockStore;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Shortest pause between keep-alive renewals
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

struct LeaseState {
    store: Arc<dyn LockStore>,
    keys: Vec<String>,
    holder_id: String,
    ttl: Duration,
    acquired_at: DateTime<Utc>,
    renewed_at: Mutex<DateTime<Utc>>,
    released: AtomicBool,
}

impl LeaseState {
    fn ttl_ms(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX)
    }

    fn renewed_at(&self) -> DateTime<Utc> {
        *self.renewed_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expires_at(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        self.renewed_at()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn renew(&self) -> ManagerResult<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(ManagerError::LockLost(self.keys.join(",")));
        }
        let now = Utc::now();
        for key in &self.keys {
            if !self.store.renew(key, &self.holder_id, now, self.ttl_ms())? {
                return Err(ManagerError::LockLost(key.clone()));
            }
        }
        *self.renewed_at.lock().unwrap_or_else(PoisonError::into_inner) = now;
        Ok(())
    }

    fn release(&self) -> ManagerResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut first_error = None;
        // Reverse acquisition order
        for key in self.keys.iter().rev() {
            match self.store.release(key, &self.holder_id) {
                Ok(true) => debug!(key = %key, "lock released"),
                Ok(false) => debug!(key = %key, "lock already expired or taken over"),
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to release lock");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// A held lock on one or more keys.
///
/// Released explicitly with [`Lease::release`] or automatically on drop, so
/// every exit path (including early returns and panics) gives the keys back.
/// If neither happens (the process crashed) the store reclaims the keys once
/// the TTL elapses.
pub struct Lease {
    state: Arc<LeaseState>,
}

impl Lease {
    pub(crate) fn new(
        store: Arc<dyn LockStore>,
        keys: Vec<String>,
        holder_id: String,
        ttl: Duration,
        acquired_at: DateTime<Utc>,
    ) -> Self {
        Self {
            state: Arc::new(LeaseState {
                store,
                keys,
                holder_id,
                ttl,
                acquired_at,
                renewed_at: Mutex::new(acquired_at),
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Keys held, in acquisition order
    pub fn keys(&self) -> &[String] {
        &self.state.keys
    }

    /// Token identifying this acquisition in the store
    pub fn holder_id(&self) -> &str {
        &self.state.holder_id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.state.acquired_at
    }

    pub fn ttl(&self) -> Duration {
        self.state.ttl
    }

    /// When the lease lapses unless renewed
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.state.expires_at()
    }

    /// Extend the lease by another TTL.
    ///
    /// Fails with `LockLost` if another holder took over after expiry.
    pub fn renew(&self) -> ManagerResult<()> {
        self.state.renew()
    }

    /// Release every key
    pub fn release(self) -> ManagerResult<()> {
        self.state.release()
    }

    /// Renew in the background every `ttl / 3` until the returned guard drops.
    ///
    /// When a renewal is refused, `on_lost` is requested so the guarded work
    /// can wind down.
    pub fn keep_alive(&self, on_lost: ShutdownSignal) -> KeepAlive {
        let state = self.state.clone();
        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = lost.clone();
        let interval = (self.state.ttl / 3).max(MIN_RENEW_INTERVAL);

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if state.released.load(Ordering::SeqCst) {
                    break;
                }
                match state.renew() {
                    Ok(()) => {}
                    Err(ManagerError::LockLost(key)) => {
                        warn!(key = %key, "lease lost, stopping guarded work");
                        lost_flag.store(true, Ordering::SeqCst);
                        on_lost.request();
                        break;
                    }
                    Err(e) if Utc::now() >= state.expires_at() => {
                        warn!(error = %e, "lease expired while the store was unreachable");
                        lost_flag.store(true, Ordering::SeqCst);
                        on_lost.request();
                        break;
                    }
                    Err(e) => warn!(error = %e, "lease renewal failed, retrying"),
                }
            }
        });

        KeepAlive { handle, lost }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("keys", &self.state.keys)
            .field("holder_id", &self.state.holder_id)
            .field("ttl", &self.state.ttl)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Err(e) = self.state.release() {
            warn!(error = %e, "failed to release lease on drop");
        }
    }
}

/// Background renewer for a [`Lease`]. Stops when dropped.
#[derive(Debug)]
pub struct KeepAlive {
    handle: JoinHandle<()>,
    lost: Arc<AtomicBool>,
}

impl KeepAlive {
    /// True once a renewal was refused
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
