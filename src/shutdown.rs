//! Cooperative shutdown signalling
//!
//! A signal is set once and observed at the next suspension point. Work in
//! flight is never interrupted; it simply is not rescheduled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct SignalState {
    requested: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<SignalState>>>,
}

impl SignalState {
    fn request(&self) {
        // Set the flag before touching `children`; `child()` relies on this order.
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        let children = std::mem::take(
            &mut *self.children.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for child in children.iter().filter_map(Weak::upgrade) {
            child.request();
        }
    }
}

/// A cooperative stop signal.
///
/// Clones share state. A child signal fires when either it or its parent is
/// requested, which lets a single cycle be stopped without stopping the
/// whole schedule.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    state: Arc<SignalState>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that also fires when `self` fires
    pub fn child(&self) -> Self {
        let state = Arc::new(SignalState::default());
        let mut children = self
            .state
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Children of finished cycles are gone; forget them
        children.retain(|weak| weak.strong_count() > 0);
        children.push(Arc::downgrade(&state));
        drop(children);
        if self.is_requested() {
            state.requested.store(true, Ordering::SeqCst);
        }
        Self { state }
    }

    /// Registered children, live or not yet pruned
    #[cfg(test)]
    pub(crate) fn child_count(&self) -> usize {
        self.state
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if a stop has been requested.
    pub fn is_requested(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    /// Request a stop and wake every waiter, including children.
    pub fn request(&self) {
        self.state.request();
    }

    /// Resolve once a stop has been requested.
    pub async fn requested(&self) {
        loop {
            // Register before checking the flag so a concurrent request is not missed.
            let notified = self.state.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration` unless a stop arrives first.
    ///
    /// Returns true if the sleep was cut short by a stop request.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_requested(),
            _ = self.requested() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_starts_unrequested() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_requested());
    }

    #[test]
    fn cloned_signal_shares_state() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        signal.request();
        assert!(clone.is_requested());
    }

    #[test]
    fn child_follows_parent_but_not_the_reverse() {
        let parent = ShutdownSignal::new();
        let child = parent.child();
        child.request();
        assert!(child.is_requested());
        assert!(!parent.is_requested());

        let other = parent.child();
        parent.request();
        assert!(other.is_requested());
    }

    #[test]
    fn dropped_children_do_not_accumulate() {
        let parent = ShutdownSignal::new();
        for _ in 0..10_000 {
            let _cycle = parent.child();
        }
        assert!(parent.child_count() <= 1);

        let kept = parent.child();
        let _transient = parent.child();
        assert!(parent.child_count() <= 2);
        parent.request();
        assert!(kept.is_requested());
    }

    #[tokio::test]
    async fn sleep_is_cut_short_by_request() {
        let signal = ShutdownSignal::new();
        let waker = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waker.request();
        });

        let started = std::time::Instant::now();
        let interrupted = signal.sleep(Duration::from_secs(10)).await;
        assert!(interrupted);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn child_wakes_on_parent_request() {
        let parent = ShutdownSignal::new();
        let child = parent.child();
        let waker = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waker.request();
        });

        tokio::time::timeout(Duration::from_secs(5), child.requested())
            .await
            .expect("child should observe the parent's request");
    }

    #[tokio::test]
    async fn sleep_runs_to_completion_without_request() {
        let signal = ShutdownSignal::new();
        assert!(!signal.sleep(Duration::from_millis(5)).await);
    }
}
