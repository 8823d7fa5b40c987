//! Scheduler: a fixed-interval task guarded by a cluster lease

use super::task::{CycleOutcome, ScheduledTask, TaskState};
use crate::error::ManagerError;
use crate::lock::{LockCoordinator, LockOptions};
use crate::shutdown::ShutdownSignal;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Shortest interval accepted; a zero period would spin
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// How a task is scheduled
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Lock key guarding the task cluster-wide
    pub lock_key: String,
    /// Pause between cycle starts
    pub interval: Duration,
    pub lock_options: LockOptions,
    /// Fire the first cycle immediately instead of after one interval
    pub run_on_start: bool,
}

impl SchedulerConfig {
    pub fn new(lock_key: impl Into<String>, interval: Duration) -> Self {
        Self {
            lock_key: lock_key.into(),
            interval,
            lock_options: LockOptions::default(),
            run_on_start: false,
        }
    }

    pub fn with_lock_options(mut self, lock_options: LockOptions) -> Self {
        self.lock_options = lock_options;
        self
    }

    pub fn with_run_on_start(mut self, run_on_start: bool) -> Self {
        self.run_on_start = run_on_start;
        self
    }
}

/// Point-in-time view of a scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub task_id: String,
    pub state: TaskState,
    /// True only while this process holds the lease and runs the task
    pub running: bool,
    pub completed_cycles: u64,
    pub failed_cycles: u64,
}

struct SchedulerInner {
    task: Arc<dyn ScheduledTask>,
    coordinator: LockCoordinator,
    config: SchedulerConfig,
    state: Mutex<TaskState>,
    running: AtomicBool,
    started: AtomicBool,
    signal: ShutdownSignal,
    /// Single in-flight run guard
    cycle_guard: tokio::sync::Mutex<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl SchedulerInner {
    fn state(&self) -> TaskState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TaskState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        // Stopped is terminal
        if *current != TaskState::Stopped {
            *current = state;
        }
    }

    async fn run_cycle(&self) -> CycleOutcome {
        let task_id = self.task.id();
        let Ok(_guard) = self.cycle_guard.try_lock() else {
            debug!(task = %task_id, "cycle already in flight, skipping");
            return CycleOutcome::Skipped;
        };
        if self.signal.is_requested() {
            debug!(task = %task_id, "scheduler stopping, skipping cycle");
            return CycleOutcome::Skipped;
        }
        if !self.task.is_enabled().await {
            debug!(task = %task_id, "task disabled, skipping cycle");
            return CycleOutcome::Disabled;
        }

        self.set_state(TaskState::AcquiringLock);
        let entered = AtomicBool::new(false);
        let body_entered = &entered;
        let result = self
            .coordinator
            .run_exclusive(
                [self.config.lock_key.as_str()],
                &self.config.lock_options,
                &self.signal,
                |cycle_signal| async move {
                    body_entered.store(true, Ordering::SeqCst);
                    self.set_state(TaskState::Running);
                    self.running.store(true, Ordering::SeqCst);
                    info!(task = %task_id, "cycle started");

                    // A separate task so a panicking body cannot take the schedule down
                    let task = self.task.clone();
                    let result =
                        match tokio::spawn(async move { task.run(&cycle_signal).await }).await {
                            Ok(result) => result,
                            Err(join_error) => Err(ManagerError::HandlerFailure(format!(
                                "task panicked: {}",
                                join_error
                            ))),
                        };

                    self.running.store(false, Ordering::SeqCst);
                    self.set_state(TaskState::ReleasingLock);
                    result
                },
            )
            .await;
        self.set_state(TaskState::Idle);

        match result {
            Ok(()) => {
                info!(task = %task_id, "cycle completed");
                self.completed.fetch_add(1, Ordering::SeqCst);
                CycleOutcome::Completed
            }
            Err(e) if e.is_lock_unavailable() && !entered.load(Ordering::SeqCst) => {
                debug!(task = %task_id, key = %self.config.lock_key, "lock held elsewhere, skipping cycle");
                CycleOutcome::Skipped
            }
            Err(e) => {
                error!(task = %task_id, key = %self.config.lock_key, error = %e, "cycle failed");
                self.failed.fetch_add(1, Ordering::SeqCst);
                CycleOutcome::Failed(e.to_string())
            }
        }
    }

    async fn run_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if !self.config.run_on_start {
            // The first tick completes immediately
            ticker.tick().await;
        }
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.signal.requested() => break,
            }
            if self.signal.is_requested() {
                break;
            }
            self.run_cycle().await;
        }
        debug!(task = %self.task.id(), "schedule loop exited");
    }
}

/// Runs a [`ScheduledTask`] on a fixed interval, at most once cluster-wide per
/// cycle.
///
/// Each tick acquires `lock_key` without waiting. When another node holds it
/// the cycle is skipped; otherwise the task runs under a kept-alive lease that
/// is released afterwards whatever the outcome. Failures are logged and the
/// schedule continues at the next tick.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        task: Arc<dyn ScheduledTask>,
        coordinator: LockCoordinator,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                task,
                coordinator,
                config,
                state: Mutex::new(TaskState::Idle),
                running: AtomicBool::new(false),
                started: AtomicBool::new(false),
                signal: ShutdownSignal::new(),
                cycle_guard: tokio::sync::Mutex::new(()),
                handle: Mutex::new(None),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn task_id(&self) -> &str {
        self.inner.task.id()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Start the timer. Returns false if already started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        let handle = tokio::spawn(self.inner.clone().run_loop());
        *self
            .inner
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(
            task = %self.task_id(),
            interval_ms = self.inner.config.interval.as_millis() as u64,
            "scheduler started"
        );
        true
    }

    /// Stop scheduling and wait for the in-flight cycle, if any, to finish.
    pub async fn shutdown(&self) {
        self.inner.signal.request();
        let handle = self
            .inner
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(task = %self.task_id(), error = %e, "schedule loop aborted");
            }
        }
        // Wait out a cycle started through `run_cycle`
        let _guard = self.inner.cycle_guard.lock().await;
        self.inner.set_state(TaskState::Stopped);
        info!(task = %self.task_id(), "scheduler stopped");
    }

    /// Run one cycle now, outside the timer.
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.inner.run_cycle().await
    }

    pub fn state(&self) -> TaskState {
        self.inner.state()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            task_id: self.task_id().to_string(),
            state: self.state(),
            running: self.is_running(),
            completed_cycles: self.inner.completed.load(Ordering::SeqCst),
            failed_cycles: self.inner.failed.load(Ordering::SeqCst),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("task", &self.task_id())
            .field("lock_key", &self.inner.config.lock_key)
            .field("state", &self.state())
            .finish()
    }
}
