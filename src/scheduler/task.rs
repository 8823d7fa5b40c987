//! The task contract and its observable states

use crate::error::ManagerResult;
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Work the [`Scheduler`](super::Scheduler) runs once per interval while holding its lease.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    /// Unique identifier, used in logs and status
    fn id(&self) -> &str;

    /// Checked before the lock is requested. A disabled cycle is skipped.
    async fn is_enabled(&self) -> bool {
        true
    }

    /// Run one cycle.
    ///
    /// `signal` fires on shutdown or when the lease is lost. Long-running
    /// tasks should return soon after it fires; short ones may ignore it.
    async fn run(&self, signal: &ShutdownSignal) -> ManagerResult<()>;
}

/// Where a scheduled task is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    AcquiringLock,
    Running,
    ReleasingLock,
    Stopped,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::AcquiringLock => "acquiring_lock",
            Self::Running => "running",
            Self::ReleasingLock => "releasing_lock",
            Self::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Result of a single cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The task reported itself disabled; no lock was requested
    Disabled,
    /// Another holder owns the lock, or a cycle is already in flight here
    Skipped,
    Completed,
    /// The task body failed or panicked
    Failed(String),
}

impl CycleOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}
