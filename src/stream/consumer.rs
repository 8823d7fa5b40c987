//! StreamConsumer: tails the event log from a durable cursor
//!
//! Delivery is at-least-once. A batch is handed to the handler, and only when
//! the handler succeeds *and* the store accepts the new cursor does the
//! consumer move past it. Anything else re-delivers the same batch on the
//! next poll, so handlers must be idempotent.

use super::event::StreamEvent;
use crate::error::{ManagerError, ManagerResult};
use crate::scheduler::ScheduledTask;
use crate::shutdown::ShutdownSignal;
use crate::storage::{CursorStore, EventLog, StreamCursor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Receives ordered batches of events
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Handle a batch. An error leaves the cursor where it was.
    async fn handle(&self, batch: &[StreamEvent]) -> ManagerResult<()>;
}

/// Where a consumer without a stored cursor begins
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartFrom {
    /// Replay the whole log
    #[default]
    Beginning,
    /// Only events appended from now on
    Live,
}

/// Tailing parameters for one consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Durable cursor name
    pub consumer_id: String,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub start_from: StartFrom,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            consumer_id: "stream_consumer".to_string(),
            poll_interval_ms: 2_000,
            batch_size: 100,
            start_from: StartFrom::Beginning,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

impl StreamConfig {
    pub fn new(consumer_id: impl Into<String>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            ..Self::default()
        }
    }

    pub fn with_start_from(mut self, start_from: StartFrom) -> Self {
        self.start_from = start_from;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial_ms = initial.as_millis() as u64;
        self.backoff_max_ms = max.as_millis() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Exponential reconnect delay
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Connection state of a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Stopped,
    Connecting,
    Tailing,
}

/// What a single poll did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Nothing after the cursor
    Empty,
    /// Handled and the cursor now sits at `position`
    Committed { position: u64, count: usize },
    /// The handler failed; the cursor did not move
    Rejected { first_position: u64, error: String },
}

/// Tails an [`EventLog`] and feeds a [`StreamHandler`].
pub struct StreamConsumer {
    log: Arc<dyn EventLog>,
    cursors: Arc<dyn CursorStore>,
    handler: Arc<dyn StreamHandler>,
    config: StreamConfig,
    state: Mutex<ConsumerState>,
    position: AtomicU64,
}

impl StreamConsumer {
    pub fn new(
        log: Arc<dyn EventLog>,
        cursors: Arc<dyn CursorStore>,
        handler: Arc<dyn StreamHandler>,
        config: StreamConfig,
    ) -> Self {
        Self {
            log,
            cursors,
            handler,
            config,
            state: Mutex::new(ConsumerState::Stopped),
            position: AtomicU64::new(0),
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.config.consumer_id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last committed position seen by this instance
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Resolve the starting position from the stored cursor.
    ///
    /// A consumer starting live pins the current head as its cursor so a
    /// restart resumes from there instead of skipping ahead again.
    pub fn resume_position(&self) -> ManagerResult<u64> {
        if let Some(cursor) = self.cursors.load_cursor(&self.config.consumer_id)? {
            return Ok(cursor.position);
        }
        match self.config.start_from {
            StartFrom::Beginning => Ok(0),
            StartFrom::Live => {
                let head = self.log.head_position()?;
                self.cursors
                    .save_cursor(&StreamCursor::new(self.config.consumer_id.clone(), head))?;
                Ok(head)
            }
        }
    }

    /// Read and handle the batch after `after`.
    ///
    /// Returns `Err` only when the log or cursor store failed; handler failures
    /// are reported as [`BatchOutcome::Rejected`].
    pub async fn process_next_batch(&self, after: u64) -> ManagerResult<BatchOutcome> {
        let batch = self
            .log
            .read_after(after, self.config.batch_size.max(1))
            .map_err(|e| ManagerError::TransientIo(e.to_string()))?;
        let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
            return Ok(BatchOutcome::Empty);
        };
        let (first_position, last_position) = (first.position, last.position);

        if let Err(e) = self.handler.handle(&batch).await {
            error!(
                consumer = %self.config.consumer_id,
                position = first_position,
                count = batch.len(),
                error = %e,
                "stream handler failed, batch will be retried"
            );
            return Ok(BatchOutcome::Rejected {
                first_position,
                error: e.to_string(),
            });
        }

        self.cursors.save_cursor(&StreamCursor::new(
            self.config.consumer_id.clone(),
            last_position,
        ))?;
        self.position.store(last_position, Ordering::SeqCst);
        debug!(
            consumer = %self.config.consumer_id,
            position = last_position,
            count = batch.len(),
            "batch committed"
        );
        Ok(BatchOutcome::Committed {
            position: last_position,
            count: batch.len(),
        })
    }

    /// Follow the log until `signal` fires.
    pub async fn tail(&self, signal: &ShutdownSignal) -> ManagerResult<()> {
        self.set_state(ConsumerState::Connecting);
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.backoff_initial_ms),
            Duration::from_millis(self.config.backoff_max_ms),
        );

        let mut position = loop {
            match self.resume_position() {
                Ok(position) => break position,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(consumer = %self.config.consumer_id, error = %e, delay_ms = delay.as_millis() as u64, "cursor unavailable, retrying");
                    if signal.sleep(delay).await {
                        self.set_state(ConsumerState::Stopped);
                        return Ok(());
                    }
                }
            }
        };
        self.position.store(position, Ordering::SeqCst);
        info!(consumer = %self.config.consumer_id, position, "stream tailing");

        while !signal.is_requested() {
            let pause = match self.process_next_batch(position).await {
                Ok(BatchOutcome::Committed { position: next, .. }) => {
                    self.set_state(ConsumerState::Tailing);
                    backoff.reset();
                    position = next;
                    // More may be waiting
                    continue;
                }
                Ok(BatchOutcome::Empty) | Ok(BatchOutcome::Rejected { .. }) => {
                    self.set_state(ConsumerState::Tailing);
                    backoff.reset();
                    self.config.poll_interval()
                }
                Err(e) => {
                    self.set_state(ConsumerState::Connecting);
                    let delay = backoff.next_delay();
                    warn!(
                        consumer = %self.config.consumer_id,
                        position,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "stream read failed, reconnecting"
                    );
                    delay
                }
            };
            if signal.sleep(pause).await {
                break;
            }
        }

        self.set_state(ConsumerState::Stopped);
        info!(consumer = %self.config.consumer_id, position, "stream stopped");
        Ok(())
    }
}

impl std::fmt::Debug for StreamConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConsumer")
            .field("consumer_id", &self.config.consumer_id)
            .field("state", &self.state())
            .field("position", &self.position())
            .finish()
    }
}

#[async_trait]
impl ScheduledTask for StreamConsumer {
    fn id(&self) -> &str {
        &self.config.consumer_id
    }

    async fn run(&self, signal: &ShutdownSignal) -> ManagerResult<()> {
        self.tail(signal).await
    }
}
