//! Batcher: the single consumer of the queue.
//!
//! Entries are accumulated into one shared batch (across all sources) which is
//! flushed when it reaches `batch_size` entries, or when it is non-empty and
//! `batch_timeout` has passed since the previous flush. Each flushed batch is
//! handed to the [`BatchSender`] and then forgotten, whatever the outcome.
//!
//! Shutdown has two stages. Cancelling the shutdown token makes the batcher
//! drain the queue and flush what is left. Cancelling the deadline token ends
//! that drain early: the send in flight finishes its current attempt, then
//! everything still buffered or queued is counted as abandoned.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entry::LogEntry;
use crate::queue::QueueReceiver;
use crate::sender::{BatchSender, Transport};

/// Upper bound on a single wait for the next entry.
const POP_WAIT: Duration = Duration::from_secs(1);

/// A group of entries flushed together in one transmission.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Client-side identifier used to correlate log lines
    pub id: Uuid,

    /// When the batch was cut
    pub created_at: DateTime<Utc>,

    /// Entries in queue order
    pub entries: Vec<LogEntry>,
}

impl Batch {
    pub fn new(entries: Vec<LogEntry>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Dual size/time flush rule.
pub fn should_flush(len: usize, since_flush: Duration, batch_size: usize, batch_timeout: Duration) -> bool {
    len >= batch_size || (len > 0 && since_flush >= batch_timeout)
}

/// Accumulates queued entries into batches and sends them, one at a time.
pub struct Batcher<T> {
    queue: QueueReceiver,
    sender: BatchSender<T>,
    batch_size: usize,
    batch_timeout: Duration,
    pop_wait: Duration,
    buffer: Vec<LogEntry>,
    last_flush: Instant,
    deadline: CancellationToken,
}

impl<T: Transport> Batcher<T> {
    pub fn new(
        queue: QueueReceiver,
        sender: BatchSender<T>,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            queue,
            sender,
            batch_size,
            batch_timeout,
            pop_wait: POP_WAIT.min(batch_timeout).max(Duration::from_millis(1)),
            buffer: Vec::with_capacity(batch_size),
            last_flush: Instant::now(),
            deadline: CancellationToken::new(),
        }
    }

    /// Give up on whatever is unsent once `deadline` fires.
    pub fn with_deadline(mut self, deadline: CancellationToken) -> Self {
        self.sender = self.sender.with_stop(deadline.clone());
        self.deadline = deadline;
        self
    }

    /// Consume the queue until shutdown.
    ///
    /// After `shutdown` is cancelled the loop keeps draining until the queue
    /// is empty, then sends whatever is left as one final batch. If the
    /// deadline fires first, the remainder is abandoned instead.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let deadline = self.deadline.clone();
        info!(
            batch_size = self.batch_size,
            batch_timeout_ms = self.batch_timeout.as_millis() as u64,
            "Batcher started"
        );

        loop {
            if deadline.is_cancelled() {
                break;
            }
            let stopping = shutdown.is_cancelled();
            if (stopping || self.queue.is_closed()) && self.queue.is_empty() {
                break;
            }

            let entry = tokio::select! {
                biased;
                _ = deadline.cancelled() => None,
                entry = self.queue.pop(self.pop_wait) => entry,
                _ = shutdown.cancelled(), if !stopping => None,
            };
            if let Some(entry) = entry {
                self.buffer.push(entry);
            }
            if deadline.is_cancelled() {
                break;
            }

            if should_flush(
                self.buffer.len(),
                self.last_flush.elapsed(),
                self.batch_size,
                self.batch_timeout,
            ) {
                if self.buffer.len() >= self.batch_size {
                    debug!(batch_size = self.buffer.len(), "Size-based flush triggered");
                } else {
                    debug!(batch_size = self.buffer.len(), "Time-based flush triggered");
                }
                self.flush().await;
            }
        }

        if deadline.is_cancelled() {
            self.abandon();
        } else if !self.buffer.is_empty() {
            info!(remaining = self.buffer.len(), "Flushing remaining logs");
            self.flush().await;
        }
        info!("Batcher stopped");
    }

    /// Count everything not yet handed to the sender as abandoned.
    fn abandon(&mut self) {
        let buffered = self.buffer.len();
        self.buffer.clear();
        let queued = self.queue.close_and_discard();

        let abandoned = buffered + queued;
        if abandoned > 0 {
            self.sender.stats().record_abandoned(abandoned);
            warn!(
                abandoned = abandoned,
                buffered = buffered,
                queued = queued,
                "Shutdown deadline reached, abandoning unsent logs"
            );
        }
    }

    async fn flush(&mut self) {
        let entries = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        let batch = Batch::new(entries);
        self.sender.send(&batch).await;
        self.last_flush = Instant::now();
    }
}
