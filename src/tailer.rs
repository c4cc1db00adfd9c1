//! Tailer: one producer task per configured source.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SourceDescriptor;
use crate::entry::LogEntry;
use crate::queue::{QueueError, QueueSender};
use crate::source::LineSource;
use crate::stats::PipelineStats;

/// How long a push may wait for room before the entry is dropped.
pub const PUSH_WAIT: Duration = Duration::from_secs(1);

/// Pause when the source has nothing new.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Pause after a read error before following again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Follows one source and pushes classified entries into the queue.
pub struct Tailer<S> {
    descriptor: SourceDescriptor,
    source: S,
    queue: QueueSender,
    stats: Arc<PipelineStats>,
    push_wait: Duration,
    idle_poll: Duration,
    error_backoff: Duration,
}

impl<S: LineSource> Tailer<S> {
    pub fn new(
        descriptor: SourceDescriptor,
        source: S,
        queue: QueueSender,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            descriptor,
            source,
            queue,
            stats,
            push_wait: PUSH_WAIT,
            idle_poll: IDLE_POLL,
            error_backoff: ERROR_BACKOFF,
        }
    }

    /// Override the push wait bound.
    pub fn with_push_wait(mut self, wait: Duration) -> Self {
        self.push_wait = wait;
        self
    }

    /// Run until `shutdown` is cancelled or the queue is closed.
    ///
    /// Read errors are logged and retried after a short backoff; they never
    /// end the loop.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            path = %self.descriptor.path.display(),
            source = %self.descriptor.name,
            "Starting tail"
        );

        while !shutdown.is_cancelled() {
            let next = self.source.next_line().await;
            match next {
                Ok(Some(line)) => {
                    if !self.handle_line(&line).await {
                        break;
                    }
                }
                Ok(None) => pause(&shutdown, self.idle_poll).await,
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %self.descriptor.path.display(),
                        backoff_ms = self.error_backoff.as_millis() as u64,
                        "Error reading source, retrying"
                    );
                    pause(&shutdown, self.error_backoff).await;
                }
            }
        }

        info!(source = %self.descriptor.name, "Tail stopped");
    }

    /// Push one line. Returns `false` once the consumer is gone.
    async fn handle_line(&mut self, line: &[u8]) -> bool {
        let Some(entry) = LogEntry::from_line(line, &self.descriptor) else {
            return true;
        };

        match self.queue.push(entry, self.push_wait).await {
            Ok(()) => {
                self.stats.record_read();
                true
            }
            Err(QueueError::Full(_)) => {
                warn!(source = %self.descriptor.name, "Queue full, dropping log entry");
                self.stats.record_dropped();
                true
            }
            Err(QueueError::Closed) => {
                warn!(source = %self.descriptor.name, "Queue closed, stopping tail");
                false
            }
        }
    }
}

/// Sleep for `duration` unless shutdown starts first.
async fn pause(shutdown: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
