//! Lifecycle coordinator for the shipping pipeline.
//!
//! A [`Shipper`] moves through `Created -> Running -> Stopping -> Stopped`.
//! Starting spawns one tailer task per enabled source plus the single batcher
//! task. Stopping cancels the shared token and waits, up to the shutdown
//! timeout, for the queue to drain and the batcher to send its last batch.
//! Past the timeout the batcher is told to give up: the request in flight
//! completes, and every entry not yet sent is counted as abandoned. No task
//! that holds entries is ever aborted, so every entry read ends up in exactly
//! one of the sent, failed or abandoned counters.

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batcher::Batcher;
use crate::config::{Config, SourceDescriptor};
use crate::error::ShipperError;
use crate::queue::{self, QueueSender};
use crate::sender::{BatchSender, HttpTransport, Transport};
use crate::source::{FileFollower, LineSource};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::tailer::Tailer;

/// Interval between queue emptiness probes while draining.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Lifecycle states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipperState {
    Created,
    Running,
    Stopping,
    Stopped,
}

struct Tasks {
    queue: QueueSender,
    tailers: Vec<JoinHandle<()>>,
    batcher: JoinHandle<()>,
}

/// Runs tailers and the batcher and coordinates their shutdown.
pub struct Shipper {
    config: Config,
    stats: Arc<PipelineStats>,
    shutdown: CancellationToken,
    deadline: CancellationToken,
    state: Mutex<ShipperState>,
    tasks: Mutex<Option<Tasks>>,
}

impl Shipper {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            stats: Arc::new(PipelineStats::new()),
            shutdown: CancellationToken::new(),
            deadline: CancellationToken::new(),
            state: Mutex::new(ShipperState::Created),
            tasks: Mutex::new(None),
        }
    }

    /// Load and validate the config file at `path`, then build a shipper.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ShipperError> {
        Ok(Self::new(Config::load(path)?))
    }

    pub fn state(&self) -> ShipperState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start following every enabled source and posting to the webhook.
    ///
    /// Returns the number of tailers started.
    pub fn start(&self) -> Result<usize, ShipperError> {
        let transport = HttpTransport::from_config(&self.config)?;
        let sources = self
            .config
            .enabled_sources()
            .into_iter()
            .map(|descriptor| {
                let follower = FileFollower::new(descriptor.path.clone());
                (descriptor, follower)
            })
            .collect();

        self.start_with(sources, transport)
    }

    /// Start with explicit line sources and transport.
    pub fn start_with<S, T>(
        &self,
        sources: Vec<(SourceDescriptor, S)>,
        transport: T,
    ) -> Result<usize, ShipperError>
    where
        S: LineSource + 'static,
        T: Transport + 'static,
    {
        if !self.transition(ShipperState::Created, ShipperState::Running) {
            return Err(ShipperError::AlreadyStarted);
        }

        let (tx, rx) = queue::bounded(self.config.queue_capacity);

        let sender = BatchSender::new(transport, &self.config, self.stats.clone());
        let batcher = Batcher::new(rx, sender, self.config.batch_size, self.config.batch_timeout)
            .with_deadline(self.deadline.clone());
        let batcher = tokio::spawn(batcher.run(self.shutdown.clone()));

        let tailers: Vec<_> = sources
            .into_iter()
            .map(|(descriptor, source)| {
                let tailer = Tailer::new(descriptor, source, tx.clone(), self.stats.clone());
                tokio::spawn(tailer.run(self.shutdown.clone()))
            })
            .collect();

        let started = tailers.len();
        if started == 0 {
            warn!("No enabled log sources configured");
        }
        info!(
            sources = started,
            webhook_url = %self.config.webhook_url,
            "Log shipper started with {} sources",
            started
        );

        *self.tasks.lock().unwrap_or_else(|e| e.into_inner()) = Some(Tasks {
            queue: tx,
            tailers,
            batcher,
        });
        Ok(started)
    }

    /// Stop the pipeline and return the final counters.
    ///
    /// Calling this again, or before `start`, does nothing beyond returning
    /// the current counters.
    pub async fn stop(&self) -> StatsSnapshot {
        if !self.transition(ShipperState::Running, ShipperState::Stopping) {
            self.transition(ShipperState::Created, ShipperState::Stopped);
            return self.stats.snapshot();
        }

        info!("Shutting down...");
        self.shutdown.cancel();

        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tasks) = tasks {
            self.drain(tasks).await;
        }

        self.transition(ShipperState::Stopping, ShipperState::Stopped);
        let stats = self.stats.snapshot();
        info!(
            logs_read = stats.logs_read,
            logs_sent = stats.logs_sent,
            logs_failed = stats.logs_failed,
            logs_dropped = stats.logs_dropped,
            logs_abandoned = stats.logs_abandoned,
            batches_sent = stats.batches_sent,
            "Stats: {}",
            stats
        );
        stats
    }

    /// Start, wait for `signal`, then stop.
    pub async fn run_until<F>(&self, signal: F) -> Result<StatsSnapshot, ShipperError>
    where
        F: Future<Output = ()>,
    {
        self.start()?;
        signal.await;
        Ok(self.stop().await)
    }

    /// Wait for the queue to empty and the batcher to finish, bounded by the
    /// shutdown timeout. Past it, the batcher abandons what it has not sent and
    /// is then awaited without a bound; only its in-flight attempt remains.
    async fn drain(&self, tasks: Tasks) {
        let deadline = Instant::now() + self.config.shutdown_timeout;

        while !tasks.queue.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let mut batcher = tasks.batcher;
        let result = match timeout_at(deadline, &mut batcher).await {
            Ok(result) => {
                info!("Queue drained");
                result
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.shutdown_timeout.as_secs_f64(),
                    "Shutdown deadline reached, waiting for the request in flight"
                );
                self.deadline.cancel();
                batcher.await
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "Batcher task failed during shutdown");
        }

        // tailers hold no entries of their own
        for mut tailer in tasks.tailers {
            if timeout_at(deadline, &mut tailer).await.is_err() {
                tailer.abort();
            }
        }
    }

    fn transition(&self, from: ShipperState, to: ShipperState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }
}
