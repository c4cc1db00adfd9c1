//! Log Shipper Library
//!
//! This library follows local log files and forwards their lines, in signed
//! JSON batches, to a remote collector webhook:
//!
//! - **source**: Line sources, including a live file follower that survives rotation
//! - **tailer**: One producer task per source, classifying lines into entries
//! - **queue**: Bounded hand-off between tailers and the batcher
//! - **batcher**: Size and time based batching, drained on shutdown
//! - **sender**: Payload encoding, HMAC signing and HTTP delivery with retries
//! - **shipper**: Lifecycle coordination and graceful shutdown
//!
//! # Example
//!
//! ```no_run
//! use log_shipper::Shipper;
//!
//! #[tokio::main]
//! async fn main() {
//!     let shipper = Shipper::load("/etc/log-shipper/config.yaml").expect("Failed to load config");
//!
//!     let stats = shipper
//!         .run_until(async {
//!             tokio::signal::ctrl_c().await.ok();
//!         })
//!         .await
//!         .expect("Failed to start shipper");
//!
//!     println!("{}", stats);
//! }
//! ```

pub mod batcher;
pub mod config;
pub mod entry;
pub mod error;
pub mod queue;
pub mod retry;
pub mod sender;
pub mod shipper;
pub mod signer;
pub mod source;
pub mod stats;
pub mod tailer;

// Re-export commonly used types at crate root for convenience
pub use batcher::{Batch, Batcher};
pub use config::{Config, ConfigError, SourceConfig, SourceDescriptor};
pub use entry::{classify, LogEntry, Severity};
pub use error::ShipperError;
pub use queue::{QueueError, QueueReceiver, QueueSender};
pub use sender::{BatchSender, HttpTransport, Transport, TransportError};
pub use shipper::{Shipper, ShipperState};
pub use source::{FileFollower, LineSource, StaticLines};
pub use stats::{PipelineStats, StatsSnapshot};
