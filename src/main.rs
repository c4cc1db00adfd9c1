//! Log Shipper - follows local log files and forwards them to a webhook
//!
//! Each configured file is followed like `tail -F`, every new line is turned
//! into a structured entry with a severity, and entries are sent in signed JSON
//! batches to the collector.
//!
//! ## Features
//!
//! - Rotation and truncation aware file following
//! - Size-based and time-based batch flushing
//! - HMAC-SHA256 signed delivery with bounded retries
//! - Graceful shutdown on SIGINT/SIGTERM with a bounded queue drain
//!
//! ## Configuration
//!
//! Configuration is read from a YAML file (`--config`, `LOG_SHIPPER_CONFIG`).
//! These environment variables override the file:
//!
//! - `LOG_SHIPPER_WEBHOOK_URL`: Collector endpoint
//! - `LOG_SHIPPER_WEBHOOK_SECRET`: Signing secret
//! - `LOG_SHIPPER_API_KEY`: Optional API key
//! - `LOG_SHIPPER_BATCH_SIZE`: Entries per batch
//! - `RUST_LOG`: Logging level filter (default: info)

use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use log_shipper::config::Config;
use log_shipper::Shipper;

/// Config file used when neither the flag nor the env var is given
const DEFAULT_CONFIG_PATH: &str = "/etc/log-shipper/config.yaml";

/// Log Shipper - forward local log files to a collector webhook
#[derive(Parser, Debug)]
#[command(name = "log-shipper")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "LOG_SHIPPER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    let args = Args::parse();
    info!(config = %args.config.display(), "Starting Log Shipper...");

    let config = match Config::load(&args.config) {
        Ok(config) => {
            info!(
                webhook_url = %config.webhook_url,
                sources = config.enabled_sources().len(),
                batch_size = config.batch_size,
                batch_timeout_secs = config.batch_timeout.as_secs_f64(),
                retry_count = config.retry_count,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let shipper = Shipper::new(config);
    match shipper.run_until(shutdown_signal()).await {
        Ok(stats) => {
            info!(%stats, "Log Shipper stopped");
        }
        Err(e) => {
            error!(error = %e, "Failed to start Log Shipper");
            std::process::exit(1);
        }
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Resolve once SIGINT or (on unix) SIGTERM arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match unix_signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to create SIGTERM handler");
                wait_for_ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = wait_for_ctrl_c() => {}
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        Err(e) => {
            // without a handler there is nothing to wait for; keep running
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_path() {
        let args = Args::parse_from(["log-shipper"]);
        if std::env::var_os("LOG_SHIPPER_CONFIG").is_none() {
            assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        }
    }

    #[test]
    fn test_config_flag() {
        let args = Args::parse_from(["log-shipper", "-c", "/tmp/shipper.yaml"]);
        assert_eq!(args.config, PathBuf::from("/tmp/shipper.yaml"));

        let args = Args::parse_from(["log-shipper", "--config", "other.yaml"]);
        assert_eq!(args.config, PathBuf::from("other.yaml"));
    }
}
