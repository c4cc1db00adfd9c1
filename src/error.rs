//! Error types for the shipper and re-exports of the per-module errors.

use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::queue::QueueError;
pub use crate::retry::RetryError;
pub use crate::sender::{SendError, TransportError};

/// Top-level error for starting the shipper.
#[derive(Error, Debug)]
pub enum ShipperError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Shipper has already been started")]
    AlreadyStarted,

    #[error("HTTP client error: {0}")]
    Client(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ShipperError::from(TransportError::Build("no tls backend".to_string()));
        assert_eq!(
            err.to_string(),
            "HTTP client error: client configuration error: no tls backend"
        );

        let err = ShipperError::from(ConfigError::Invalid {
            field: "batch_size".to_string(),
            message: "must be at least 1".to_string(),
        });
        assert!(err.to_string().starts_with("Configuration error: "));
    }
}
