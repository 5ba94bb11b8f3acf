//! Chunk retry policy
//!
//! Exponential backoff for failed transfer chunks, bounded by `max_retries`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::error::{Error, ErrorKind};

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts per run
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff multiplier for each retry
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set custom backoff parameters
    pub fn with_backoff(mut self, initial_ms: u64, multiplier: f64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.backoff_multiplier = multiplier;
        self.max_backoff_ms = max_ms;
        self
    }
}

/// Backoff before retry number `attempt` (0-based)
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let delay_ms = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powi(attempt.min(63) as i32))
    .min(config.max_backoff_ms as f64);

    Duration::from_millis(delay_ms as u64)
}

/// Whether a failed chunk is worth another attempt.
///
/// Errors about the target itself (missing, denied, wrong type) will not
/// change on retry.
pub fn is_retryable_error(error: &Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::ConnectionLost
            | ErrorKind::Network
            | ErrorKind::Protocol
            | ErrorKind::ChannelLimitExceeded
            | ErrorKind::Overloaded
            | ErrorKind::LocalIo
    )
}

/// Sleep for the backoff unless cancelled first. Returns false on cancel.
pub async fn backoff_or_cancel(
    delay: Duration,
    cancel_rx: &mut watch::Receiver<bool>,
    task_id: &str,
) -> bool {
    if *cancel_rx.borrow_and_update() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel_rx.wait_for(|cancelled| *cancelled) => {
            info!("Transfer {} cancelled during backoff", task_id);
            false
        }
    }
}
