//! Retry and queue sizing parameters.
//!
//! Both the client and the listener retry connectivity faults at a fixed
//! interval ([`RetryConfig::retry_wait`]) and give up once faults have gone
//! on for longer than [`RetryConfig::max_retry`] without a success in
//! between.  `max_retry` doubles as the patience for a single reply.

use std::time::Duration;

use crate::error::QueueError;
use crate::sequence::CERTAIN_WINDOW;

/// Largest number of requests a client may have unacknowledged at once.
///
/// Keeping the queue within the certain window guarantees the server can
/// always order the numbers it sees.
pub const MAX_OUTSTANDING: usize = CERTAIN_WINDOW as usize;

/// Fixed-interval retry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// How long faults may continue before they are reported.
    pub max_retry: Duration,
    /// Pause between attempts.
    pub retry_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry: Duration::from_secs(1),
            retry_wait: Duration::from_millis(100),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retry: Duration, retry_wait: Duration) -> Self {
        Self {
            max_retry,
            retry_wait,
        }
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_retry < Duration::from_millis(1) {
            return Err(QueueError::InvalidArgument(format!(
                "max_retry must be at least 1ms: {:?}",
                self.max_retry
            )));
        }
        if self.retry_wait < Duration::from_millis(1) {
            return Err(QueueError::InvalidArgument(format!(
                "retry_wait must be at least 1ms: {:?}",
                self.retry_wait
            )));
        }
        Ok(())
    }
}

/// Parameters for a [`crate::client::RequestQueueClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    pub retry: RetryConfig,
    /// Capacity of the queue of requests waiting to be sent or acknowledged.
    pub queue_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            queue_size: 100,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        self.retry.validate()?;
        if self.queue_size < 1 || self.queue_size > MAX_OUTSTANDING {
            return Err(QueueError::InvalidArgument(format!(
                "queue_size must be between 1 and {MAX_OUTSTANDING}: {}",
                self.queue_size
            )));
        }
        Ok(())
    }
}
