use std::time::Duration;

use crate::config::DispatchConfig;

/// Per-recipient retry bounds and batch pacing
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPolicy {
    /// Delivery attempts per recipient, including the first
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    /// Deadline for one delivery attempt, connecting included
    pub send_timeout: Duration,
    /// Pause after each batch that attempted at least one delivery
    pub batch_delay: Duration,
    /// Wall-clock ceiling on retrying one recipient, whatever the attempt count
    pub max_retry_window: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> DispatchPolicy {
        DispatchPolicy::from(&DispatchConfig::default())
    }
}

impl<'a> From<&'a DispatchConfig> for DispatchPolicy {
    fn from(config: &'a DispatchConfig) -> DispatchPolicy {
        DispatchPolicy {
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: Duration::from_secs(config.retry_delay),
            send_timeout: Duration::from_secs(config.send_timeout),
            batch_delay: Duration::from_secs(config.batch_delay),
            max_retry_window: Duration::from_secs(config.max_retry_window_minutes * 60),
        }
    }
}
