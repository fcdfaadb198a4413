use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Exit status for a run cut short by Ctrl-C
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Counters for one dispatch run, handed to the reporting side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub successful: usize,
    pub failed: usize,
    pub skipped_unsubscribed: usize,
    pub skipped_bounced: usize,
    pub skipped_invalid: usize,
    /// Delivery attempts made, retries included
    pub attempts: usize,
    pub interrupted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DispatchOutcome {
    pub fn start() -> DispatchOutcome {
        let now = Utc::now();
        DispatchOutcome {
            successful: 0,
            failed: 0,
            skipped_unsubscribed: 0,
            skipped_bounced: 0,
            skipped_invalid: 0,
            attempts: 0,
            interrupted: false,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn finish(&mut self, interrupted: bool) {
        self.interrupted = interrupted;
        self.finished_at = Utc::now();
    }

    pub fn skipped(&self) -> usize {
        self.skipped_unsubscribed + self.skipped_bounced + self.skipped_invalid
    }

    pub fn processed(&self) -> usize {
        self.successful + self.failed + self.skipped()
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            INTERRUPTED_EXIT_CODE
        } else {
            0
        }
    }
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}: {} sent, {} failed, {} skipped ({} unsubscribed, {} bounced, {} invalid) \
             in {}s over {} attempt(s)",
            if self.interrupted { "interrupted" } else { "completed" },
            self.successful,
            self.failed,
            self.skipped(),
            self.skipped_unsubscribed,
            self.skipped_bounced,
            self.skipped_invalid,
            self.duration().as_secs(),
            self.attempts,
        )
    }
}
