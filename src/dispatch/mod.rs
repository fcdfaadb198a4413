mod interrupt;
mod outcome;
mod policy;

pub use self::interrupt::Interrupt;
pub use self::outcome::{DispatchOutcome, INTERRUPTED_EXIT_CODE};
pub use self::policy::DispatchPolicy;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::smtp::{FailureClass, Mailer};
use crate::storage::{MarkOutcome, RecipientRecord, RecipientStorage};
use crate::suppression::{self, SuppressionSet};

/// Produces the message body for one recipient
pub trait Renderer {
    fn render(
        &self,
        template: &Path,
        recipient: &RecipientRecord,
        subject: &str,
    ) -> Result<String, Error>;
}

impl<F> Renderer for F
where
    F: Fn(&Path, &RecipientRecord, &str) -> Result<String, Error>,
{
    fn render(
        &self,
        template: &Path,
        recipient: &RecipientRecord,
        subject: &str,
    ) -> Result<String, Error> {
        self(template, recipient, subject)
    }
}

/// The result of a single delivery attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Sent,
    Retryable(String),
    Terminal(String),
    /// Stopped by the interrupt before the message went out
    Interrupted,
}

/// How a recipient's delivery loop ended
#[derive(Debug)]
enum Delivery {
    Sent,
    Failed(String),
    Interrupted,
}

/// What happened to one record
#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    Skipped,
    Attempted,
    Interrupted,
}

enum Validation {
    Valid(String),
    /// Nothing to key a row with
    Missing,
    /// Present but unusable; the row gets marked failed
    Malformed(String),
}

fn validate(raw: &str) -> Validation {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        Validation::Missing
    } else if trimmed.eq_ignore_ascii_case("nan") || !trimmed.contains('@') {
        Validation::Malformed(trimmed.to_owned())
    } else {
        Validation::Valid(suppression::normalize(trimmed))
    }
}

/// Drives pending recipients through suppression checks and delivery.
pub struct Dispatcher<'a, R> {
    template: PathBuf,
    subject: String,
    renderer: R,
    policy: DispatchPolicy,
    unsubscribed: Option<&'a SuppressionSet>,
    bounced: Option<&'a SuppressionSet>,
    interrupt: Interrupt,
}

impl<'a, R: Renderer> Dispatcher<'a, R> {
    /// Fails with `Error::Config` if the template does not exist
    pub fn new<P: Into<PathBuf>>(
        template: P,
        subject: &str,
        renderer: R,
        policy: DispatchPolicy,
    ) -> Result<Dispatcher<'a, R>, Error> {
        let template = template.into();
        if !template.is_file() {
            return Err(Error::Config(format!(
                "template {} not found",
                template.display()
            )));
        }
        Ok(Dispatcher {
            template,
            subject: subject.to_owned(),
            renderer,
            policy,
            unsubscribed: None,
            bounced: None,
            interrupt: Interrupt::new(),
        })
    }

    pub fn unsubscribed(mut self, set: &'a SuppressionSet) -> Dispatcher<'a, R> {
        self.unsubscribed = Some(set);
        self
    }

    pub fn bounced(mut self, set: &'a SuppressionSet) -> Dispatcher<'a, R> {
        self.bounced = Some(set);
        self
    }

    pub fn interrupt(mut self, interrupt: Interrupt) -> Dispatcher<'a, R> {
        self.interrupt = interrupt;
        self
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Send to every pending recipient in `store`.
    ///
    /// Per-recipient failures are recorded and never end the run. Only a
    /// store that can no longer be saved or restored is an error here. An
    /// interrupted run returns a partial outcome and keeps the store's
    /// recovery backup; a complete run cleans it up.
    pub fn run<S, M>(&self, store: &mut S, mailer: &M) -> Result<DispatchOutcome, Error>
    where
        S: RecipientStorage,
        M: Mailer,
    {
        let mut outcome = DispatchOutcome::start();

        let pending = store.total_pending();
        if pending == 0 {
            let counts = store.counts();
            info!(
                "no pending recipients ({} sent, {} failed, {} total)",
                counts.sent, counts.failed, counts.total
            );
        } else {
            info!("dispatch starting with {} pending recipients", pending);
        }

        let mut batches = store.batches().peekable();
        let mut index = 0;
        while let Some(batch) = batches.next() {
            index += 1;
            debug!("batch {} with {} recipients", index, batch.len());

            let mut attempted = 0;
            for record in &batch {
                if self.interrupt.is_set() {
                    return self.stop(store, outcome);
                }
                match self.process(store, mailer, record, &mut outcome)? {
                    Step::Attempted => attempted += 1,
                    Step::Skipped => {}
                    Step::Interrupted => return self.stop(store, outcome),
                }
            }

            if attempted > 0 && batches.peek().is_some() && self.policy.batch_delay > Duration::from_secs(0) {
                info!(
                    "batch {} done ({} attempted), pausing {}s",
                    index,
                    attempted,
                    self.policy.batch_delay.as_secs()
                );
                if !self.pause(self.policy.batch_delay) {
                    return self.stop(store, outcome);
                }
            }
        }

        outcome.finish(false);
        if let Err(e) = store.cleanup() {
            warn!("could not clean up after run: {}", e);
        }
        info!("{}", outcome);
        Ok(outcome)
    }

    fn process<S, M>(
        &self,
        store: &mut S,
        mailer: &M,
        record: &RecipientRecord,
        outcome: &mut DispatchOutcome,
    ) -> Result<Step, Error>
    where
        S: RecipientStorage,
        M: Mailer,
    {
        let email = match validate(&record.email) {
            Validation::Valid(email) => email,
            Validation::Missing => {
                warn!("row {} has no email address, skipping", record.row);
                outcome.skipped_invalid += 1;
                return Ok(Step::Skipped);
            }
            Validation::Malformed(raw) => {
                warn!("row {} has an invalid email address {:?}", record.row, raw);
                outcome.skipped_invalid += 1;
                persisted(store.mark_failed(&raw))?;
                return Ok(Step::Skipped);
            }
        };

        if self.bounced.map_or(false, |set| set.contains(&email)) {
            debug!("{} has bounced before, skipping", email);
            outcome.skipped_bounced += 1;
            return Ok(Step::Skipped);
        }
        if self.unsubscribed.map_or(false, |set| set.contains(&email)) {
            debug!("{} is unsubscribed, skipping", email);
            outcome.skipped_unsubscribed += 1;
            return Ok(Step::Skipped);
        }
        if !store.is_pending(&email) {
            debug!("{} was already handled in this run", email);
            return Ok(Step::Skipped);
        }

        match self.deliver(mailer, record, &email, outcome) {
            Delivery::Sent => {
                outcome.successful += 1;
                persisted(store.mark_sent(&email))?;
            }
            Delivery::Failed(reason) => {
                error!("giving up on {}: {}", email, reason);
                outcome.failed += 1;
                persisted(store.mark_failed(&email))?;
            }
            Delivery::Interrupted => return Ok(Step::Interrupted),
        }
        Ok(Step::Attempted)
    }

    /// Attempt delivery until it succeeds, fails terminally, or runs out of
    /// attempts or retry window.
    fn deliver<M: Mailer>(
        &self,
        mailer: &M,
        record: &RecipientRecord,
        email: &str,
        outcome: &mut DispatchOutcome,
    ) -> Delivery {
        let first_attempt = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;
            outcome.attempts += 1;

            let reason = match self.attempt(mailer, record, email) {
                AttemptResult::Sent => {
                    info!("sent to {}", email);
                    return Delivery::Sent;
                }
                AttemptResult::Terminal(reason) => return Delivery::Failed(reason),
                AttemptResult::Interrupted => return Delivery::Interrupted,
                AttemptResult::Retryable(reason) => reason,
            };

            if attempts >= self.policy.retry_attempts {
                return Delivery::Failed(format!(
                    "{} after {} attempt(s)",
                    reason, attempts
                ));
            }
            if first_attempt.elapsed() >= self.policy.max_retry_window {
                return Delivery::Failed(format!(
                    "{} (retry window of {}s used up after {} attempt(s))",
                    reason,
                    self.policy.max_retry_window.as_secs(),
                    attempts
                ));
            }

            warn!(
                "attempt {}/{} to {} failed, retrying: {}",
                attempts, self.policy.retry_attempts, email, reason
            );
            if !self.pause(self.policy.retry_delay) {
                return Delivery::Interrupted;
            }
        }
    }

    fn attempt<M: Mailer>(&self, mailer: &M, record: &RecipientRecord, email: &str) -> AttemptResult {
        let body = match self.renderer.render(&self.template, record, &self.subject) {
            Ok(body) => body,
            Err(e) => return AttemptResult::Terminal(e.to_string()),
        };

        match mailer.send_email(email, &self.subject, &body, true) {
            Ok(()) => AttemptResult::Sent,
            Err(Error::Interrupted) => AttemptResult::Interrupted,
            Err(e) => match e.failure_class() {
                FailureClass::Connection => AttemptResult::Retryable(e.to_string()),
                FailureClass::Terminal => AttemptResult::Terminal(e.to_string()),
            },
        }
    }

    /// Returns false if interrupted
    fn pause(&self, duration: Duration) -> bool {
        self.interrupt.sleep(duration)
    }

    fn stop<S: RecipientStorage>(
        &self,
        store: &mut S,
        mut outcome: DispatchOutcome,
    ) -> Result<DispatchOutcome, Error> {
        warn!("interrupted, stopping; recovery backup kept");
        if let Err(e) = store.flush() {
            if e.is_fatal() {
                return Err(e);
            }
            error!("final save failed: {}", e);
        }
        outcome.finish(true);
        info!("{}", outcome);
        Ok(outcome)
    }
}

/// Surface a store write that could not be made durable. Only a failed
/// restore ends the run; a restored backup is logged and the in-memory
/// state, which already holds the flag, is written again on the next save.
fn persisted(result: Result<MarkOutcome, Error>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            if e.is_fatal() {
                return Err(e);
            }
            error!("recipient state not saved: {}", e);
            Ok(())
        }
    }
}
