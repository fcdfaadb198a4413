//! Resumable batch email dispatch.
//!
//! A [`RecipientStore`] keeps per-recipient `sent` / `failed` flags in the
//! source CSV, saved atomically after every delivery so a re-run never
//! sends twice. A [`Dispatcher`] walks the pending rows in batches, skips
//! suppressed addresses, renders each message and hands it to a
//! [`ConnectionManager`], retrying transient network failures within the
//! configured bounds.

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

#[cfg(test)]
mod tests;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod smtp;
pub mod storage;
pub mod suppression;

use std::path::Path;

pub use crate::config::Config;
pub use crate::dispatch::{DispatchOutcome, DispatchPolicy, Dispatcher, Interrupt, Renderer};
pub use crate::error::Error;
pub use crate::smtp::{ConnectionManager, Mailer};
pub use crate::storage::{MemoryStorage, RecipientRecord, RecipientStorage, RecipientStore};
pub use crate::suppression::SuppressionSet;

/// Send the configured campaign to the pending rows of `source`.
///
/// Configuration problems (no template, missing source) are reported
/// before anything is sent.
pub fn dispatch_file<P, R>(
    config: &Config,
    source: P,
    renderer: R,
    interrupt: Interrupt,
) -> Result<DispatchOutcome, Error>
where
    P: AsRef<Path>,
    R: Renderer,
{
    let template = config
        .template
        .clone()
        .ok_or_else(|| Error::Config("no template configured".to_owned()))?;

    let unsubscribed = SuppressionSet::load_optional(config.suppression.unsubscribed.as_ref())?;
    let bounced = SuppressionSet::load_optional(config.suppression.bounced.as_ref())?;

    let dispatcher = Dispatcher::new(template, &config.subject, renderer, config.policy())?
        .unsubscribed(&unsubscribed)
        .bounced(&bounced)
        .interrupt(interrupt.clone());

    let mailer = ConnectionManager::from_config(config)?.interrupt(interrupt);
    let mut store = RecipientStore::open(source, config.dispatch.batch_size)?;

    dispatcher.run(&mut store, &mailer)
}
