pub mod csv_storage;
pub mod memory_storage;
pub mod record;

pub use self::csv_storage::RecipientStore;
pub use self::memory_storage::MemoryStorage;
pub use self::record::{MarkOutcome, RecipientRecord, StoreCounts};

use std::vec;

use crate::error::Error;

/// A trait for implementing recipient state storage
pub trait RecipientStorage {
    /// Number of rows still eligible for delivery
    fn total_pending(&self) -> usize;

    /// Sent / failed / total counts
    fn counts(&self) -> StoreCounts;

    /// Snapshot the pending rows as of now and hand them out in batches.
    /// Call again to see state changes made since.
    fn batches(&self) -> Batches;

    /// Whether a row with this address is still pending
    fn is_pending(&self, email: &str) -> bool;

    /// Flag every row matching `email` (case-insensitively) as sent and persist
    fn mark_sent(&mut self, email: &str) -> Result<MarkOutcome, Error>;

    /// Flag every row matching `email` (case-insensitively) as failed and persist
    fn mark_failed(&mut self, email: &str) -> Result<MarkOutcome, Error>;

    /// Best-effort persist of the current state, used when a run is cut short
    fn flush(&mut self) -> Result<(), Error>;

    /// Remove recovery artifacts. Only call this after a complete run.
    fn cleanup(&mut self) -> Result<(), Error>;
}

/// Contiguous groups of pending records, in row order.
///
/// The pending set is captured when the `Batches` is created; it is not
/// restartable.
pub struct Batches {
    pending: vec::IntoIter<RecipientRecord>,
    batch_size: usize,
}

impl Batches {
    pub fn new(pending: Vec<RecipientRecord>, batch_size: usize) -> Batches {
        Batches {
            pending: pending.into_iter(),
            batch_size: batch_size.max(1),
        }
    }

    /// Records not yet handed out
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl Iterator for Batches {
    type Item = Vec<RecipientRecord>;

    fn next(&mut self) -> Option<Vec<RecipientRecord>> {
        let batch: Vec<RecipientRecord> = self.pending.by_ref().take(self.batch_size).collect();
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}
