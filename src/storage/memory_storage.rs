use crate::config::DEFAULT_BATCH_SIZE;
use crate::error::Error;
use crate::storage::record::{MarkOutcome, RecipientRecord, StoreCounts, FLAG_OK};
use crate::storage::{Batches, RecipientStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Sent,
    Failed,
}

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    email: String,
    state: State,
}

/// Recipients that come from a selection query rather than a file.
///
/// The caller feeds an ordered, already filtered list of `(id, email)`
/// pairs and reads the final state back with `sent_ids` / `failed_ids`.
/// Nothing is persisted.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Vec<Entry>,
    batch_size: usize,
}

impl MemoryStorage {
    pub fn new<I, S, T>(recipients: I, batch_size: usize) -> MemoryStorage
    where
        I: IntoIterator<Item = (S, T)>,
        S: ToString,
        T: AsRef<str>,
    {
        MemoryStorage {
            entries: recipients
                .into_iter()
                .map(|(id, email)| Entry {
                    id: id.to_string(),
                    email: email.as_ref().trim().to_lowercase(),
                    state: State::Pending,
                })
                .collect(),
            batch_size: if batch_size == 0 {
                DEFAULT_BATCH_SIZE
            } else {
                batch_size
            },
        }
    }

    pub fn sent_ids(&self) -> Vec<&str> {
        self.ids_in(State::Sent)
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.ids_in(State::Failed)
    }

    fn ids_in(&self, state: State) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.state == state)
            .map(|e| e.id.as_str())
            .collect()
    }

    fn mark(&mut self, email: &str, state: State) -> MarkOutcome {
        let needle = email.trim().to_lowercase();
        let mut outcome = MarkOutcome::NotFound;
        for entry in self.entries.iter_mut().filter(|e| e.email == needle) {
            entry.state = state;
            outcome = MarkOutcome::Marked;
        }
        if outcome == MarkOutcome::NotFound {
            warn!("no queued recipient for {}, not marking {:?}", email, state);
        }
        outcome
    }
}

fn flag(set: bool) -> String {
    if set {
        FLAG_OK.to_owned()
    } else {
        String::new()
    }
}

impl RecipientStorage for MemoryStorage {
    fn total_pending(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == State::Pending)
            .count()
    }

    fn counts(&self) -> StoreCounts {
        StoreCounts {
            sent: self.ids_in(State::Sent).len(),
            failed: self.ids_in(State::Failed).len(),
            total: self.entries.len(),
        }
    }

    fn batches(&self) -> Batches {
        let pending = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == State::Pending)
            .map(|(row, e)| RecipientRecord {
                row,
                email: e.email.clone(),
                fields: vec![
                    ("id".to_owned(), e.id.clone()),
                    ("email".to_owned(), e.email.clone()),
                    ("sent".to_owned(), flag(e.state == State::Sent)),
                    ("failed".to_owned(), flag(e.state == State::Failed)),
                ],
            })
            .collect();
        Batches::new(pending, self.batch_size)
    }

    fn is_pending(&self, email: &str) -> bool {
        let needle = email.trim().to_lowercase();
        self.entries
            .iter()
            .any(|e| e.email == needle && e.state == State::Pending)
    }

    fn mark_sent(&mut self, email: &str) -> Result<MarkOutcome, Error> {
        Ok(self.mark(email, State::Sent))
    }

    fn mark_failed(&mut self, email: &str) -> Result<MarkOutcome, Error> {
        Ok(self.mark(email, State::Failed))
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
