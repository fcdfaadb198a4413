
/// Value written to the `sent` / `failed` columns once a flag is raised
pub const FLAG_OK: &str = "ok";

/// One recipient row, as handed to the renderer and the dispatch loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientRecord {
    /// Position of the row in the source, in original order
    pub row: usize,

    /// The `email` column (lower-cased if the row was pending at load time)
    pub email: String,

    /// Every column of the row, including `email`, `sent` and `failed`, in
    /// source column order
    pub fields: Vec<(String, String)>,
}

impl RecipientRecord {
    /// Look up a column by name
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }
}

/// Outcome of a `mark_sent` / `mark_failed` call that did not error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// At least one row was flagged and the change is on disk
    Marked,
    /// No row matched the address; nothing changed
    NotFound,
}

/// Sent / failed / total counts, logged when nothing is pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreCounts {
    pub sent: usize,
    pub failed: usize,
    pub total: usize,
}

pub fn is_flag_set(value: &str) -> bool {
    value.trim() == FLAG_OK
}

/// A row is pending if it was neither sent nor given up on
pub fn is_pending(sent: &str, failed: &str) -> bool {
    sent.trim().is_empty() && !is_flag_set(failed)
}

pub fn is_truthy(value: &str) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "ok" | "true" | "yes" | "1" => true,
        _ => false,
    }
}
