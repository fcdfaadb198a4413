use std::collections::HashSet;
use std::fs;
use std::iter::FromIterator;
use std::path::Path;

use crate::error::Error;
use crate::storage::csv_storage::delimiter_for;

/// Addresses that must never receive mail (unsubscribed or bounced).
///
/// Entries are trimmed and lower-cased on the way in, and lookups are
/// normalized the same way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuppressionSet(HashSet<String>);

pub fn normalize(email: &str) -> String {
    email.trim().to_lowercase()
}

impl SuppressionSet {
    pub fn new() -> SuppressionSet {
        SuppressionSet(HashSet::new())
    }

    /// Load a list file.
    ///
    /// A file whose first entry has no `@` is read as CSV with that entry as
    /// the header: addresses come from the `email` column, or from the only
    /// column if there is just one. Anything else is one address per line.
    /// Blank lines and `#` comments are skipped in both forms.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<SuppressionSet, Error> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;

        let first = contents
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'));
        let set = match first {
            Some(header) if !header.contains('@') => from_table(path, &contents, header)?,
            _ => from_lines(&contents),
        };

        info!("loaded {} suppressed addresses from {}", set.len(), path.display());
        Ok(set)
    }

    /// Like `load`, but a missing path gives an empty set
    pub fn load_optional<P: AsRef<Path>>(path: Option<P>) -> Result<SuppressionSet, Error> {
        match path {
            Some(ref p) if p.as_ref().exists() => SuppressionSet::load(p),
            Some(ref p) => {
                warn!("suppression list {} does not exist", p.as_ref().display());
                Ok(SuppressionSet::new())
            }
            None => Ok(SuppressionSet::new()),
        }
    }

    pub fn contains(&self, email: &str) -> bool {
        self.0.contains(&normalize(email))
    }

    pub fn insert(&mut self, email: &str) -> bool {
        self.0.insert(normalize(email))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn from_lines(contents: &str) -> SuppressionSet {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect()
}

fn from_table(path: &Path, contents: &str, header: &str) -> Result<SuppressionSet, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter_for(header))
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(contents.as_bytes());

    let headers = reader.headers()?.clone();
    let column = headers
        .iter()
        .position(|h| h.trim_start_matches('\u{feff}').trim().eq_ignore_ascii_case("email"));
    let column = match column {
        Some(index) => index,
        None if headers.len() == 1 => {
            warn!(
                "{} has no email column, reading addresses under {:?}",
                path.display(),
                &headers[0]
            );
            0
        }
        None => {
            return Err(Error::Config(format!(
                "{} has no 'email' column",
                path.display()
            )))
        }
    };

    let mut set = SuppressionSet::new();
    for record in reader.records() {
        let record = record?;
        match record.get(column).map(str::trim) {
            Some(value) if !value.is_empty() => {
                set.insert(value);
            }
            _ => {}
        }
    }
    Ok(set)
}

impl<S: AsRef<str>> FromIterator<S> for SuppressionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> SuppressionSet {
        SuppressionSet(iter.into_iter().map(|s| normalize(s.as_ref())).collect())
    }
}
