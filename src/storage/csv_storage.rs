use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::config::DEFAULT_BATCH_SIZE;
use crate::error::Error;
use crate::storage::record::{self, MarkOutcome, RecipientRecord, StoreCounts, FLAG_OK};
use crate::storage::{Batches, RecipientStorage};

const EMAIL_COLUMN: &str = "email";
const SENT_COLUMN: &str = "sent";
const FAILED_COLUMN: &str = "failed";
const UNSUBSCRIBED_COLUMN: &str = "unsubscribed";

/// The in-memory copy of the recipient file
#[derive(Debug, Clone)]
struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    email: usize,
    sent: usize,
    failed: usize,
    unsubscribed: Option<usize>,
}

impl Table {
    fn is_pending(&self, row: &[String]) -> bool {
        record::is_pending(&row[self.sent], &row[self.failed])
    }

    fn record(&self, index: usize, row: &[String]) -> RecipientRecord {
        RecipientRecord {
            row: index,
            email: row[self.email].clone(),
            fields: self
                .headers
                .iter()
                .cloned()
                .zip(row.iter().cloned())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Flag {
    Sent,
    Failed,
}

/// File-backed recipient state.
///
/// The source CSV is copied to `<file>.bak` when the store is opened and
/// every change is written with write-to-temp-then-rename. The backup is
/// only removed by `cleanup()`, so an interrupted run leaves it behind for
/// manual recovery. Only one store may own a given file at a time.
#[derive(Debug)]
pub struct RecipientStore {
    path: PathBuf,
    backup_path: PathBuf,
    temp_path: PathBuf,
    delimiter: u8,
    batch_size: usize,
    table: Table,
}

impl RecipientStore {
    pub fn open<P: AsRef<Path>>(path: P, batch_size: usize) -> Result<RecipientStore, Error> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(Error::NotFound(path));
        }
        if is_spreadsheet(&path) {
            return Err(Error::Config(format!(
                "{} is a spreadsheet, only CSV sources are supported",
                path.display()
            )));
        }

        let batch_size = if batch_size == 0 {
            warn!("batch size 0 is invalid, using {}", DEFAULT_BATCH_SIZE);
            DEFAULT_BATCH_SIZE
        } else {
            batch_size
        };

        let backup_path = sibling(&path, "bak");
        let temp_path = sibling(&path, "temp");

        if backup_path.exists() {
            warn!(
                "found backup {} from an earlier run, replacing it",
                backup_path.display()
            );
        }
        fs::copy(&path, &backup_path)?;

        let (table, delimiter) = match load(&path) {
            Ok(loaded) => loaded,
            Err(e) => {
                if let Err(rm) = fs::remove_file(&backup_path) {
                    warn!("could not remove {}: {:?}", backup_path.display(), rm);
                }
                return Err(e);
            }
        };

        let store = RecipientStore {
            path,
            backup_path,
            temp_path,
            delimiter,
            batch_size,
            table,
        };
        info!(
            "loaded {} recipients from {} ({} pending)",
            store.table.rows.len(),
            store.path.display(),
            store.total_pending()
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Reset the `sent` flags, and the `failed` flags too if `clear_all`.
    /// The file is backed up first.
    pub fn clear_flags(&mut self, clear_all: bool) -> Result<(), Error> {
        fs::copy(&self.path, &self.backup_path)?;

        let (sent, failed) = (self.table.sent, self.table.failed);
        for row in &mut self.table.rows {
            row[sent].clear();
            if clear_all {
                row[failed].clear();
            }
        }
        info!(
            "cleared sent flags{} in {}",
            if clear_all { " and failed flags" } else { "" },
            self.path.display()
        );
        self.save()
    }

    /// Put the backup copy back over the source and reload it
    pub fn restore_backup(&mut self) -> Result<(), Error> {
        fs::copy(&self.backup_path, &self.path).map_err(|source| Error::RestoreFailed {
            path: self.path.clone(),
            source,
        })?;
        let (table, delimiter) = load(&self.path)?;
        self.table = table;
        self.delimiter = delimiter;
        info!("restored {} from backup", self.path.display());
        Ok(())
    }

    fn mark(&mut self, email: &str, flag: Flag) -> Result<MarkOutcome, Error> {
        let needle = email.trim().to_lowercase();
        let email_col = self.table.email;
        let flag_col = match flag {
            Flag::Sent => self.table.sent,
            Flag::Failed => self.table.failed,
        };

        let mut matched = 0;
        for row in &mut self.table.rows {
            if row[email_col].trim().to_lowercase() == needle {
                row[flag_col] = FLAG_OK.to_owned();
                matched += 1;
            }
        }

        if matched == 0 {
            warn!("no recipient row for {}, not marking {:?}", email, flag);
            return Ok(MarkOutcome::NotFound);
        }

        trace!("marked {} row(s) for {} as {:?}", matched, email, flag);
        self.save()?;
        Ok(MarkOutcome::Marked)
    }

    /// Write the table to `<file>.temp` and rename it over `<file>`. On any
    /// failure the source file is restored from the backup.
    fn save(&self) -> Result<(), Error> {
        let result = self
            .write_temp()
            .and_then(|()| fs::rename(&self.temp_path, &self.path));
        match result {
            Ok(()) => Ok(()),
            Err(cause) => self.recover(cause),
        }
    }

    fn write_temp(&self) -> io::Result<()> {
        let file = File::create(&self.temp_path)?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(file);
        writer.write_record(&self.table.headers)?;
        for row in &self.table.rows {
            writer.write_record(row)?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }

    fn recover(&self, cause: io::Error) -> Result<(), Error> {
        error!("saving {} failed: {:?}", self.path.display(), cause);

        if let Err(e) = fs::remove_file(&self.temp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("could not remove {}: {:?}", self.temp_path.display(), e);
            }
        }

        match fs::copy(&self.backup_path, &self.path) {
            Ok(_) => {
                warn!("restored {} from backup", self.path.display());
                Err(Error::Persistence {
                    path: self.path.clone(),
                    source: cause,
                })
            }
            Err(e) => {
                error!("restoring {} from backup failed: {:?}", self.path.display(), e);
                Err(Error::RestoreFailed {
                    path: self.path.clone(),
                    source: e,
                })
            }
        }
    }
}

impl RecipientStorage for RecipientStore {
    fn total_pending(&self) -> usize {
        let table = &self.table;
        table
            .rows
            .iter()
            .filter(|row| table.is_pending(row))
            .filter(|row| match table.unsubscribed {
                Some(col) => !record::is_truthy(&row[col]),
                None => true,
            })
            .count()
    }

    fn counts(&self) -> StoreCounts {
        let table = &self.table;
        StoreCounts {
            sent: table
                .rows
                .iter()
                .filter(|row| !row[table.sent].trim().is_empty())
                .count(),
            failed: table
                .rows
                .iter()
                .filter(|row| record::is_flag_set(&row[table.failed]))
                .count(),
            total: table.rows.len(),
        }
    }

    fn batches(&self) -> Batches {
        let table = &self.table;
        let pending: Vec<RecipientRecord> = table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| table.is_pending(row))
            .map(|(index, row)| table.record(index, row))
            .collect();
        Batches::new(pending, self.batch_size)
    }

    fn is_pending(&self, email: &str) -> bool {
        let needle = email.trim().to_lowercase();
        let table = &self.table;
        table
            .rows
            .iter()
            .any(|row| row[table.email].trim().to_lowercase() == needle && table.is_pending(row))
    }

    fn mark_sent(&mut self, email: &str) -> Result<MarkOutcome, Error> {
        self.mark(email, Flag::Sent)
    }

    fn mark_failed(&mut self, email: &str) -> Result<MarkOutcome, Error> {
        self.mark(email, Flag::Failed)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.save()
    }

    fn cleanup(&mut self) -> Result<(), Error> {
        match fs::remove_file(&self.backup_path) {
            Ok(()) => {
                debug!("removed backup {}", self.backup_path.display());
                Ok(())
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// `<path>.<ext>`, keeping the original extension
fn sibling(path: &Path, ext: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

fn is_spreadsheet(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => match ext.to_ascii_lowercase().as_str() {
            "xlsx" | "xls" | "xlsm" | "ods" => true,
            _ => false,
        },
        None => false,
    }
}

/// `;` if the header line has more of them than `,`
pub(crate) fn delimiter_for(header: &str) -> u8 {
    if header.matches(';').count() > header.matches(',').count() {
        b';'
    } else {
        b','
    }
}

fn detect_delimiter(path: &Path) -> Result<u8, Error> {
    let mut first_line = String::new();
    BufReader::new(File::open(path)?).read_line(&mut first_line)?;
    Ok(delimiter_for(&first_line))
}

fn load(path: &Path) -> Result<(Table, u8), Error> {
    let delimiter = detect_delimiter(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)?;

    let mut headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_owned())
        .collect();

    let width = headers.len();
    let email = find_column(&headers, EMAIL_COLUMN).ok_or_else(|| {
        Error::Config(format!("{} has no '{}' column", path.display(), EMAIL_COLUMN))
    })?;
    let sent = ensure_column(&mut headers, SENT_COLUMN);
    let failed = ensure_column(&mut headers, FAILED_COLUMN);
    let unsubscribed = find_column(&headers, UNSUBSCRIBED_COLUMN);

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        // extra cells would be lost on the next save
        if record.len() > width {
            let line = record.position().map_or(0, |p| p.line());
            return Err(Error::Config(format!(
                "{} line {} has {} fields but the header has {}",
                path.display(),
                line,
                record.len(),
                width
            )));
        }
        let mut row: Vec<String> = record.iter().map(|v| v.to_owned()).collect();
        row.resize(headers.len(), String::new());
        rows.push(row);
    }

    let table = Table {
        headers,
        rows,
        email,
        sent,
        failed,
        unsubscribed,
    };
    Ok((normalize_pending_emails(table), delimiter))
}

fn find_column(headers: &[String], name: &str) -> Option<usize> {
    headers.iter().position(|h| h.eq_ignore_ascii_case(name))
}

fn ensure_column(headers: &mut Vec<String>, name: &str) -> usize {
    match find_column(headers, name) {
        Some(index) => index,
        None => {
            headers.push(name.to_owned());
            headers.len() - 1
        }
    }
}

/// Lower-case the address of every row that has not been sent yet. Rows
/// already sent keep their casing so historical records are not renamed.
fn normalize_pending_emails(table: Table) -> Table {
    let Table {
        headers,
        rows,
        email,
        sent,
        failed,
        unsubscribed,
    } = table;

    let rows = rows
        .into_iter()
        .map(|mut row| {
            if row[sent].trim().is_empty() {
                row[email] = row[email].trim().to_lowercase();
            }
            row
        })
        .collect();

    Table {
        headers,
        rows,
        email,
        sent,
        failed,
        unsubscribed,
    }
}
