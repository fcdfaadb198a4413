use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::smtp::classify::{self, FailureClass};

/// The structured cause of an SMTP failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmtpErrorKind {
    /// A socket operation ran past its deadline
    Timeout,
    /// The relay host name could not be resolved
    Dns,
    /// The relay refused the TCP connection
    Refused,
    /// The connection was reset or aborted by the peer
    Reset,
    /// No route to the relay's network or host
    Unreachable,
    /// The server closed the session (421, EOF, broken pipe)
    Disconnected,
    /// TLS negotiation failed or STARTTLS was required but not offered
    Tls,
    /// The relay rejected our credentials
    Authentication,
    /// 4xx reply
    Transient,
    /// 5xx reply other than authentication
    Rejected,
    /// Anything we could not put a name to
    Other,
}

/// An error reported by the networking layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpError {
    pub kind: SmtpErrorKind,
    pub message: String,
}

impl SmtpError {
    pub fn new<S: Into<String>>(kind: SmtpErrorKind, message: S) -> SmtpError {
        SmtpError {
            kind,
            message: message.into(),
        }
    }

    pub fn is_disconnect(&self) -> bool {
        self.kind == SmtpErrorKind::Disconnected
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for SmtpError {}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("recipient source not found: {0}")]
    NotFound(PathBuf),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The save failed but the source file was restored from its backup
    #[error("failed to save {path}, restored from backup: {source}")]
    Persistence { path: PathBuf, source: io::Error },

    /// The save failed and the backup could not be put back either
    #[error("failed to save {path} and failed to restore its backup: {source}")]
    RestoreFailed { path: PathBuf, source: io::Error },

    #[error("could not connect after {attempts} attempt(s): {source}")]
    Connection { attempts: u32, source: SmtpError },

    #[error("SMTP error: {0}")]
    Smtp(#[from] SmtpError),

    #[error("invalid address: {0}")]
    Address(String),

    #[error("could not build message: {0}")]
    Message(String),

    #[error("could not render template: {0}")]
    Render(String),

    /// The run was asked to stop while waiting to reconnect
    #[error("interrupted")]
    Interrupted,
}

impl Error {
    /// Whether a delivery failing with this error is worth another attempt
    pub fn failure_class(&self) -> FailureClass {
        match *self {
            Error::Connection { ref source, .. } | Error::Smtp(ref source) => {
                classify::classify_smtp(source)
            }
            Error::Io(ref e) => classify::classify_io(e),
            _ => FailureClass::Terminal,
        }
    }

    /// Errors after which the recipient store can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        match *self {
            Error::RestoreFailed { .. } => true,
            _ => false,
        }
    }
}
