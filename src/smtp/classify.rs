use std::io::{self, ErrorKind};

use crate::error::{SmtpError, SmtpErrorKind};

/// Whether a failed delivery attempt should be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transient network trouble; try again
    Connection,
    /// Retrying will not help
    Terminal,
}

/// Lower-case phrases that mark an otherwise opaque error message as a
/// transient network failure. Only consulted when nothing structured is
/// available.
pub const CONNECTION_ERROR_PHRASES: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "connection aborted",
    "connection closed",
    "connection lost",
    "connection unexpectedly closed",
    "server disconnected",
    "not connected",
    "broken pipe",
    "network is unreachable",
    "network is down",
    "host is unreachable",
    "no route to host",
    "name or service not known",
    "temporary failure in name resolution",
    "nodename nor servname provided",
    "failed to lookup address",
    "no address associated with hostname",
    "getaddrinfo",
    "dns",
    "unexpected eof",
    "end of file",
    "resource temporarily unavailable",
    "try again",
    "service not available",
    "too many connections",
];

pub fn classify_smtp(error: &SmtpError) -> FailureClass {
    match error.kind {
        SmtpErrorKind::Timeout
        | SmtpErrorKind::Dns
        | SmtpErrorKind::Refused
        | SmtpErrorKind::Reset
        | SmtpErrorKind::Unreachable
        | SmtpErrorKind::Disconnected
        | SmtpErrorKind::Transient => FailureClass::Connection,
        SmtpErrorKind::Tls | SmtpErrorKind::Authentication | SmtpErrorKind::Rejected => {
            FailureClass::Terminal
        }
        SmtpErrorKind::Other => classify_message(&error.message),
    }
}

pub fn classify_io(error: &io::Error) -> FailureClass {
    match io_kind(error) {
        SmtpErrorKind::Other => classify_message(&error.to_string()),
        kind => classify_smtp(&SmtpError::new(kind, String::new())),
    }
}

/// Fallback for messages we get no structure with
pub fn classify_message(message: &str) -> FailureClass {
    let lower = message.to_lowercase();
    if CONNECTION_ERROR_PHRASES.iter().any(|p| lower.contains(p)) {
        FailureClass::Connection
    } else {
        FailureClass::Terminal
    }
}

/// Name the network failure behind an I/O error
pub fn io_kind(error: &io::Error) -> SmtpErrorKind {
    match error.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => SmtpErrorKind::Timeout,
        ErrorKind::ConnectionRefused => SmtpErrorKind::Refused,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => SmtpErrorKind::Reset,
        ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof | ErrorKind::NotConnected => {
            SmtpErrorKind::Disconnected
        }
        _ => match error.raw_os_error() {
            Some(libc::ENETUNREACH) | Some(libc::EHOSTUNREACH) | Some(libc::ENETDOWN) => {
                SmtpErrorKind::Unreachable
            }
            Some(libc::ETIMEDOUT) => SmtpErrorKind::Timeout,
            _ => {
                let lower = error.to_string().to_lowercase();
                if lower.contains("failed to lookup address")
                    || lower.contains("name or service not known")
                    || lower.contains("temporary failure in name resolution")
                {
                    SmtpErrorKind::Dns
                } else {
                    SmtpErrorKind::Other
                }
            }
        },
    }
}
