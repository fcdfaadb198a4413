use std::error::Error as StdError;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use lettre::address::Envelope;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{SmtpConnection, TlsParameters, TlsVersion};
use lettre::transport::smtp::extension::ClientId;
use lettre::transport::smtp::Error as LettreSmtpError;

use crate::config::SmtpConfig;
use crate::error::{Error, SmtpError, SmtpErrorKind};
use crate::smtp::classify;
use crate::smtp::{Connection, Connector};

const AUTH_MECHANISMS: &[Mechanism] = &[Mechanism::Plain, Mechanism::Login];

/// Opens authenticated sessions to the configured relay
#[derive(Clone)]
pub struct RelayConnector {
    host: String,
    port: u16,
    hello_name: ClientId,
    credentials: Option<Credentials>,
    tls_parameters: Option<TlsParameters>,
    require_tls: bool,
}

impl RelayConnector {
    pub fn new(config: &SmtpConfig) -> Result<RelayConnector, Error> {
        let tls_parameters = if config.use_tls {
            let params = TlsParameters::builder(config.host.clone())
                .set_min_tls_version(TlsVersion::Tlsv12)
                .build()
                .map_err(|e| Error::Config(format!("failed to set up TLS: {}", e)))?;
            Some(params)
        } else {
            None
        };

        let credentials = if config.has_credentials() {
            Some(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
        } else {
            None
        };

        Ok(RelayConnector {
            host: config.host.clone(),
            port: config.port,
            hello_name: ClientId::Domain(config.helo_name.clone()),
            credentials,
            tls_parameters,
            require_tls: config.require_tls,
        })
    }
}

impl RelayConnector {
    /// Connect, upgrade and authenticate with `socket_timeout` on every
    /// socket operation. Blocks for as long as the relay keeps talking.
    fn open(&self, socket_timeout: Duration) -> Result<SmtpConnection, SmtpError> {
        debug!("connecting to {}:{}", self.host, self.port);
        let mut conn = SmtpConnection::connect(
            (self.host.as_str(), self.port),
            Some(socket_timeout),
            &self.hello_name,
            None,
            None,
        )
        .map_err(smtp_error)?;

        if let Some(ref tls_parameters) = self.tls_parameters {
            if conn.can_starttls() {
                if let Err(e) = conn.starttls(tls_parameters, &self.hello_name) {
                    conn.abort();
                    return Err(smtp_error(e));
                }
                trace!("STARTTLS negotiated with {}", self.host);
            } else if self.require_tls {
                conn.abort();
                return Err(SmtpError::new(
                    SmtpErrorKind::Tls,
                    format!("{} does not offer STARTTLS", self.host),
                ));
            } else {
                warn!("{} does not offer STARTTLS, continuing in plaintext", self.host);
            }
        }

        if let Some(ref credentials) = self.credentials {
            if let Err(e) = conn.auth(AUTH_MECHANISMS, credentials) {
                conn.abort();
                let mut error = smtp_error(e);
                if error.kind == SmtpErrorKind::Rejected {
                    error.kind = SmtpErrorKind::Authentication;
                }
                return Err(error);
            }
        }

        Ok(conn)
    }
}

impl Connector for RelayConnector {
    type Connection = RelayConnection;

    fn connect(&self, deadline: Instant) -> Result<RelayConnection, SmtpError> {
        let connector = self.clone();
        let socket_timeout = remaining(deadline, "connect")?;
        let conn = before_deadline(deadline, "connect", move || connector.open(socket_timeout))?;
        Ok(RelayConnection(Some(conn)))
    }
}

/// An open, authenticated relay session. Empty once a send has been
/// abandoned at its deadline.
pub struct RelayConnection(Option<SmtpConnection>);

impl Connection for RelayConnection {
    fn send(
        &mut self,
        envelope: &Envelope,
        message: &[u8],
        deadline: Instant,
    ) -> Result<(), SmtpError> {
        let mut conn = self.0.take().ok_or_else(|| {
            SmtpError::new(
                SmtpErrorKind::Disconnected,
                "session was abandoned after a timeout",
            )
        })?;
        if let Err(e) = conn.set_timeout(Some(remaining(deadline, "send")?)) {
            debug!("could not shorten socket timeout: {}", e);
        }

        let envelope = envelope.clone();
        let message = message.to_vec();
        let (conn, result) = before_deadline(deadline, "send", move || {
            let result = conn.send(&envelope, &message);
            Ok((conn, result))
        })?;
        self.0 = Some(conn);

        let response = result.map_err(smtp_error)?;
        debug!("relay accepted message: {:?}", response);
        Ok(())
    }

    fn quit(&mut self) -> Result<(), SmtpError> {
        match self.0 {
            Some(ref mut conn) => conn.quit().map(|_| ()).map_err(smtp_error),
            None => Ok(()),
        }
    }

    fn abort(&mut self) {
        if let Some(ref mut conn) = self.0 {
            conn.abort();
        }
    }
}

fn timed_out(what: &str) -> SmtpError {
    SmtpError::new(
        SmtpErrorKind::Timeout,
        format!("{} did not finish before the attempt deadline", what),
    )
}

/// Time left before `deadline`, or a timeout error if there is none
fn remaining(deadline: Instant, what: &str) -> Result<Duration, SmtpError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left == Duration::from_secs(0) {
        Err(timed_out(what))
    } else {
        Ok(left)
    }
}

/// Run `f` on its own thread and stop waiting for it at `deadline`.
///
/// An abandoned call keeps its thread until its socket timeout fires or the
/// relay goes away; whatever it returns then is dropped, which closes the
/// socket.
fn before_deadline<T, F>(deadline: Instant, what: &str, f: F) -> Result<T, SmtpError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SmtpError> + Send + 'static,
{
    let wait = remaining(deadline, what)?;
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("smtp-{}", what))
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| {
            SmtpError::new(
                SmtpErrorKind::Other,
                format!("could not start {} thread: {}", what, e),
            )
        })?;

    match rx.recv_timeout(wait) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            warn!("{} abandoned at the attempt deadline", what);
            Err(timed_out(what))
        }
        Err(RecvTimeoutError::Disconnected) => Err(SmtpError::new(
            SmtpErrorKind::Other,
            format!("{} thread ended without a result", what),
        )),
    }
}

/// Put a name to a lettre error
fn smtp_error(e: LettreSmtpError) -> SmtpError {
    let message = e.to_string();
    let code = e.status().map(|c| c.to_string());

    let kind = if e.is_timeout() {
        SmtpErrorKind::Timeout
    } else if e.is_tls() {
        SmtpErrorKind::Tls
    } else if e.is_transient() {
        match code.as_deref() {
            Some("421") => SmtpErrorKind::Disconnected,
            _ => SmtpErrorKind::Transient,
        }
    } else if e.is_permanent() {
        match code.as_deref() {
            Some("530") | Some("534") | Some("535") | Some("538") => SmtpErrorKind::Authentication,
            _ => SmtpErrorKind::Rejected,
        }
    } else {
        match StdError::source(&e).and_then(|s| s.downcast_ref::<io::Error>()) {
            Some(ioe) => classify::io_kind(ioe),
            None => SmtpErrorKind::Other,
        }
    };

    SmtpError::new(kind, message)
}
