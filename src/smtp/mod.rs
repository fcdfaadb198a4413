pub mod classify;
pub mod message;
pub mod relay;

pub use self::classify::FailureClass;
pub use self::relay::{RelayConnection, RelayConnector};

use std::cmp;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use lettre::address::Envelope;

use crate::config::Config;
use crate::dispatch::Interrupt;
use crate::error::{Error, SmtpError, SmtpErrorKind};

/// An established, authenticated session with the mail relay
pub trait Connection {
    /// Give up with `SmtpErrorKind::Timeout` once `deadline` passes
    fn send(
        &mut self,
        envelope: &Envelope,
        message: &[u8],
        deadline: Instant,
    ) -> Result<(), SmtpError>;

    /// Graceful shutdown (QUIT)
    fn quit(&mut self) -> Result<(), SmtpError>;

    /// Drop the socket without ceremony
    fn abort(&mut self);
}

/// Something that can open a `Connection`: resolve, connect, optionally
/// STARTTLS, then authenticate, all before `deadline`.
pub trait Connector {
    type Connection: Connection;

    fn connect(&self, deadline: Instant) -> Result<Self::Connection, SmtpError>;
}

/// The delivery seam the dispatch loop talks to
pub trait Mailer {
    fn send_email(&self, to: &str, subject: &str, body: &str, is_html: bool) -> Result<(), Error>;
}

/// A connection that is closed when it goes out of scope, with QUIT if
/// possible and a hard close otherwise.
pub struct ScopedConnection<C: Connection> {
    inner: C,
}

impl<C: Connection> Deref for ScopedConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.inner
    }
}

impl<C: Connection> DerefMut for ScopedConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.inner
    }
}

impl<C: Connection> Drop for ScopedConnection<C> {
    fn drop(&mut self) {
        if let Err(e) = self.inner.quit() {
            debug!("QUIT failed ({}), closing connection", e);
            self.inner.abort();
        }
    }
}

/// Owns the way to the relay: bounded reconnects, scoped sessions, and
/// message sending.
///
/// Each `send_email` call is one delivery attempt. Every reconnect, the
/// send itself and the single resend after a disconnect share one deadline
/// of `timeout` from the start of the call.
pub struct ConnectionManager<C> {
    connector: C,
    sender: String,
    helo_name: String,
    retry_attempts: u32,
    retry_delay: Duration,
    timeout: Duration,
    interrupt: Interrupt,
}

impl ConnectionManager<RelayConnector> {
    pub fn from_config(config: &Config) -> Result<ConnectionManager<RelayConnector>, Error> {
        let connector = RelayConnector::new(&config.smtp)?;
        Ok(ConnectionManager::new(connector, &config.sender, &config.smtp.helo_name)
            .retries(
                config.dispatch.retry_attempts,
                Duration::from_secs(config.dispatch.retry_delay),
            )
            .timeout(Duration::from_secs(config.dispatch.send_timeout)))
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, sender: &str, helo_name: &str) -> ConnectionManager<C> {
        ConnectionManager {
            connector,
            sender: sender.to_owned(),
            helo_name: helo_name.to_owned(),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
            interrupt: Interrupt::new(),
        }
    }

    pub fn retries(mut self, attempts: u32, delay: Duration) -> ConnectionManager<C> {
        self.retry_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    /// Deadline for one delivery attempt, connecting included
    pub fn timeout(mut self, timeout: Duration) -> ConnectionManager<C> {
        self.timeout = timeout;
        self
    }

    /// Stop waiting between reconnects when `interrupt` trips
    pub fn interrupt(mut self, interrupt: Interrupt) -> ConnectionManager<C> {
        self.interrupt = interrupt;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Open a connection, retrying up to `retry_attempts` times before
    /// `deadline`. Fails with `Error::Interrupted` if the interrupt trips
    /// while waiting to retry.
    pub fn connection(&self, deadline: Instant) -> Result<ScopedConnection<C::Connection>, Error> {
        let attempts = self.retry_attempts;
        let mut last_error: Option<SmtpError> = None;

        for attempt in 1..=attempts {
            if self.interrupt.is_set() {
                return Err(Error::Interrupted);
            }
            if Instant::now() >= deadline {
                let message = match last_error {
                    Some(ref e) => format!("attempt deadline passed, last error: {}", e),
                    None => "attempt deadline passed before connecting".to_owned(),
                };
                return Err(Error::Connection {
                    attempts: attempt - 1,
                    source: SmtpError::new(SmtpErrorKind::Timeout, message),
                });
            }

            match self.connector.connect(deadline) {
                Ok(inner) => {
                    trace!("connected on attempt {}/{}", attempt, attempts);
                    return Ok(ScopedConnection { inner });
                }
                Err(e) => {
                    warn!("connect attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if !self.interrupt.sleep(cmp::min(self.retry_delay, remaining)) {
                            return Err(Error::Interrupted);
                        }
                    }
                }
            }
        }

        Err(Error::Connection {
            attempts,
            source: last_error
                .unwrap_or_else(|| SmtpError::new(SmtpErrorKind::Other, "no connection attempted")),
        })
    }

    /// Run `f` with an open connection, closing it afterwards whatever `f`
    /// returns.
    pub fn with_connection<T, F>(&self, deadline: Instant, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut C::Connection) -> Result<T, Error>,
    {
        let mut connection = self.connection(deadline)?;
        let result = f(&mut *connection);
        result
    }
}

impl<C: Connector> Mailer for ConnectionManager<C> {
    fn send_email(&self, to: &str, subject: &str, body: &str, is_html: bool) -> Result<(), Error> {
        let message = message::build_message(
            &self.sender,
            &self.helo_name,
            to,
            subject,
            body,
            is_html,
        )?;
        let envelope = message.envelope().clone();
        let formatted = message.formatted();
        let deadline = Instant::now() + self.timeout;

        let send = |conn: &mut C::Connection| -> Result<(), Error> {
            conn.send(&envelope, &formatted, deadline).map_err(Error::from)
        };

        match self.with_connection(deadline, send) {
            Err(Error::Smtp(ref e)) if e.is_disconnect() => {
                warn!("relay dropped the connection sending to {}, reconnecting once", to);
                self.with_connection(deadline, send)
            }
            result => result,
        }
    }
}
