use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use lettre::address::Envelope;
use tempfile::TempDir;

use crate::dispatch::{DispatchOutcome, DispatchPolicy, Dispatcher, Interrupt};
use crate::error::{Error, SmtpError, SmtpErrorKind};
use crate::smtp::{Connection, ConnectionManager, Connector};
use crate::storage::{MemoryStorage, RecipientRecord, RecipientStorage, RecipientStore};
use crate::suppression::SuppressionSet;
use crate::Config;

#[derive(Default)]
struct Relay {
    /// Address -> error returned on every send to it
    failing: HashMap<String, SmtpError>,
    sends: usize,
    delivered: Vec<String>,
}

#[derive(Clone, Default)]
struct ScriptedConnector(Rc<RefCell<Relay>>);

struct ScriptedConnection(Rc<RefCell<Relay>>);

impl ScriptedConnector {
    fn fail(&self, address: &str, kind: SmtpErrorKind, message: &str) {
        self.0
            .borrow_mut()
            .failing
            .insert(address.to_owned(), SmtpError::new(kind, message));
    }

    fn delivered(&self) -> Vec<String> {
        self.0.borrow().delivered.clone()
    }

    fn sends(&self) -> usize {
        self.0.borrow().sends
    }
}

impl Connector for ScriptedConnector {
    type Connection = ScriptedConnection;

    fn connect(&self, _deadline: Instant) -> Result<ScriptedConnection, SmtpError> {
        Ok(ScriptedConnection(self.0.clone()))
    }
}

impl Connection for ScriptedConnection {
    fn send(
        &mut self,
        envelope: &Envelope,
        _message: &[u8],
        _deadline: Instant,
    ) -> Result<(), SmtpError> {
        let mut relay = self.0.borrow_mut();
        relay.sends += 1;
        let to = envelope.to()[0].to_string();
        match relay.failing.get(&to) {
            Some(e) => Err(e.clone()),
            None => {
                relay.delivered.push(to);
                Ok(())
            }
        }
    }

    fn quit(&mut self) -> Result<(), SmtpError> {
        Ok(())
    }

    fn abort(&mut self) {}
}

fn render(_template: &Path, recipient: &RecipientRecord, subject: &str) -> Result<String, Error> {
    Ok(format!(
        "<h1>{}</h1><p>Hello {}</p>",
        subject,
        recipient.get("name").unwrap_or("there")
    ))
}

struct Fixture {
    _dir: TempDir,
    source: PathBuf,
    template: PathBuf,
}

fn fixture(csv: &str) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("recipients.csv");
    let template = dir.path().join("template.html");
    fs::write(&source, csv).unwrap();
    fs::write(&template, "<p>Hello {{name}}</p>").unwrap();
    Fixture {
        _dir: dir,
        source,
        template,
    }
}

fn quick_policy(retry_attempts: u32) -> DispatchPolicy {
    DispatchPolicy {
        retry_attempts,
        retry_delay: Duration::from_secs(0),
        send_timeout: Duration::from_secs(5),
        batch_delay: Duration::from_secs(0),
        max_retry_window: Duration::from_secs(5 * 60),
    }
}

fn mailer(connector: &ScriptedConnector) -> ConnectionManager<ScriptedConnector> {
    ConnectionManager::new(connector.clone(), "Campaigns <news@example.com>", "localhost")
        .retries(3, Duration::from_secs(0))
}

#[test]
fn sends_pending_rows_and_marks_them() {
    let fx = fixture("email,sent\na@x.com,\nb@x.com,ok\nc@x.com,\n");
    let connector = ScriptedConnector::default();
    let mut store = RecipientStore::open(&fx.source, 10).unwrap();

    let dispatcher = Dispatcher::new(&fx.template, "News", render, quick_policy(3)).unwrap();
    let outcome = dispatcher.run(&mut store, &mailer(&connector)).unwrap();

    assert_eq!(outcome.successful, 2);
    assert_eq!(outcome.failed, 0);
    assert_eq!(outcome.skipped(), 0);
    assert!(!outcome.interrupted);
    assert_eq!(connector.delivered(), vec!["a@x.com".to_owned(), "c@x.com".to_owned()]);

    assert_eq!(
        fs::read_to_string(&fx.source).unwrap(),
        "email,sent,failed\na@x.com,ok,\nb@x.com,ok,\nc@x.com,ok,\n"
    );
    assert!(!store.backup_path().exists());
}

#[test]
fn second_run_sends_nothing() {
    let fx = fixture("email,name\na@x.com,Alice\nb@x.com,Bob\n");
    let connector = ScriptedConnector::default();
    let dispatcher = Dispatcher::new(&fx.template, "News", render, quick_policy(3)).unwrap();

    let mut store = RecipientStore::open(&fx.source, 1).unwrap();
    assert_eq!(dispatcher.run(&mut store, &mailer(&connector)).unwrap().successful, 2);

    let mut store = RecipientStore::open(&fx.source, 1).unwrap();
    let outcome = dispatcher.run(&mut store, &mailer(&connector)).unwrap();
    assert_eq!(outcome.successful, 0);
    assert_eq!(outcome.attempts, 0);
    assert_eq!(connector.sends(), 2);
}

#[test]
fn bounced_wins_over_unsubscribed() {
    let fx = fixture("email\nboth@x.com\nunsub@x.com\nok@x.com\n");
    let connector = ScriptedConnector::default();
    let bounced: SuppressionSet = vec!["Both@x.com"].into_iter().collect();
    let unsubscribed: SuppressionSet = vec!["both@x.com", "unsub@x.com"].into_iter().collect();

    let mut store = RecipientStore::open(&fx.source, 10).unwrap();
    let dispatcher = Dispatcher::new(&fx.template, "News", render, quick_policy(3))
        .unwrap()
        .unsubscribed(&unsubscribed)
        .bounced(&bounced);
    let outcome = dispatcher.run(&mut store, &mailer(&connector)).unwrap();

    assert_eq!(outcome.skipped_bounced, 1);
    assert_eq!(outcome.skipped_unsubscribed, 1);
    assert_eq!(outcome.successful, 1);
    assert_eq!(connector.delivered(), vec!["ok@x.com".to_owned()]);
    // suppressed rows are left untouched
    assert!(store.is_pending("both@x.com"));
    assert!(store.is_pending("unsub@x.com"));
}

#[test]
fn persistent_timeout_uses_every_attempt() {
    let fx = fixture("email\nslow@x.com\n");
    let connector = ScriptedConnector::default();
    connector.fail("slow@x.com", SmtpErrorKind::Other, "read timeout waiting for reply");

    let mut store = RecipientStore::open(&fx.source, 10).unwrap();
    let dispatcher = Dispatcher::new(&fx.template, "News", render, quick_policy(3)).unwrap();
    let outcome = dispatcher.run(&mut store, &mailer(&connector)).unwrap();

    assert_eq!(outcome.attempts, 3);
    assert_eq!(connector.sends(), 3);
    assert_eq!(outcome.failed, 1);
    assert_eq!(store.counts().failed, 1);
    assert!(!store.is_pending("slow@x.com"));
}

#[test]
fn authentication_failure_is_not_retried() {
    let fx = fixture("email\nlocked@x.com\n");
    let connector = ScriptedConnector::default();
    connector.fail("locked@x.com", SmtpErrorKind::Other, "535 authentication failed");

    let mut store = RecipientStore::open(&fx.source, 10).unwrap();
    let dispatcher = Dispatcher::new(&fx.template, "News", render, quick_policy(3)).unwrap();
    let outcome = dispatcher.run(&mut store, &mailer(&connector)).unwrap();

    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.failed, 1);
}

#[test]
fn exhausted_retry_window_stops_retrying() {
    let fx = fixture("email\nslow@x.com\n");
    let connector = ScriptedConnector::default();
    connector.fail("slow@x.com", SmtpErrorKind::Timeout, "deadline passed");

    let mut policy = quick_policy(10);
    policy.max_retry_window = Duration::from_secs(0);

    let mut store = RecipientStore::open(&fx.source, 10).unwrap();
    let dispatcher = Dispatcher::new(&fx.template, "News", render, policy).unwrap();
    let outcome = dispatcher.run(&mut store, &mailer(&connector)).unwrap();

    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.failed, 1);
}

#[test]
fn one_failure_does_not_stop_the_run() {
    let fx = fixture("email\nbad@x.com\ngood@x.com\n");
    let connector = ScriptedConnector::default();
    connector.fail("bad@x.com", SmtpErrorKind::Rejected, "550 no such user");

    let mut store = RecipientStore::open(&fx.source, 10).unwrap();
    let dispatcher = Dispatcher::new(&fx.template, "News", render, quick_policy(3)).unwrap();
    let outcome = dispatcher.run(&mut store, &mailer(&connector)).unwrap();

    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.successful, 1);
    assert_eq!(
        fs::read_to_string(&fx.source).unwrap(),
        "email,sent,failed\nbad@x.com,,ok\ngood@x.com,ok,\n"
    );
}

#[test]
fn invalid_rows_are_skipped() {
    let fx = fixture("email,name\n,Nobody\nnan,Pandas\nnot-an-address,Typo\nreal@x.com,Real\n");
    let connector = ScriptedConnector::default();

    let mut store = RecipientStore::open(&fx.source, 10).unwrap();
    let dispatcher = Dispatcher::new(&fx.template, "News", render, quick_policy(3)).unwrap();
    let outcome = dispatcher.run(&mut store, &mailer(&connector)).unwrap();

    assert_eq!(outcome.skipped_invalid, 3);
    assert_eq!(outcome.successful, 1);
    // the two rows with something in the email column are marked failed
    assert_eq!(store.counts().failed, 2);
    assert_eq!(store.total_pending(), 1);
}

#[test]
fn duplicate_addresses_are_sent_once() {
    let fx = fixture("email\ndup@x.com\nDUP@x.com\n");
    let connector = ScriptedConnector::default();

    let mut store = RecipientStore::open(&fx.source, 10).unwrap();
    let dispatcher = Dispatcher::new(&fx.template, "News", render, quick_policy(3)).unwrap();
    let outcome = dispatcher.run(&mut store, &mailer(&connector)).unwrap();

    assert_eq!(outcome.successful, 1);
    assert_eq!(connector.sends(), 1);
    assert_eq!(store.counts().sent, 2);
}

#[test]
fn interrupted_run_keeps_backup() {
    let fx = fixture("email\na@x.com\nb@x.com\nc@x.com\n");
    let connector = ScriptedConnector::default();
    let interrupt = Interrupt::new();
    let trip = interrupt.clone();

    let stop_after_first = move |_: &Path, _: &RecipientRecord, _: &str| -> Result<String, Error> {
        trip.trigger();
        Ok("<p>hi</p>".to_owned())
    };

    let mut store = RecipientStore::open(&fx.source, 10).unwrap();
    let dispatcher = Dispatcher::new(&fx.template, "News", stop_after_first, quick_policy(3))
        .unwrap()
        .interrupt(interrupt);
    let outcome = dispatcher.run(&mut store, &mailer(&connector)).unwrap();

    assert!(outcome.interrupted);
    assert_eq!(outcome.exit_code(), 130);
    assert_eq!(outcome.successful, 1);
    assert!(store.backup_path().exists());
    assert_eq!(store.total_pending(), 2);

    let reopened = RecipientStore::open(&fx.source, 10).unwrap();
    assert_eq!(reopened.total_pending(), 2);
}

const PACE: Duration = Duration::from_millis(400);

fn paced_run(csv: &str, bounced: &SuppressionSet) -> (DispatchOutcome, Duration) {
    let fx = fixture(csv);
    let connector = ScriptedConnector::default();
    let mut policy = quick_policy(1);
    policy.batch_delay = PACE;

    let mut store = RecipientStore::open(&fx.source, 1).unwrap();
    let dispatcher = Dispatcher::new(&fx.template, "News", render, policy)
        .unwrap()
        .bounced(bounced);

    let started = Instant::now();
    let outcome = dispatcher.run(&mut store, &mailer(&connector)).unwrap();
    (outcome, started.elapsed())
}

#[test]
fn pauses_once_between_two_attempted_batches() {
    let (outcome, elapsed) = paced_run("email\na@x.com\nb@x.com\n", &SuppressionSet::new());
    assert_eq!(outcome.successful, 2);
    assert!(elapsed >= PACE, "no pause between batches: {:?}", elapsed);
    assert!(elapsed < PACE * 2, "paused after the last batch: {:?}", elapsed);
}

#[test]
fn no_pause_after_the_last_batch() {
    let (outcome, elapsed) = paced_run("email\na@x.com\n", &SuppressionSet::new());
    assert_eq!(outcome.successful, 1);
    assert!(elapsed < PACE, "paused after the only batch: {:?}", elapsed);
}

#[test]
fn no_pause_after_a_fully_suppressed_batch() {
    let bounced: SuppressionSet = vec!["gone@x.com"].into_iter().collect();
    let (outcome, elapsed) = paced_run("email\ngone@x.com\na@x.com\n", &bounced);
    assert_eq!(outcome.skipped_bounced, 1);
    assert_eq!(outcome.successful, 1);
    assert!(elapsed < PACE, "paused after a batch with nothing sent: {:?}", elapsed);
}

#[test]
fn interrupt_during_pacing_stops_between_batches() {
    let fx = fixture("email\na@x.com\nb@x.com\n");
    let connector = ScriptedConnector::default();
    let interrupt = Interrupt::new();
    let trip = interrupt.clone();

    let trip_on_send = move |_: &Path, _: &RecipientRecord, _: &str| -> Result<String, Error> {
        trip.trigger();
        Ok("<p>hi</p>".to_owned())
    };

    let mut policy = quick_policy(1);
    policy.batch_delay = Duration::from_secs(3600);

    let mut store = RecipientStore::open(&fx.source, 1).unwrap();
    let dispatcher = Dispatcher::new(&fx.template, "News", trip_on_send, policy)
        .unwrap()
        .interrupt(interrupt);
    let outcome = dispatcher.run(&mut store, &mailer(&connector)).unwrap();

    assert!(outcome.interrupted);
    assert_eq!(connector.delivered(), vec!["a@x.com".to_owned()]);
}

#[test]
fn render_failure_fails_the_recipient() {
    let fx = fixture("email\na@x.com\n");
    let connector = ScriptedConnector::default();
    let broken = |_: &Path, _: &RecipientRecord, _: &str| -> Result<String, Error> {
        Err(Error::Render("unknown placeholder {{surname}}".to_owned()))
    };

    let mut store = RecipientStore::open(&fx.source, 10).unwrap();
    let dispatcher = Dispatcher::new(&fx.template, "News", broken, quick_policy(3)).unwrap();
    let outcome = dispatcher.run(&mut store, &mailer(&connector)).unwrap();

    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(connector.sends(), 0);
}

#[test]
fn query_sourced_recipients_share_the_loop() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("template.html");
    fs::write(&template, "<p>hi</p>").unwrap();

    let connector = ScriptedConnector::default();
    connector.fail("b@x.com", SmtpErrorKind::Rejected, "550 rejected");
    let unsubscribed: SuppressionSet = vec!["c@x.com"].into_iter().collect();

    let mut storage = MemoryStorage::new(vec![(11, "a@x.com"), (12, "b@x.com"), (13, "c@x.com")], 2);
    let dispatcher = Dispatcher::new(&template, "News", render, quick_policy(3))
        .unwrap()
        .unsubscribed(&unsubscribed);
    let outcome = dispatcher.run(&mut storage, &mailer(&connector)).unwrap();

    assert_eq!(outcome.successful, 1);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.skipped_unsubscribed, 1);
    assert_eq!(storage.sent_ids(), vec!["11"]);
    assert_eq!(storage.failed_ids(), vec!["12"]);
}

#[test]
fn missing_template_is_rejected_up_front() {
    let fx = fixture("email\na@x.com\n");
    match Dispatcher::new(fx.source.with_file_name("missing.html"), "News", render, quick_policy(3)) {
        Err(Error::Config(msg)) => assert!(msg.contains("missing.html")),
        Err(e) => panic!("unexpected error: {:?}", e),
        Ok(_) => panic!("expected a config error"),
    }
}

#[test]
fn dispatch_file_requires_a_template() {
    let fx = fixture("email\na@x.com\n");
    let mut config = Config::default();
    config.sender = "news@example.com".to_owned();

    match crate::dispatch_file(&config, &fx.source, render, Interrupt::new()) {
        Err(Error::Config(_)) => {}
        other => panic!("unexpected: {:?}", other),
    }
    // nothing was touched
    assert!(!fx.source.with_extension("csv.bak").exists());
}
