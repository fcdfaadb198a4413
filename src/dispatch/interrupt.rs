use std::cmp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use signal_hook::consts::SIGINT;
use signal_hook::{flag, SigId};

use crate::dispatch::INTERRUPTED_EXIT_CODE;
use crate::error::Error;

/// Longest uninterrupted sleep while pacing or backing off
const PAUSE_TICK: Duration = Duration::from_millis(100);

/// Signal actions owned by one `Interrupt::sigint` handle, removed when the
/// last clone goes away
#[derive(Debug)]
struct Registration(Vec<SigId>);

impl Drop for Registration {
    fn drop(&mut self) {
        for id in self.0.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Stop request for a dispatch run.
///
/// The dispatch loop and the connection manager poll it between
/// recipients, between retries and while sleeping. It never interrupts a
/// network call in progress; the attempt deadline bounds those.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
    registration: Option<Arc<Registration>>,
}

impl Interrupt {
    /// A handle that only trips when `trigger` is called
    pub fn new() -> Interrupt {
        Interrupt::default()
    }

    /// A handle that also trips on SIGINT.
    ///
    /// Every handle gets a fresh flag, so a Ctrl-C seen by an earlier run
    /// does not stop the next one. A second Ctrl-C while the flag is up
    /// exits the process with status 130.
    pub fn sigint() -> Result<Interrupt, Error> {
        let flag = Arc::new(AtomicBool::new(false));
        let mut registration = Registration(Vec::with_capacity(2));

        // must run before the flag is raised, so it only fires on the second signal
        registration.0.push(flag::register_conditional_shutdown(
            SIGINT,
            INTERRUPTED_EXIT_CODE,
            Arc::clone(&flag),
        )?);
        registration.0.push(flag::register(SIGINT, Arc::clone(&flag))?);

        debug!("SIGINT handler installed");
        Ok(Interrupt {
            flag,
            registration: Some(Arc::new(registration)),
        })
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early if the interrupt trips. Returns
    /// false if it did.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_set() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(cmp::min(deadline - now, PAUSE_TICK));
        }
    }
}
