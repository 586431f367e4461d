//! Clear-to-send handshake flag.
//!
//! Set by the listener when the machine reaches a state that accepts more
//! commands, cleared by the dispatcher when it writes motion. Waiters block on a
//! condition variable and re-check their stop flag and the link every poll.

use crate::worker::StopFlag;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Why [`ClearToSend::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// The flag is set
    Clear,
    /// The caller's stop flag was raised
    Stopped,
    /// No link is connected
    Disconnected,
}

/// Clear-to-send flag with blocking waiters.
#[derive(Debug)]
pub struct ClearToSend {
    clear: Mutex<bool>,
    changed: Condvar,
}

impl Default for ClearToSend {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ClearToSend {
    /// Flag starting at `initial`.
    pub fn new(initial: bool) -> Self {
        Self {
            clear: Mutex::new(initial),
            changed: Condvar::new(),
        }
    }

    /// Current flag value.
    pub fn is_clear(&self) -> bool {
        *self.clear.lock()
    }

    /// Set the flag, waking waiters when it becomes clear.
    pub fn set(&self, clear: bool) {
        *self.clear.lock() = clear;
        if clear {
            self.changed.notify_all();
        }
    }

    /// Release every waiter regardless of machine state.
    pub fn force(&self) {
        self.set(true);
    }

    /// Block until the flag is set, `stop` is raised or `connected` turns false.
    pub fn wait(&self, stop: &StopFlag, poll: Duration, connected: impl Fn() -> bool) -> Gate {
        let mut clear = self.clear.lock();
        loop {
            if stop.is_set() {
                return Gate::Stopped;
            }
            if *clear {
                return Gate::Clear;
            }
            if !connected() {
                return Gate::Disconnected;
            }
            self.changed.wait_for(&mut clear, poll);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const POLL: Duration = Duration::from_millis(5);

    #[test]
    fn test_clear_passes_immediately() {
        let cts = ClearToSend::default();
        assert_eq!(cts.wait(&StopFlag::new(), POLL, || true), Gate::Clear);
    }

    #[test]
    fn test_force_releases_waiter() {
        let cts = Arc::new(ClearToSend::new(false));
        let waiter = Arc::clone(&cts);
        let handle = thread::spawn(move || waiter.wait(&StopFlag::new(), Duration::from_secs(1), || true));
        thread::sleep(Duration::from_millis(20));
        cts.force();
        assert_eq!(handle.join().unwrap(), Gate::Clear);
    }

    #[test]
    fn test_stop_and_disconnect_end_wait() {
        let cts = ClearToSend::new(false);
        let stop = StopFlag::new();
        assert_eq!(cts.wait(&stop, POLL, || false), Gate::Disconnected);
        stop.set();
        assert_eq!(cts.wait(&stop, POLL, || true), Gate::Stopped);
    }
}
