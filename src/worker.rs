//! Named background workers with cooperative stop.
//!
//! A [`Worker`] owns one OS thread and the [`StopFlag`] it polls. Stopping sets
//! the flag, wakes any [`StopFlag::sleep`] in progress and joins, except when the
//! stop request comes from the worker's own thread, which is detected up front
//! rather than by attempting the join.

use crate::error::{AppResult, RigError};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

/// Cooperative stop flag shared between a worker and its owner.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<StopInner>);

impl StopFlag {
    /// Unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once stop was requested.
    pub fn is_set(&self) -> bool {
        self.0.stopped.load(Ordering::SeqCst)
    }

    /// Set the flag and wake every sleeper.
    pub fn set(&self) {
        self.0.stopped.store(true, Ordering::SeqCst);
        let _guard = self.0.lock.lock();
        self.0.wake.notify_all();
    }

    /// Sleep up to `duration`, returning early once the flag is set.
    ///
    /// Returns `true` if the flag is set.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut guard = self.0.lock.lock();
        if !self.is_set() {
            self.0.wake.wait_for(&mut guard, duration);
        }
        self.is_set()
    }
}

impl std::fmt::Debug for StopFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StopFlag").field(&self.is_set()).finish()
    }
}

/// Result of [`Worker::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The thread exited and was joined
    Joined,
    /// Called from the worker's own thread; the flag is set and the thread
    /// exits on its own once the current iteration returns
    SkippedSelf,
    /// The thread panicked
    Panicked,
}

/// A named OS thread plus its stop flag.
pub struct Worker {
    name: String,
    stop: StopFlag,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn `body` on a new thread named `name`.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> AppResult<Self>
    where
        F: FnOnce(StopFlag) + Send + 'static,
    {
        let name = name.into();
        let stop = StopFlag::new();
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(flag))
            .map_err(|source| RigError::WorkerSpawn {
                name: name.clone(),
                source,
            })?;
        debug!(worker = %name, "Worker started");
        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Clone of the worker's stop flag.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Ask the worker to stop without waiting for it.
    pub fn request_stop(&self) {
        self.stop.set();
    }

    /// True when called from this worker's own thread.
    pub fn is_current(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| h.thread().id() == thread::current().id())
    }

    /// True once the thread body has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Set the stop flag and join, skipping the join when called from the worker itself.
    pub fn stop(mut self) -> StopOutcome {
        self.stop.set();
        if self.is_current() {
            debug!(worker = %self.name, "Stop requested from inside worker; skipping join");
            self.handle.take();
            return StopOutcome::SkippedSelf;
        }
        match self.handle.take().map(JoinHandle::join) {
            Some(Err(_)) => {
                warn!(worker = %self.name, "Worker panicked");
                StopOutcome::Panicked
            }
            _ => {
                debug!(worker = %self.name, "Worker joined");
                StopOutcome::Joined
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Dropped without stop(): let the thread wind down detached.
        if self.handle.is_some() {
            self.stop.set();
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("stop", &self.stop)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn test_stop_joins_looping_worker() {
        let worker = Worker::spawn("loop", |stop| {
            while !stop.sleep(Duration::from_millis(5)) {}
        })
        .unwrap();
        assert_eq!(worker.name(), "loop");
        assert!(!worker.is_current());
        assert_eq!(worker.stop(), StopOutcome::Joined);
    }

    #[test]
    fn test_sleep_wakes_on_set() {
        let flag = StopFlag::new();
        let setter = flag.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set();
        });
        assert!(flag.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn test_self_stop_is_detected() {
        let slot: Arc<Mutex<Option<Worker>>> = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&slot);
        let mut guard = slot.lock();
        let worker = Worker::spawn("self-stop", move |_stop| {
            let worker = inner.lock().take();
            if let Some(worker) = worker {
                let _ = tx.send(worker.stop());
            }
        })
        .unwrap();
        *guard = Some(worker);
        drop(guard);

        let outcome = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(outcome, StopOutcome::SkippedSelf);
    }

    #[test]
    fn test_panicking_worker() {
        let worker = Worker::spawn("boom", |_stop| panic!("worker failure")).unwrap();
        assert_eq!(worker.stop(), StopOutcome::Panicked);
    }
}
