//! Transmission pipeline.
//!
//! Everything the listener, the steady-state sender and the run controllers
//! share lives in one [`PipelineContext`]:
//! - the [`Machine`] device table behind the machine lock
//! - the [`SideQueue`] of outbound work
//! - the [`ClearToSend`] handshake
//! - the table of open transports
//!
//! Handshake updates produced by the state machine are applied while the
//! machine lock is still held, so a dispatch can never interleave between a
//! readiness decision and its flag update.

pub mod handshake;
pub mod queue;
pub mod sender;

pub use handshake::{ClearToSend, Gate};
pub use queue::{Outbound, SideQueue};
pub use sender::{send_next_batch, CaptureTrigger, Sender, StepOutcome};

use crate::adapters::LinkTable;
use crate::config::PipelineConfig;
use crate::machine::{Effect, Machine};
use crate::notify::{SharedNotifier, Signal};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

type CancelHook = Arc<dyn Fn() + Send + Sync>;

/// State shared by every serial worker.
pub struct PipelineContext {
    machine: Mutex<Machine>,
    /// Outbound work
    pub queue: SideQueue,
    /// Handshake gating motion
    pub cts: ClearToSend,
    /// Open transports by port
    pub links: LinkTable,
    /// Sink for user-facing log lines
    pub notifier: SharedNotifier,
    /// Batch sizes and poll intervals
    pub pacing: PipelineConfig,
    capture: RwLock<Option<Arc<dyn CaptureTrigger>>>,
    cancel_hook: RwLock<Option<CancelHook>>,
}

impl PipelineContext {
    /// Context around `machine` with an empty queue and no open ports.
    pub fn new(machine: Machine, notifier: SharedNotifier, pacing: PipelineConfig) -> Self {
        Self {
            machine: Mutex::new(machine),
            queue: SideQueue::new(),
            cts: ClearToSend::default(),
            links: LinkTable::new(),
            notifier,
            pacing,
            capture: RwLock::new(None),
            cancel_hook: RwLock::new(None),
        }
    }

    /// Forward a log line to the notifier.
    pub fn notify(&self, signal: Signal, message: &str) {
        self.notifier.log(signal, message);
    }

    /// Read-only access to the machine under its lock.
    pub fn with_machine<R>(&self, f: impl FnOnce(&Machine) -> R) -> R {
        f(&self.machine.lock())
    }

    /// Run a state-machine transition and carry out its effects.
    pub fn update(&self, f: impl FnOnce(&mut Machine) -> Vec<Effect>) {
        let mut machine = self.machine.lock();
        let effects = f(&mut machine);
        let deferred: Vec<Effect> = effects
            .into_iter()
            .filter_map(|effect| match effect {
                Effect::ClearToSend(clear) => {
                    self.cts.set(clear);
                    None
                }
                other => Some(other),
            })
            .collect();
        drop(machine);
        self.apply(deferred);
    }

    /// Mutate the machine without producing effects.
    pub fn with_machine_mut<R>(&self, f: impl FnOnce(&mut Machine) -> R) -> R {
        f(&mut self.machine.lock())
    }

    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { port, lines } => self.write_direct(&port, &lines),
                Effect::ClearToSend(clear) => self.cts.set(clear),
                Effect::CancelImaging => self.request_cancel(),
                Effect::Notify(signal, message) => self.notify(signal, &message),
            }
        }
    }

    /// Write bypassing the side-queue. Used for state-machine traffic
    /// (queries, unlocks) which must never wait on the handshake.
    pub fn write_direct(&self, port: &str, lines: &[String]) {
        let Some(transport) = self.links.get(port) else {
            self.notify(
                Signal::Error,
                &format!("Cannot write {} line(s): port {port} is not open", lines.len()),
            );
            return;
        };
        match transport.write_lines(lines) {
            Ok(()) => {
                for line in lines {
                    self.notify(Signal::Echo, line);
                }
            }
            Err(e) => self.notify(
                Signal::Error,
                &format!("Write to {port} failed: {e}; dropping {} line(s)", lines.len()),
            ),
        }
    }

    /// Install the remote-capture backend.
    pub fn set_capture(&self, trigger: Arc<dyn CaptureTrigger>) {
        *self.capture.write() = Some(trigger);
    }

    /// Remote-capture backend, if installed.
    pub fn capture(&self) -> Option<Arc<dyn CaptureTrigger>> {
        self.capture.read().clone()
    }

    /// Install the callback run when the state machine asks for imaging to stop.
    pub fn set_cancel_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.cancel_hook.write() = Some(Arc::new(hook));
    }

    /// Ask the run controller to cancel imaging.
    pub fn request_cancel(&self) {
        let hook = self.cancel_hook.read().clone();
        match hook {
            Some(hook) => hook(),
            None => self.notify(Signal::Debug, "Cancel requested with no run controller attached"),
        }
    }

    /// True while a capture is in flight on any camera.
    pub fn capture_busy(&self) -> bool {
        self.capture().is_some_and(|c| c.is_busy())
    }
}
