//! Homer and imager run controllers.
//!
//! A run is a bounded drive loop over the side-queue: while the run is running
//! and a link is connected it dispatches `run_batch_size` items at a time,
//! gated by the handshake. A run is complete when the queue is empty, the
//! machine is idle and no camera is still writing.
//!
//! Runs and the steady-state [`Sender`] are mutually exclusive: starting a run
//! stops the sender, and the sender is restarted once the run ends as long as
//! a port is still open.

use crate::error::{AppResult, RigError};
use crate::machine::Machine;
use crate::model::Action;
use crate::notify::Signal;
use crate::pipeline::{send_next_batch, Outbound, PipelineContext, Sender, StepOutcome};
use crate::protocol;
use crate::worker::{StopFlag, StopOutcome, Worker};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::error;
use uuid::Uuid;

/// Which run controller drives the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// Home every connected positioner
    Homing,
    /// Walk a compiled pose sequence
    Imaging,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Homing => write!(f, "homing"),
            RunKind::Imaging => write!(f, "imaging"),
        }
    }
}

/// Lifecycle of the most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No run has started
    Idle,
    /// Dispatching
    Running,
    /// Stopped with its queue kept
    Paused,
    /// Stopped and queue discarded
    Cancelled,
    /// Queue drained and machine settled
    Complete,
    /// Ended by a lost link or an internal fault
    Faulted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Cancelled => "cancelled",
            RunState::Complete => "complete",
            RunState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

struct ActiveRun {
    id: Uuid,
    kind: RunKind,
    worker: Option<Worker>,
    /// Devices flagged homed when a homing run completes
    homed: Vec<u32>,
}

struct Slot {
    run: Option<ActiveRun>,
    state: RunState,
    last_run: Option<Uuid>,
    sender: Option<Sender>,
}

struct Shared {
    ctx: Arc<PipelineContext>,
    slot: Mutex<Slot>,
}

/// Drives homing and imaging runs and owns the steady-state sender.
#[derive(Clone)]
pub struct RunController {
    shared: Arc<Shared>,
}

/// Non-owning [`RunController`] handle for callbacks stored in the pipeline context.
#[derive(Clone)]
pub struct RunHandle(Weak<Shared>);

impl RunHandle {
    /// Controller, if it is still alive.
    pub fn upgrade(&self) -> Option<RunController> {
        self.0.upgrade().map(|shared| RunController { shared })
    }
}

/// `$H` for every connected positioner, then `G90`, then a status query.
pub fn homing_sequence(machine: &Machine) -> Vec<Outbound> {
    let ids = machine.connected_positioners();
    let routed = |id: u32, line: String, action: Option<Action>| {
        machine.port_of(id).map(|port| Outbound::Serial {
            port: port.to_string(),
            line,
            action,
        })
    };
    let homes = ids.iter().filter_map(|&id| {
        let action = Action::home(id);
        routed(id, protocol::command_line(id, protocol::HOME), Some(action))
    });
    let modes = ids.iter().filter_map(|&id| {
        let action = Action::mode(id, true);
        let line = protocol::format_action(&action)?;
        routed(id, line, Some(action))
    });
    let queries = ids
        .iter()
        .filter_map(|&id| routed(id, protocol::command_line(id, protocol::STATUS_QUERY), None));
    homes.chain(modes).chain(queries).collect()
}

impl RunController {
    /// Controller over `ctx` with no run and no sender.
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            shared: Arc::new(Shared {
                ctx,
                slot: Mutex::new(Slot {
                    run: None,
                    state: RunState::Idle,
                    last_run: None,
                    sender: None,
                }),
            }),
        }
    }

    /// Handle that does not keep the controller alive.
    pub fn downgrade(&self) -> RunHandle {
        RunHandle(Arc::downgrade(&self.shared))
    }

    /// State of the current or most recent run.
    pub fn state(&self) -> RunState {
        self.shared.slot.lock().state
    }

    /// Id of the active run, or of the last one if none is active.
    pub fn run_id(&self) -> Option<Uuid> {
        let slot = self.shared.slot.lock();
        slot.run.as_ref().map(|r| r.id).or(slot.last_run)
    }

    /// Kind of the active run.
    pub fn active_kind(&self) -> Option<RunKind> {
        self.shared.slot.lock().run.as_ref().map(|r| r.kind)
    }

    /// True while an imaging run is active.
    pub fn is_imaging(&self) -> bool {
        self.active_kind() == Some(RunKind::Imaging)
    }

    /// True while a homing run is active.
    pub fn is_homing(&self) -> bool {
        self.active_kind() == Some(RunKind::Homing)
    }

    /// True while the steady-state sender runs.
    pub fn is_sending(&self) -> bool {
        self.shared.slot.lock().sender.is_some()
    }

    /// Start steady-state sending unless a run or a sender is already active.
    pub fn start_sender(&self) -> AppResult<()> {
        let mut slot = self.shared.slot.lock();
        if slot.run.is_some() || slot.sender.is_some() {
            return Ok(());
        }
        slot.sender = Some(Sender::start(Arc::clone(&self.shared.ctx))?);
        Ok(())
    }

    /// Stop the steady-state sender, if running.
    pub fn stop_sender(&self) -> Option<StopOutcome> {
        let sender = self.shared.slot.lock().sender.take();
        sender.map(Sender::stop)
    }

    /// Home every connected positioner.
    pub fn start_homing(&self) -> AppResult<Uuid> {
        let ctx = &self.shared.ctx;
        let homed = ctx.with_machine(|m| m.connected_positioners());
        let sequence = ctx.with_machine(homing_sequence);
        self.start(RunKind::Homing, sequence, homed)
    }

    /// Run a routed imaging sequence.
    pub fn start_imaging(&self, sequence: Vec<Outbound>) -> AppResult<Uuid> {
        self.start(RunKind::Imaging, sequence, Vec::new())
    }

    fn start(&self, kind: RunKind, sequence: Vec<Outbound>, homed: Vec<u32>) -> AppResult<Uuid> {
        let ctx = &self.shared.ctx;
        let mut slot = self.shared.slot.lock();
        if let Some(run) = &slot.run {
            return Err(RigError::RunActive(run.kind.to_string()));
        }
        if let Some(sender) = slot.sender.take() {
            sender.stop();
        }

        let id = Uuid::new_v4();
        let count = sequence.len();
        ctx.queue.extend(sequence);
        let worker = match spawn_drive(&self.shared, id, kind) {
            Ok(worker) => worker,
            Err(e) => {
                ctx.queue.clear();
                return Err(e);
            }
        };
        slot.run = Some(ActiveRun {
            id,
            kind,
            worker: Some(worker),
            homed,
        });
        slot.state = RunState::Running;
        slot.last_run = Some(id);
        drop(slot);

        ctx.notify(
            Signal::Info,
            &format!("Started {kind} run {id} with {count} queued item(s)"),
        );
        Ok(id)
    }

    /// Stop the run's worker without discarding the queue.
    ///
    /// Safe to call from inside the run's own worker: the join is skipped.
    pub fn pause(&self) -> bool {
        let worker = {
            let mut slot = self.shared.slot.lock();
            if slot.state != RunState::Running {
                return false;
            }
            let Some(run) = slot.run.as_mut() else {
                return false;
            };
            let worker = run.worker.take();
            slot.state = RunState::Paused;
            worker
        };
        if let Some(worker) = worker {
            worker.stop();
        }
        // The worker may have settled the run while we joined it.
        if self.shared.slot.lock().state != RunState::Paused {
            return false;
        }
        self.shared.ctx.notify(Signal::Info, "Run paused");
        true
    }

    /// Continue a paused run from the current queue position.
    pub fn resume(&self) -> AppResult<bool> {
        let mut slot = self.shared.slot.lock();
        if slot.state != RunState::Paused {
            return Ok(false);
        }
        let Some((id, kind)) = slot.run.as_ref().map(|r| (r.id, r.kind)) else {
            return Ok(false);
        };
        let worker = spawn_drive(&self.shared, id, kind)?;
        if let Some(run) = slot.run.as_mut() {
            run.worker = Some(worker);
        }
        slot.state = RunState::Running;
        drop(slot);
        self.shared.ctx.notify(Signal::Info, &format!("Resumed {kind} run {id}"));
        Ok(true)
    }

    /// Cancel the imaging run, if any, then clear the queue and release the handshake.
    ///
    /// Returns whether an imaging run was cancelled. The queue is cleared and
    /// the handshake forced either way.
    pub fn cancel_imaging(&self) -> bool {
        self.cancel_where(|kind| kind == RunKind::Imaging)
    }

    /// Cancel whichever run is active.
    pub fn cancel(&self) -> bool {
        self.cancel_where(|_| true)
    }

    fn cancel_where(&self, matches: impl Fn(RunKind) -> bool) -> bool {
        let ctx = &self.shared.ctx;
        let cancelled = {
            let mut slot = self.shared.slot.lock();
            if slot.run.as_ref().is_some_and(|r| matches(r.kind)) {
                slot.state = RunState::Cancelled;
                slot.run.take()
            } else {
                None
            }
        };

        let result = cancelled.is_some();
        if let Some(mut run) = cancelled {
            if let Some(worker) = run.worker.take() {
                if worker.stop() == StopOutcome::SkippedSelf {
                    ctx.notify(Signal::Debug, "Cancel issued from the run worker");
                }
            }
        }

        let dropped = ctx.queue.clear();
        ctx.cts.force();
        if result {
            ctx.notify(
                Signal::Info,
                &format!("Run cancelled; {dropped} queued item(s) discarded"),
            );
            if !ctx.links.is_empty() {
                if let Err(e) = self.start_sender() {
                    ctx.notify(Signal::Error, &format!("Failed to restart sender: {e}"));
                }
            }
        }
        result
    }

    /// Cancel any run and stop the sender. Used on disconnect.
    pub fn shutdown(&self) {
        self.cancel();
        self.stop_sender();
    }
}

fn spawn_drive(shared: &Arc<Shared>, id: Uuid, kind: RunKind) -> AppResult<Worker> {
    let owner = Arc::clone(shared);
    Worker::spawn(format!("rig-{kind}"), move |stop| {
        // A fault inside the loop must still end the run and restart the sender.
        let ended = panic::catch_unwind(AssertUnwindSafe(|| drive(&owner.ctx, &stop)));
        match ended {
            Ok(outcome) => finish(&owner, id, outcome.map(|state| (state, None))),
            Err(payload) => {
                let reason = panic_reason(payload.as_ref());
                error!(run = %id, %kind, reason = %reason, "Run worker panicked");
                finish(&owner, id, Some((RunState::Faulted, Some(reason))));
            }
        }
    })
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Returns `None` when stopped by its owner.
fn drive(ctx: &PipelineContext, stop: &StopFlag) -> Option<RunState> {
    let batch_size = ctx.pacing.run_batch_size;
    let poll = ctx.pacing.yield_interval();
    loop {
        if stop.is_set() {
            return None;
        }
        if !ctx.links.any_connected() {
            return Some(RunState::Faulted);
        }
        match send_next_batch(ctx, batch_size, stop) {
            StepOutcome::Stopped => return None,
            StepOutcome::Empty => {
                let settled = ctx.queue.is_empty()
                    && ctx.with_machine(|m| m.is_idle())
                    && !ctx.capture_busy();
                if settled {
                    return Some(RunState::Complete);
                }
                stop.sleep(poll);
            }
            StepOutcome::Sent(_) | StepOutcome::Dropped(_) => {}
        }
    }
}

/// End run `id`. `outcome` is `None` when the worker was stopped by its
/// owner; a fault may carry the reason it happened.
fn finish(shared: &Arc<Shared>, id: Uuid, outcome: Option<(RunState, Option<String>)>) {
    let ctx = &shared.ctx;
    let Some((state, fault)) = outcome else {
        return;
    };
    let mut slot = shared.slot.lock();
    if slot.run.as_ref().map(|r| r.id) != Some(id) {
        return;
    }
    let Some(mut run) = slot.run.take() else {
        return;
    };
    // Dropping our own handle detaches the thread.
    run.worker.take();
    slot.state = state;

    match (run.kind, state) {
        (RunKind::Homing, RunState::Complete) => {
            ctx.with_machine_mut(|m| m.mark_homed(&run.homed));
            ctx.notify(
                Signal::Info,
                &format!("Homing run {id} complete; {} device(s) homed", run.homed.len()),
            );
        }
        (kind, RunState::Faulted) => {
            let dropped = ctx.queue.clear();
            ctx.cts.force();
            let reason = fault.unwrap_or_else(|| "link lost".to_string());
            ctx.notify(
                Signal::Error,
                &format!("{kind} run {id} ended: {reason}; {dropped} queued item(s) discarded"),
            );
        }
        (kind, state) => {
            ctx.notify(Signal::Info, &format!("{kind} run {id} {state}"));
        }
    }

    if !ctx.links.is_empty() && slot.sender.is_none() {
        match Sender::start(Arc::clone(ctx)) {
            Ok(sender) => slot.sender = Some(sender),
            Err(e) => ctx.notify(Signal::Error, &format!("Failed to restart sender: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockTransport, Transport};
    use crate::config::PipelineConfig;
    use crate::model::{Device, DeviceKind};
    use crate::pipeline::CaptureTrigger;
    use crate::notify::LogBuffer;
    use std::time::{Duration, Instant};

    fn setup() -> (Arc<PipelineContext>, Arc<MockTransport>, LogBuffer) {
        let log = LogBuffer::new();
        let machine = Machine::new(
            vec![
                Device::new(1, "arm", DeviceKind::Positioner).on_port("COM1"),
                Device::new(2, "turntable", DeviceKind::Positioner).on_port("COM1"),
            ],
            Duration::from_millis(500),
        );
        let pacing = PipelineConfig {
            queue_wait_ms: 5,
            yield_interval_ms: 2,
            ..PipelineConfig::default()
        };
        let ctx = Arc::new(PipelineContext::new(machine, Arc::new(log.clone()), pacing));
        let transport = Arc::new(MockTransport::new("COM1"));
        ctx.links.insert(transport.clone());
        (ctx, transport, log)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn line(text: &str) -> Outbound {
        Outbound::Serial {
            port: "COM1".into(),
            line: text.into(),
            action: None,
        }
    }

    #[test]
    fn test_homing_sequence_order() {
        let (ctx, _transport, _log) = setup();
        ctx.update(|m| m.on_connect("COM1", Instant::now()));
        let lines: Vec<String> = ctx
            .with_machine(homing_sequence)
            .into_iter()
            .filter_map(|item| match item {
                Outbound::Serial { line, .. } => Some(line),
                Outbound::Capture { .. } => None,
            })
            .collect();
        assert_eq!(lines, vec![">1$H", ">2$H", ">1G90", ">2G90", ">1?", ">2?"]);
    }

    #[test]
    fn test_run_dispatches_in_run_batches() {
        let (ctx, transport, log) = setup();
        let runner = RunController::new(Arc::clone(&ctx));
        runner.start_sender().unwrap();
        assert!(runner.is_sending());

        runner
            .start_imaging(vec![line(">1C0"), line(">1C1"), line(">2C0")])
            .unwrap();
        assert!(!runner.is_sending());
        assert!(runner.run_id().is_some());

        assert!(wait_for(|| transport.written().len() == 3));
        assert_eq!(transport.write_count(), 2);
        assert!(runner.is_imaging());

        assert!(runner.cancel_imaging());
        assert!(!runner.is_imaging());
        assert_eq!(runner.state(), RunState::Cancelled);
        assert!(runner.is_sending());
        assert_eq!(log.count_containing(Signal::Info, "Run cancelled"), 1);
        runner.shutdown();
    }

    #[test]
    fn test_pose_payload_waits_for_its_move() {
        let (ctx, transport, _log) = setup();
        let runner = RunController::new(Arc::clone(&ctx));
        let routed = |action: Action| Outbound::Serial {
            port: "COM1".into(),
            line: protocol::format_action(&action).unwrap(),
            action: Some(action),
        };
        let arm = Action::move_to(1, crate::model::Position::new(10.0, 0.0, 0.0, 0.0, 0.0), false);
        runner
            .start_imaging(vec![routed(arm), routed(Action::shutter(3, Some(1.5)))])
            .unwrap();

        assert!(wait_for(|| transport.write_count() == 1));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(transport.written(), vec![">1G1X10.000Y0.000Z0.000P0.000T0.000"]);
        assert!(!ctx.cts.is_clear());

        ctx.cts.set(true);
        assert!(wait_for(|| transport.write_count() == 2));
        assert_eq!(transport.written()[1], ">3C0S1.500");
        runner.shutdown();
    }

    #[test]
    fn test_cancel_clears_queue_and_forces_handshake() {
        let (ctx, transport, _log) = setup();
        let runner = RunController::new(Arc::clone(&ctx));
        ctx.cts.set(false);

        let moves: Vec<Outbound> = (0..5).map(|i| line(&format!(">1G1X{i}"))).collect();
        runner.start_imaging(moves).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(transport.written().is_empty());

        assert!(runner.cancel_imaging());
        assert!(!runner.is_imaging());
        assert!(ctx.queue.is_empty());
        assert!(ctx.cts.is_clear());
        runner.shutdown();
    }

    #[test]
    fn test_pause_and_resume() {
        let (ctx, transport, _log) = setup();
        let runner = RunController::new(Arc::clone(&ctx));
        ctx.cts.set(false);

        runner
            .start_imaging(vec![line(">1C0"), line(">1C1"), line(">1C0")])
            .unwrap();
        assert!(runner.pause());
        assert_eq!(runner.state(), RunState::Paused);
        assert!(!runner.pause());
        assert_eq!(ctx.queue.len(), 3);

        ctx.cts.set(true);
        assert!(runner.resume().unwrap());
        assert!(wait_for(|| transport.written().len() == 3));
        assert!(runner.cancel());
    }

    #[test]
    fn test_pause_loses_to_settling_run() {
        let log = LogBuffer::new();
        let machine = Machine::new(
            vec![Device::new(1, "arm", DeviceKind::Positioner).on_port("COM1")],
            Duration::from_millis(500),
        );
        let pacing = PipelineConfig {
            queue_wait_ms: 200,
            yield_interval_ms: 2,
            ..PipelineConfig::default()
        };
        let ctx = Arc::new(PipelineContext::new(machine, Arc::new(log.clone()), pacing));
        ctx.links.insert(Arc::new(MockTransport::new("COM1")));
        ctx.update(|m| m.on_connect("COM1", Instant::now()));
        for reply in [">1<Idle|X0Y0Z0P0T0>", ">1<Idle|X0Y0Z0P0T0>"] {
            let parsed = protocol::parse_line(reply, Instant::now()).unwrap();
            ctx.update(|m| m.on_reply("COM1", parsed));
        }
        assert!(ctx.with_machine(|m| m.is_idle()));

        // The worker is parked in the queue wait and settles once it returns.
        let runner = RunController::new(Arc::clone(&ctx));
        runner.start_imaging(Vec::new()).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(!runner.pause());
        assert_eq!(runner.state(), RunState::Complete);
        assert_eq!(log.count_containing(Signal::Info, "Run paused"), 0);
        runner.shutdown();
    }

    #[test]
    fn test_second_run_is_rejected() {
        let (ctx, _transport, _log) = setup();
        let runner = RunController::new(Arc::clone(&ctx));
        ctx.cts.set(false);
        runner.start_imaging(vec![line(">1C0")]).unwrap();
        let err = runner.start_homing().unwrap_err();
        assert!(matches!(&err, RigError::RunActive(kind) if kind == "imaging"));
        assert_eq!(err.to_string(), "A run of kind imaging is already active");
        runner.cancel();
    }

    #[test]
    fn test_lost_link_faults_run() {
        let (ctx, transport, log) = setup();
        let runner = RunController::new(Arc::clone(&ctx));
        ctx.cts.set(false);
        runner.start_imaging(vec![line(">1C0")]).unwrap();
        transport.close();
        assert!(wait_for(|| runner.state() == RunState::Faulted));
        assert!(!runner.is_imaging());
        assert!(ctx.queue.is_empty());
        assert_eq!(log.count_containing(Signal::Error, "link lost"), 1);
        runner.shutdown();
    }

    #[test]
    fn test_cancel_hook_cancels_imaging() {
        let (ctx, _transport, _log) = setup();
        let runner = RunController::new(Arc::clone(&ctx));
        let inner = runner.clone();
        ctx.set_cancel_hook(move || {
            inner.cancel_imaging();
        });
        ctx.cts.set(false);
        runner.start_imaging(vec![line(">1C0")]).unwrap();

        let hook_ctx = Arc::clone(&ctx);
        std::thread::spawn(move || hook_ctx.request_cancel())
            .join()
            .unwrap();
        assert!(!runner.is_imaging());
        assert!(ctx.queue.is_empty());
        runner.shutdown();
    }

    struct CancellingCamera {
        runner: Mutex<Option<RunController>>,
    }

    impl CaptureTrigger for CancellingCamera {
        fn snap(&self, _device_id: u32, _auto_focus: bool) -> AppResult<()> {
            let runner = self.runner.lock().clone();
            if let Some(runner) = runner {
                runner.cancel_imaging();
            }
            Ok(())
        }

        fn is_busy(&self) -> bool {
            false
        }

        fn is_writing(&self, _device_id: u32) -> bool {
            false
        }
    }

    #[test]
    fn test_cancel_from_inside_run_worker() {
        let (ctx, _transport, log) = setup();
        let runner = RunController::new(Arc::clone(&ctx));
        let camera = Arc::new(CancellingCamera {
            runner: Mutex::new(Some(runner.clone())),
        });
        ctx.set_capture(camera.clone());

        runner
            .start_imaging(vec![
                Outbound::Capture {
                    device_id: 5,
                    auto_focus: false,
                },
                line(">1C0"),
            ])
            .unwrap();

        assert!(wait_for(|| !runner.is_imaging()));
        assert_eq!(runner.state(), RunState::Cancelled);
        assert!(ctx.queue.is_empty());
        assert!(wait_for(|| log.count_containing(Signal::Debug, "Cancel issued from the run worker") == 1));

        *camera.runner.lock() = None;
        runner.shutdown();
    }

    struct FailingCamera;

    impl CaptureTrigger for FailingCamera {
        fn snap(&self, device_id: u32, _auto_focus: bool) -> AppResult<()> {
            panic!("camera {device_id} backend fault");
        }

        fn is_busy(&self) -> bool {
            false
        }

        fn is_writing(&self, _device_id: u32) -> bool {
            false
        }
    }

    #[test]
    fn test_worker_panic_faults_run_and_restarts_sender() {
        let (ctx, transport, log) = setup();
        let runner = RunController::new(Arc::clone(&ctx));
        ctx.set_capture(Arc::new(FailingCamera));
        runner.start_sender().unwrap();

        runner
            .start_imaging(vec![
                Outbound::Capture {
                    device_id: 5,
                    auto_focus: false,
                },
                line(">1C0"),
            ])
            .unwrap();

        assert!(wait_for(|| runner.state() == RunState::Faulted));
        assert!(!runner.is_imaging());
        assert!(ctx.queue.is_empty());
        assert!(runner.is_sending());
        assert_eq!(
            log.count_containing(Signal::Error, "camera 5 backend fault"),
            1
        );
        assert!(transport.written().is_empty());

        ctx.set_capture(Arc::new(CancellingCamera {
            runner: Mutex::new(None),
        }));
        assert!(runner.start_imaging(vec![line(">1C1")]).is_ok());
        assert!(wait_for(|| transport.written() == vec![">1C1".to_string()]));
        runner.shutdown();
    }
}
