//! Top-level composition of the rig.
//!
//! [`Orchestrator`] wires the capabilities together:
//! - a [`TransportFactory`] for serial links
//! - a [`Notifier`](crate::notify::Notifier) for every log line
//! - the [`Listener`] and [`RunController`] driving the pipeline
//! - an optional [`CameraBank`] for remote-capture devices
//!
//! Connect, disconnect and port selection are serialized by one entry lock.
//! Everything else goes straight to the component that owns it.

use crate::adapters::TransportFactory;
use crate::capture::{CameraBank, CaptureController, CaptureSdk};
use crate::compiler;
use crate::config::RigConfig;
use crate::error::{AppResult, RigError};
use crate::listener::Listener;
use crate::machine::{Machine, MachineStatus};
use crate::model::{Action, Device, Pose};
use crate::notify::{SharedNotifier, Signal};
use crate::pipeline::PipelineContext;
use crate::runner::{RunController, RunKind, RunState};
use crate::worker::StopOutcome;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument};
use uuid::Uuid;

/// The device orchestration layer of one rig.
pub struct Orchestrator {
    ctx: Arc<PipelineContext>,
    listener: Listener,
    runs: RunController,
    factory: Arc<dyn TransportFactory>,
    cameras: Option<Arc<CameraBank>>,
    connect_lock: Mutex<Option<String>>,
    configured_ports: Vec<String>,
}

impl Orchestrator {
    /// Build the rig described by `config`. Pass `sdk` to enable remote capture.
    pub fn new(
        config: &RigConfig,
        notifier: SharedNotifier,
        factory: Arc<dyn TransportFactory>,
        sdk: Option<Arc<dyn CaptureSdk>>,
    ) -> Self {
        let devices = config.devices();
        let mut configured_ports: Vec<String> =
            devices.iter().filter_map(|d| d.port.clone()).collect();
        configured_ports.sort();
        configured_ports.dedup();

        let machine = Machine::new(devices.clone(), config.pipeline.stale_after());
        let ctx = Arc::new(PipelineContext::new(
            machine,
            Arc::clone(&notifier),
            config.pipeline.clone(),
        ));
        let listener = Listener::new(Arc::clone(&ctx));
        let runs = RunController::new(Arc::clone(&ctx));

        let handle = runs.downgrade();
        ctx.set_cancel_hook(move || {
            if let Some(runs) = handle.upgrade() {
                runs.cancel_imaging();
            }
        });

        let cameras = sdk.map(|sdk| {
            let controller = Arc::new(CaptureController::new(sdk, Arc::clone(&notifier)));
            let bank = Arc::new(CameraBank::new(
                controller,
                Arc::clone(&notifier),
                config.capture.clone(),
            ));
            bank.register(&devices);
            let weak = Arc::downgrade(&ctx);
            bank.set_completion_hook(move |device_id| {
                if let Some(ctx) = weak.upgrade() {
                    ctx.with_machine_mut(|m| m.set_writing(device_id, false));
                    ctx.notify(
                        Signal::Info,
                        &format!("Capture on device {device_id} complete"),
                    );
                }
            });
            ctx.set_capture(bank.clone());
            bank
        });

        Self {
            ctx,
            listener,
            runs,
            factory,
            cameras,
            connect_lock: Mutex::new(None),
            configured_ports,
        }
    }

    /// Shared pipeline state.
    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Homing and imaging run controller.
    pub fn runs(&self) -> &RunController {
        &self.runs
    }

    /// Remote-capture cameras, when an SDK was supplied.
    pub fn cameras(&self) -> Option<&Arc<CameraBank>> {
        self.cameras.as_ref()
    }

    /// Ports named by the device configuration.
    pub fn configured_ports(&self) -> &[String] {
        &self.configured_ports
    }

    /// Ports with a live reader.
    pub fn open_ports(&self) -> Vec<String> {
        self.listener.ports()
    }

    /// Port chosen with [`select_port`](Self::select_port).
    pub fn selected_port(&self) -> Option<String> {
        self.connect_lock.lock().clone()
    }

    /// Aggregate machine readiness.
    pub fn status(&self) -> MachineStatus {
        self.ctx.with_machine(Machine::status)
    }

    /// Snapshot of the device table.
    pub fn devices(&self) -> Vec<Device> {
        self.ctx.with_machine(Machine::device_list)
    }

    /// State of the current or most recent run.
    pub fn run_state(&self) -> RunState {
        self.runs.state()
    }

    /// True while an imaging run is active.
    pub fn is_imaging(&self) -> bool {
        self.runs.is_imaging()
    }

    /// Open `port`, start its reader and the steady-state sender.
    ///
    /// Returns `Ok(false)` when the port was already open.
    #[instrument(skip(self))]
    pub fn connect(&self, port: &str) -> AppResult<bool> {
        let _entry = self.connect_lock.lock();
        self.open_port(port)
    }

    fn open_port(&self, port: &str) -> AppResult<bool> {
        let opened = self.listener.open(port, self.factory.as_ref())?;
        self.runs.start_sender()?;
        Ok(opened)
    }

    /// Open every configured port and start remote capture.
    pub fn connect_all(&self) -> AppResult<()> {
        let _entry = self.connect_lock.lock();
        for port in &self.configured_ports {
            self.open_port(port)?;
        }
        drop(_entry);
        self.start_capture()
    }

    /// Initialize the capture SDK and start its event pump, if configured.
    pub fn start_capture(&self) -> AppResult<()> {
        match &self.cameras {
            Some(bank) => bank.start(),
            None => Ok(()),
        }
    }

    /// Make `port` the active link, closing the previously selected one.
    #[instrument(skip(self))]
    pub fn select_port(&self, port: &str) -> AppResult<bool> {
        let mut selected = self.connect_lock.lock();
        if selected.as_deref() == Some(port) && self.listener.is_open(port) {
            return Ok(false);
        }
        if let Some(previous) = selected.take() {
            if previous != port {
                self.runs.cancel();
                self.listener.close(&previous);
            }
        }
        let opened = self.open_port(port)?;
        *selected = Some(port.to_string());
        self.ctx.notify(Signal::Info, &format!("Selected port {port}"));
        Ok(opened)
    }

    /// Close one port. Cancels any run first so no worker writes into a closing link.
    pub fn disconnect_port(&self, port: &str) -> bool {
        let mut selected = self.connect_lock.lock();
        if !self.listener.is_open(port) {
            return false;
        }
        self.runs.cancel();
        self.listener.close(port);
        if selected.as_deref() == Some(port) {
            selected.take();
        }
        if self.listener.count() == 0 {
            self.runs.stop_sender();
        }
        true
    }

    /// Hard stop: cancel runs, join every worker, then release transports and cameras.
    #[instrument(skip(self))]
    pub fn disconnect(&self) -> AppResult<()> {
        let mut selected = self.connect_lock.lock();
        self.runs.shutdown();
        let closed = self.listener.close_all();
        selected.take();

        let mut errors = Vec::new();
        for (port, outcome) in &closed {
            if *outcome == StopOutcome::Panicked {
                errors.push(RigError::Transport(format!("reader for {port} panicked")));
            }
        }
        if let Some(bank) = &self.cameras {
            if let Err(e) = bank.shutdown() {
                errors.push(e);
            }
        }
        info!(ports = closed.len(), "Rig disconnected");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RigError::ShutdownFailed(errors))
        }
    }

    /// Compile `poses` against the configured devices.
    pub fn compile(&self, poses: &[Pose]) -> AppResult<Vec<Action>> {
        compiler::compile(poses, &self.devices())
    }

    /// Compile `poses` and write the run to `path`.
    pub fn export(&self, poses: &[Pose], path: &Path) -> AppResult<()> {
        let actions = self.compile(poses)?;
        compiler::export(&actions, path)
    }

    /// Queue `poses` for the steady-state sender. Returns the number of items queued.
    pub fn enqueue(&self, poses: &[Pose]) -> AppResult<usize> {
        let run = compiler::build_run(poses, &self.devices())?;
        let count = run.len();
        self.ctx.queue.extend(run);
        Ok(count)
    }

    /// Home every connected positioner.
    pub fn start_homing(&self) -> AppResult<Uuid> {
        self.runs.start_homing()
    }

    /// Compile `poses` and drive them through the imaging run controller.
    pub fn start_imaging(&self, poses: &[Pose]) -> AppResult<Uuid> {
        let run = compiler::build_run(poses, &self.devices())?;
        self.runs.start_imaging(run)
    }

    /// Pause the active run, keeping its queue.
    pub fn pause(&self) -> bool {
        self.runs.pause()
    }

    /// Resume a paused run.
    pub fn resume(&self) -> AppResult<bool> {
        self.runs.resume()
    }

    /// Cancel the imaging run and empty the queue.
    pub fn cancel_imaging(&self) -> bool {
        self.runs.cancel_imaging()
    }

    /// Cancel whichever run is active.
    pub fn cancel(&self) -> bool {
        self.runs.cancel()
    }

    /// Block until the machine reports idle, or `timeout` passes.
    pub fn wait_until_ready(&self, timeout: Duration) -> bool {
        let poll = self.ctx.pacing.yield_interval();
        let deadline = Instant::now() + timeout;
        loop {
            if self.ctx.with_machine(Machine::is_idle) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(poll);
        }
    }

    /// Block until no run of `kind` is active, or `timeout` passes.
    pub fn wait_for_run(&self, kind: RunKind, timeout: Duration) -> RunState {
        let poll = self.ctx.pacing.yield_interval();
        let deadline = Instant::now() + timeout;
        while self.runs.active_kind() == Some(kind) && Instant::now() < deadline {
            std::thread::sleep(poll);
        }
        self.runs.state()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            self.ctx
                .notify(Signal::Error, &format!("Disconnect on drop failed: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockTransportFactory, Transport};
    use crate::config::DeviceDefinition;
    use crate::model::DeviceKind;
    use crate::notify::LogBuffer;

    fn config() -> RigConfig {
        let mut config = RigConfig::default();
        config.pipeline.yield_interval_ms = 2;
        config.pipeline.queue_wait_ms = 5;
        config.pipeline.stale_after_ms = 100;
        config.devices = vec![DeviceDefinition {
            device_id: 1,
            name: "arm".into(),
            kind: DeviceKind::Positioner,
            port: Some("COM1".into()),
            hardware_id: None,
            software_id: None,
        }];
        config
    }

    #[test]
    fn test_connect_is_idempotent() {
        let log = LogBuffer::new();
        let factory = Arc::new(MockTransportFactory::simulated());
        let rig = Orchestrator::new(&config(), Arc::new(log.clone()), factory.clone(), None);

        assert!(rig.connect("COM1").unwrap());
        assert!(!rig.connect("COM1").unwrap());
        assert_eq!(factory.open_count(), 1);
        assert!(rig.runs().is_sending());
        assert!(rig.wait_until_ready(Duration::from_secs(2)));

        rig.disconnect().unwrap();
        assert!(rig.open_ports().is_empty());
        assert!(!rig.runs().is_sending());
        assert_eq!(rig.status(), MachineStatus::Disconnected);
    }

    #[test]
    fn test_select_port_switches_link() {
        let log = LogBuffer::new();
        let factory = Arc::new(MockTransportFactory::silent());
        let rig = Orchestrator::new(&config(), Arc::new(log.clone()), factory.clone(), None);

        assert!(rig.select_port("COM1").unwrap());
        assert!(!rig.select_port("COM1").unwrap());
        assert!(rig.select_port("COM2").unwrap());
        assert_eq!(rig.open_ports(), vec!["COM2".to_string()]);
        assert_eq!(rig.selected_port().as_deref(), Some("COM2"));
        assert!(!factory.transport("COM1").unwrap().is_connected());
    }

    #[test]
    fn test_compile_error_surfaces_synchronously() {
        let log = LogBuffer::new();
        let factory = Arc::new(MockTransportFactory::silent());
        let rig = Orchestrator::new(&config(), Arc::new(log), factory, None);
        let poses = vec![Pose::at(4, crate::model::Position::ORIGIN)];
        assert!(matches!(
            rig.start_imaging(&poses),
            Err(RigError::DeviceReference { device_id: 4 })
        ));
        assert!(rig.context().queue.is_empty());
        assert_eq!(rig.run_state(), RunState::Idle);
    }
}
