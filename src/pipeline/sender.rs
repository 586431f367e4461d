//! Batch dispatch and the steady-state sender worker.
//!
//! [`send_next_batch`] is the one step shared by the sender and the run
//! controllers: drain up to N items, wait for the handshake, record motion with
//! the state machine, then write. A failed write is logged and its batch
//! dropped; the listener's staleness re-query is the recovery path.

use super::{Gate, Outbound, PipelineContext};
use crate::adapters::CommandBatch;
use crate::error::{AppResult, RigError};
use crate::model::Action;
use crate::notify::Signal;
use crate::worker::{StopFlag, StopOutcome, Worker};
use std::sync::Arc;
use std::time::Instant;

/// Capability used to fire remote-capture snaps.
pub trait CaptureTrigger: Send + Sync {
    /// Start a capture on `device_id`. Completion is reported asynchronously.
    fn snap(&self, device_id: u32, auto_focus: bool) -> AppResult<()>;

    /// True while any camera still has images to deliver.
    fn is_busy(&self) -> bool;

    /// True while `device_id` has images to deliver.
    fn is_writing(&self, device_id: u32) -> bool;
}

/// Result of one dispatch step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Items handed to a transport or camera
    Sent(usize),
    /// Nothing was queued within the queue wait
    Empty,
    /// The stop flag was raised; the batch went back to the queue head
    Stopped,
    /// The batch could not be delivered and was discarded
    Dropped(usize),
}

/// Drain, gate and transmit one batch of at most `batch_size` items.
pub fn send_next_batch(ctx: &PipelineContext, batch_size: usize, stop: &StopFlag) -> StepOutcome {
    let batch = ctx.queue.drain_batch(batch_size, ctx.pacing.queue_wait());
    if batch.is_empty() {
        return StepOutcome::Empty;
    }
    let poll = ctx.pacing.yield_interval();
    let count = batch.len();

    match ctx.cts.wait(stop, poll, || ctx.links.any_connected()) {
        Gate::Clear => {}
        Gate::Stopped => {
            ctx.queue.requeue_front(batch);
            return StepOutcome::Stopped;
        }
        Gate::Disconnected => {
            ctx.notify(
                Signal::Error,
                &format!("Link disconnected; dropping {count} queued command(s)"),
            );
            return StepOutcome::Dropped(count);
        }
    }

    if let Some(Outbound::Capture {
        device_id,
        auto_focus,
    }) = batch.first().cloned()
    {
        while ctx.capture_busy() {
            if stop.sleep(poll) {
                ctx.queue.requeue_front(batch);
                return StepOutcome::Stopped;
            }
        }
        return transmit_capture(ctx, device_id, auto_focus);
    }

    transmit_serial(ctx, batch)
}

fn transmit_capture(ctx: &PipelineContext, device_id: u32, auto_focus: bool) -> StepOutcome {
    let Some(trigger) = ctx.capture() else {
        ctx.notify(
            Signal::Error,
            &format!("No capture backend for device {device_id}; dropping snap"),
        );
        return StepOutcome::Dropped(1);
    };
    match trigger.snap(device_id, auto_focus) {
        Ok(()) => {
            ctx.with_machine_mut(|m| m.set_writing(device_id, trigger.is_writing(device_id)));
            ctx.notify(Signal::Info, &format!("Remote snap on device {device_id}"));
            StepOutcome::Sent(1)
        }
        Err(e) => {
            ctx.notify(
                Signal::Error,
                &format!("Remote snap on device {device_id} failed: {e}"),
            );
            StepOutcome::Dropped(1)
        }
    }
}

fn transmit_serial(ctx: &PipelineContext, batch: Vec<Outbound>) -> StepOutcome {
    let mut groups: Vec<(CommandBatch, Vec<Action>)> = Vec::new();
    for item in batch {
        let Outbound::Serial { port, line, action } = item else {
            continue;
        };
        let index = match groups.iter().position(|(b, _)| b.port() == port) {
            Some(index) => index,
            None => {
                groups.push((CommandBatch::new(port), Vec::new()));
                groups.len() - 1
            }
        };
        let (commands, actions) = &mut groups[index];
        commands.queue(line);
        actions.extend(action);
    }

    let dispatched: Vec<Action> = groups.iter().flat_map(|(_, a)| a.iter().cloned()).collect();
    ctx.update(|m| m.on_dispatch(&dispatched, Instant::now()));

    let mut sent = 0;
    let mut dropped = 0;
    for (mut commands, actions) in groups {
        let lines = commands.lines().to_vec();
        let port = commands.port().to_string();
        let result = match ctx.links.get(&port) {
            Some(transport) => commands.flush(transport.as_ref()),
            None => Err(RigError::PortNotOpen(port.clone())),
        };
        match result {
            Ok(()) => {
                for line in &lines {
                    ctx.notify(Signal::Echo, line);
                }
                sent += lines.len();
            }
            Err(e) => {
                ctx.notify(
                    Signal::Error,
                    &format!("Write to {port} failed: {e}; dropping {} line(s)", lines.len()),
                );
                dropped += lines.len();
                ctx.update(|m| m.on_write_failed(&actions));
            }
        }
    }

    if sent == 0 && dropped > 0 {
        StepOutcome::Dropped(dropped)
    } else {
        StepOutcome::Sent(sent)
    }
}

/// Steady-state sender: drains the side-queue one small batch at a time.
#[derive(Debug)]
pub struct Sender {
    worker: Worker,
}

impl Sender {
    /// Spawn the sender worker.
    pub fn start(ctx: Arc<PipelineContext>) -> AppResult<Self> {
        let batch_size = ctx.pacing.sender_batch_size;
        let worker = Worker::spawn("rig-sender", move |stop| {
            while !stop.is_set() {
                if send_next_batch(&ctx, batch_size, &stop) == StepOutcome::Stopped {
                    break;
                }
            }
        })?;
        Ok(Self { worker })
    }

    /// True when called from the sender's own thread.
    pub fn is_current(&self) -> bool {
        self.worker.is_current()
    }

    /// Stop and join the sender.
    pub fn stop(self) -> StopOutcome {
        self.worker.stop()
    }
}
