//! Per-port read threads feeding the machine state machine.
//!
//! Each open port gets exactly one [`ReadThread`]: it reads lines, logs them
//! raw, parses them and folds them into the machine. It also drives the
//! staleness re-query. It never waits on the handshake; it only sets it.

use crate::adapters::{SharedTransport, TransportFactory};
use crate::error::AppResult;
use crate::notify::Signal;
use crate::pipeline::PipelineContext;
use crate::protocol::{self, Reply};
use crate::worker::{StopFlag, StopOutcome, Worker};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

/// A background reader bound to one serial port.
#[derive(Debug)]
pub struct ReadThread {
    port: String,
    worker: Worker,
}

impl ReadThread {
    /// Port this thread reads.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// True once the read loop has exited.
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }
}

/// Owner of every [`ReadThread`].
pub struct Listener {
    ctx: Arc<PipelineContext>,
    threads: Mutex<Vec<ReadThread>>,
}

impl Listener {
    /// Listener with no open ports.
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            ctx,
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Open `port` and start its reader.
    ///
    /// Idempotent: returns `Ok(false)` without opening anything when a live
    /// reader already exists for the port.
    #[instrument(skip(self, factory))]
    pub fn open(&self, port: &str, factory: &dyn TransportFactory) -> AppResult<bool> {
        let mut threads = self.threads.lock();
        if let Some(index) = threads.iter().position(|t| t.port == port) {
            if !threads[index].is_finished() {
                self.ctx
                    .notify(Signal::Debug, &format!("Port {port} is already open"));
                return Ok(false);
            }
            let dead = threads.remove(index);
            self.teardown(dead);
        }

        let transport = factory.open(port)?;
        self.ctx.links.insert(Arc::clone(&transport));

        let ctx = Arc::clone(&self.ctx);
        let reader = Arc::clone(&transport);
        let spawned = Worker::spawn(format!("rig-listener-{port}"), move |stop| {
            read_loop(&ctx, &reader, &stop)
        });
        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                self.ctx.links.remove(port);
                transport.close();
                return Err(e);
            }
        };
        threads.push(ReadThread {
            port: port.to_string(),
            worker,
        });
        drop(threads);

        self.ctx.update(|m| m.on_connect(port, Instant::now()));
        Ok(true)
    }

    /// Stop and join the reader for `port`, then close its transport.
    pub fn close(&self, port: &str) -> Option<StopOutcome> {
        let thread = {
            let mut threads = self.threads.lock();
            let index = threads.iter().position(|t| t.port == port)?;
            threads.remove(index)
        };
        Some(self.teardown(thread))
    }

    /// Close every open port.
    pub fn close_all(&self) -> Vec<(String, StopOutcome)> {
        let threads: Vec<ReadThread> = std::mem::take(&mut *self.threads.lock());
        threads
            .into_iter()
            .map(|thread| {
                let port = thread.port.clone();
                (port, self.teardown(thread))
            })
            .collect()
    }

    fn teardown(&self, thread: ReadThread) -> StopOutcome {
        let ReadThread { port, worker } = thread;
        let outcome = worker.stop();
        if let Some(transport) = self.ctx.links.remove(&port) {
            transport.close();
        }
        self.ctx.update(|m| m.on_disconnect(&port));
        debug!(port = %port, ?outcome, "Read thread closed");
        outcome
    }

    /// Ports with a reader.
    pub fn ports(&self) -> Vec<String> {
        self.threads.lock().iter().map(|t| t.port.clone()).collect()
    }

    /// True when `port` has a reader.
    pub fn is_open(&self, port: &str) -> bool {
        self.threads.lock().iter().any(|t| t.port == port)
    }

    /// Number of open ports.
    pub fn count(&self) -> usize {
        self.threads.lock().len()
    }
}

fn read_loop(ctx: &PipelineContext, transport: &SharedTransport, stop: &StopFlag) {
    let port = transport.port_name().to_string();
    let poll = ctx.pacing.yield_interval();

    while !stop.is_set() {
        match transport.read_line(poll) {
            Ok(Some(line)) => handle_line(ctx, &port, &line),
            Ok(None) => {}
            Err(e) => {
                if !transport.is_connected() {
                    ctx.notify(Signal::Error, &format!("Lost connection to {port}: {e}"));
                    ctx.links.remove(&port);
                    ctx.update(|m| m.on_disconnect(&port));
                    break;
                }
                ctx.notify(Signal::Error, &format!("Read from {port} failed: {e}"));
                stop.sleep(poll);
            }
        }
        ctx.update(|m| m.on_tick(Instant::now()));
    }
}

fn handle_line(ctx: &PipelineContext, port: &str, line: &str) {
    // A terminator split across reads surfaces as an empty line.
    if line.trim().is_empty() {
        return;
    }
    ctx.notify(Signal::Raw, line);
    match protocol::parse_line(line, Instant::now()) {
        Some(Reply::Other { device_id, text }) => ctx.notify(
            Signal::Debug,
            &format!("Unrecognised reply from device {device_id} on {port}: {text}"),
        ),
        Some(reply) => ctx.update(|m| m.on_reply(port, reply)),
        None => {}
    }
}
