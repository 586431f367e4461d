//! FIFO side-queue of not-yet-sent commands.

use crate::model::Action;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// One unit of outbound work.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A wire line for `port`. `action` is kept for motion bookkeeping and is
    /// `None` for bare commands such as status queries.
    Serial {
        /// Port the line is written to
        port: String,
        /// Wire line without terminator
        line: String,
        /// Action the line encodes
        action: Option<Action>,
    },
    /// A capture through the vendor SDK
    Capture {
        /// Remote-capture device
        device_id: u32,
        /// Focus before releasing the shutter
        auto_focus: bool,
    },
}

impl Outbound {
    /// True for a vendor SDK capture.
    pub fn is_capture(&self) -> bool {
        matches!(self, Outbound::Capture { .. })
    }

    /// True for a move or home, which leaves its device busy until it reports idle.
    pub fn is_motion(&self) -> bool {
        matches!(self, Outbound::Serial { action: Some(action), .. } if action.kind().is_motion())
    }
}

/// Thread-safe FIFO with a bounded blocking drain.
#[derive(Debug, Default)]
pub struct SideQueue {
    items: Mutex<VecDeque<Outbound>>,
    ready: Condvar,
}

impl SideQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one item. Never blocks beyond the queue lock.
    pub fn push(&self, item: Outbound) {
        self.items.lock().push_back(item);
        self.ready.notify_one();
    }

    /// Append items in order.
    pub fn extend(&self, items: impl IntoIterator<Item = Outbound>) {
        self.items.lock().extend(items);
        self.ready.notify_all();
    }

    /// Put an undelivered batch back at the head, keeping its order.
    pub fn requeue_front(&self, batch: Vec<Outbound>) {
        let mut items = self.items.lock();
        for item in batch.into_iter().rev() {
            items.push_front(item);
        }
        drop(items);
        self.ready.notify_all();
    }

    /// Take up to `max` items, waiting at most `wait` for the first one.
    ///
    /// A batch holds either serial lines or a single capture, never both. A
    /// motion line always ends its batch, so whatever follows a move waits for
    /// the handshake the move clears.
    pub fn drain_batch(&self, max: usize, wait: Duration) -> Vec<Outbound> {
        let mut items = self.items.lock();
        if items.is_empty() {
            self.ready.wait_for(&mut items, wait);
        }
        let mut batch = Vec::new();
        while batch.len() < max.max(1) {
            match items.front() {
                Some(Outbound::Capture { .. }) if !batch.is_empty() => break,
                Some(Outbound::Capture { .. }) => {
                    batch.extend(items.pop_front());
                    break;
                }
                Some(item @ Outbound::Serial { .. }) => {
                    let motion = item.is_motion();
                    batch.extend(items.pop_front());
                    if motion {
                        break;
                    }
                }
                None => break,
            }
        }
        batch
    }

    /// Drop everything queued, returning how many items were discarded.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let dropped = items.len();
        items.clear();
        drop(items);
        self.ready.notify_all();
        dropped
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Snapshot of the queued items, head first.
    pub fn snapshot(&self) -> Vec<Outbound> {
        self.items.lock().iter().cloned().collect()
    }
}
