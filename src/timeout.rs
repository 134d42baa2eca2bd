//! Timeout bookkeeping for timer ports.
//!
//! Deadlines are absolute monotonic milliseconds as produced by
//! [`monotonic_millis`]. Each port owns at most one pending deadline; a
//! timer update replaces the previous one, and a deadline of zero (or less)
//! cancels it.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;
use std::time::Instant;

use crate::mailbox::Port;

/// Milliseconds on the process-wide monotonic clock.
pub fn monotonic_millis() -> i64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as i64
}

/// Pending (deadline, port) pairs ordered by deadline.
#[derive(Debug, Default)]
pub struct TimeoutQueue {
    queue: BTreeSet<(i64, Port)>,
    deadlines: HashMap<Port, i64>,
}

impl TimeoutQueue {
    pub fn new() -> TimeoutQueue {
        TimeoutQueue::default()
    }

    /// Upserts the deadline for `port`; `deadline <= 0` cancels it.
    pub fn update_timeout(&mut self, port: Port, deadline: i64) {
        if let Some(previous) = self.deadlines.remove(&port) {
            self.queue.remove(&(previous, port));
        }
        if deadline > 0 {
            self.deadlines.insert(port, deadline);
            self.queue.insert((deadline, port));
        }
    }

    pub fn has_timeout(&self) -> bool {
        !self.queue.is_empty()
    }

    /// The earliest pending (deadline, port) pair.
    pub fn current(&self) -> Option<(i64, Port)> {
        self.queue.iter().next().copied()
    }

    /// Drops the earliest pending pair.
    pub fn remove_current(&mut self) {
        if let Some(entry) = self.current() {
            self.queue.remove(&entry);
            self.deadlines.remove(&entry.1);
        }
    }
}
