//! Reference-counted socket handle shared between producer threads and the
//! event loop.
//!
//! A command message carries its target socket as a raw refcount: the sender
//! leaks one strong reference into the message id, and the loop reclaims it
//! while dispatching. The binding on the receive side is the scoped release —
//! the reference drops when dispatch of that message finishes, so the handle
//! stays alive for exactly as long as the command that names it.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::mailbox::Port;

#[derive(Debug, Clone)]
pub struct Socket {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    fd: AtomicI32,
    isolate_port: Port,
}

impl Socket {
    /// Wraps an open descriptor. `isolate_port` identifies the owning
    /// consumer for signal-handler bookkeeping.
    pub fn new(fd: RawFd, isolate_port: Port) -> Socket {
        Socket {
            inner: Arc::new(Inner {
                fd: AtomicI32::new(fd),
                isolate_port,
            }),
        }
    }

    /// The wrapped descriptor, or `-1` once the handle has been closed.
    pub fn fd(&self) -> RawFd {
        self.inner.fd.load(Ordering::Acquire)
    }

    pub fn isolate_port(&self) -> Port {
        self.inner.isolate_port
    }

    /// Marks the handle closed. The kernel descriptor itself is closed by
    /// the event loop when the descriptor entry is torn down.
    pub fn close_fd(&self) {
        self.inner.fd.store(-1, Ordering::Release);
    }

    /// Leaks one strong reference into a message id.
    pub(crate) fn into_msg_id(self) -> i64 {
        Arc::into_raw(self.inner) as usize as i64
    }

    /// Reclaims a reference previously leaked by [`Socket::into_msg_id`].
    ///
    /// # Safety
    ///
    /// `id` must come from `into_msg_id` and must be reclaimed exactly once.
    pub(crate) unsafe fn from_msg_id(id: i64) -> Socket {
        Socket {
            inner: unsafe { Arc::from_raw(id as usize as *const Inner) },
        }
    }
}
