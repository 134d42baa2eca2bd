//! Cross-thread registries the event loop consults during close commands.
//!
//! These are the only structures the loop shares with other threads; each is
//! guarded by its own mutex, held just for the duration of one query.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Mutex;

use crate::mailbox::Port;
use crate::socket::Socket;

/// Tracks how many handles share one listening descriptor.
///
/// Several consumers may listen on the same (address, port) combination and
/// therefore share a single kernel descriptor. The loop may only release the
/// descriptor once the last holder closes, which [`close_safe`] decides.
///
/// [`close_safe`]: ListeningSocketRegistry::close_safe
#[derive(Debug, Default)]
pub struct ListeningSocketRegistry {
    holders: Mutex<HashMap<RawFd, usize>>,
}

impl ListeningSocketRegistry {
    pub fn new() -> ListeningSocketRegistry {
        ListeningSocketRegistry::default()
    }

    /// Records one more holder of `fd`.
    pub fn register(&self, fd: RawFd) {
        let mut holders = self.holders.lock().unwrap();
        *holders.entry(fd).or_insert(0) += 1;
    }

    /// Releases the caller's hold on the socket's descriptor. Returns true
    /// iff no holders remain and the descriptor may be destroyed.
    pub fn close_safe(&self, socket: &Socket) -> bool {
        let fd = socket.fd();
        let mut holders = self.holders.lock().unwrap();
        match holders.get(&fd).copied() {
            Some(count) if count > 1 => {
                holders.insert(fd, count - 1);
                false
            }
            Some(_) => {
                holders.remove(&fd);
                true
            }
            // Unregistered descriptors have exactly one implicit holder.
            None => true,
        }
    }
}

/// Registered signal-forwarding sockets, keyed by descriptor.
#[derive(Debug, Default)]
pub struct SignalHandlerRegistry {
    handlers: Mutex<Vec<(RawFd, Port)>>,
}

impl SignalHandlerRegistry {
    pub fn new() -> SignalHandlerRegistry {
        SignalHandlerRegistry::default()
    }

    pub fn register(&self, fd: RawFd, port: Port) {
        self.handlers.lock().unwrap().push((fd, port));
    }

    /// Drops every registration matching the descriptor and consumer port.
    pub fn clear_by_fd(&self, fd: RawFd, port: Port) {
        self.handlers
            .lock()
            .unwrap()
            .retain(|&(h_fd, h_port)| h_fd != fd || h_port != port);
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.handlers.lock().unwrap().iter().any(|&(h_fd, _)| h_fd == fd)
    }
}
