//! Kernel filter lifecycle and event translation.
//!
//! The reactor is the sole owner of the kqueue descriptor and the only code
//! that mutates kernel filters. After every descriptor state change the loop
//! hands the old mask to [`KqueueReactor::update`], which reconciles the
//! installed `EVFILT_READ`/`EVFILT_WRITE` set with the new mask.
//!
//! Filters carry an integer cookie of `fd + 1` in the kernel user-data word;
//! cookie `0` is reserved for the wakeup pipe. Events resolve back through
//! the loop's descriptor table, so a stale cookie can never be dereferenced.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use crate::descriptor::DescriptorInfo;
use crate::errno::{retry_on_eintr, Errno};
use crate::events::EventBits;
use crate::mailbox::PortSink;
use crate::wakeup::set_close_on_exec;

/// Size of the per-iteration kernel event buffer.
pub const MAX_EVENTS: usize = 16;

fn cookie_of(fd: RawFd) -> *mut libc::c_void {
    (fd as usize + 1) as *mut libc::c_void
}

/// Resolves a kernel cookie; `None` marks the wakeup pipe.
pub fn cookie_to_fd(udata: *mut libc::c_void) -> Option<RawFd> {
    match udata as usize {
        0 => None,
        cookie => Some((cookie - 1) as RawFd),
    }
}

pub struct KqueueReactor {
    kq: OwnedFd,
}

impl KqueueReactor {
    pub fn new() -> io::Result<KqueueReactor> {
        let fd = Errno::result(unsafe { libc::kqueue() })?;
        let kq = unsafe { OwnedFd::from_raw_fd(fd) };
        set_close_on_exec(fd)?;
        Ok(KqueueReactor { kq })
    }

    /// Registers the wakeup pipe's read end under the null cookie. This
    /// filter stays installed for the reactor's whole lifetime.
    pub fn register_wakeup(&self, fd: RawFd) -> io::Result<()> {
        let event = libc::kevent {
            ident: fd as usize,
            filter: libc::EVFILT_READ,
            flags: libc::EV_ADD,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };
        Errno::result(unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                &event,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        })?;
        Ok(())
    }

    /// Reconciles installed filters after a descriptor state change.
    ///
    /// Listening sockets never change mask while installed; their only
    /// transitions are zero ↔ nonzero.
    pub fn update(&self, old_mask: EventBits, di: &mut DescriptorInfo, sink: &dyn PortSink) {
        let new_mask = di.mask();
        if !old_mask.is_empty() && new_mask.is_empty() {
            self.remove(di);
        } else if old_mask.is_empty() && !new_mask.is_empty() {
            self.add(di, sink);
        } else if !old_mask.is_empty() && !new_mask.is_empty() && old_mask != new_mask {
            debug_assert!(!di.is_listening());
            self.remove(di);
            self.add(di, sink);
        }
    }

    /// Installs filters for every bit in the descriptor's mask.
    fn add(&self, di: &mut DescriptorInfo, sink: &dyn PortSink) {
        debug_assert!(!di.tracked_by_kqueue());
        debug_assert!(di.has_read_event() || di.has_write_event());

        // Level-triggered for listening sockets so pending connections stay
        // visible; edge-triggered otherwise so readiness does not re-fire
        // until the state changes.
        let flags = if di.is_listening() {
            libc::EV_ADD
        } else {
            libc::EV_ADD | libc::EV_CLEAR
        };

        let mut changes = [libc::kevent {
            ident: di.fd() as usize,
            filter: 0,
            flags,
            fflags: 0,
            data: 0,
            udata: cookie_of(di.fd()),
        }; 2];
        let mut count = 0;
        if di.has_read_event() {
            changes[count].filter = libc::EVFILT_READ;
            count += 1;
        }
        if di.has_write_event() {
            changes[count].filter = libc::EVFILT_WRITE;
            count += 1;
        }

        let status = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                changes.as_ptr(),
                count as i32,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if Errno::result(status).is_err() {
            // The kernel queue refused the descriptor: already closed, or an
            // unpollable device such as /dev/null. Surface it as a close so
            // the consumer releases the descriptor.
            crate::debug!("kqueue refused fd {}, synthesizing close", di.fd());
            di.notify_all_ports(EventBits::CLOSE, sink);
        } else {
            di.set_tracked_by_kqueue(true);
        }
    }

    /// Removes both filters. Errors are ignored; the filter may never have
    /// been installed.
    fn remove(&self, di: &mut DescriptorInfo) {
        if !di.tracked_by_kqueue() {
            return;
        }
        for filter in [libc::EVFILT_READ, libc::EVFILT_WRITE] {
            let change = libc::kevent {
                ident: di.fd() as usize,
                filter,
                flags: libc::EV_DELETE,
                fflags: 0,
                data: 0,
                udata: ptr::null_mut(),
            };
            unsafe {
                libc::kevent(
                    self.kq.as_raw_fd(),
                    &change,
                    1,
                    ptr::null_mut(),
                    0,
                    ptr::null(),
                );
            }
        }
        di.set_tracked_by_kqueue(false);
    }

    /// Blocks until events arrive or the timeout elapses. A negative
    /// timeout blocks indefinitely. `EINTR` is retried; any other failure
    /// indicates a corrupted host environment.
    pub fn wait(&self, events: &mut [libc::kevent], timeout_millis: i64) -> usize {
        let ts;
        let timeout = if timeout_millis >= 0 {
            ts = libc::timespec {
                tv_sec: (timeout_millis / 1000) as libc::time_t,
                tv_nsec: ((timeout_millis % 1000) * 1_000_000) as libc::c_long,
            };
            &ts as *const libc::timespec
        } else {
            ptr::null()
        };

        let count = retry_on_eintr(|| unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout,
            )
        })
        .unwrap_or_else(|err| panic!("kevent failed: {err}"));
        count as usize
    }
}

/// Maps one kernel event onto the delivered mask.
///
/// Data is deliberately prioritized over close: a readable descriptor at EOF
/// still surfaces `IN` so buffered bytes can be consumed first.
pub fn translate(event: &libc::kevent, listening: bool) -> EventBits {
    crate::trace!(
        "kevent fd {} filter {} flags {:#x} fflags {:#x} data {}",
        event.ident,
        event.filter,
        event.flags,
        event.fflags,
        event.data
    );

    let eof = (event.flags & libc::EV_EOF) != 0;
    let mut event_mask = EventBits::NONE;
    if listening {
        // On a listening socket the read filter means connections are ready
        // to be accepted.
        debug_assert_eq!(event.filter, libc::EVFILT_READ);
        if eof {
            if event.fflags != 0 {
                event_mask |= EventBits::ERROR;
            } else {
                event_mask |= EventBits::CLOSE;
            }
        }
        if event_mask.is_empty() {
            event_mask |= EventBits::IN;
        }
    } else if event.filter == libc::EVFILT_READ {
        event_mask = EventBits::IN;
        if eof {
            if event.fflags != 0 {
                event_mask = EventBits::ERROR;
            } else {
                event_mask |= EventBits::CLOSE;
            }
        }
    } else if event.filter == libc::EVFILT_WRITE {
        event_mask = EventBits::OUT;
        if eof && event.fflags != 0 {
            event_mask = EventBits::ERROR;
        }
    } else {
        unreachable!("unexpected kqueue filter {}", event.filter);
    }

    event_mask
}
