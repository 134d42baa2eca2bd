//! The wakeup channel: a self-pipe carrying control messages to the loop.
//!
//! Producers write whole [`InterruptMessage`] records to the blocking write
//! end; the loop owns the non-blocking read end, which is registered with
//! the kernel queue under the null cookie. Because one record fits in
//! `PIPE_BUF`, concurrent writers never interleave and need no lock.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::errno::{retry_on_eintr, Errno};
use crate::message::{InterruptMessage, INTERRUPT_MESSAGE_SIZE};

/// Upper bound on records consumed by one [`WakeupReceiver::drain`] call.
pub const MAX_MESSAGES: usize = 16;

pub(crate) fn set_close_on_exec(fd: RawFd) -> io::Result<()> {
    let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    Ok(())
}

pub(crate) fn set_non_blocking(fd: RawFd) -> io::Result<()> {
    let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

/// Creates the channel. The read end is non-blocking; both ends are
/// close-on-exec.
pub fn channel() -> io::Result<(WakeupSender, WakeupReceiver)> {
    let mut fds = [0 as RawFd; 2];
    Errno::result(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    let reader = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let writer = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    set_non_blocking(reader.as_raw_fd())?;
    set_close_on_exec(reader.as_raw_fd())?;
    set_close_on_exec(writer.as_raw_fd())?;
    Ok((
        WakeupSender {
            pipe: Arc::new(writer),
        },
        WakeupReceiver { pipe: reader },
    ))
}

/// Write end; cheap to clone and share across producer threads.
#[derive(Debug, Clone)]
pub struct WakeupSender {
    pipe: Arc<OwnedFd>,
}

impl WakeupSender {
    /// Writes one record with blocking semantics. A short or failed write
    /// means the loop can no longer be reached and is unrecoverable.
    pub fn send(&self, msg: InterruptMessage) {
        let bytes = msg.to_bytes();
        let written = retry_on_eintr(|| unsafe {
            libc::write(
                self.pipe.as_raw_fd(),
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
            )
        })
        .unwrap_or_else(|err| panic!("interrupt message write failed: {err}"));
        if written as usize != INTERRUPT_MESSAGE_SIZE {
            panic!("interrupt message write was short: {written} bytes");
        }
    }
}

/// Read end, owned by the loop thread.
#[derive(Debug)]
pub struct WakeupReceiver {
    pipe: OwnedFd,
}

impl WakeupReceiver {
    pub fn raw_fd(&self) -> RawFd {
        self.pipe.as_raw_fd()
    }

    /// Reads up to `out.len()` complete records, returning how many arrived.
    /// A trailing partial record cannot occur given `PIPE_BUF` atomicity and
    /// is treated as a fatal protocol error.
    pub fn drain(&self, out: &mut [InterruptMessage]) -> usize {
        let mut buf = [0u8; MAX_MESSAGES * INTERRUPT_MESSAGE_SIZE];
        let len = out.len().min(MAX_MESSAGES) * INTERRUPT_MESSAGE_SIZE;
        let read = retry_on_eintr(|| unsafe {
            libc::read(
                self.pipe.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                len,
            )
        });
        let read = match read {
            Ok(n) => n as usize,
            Err(err) if *err == libc::EAGAIN => return 0,
            Err(err) => panic!("interrupt message read failed: {err}"),
        };
        if read % INTERRUPT_MESSAGE_SIZE != 0 {
            panic!("partial interrupt message: {read} bytes");
        }
        let count = read / INTERRUPT_MESSAGE_SIZE;
        for (slot, chunk) in out
            .iter_mut()
            .zip(buf[..read].chunks_exact(INTERRUPT_MESSAGE_SIZE))
        {
            *slot = InterruptMessage::from_bytes(chunk.try_into().unwrap());
        }
        count
    }
}
