//! The event loop thread and its command dispatcher.
//!
//! One dedicated thread blocks in `kevent`, then services expired timeouts,
//! drains the returned kernel events, and finally drains the wakeup pipe.
//! The pipe is drained last on purpose: a close command must never destroy a
//! descriptor that still has readiness events pending in the current batch.
//!
//! The thread exclusively owns the kqueue descriptor, the descriptor table
//! and the timeout queue, so none of them are locked. Producers reach the
//! loop only through [`EventHandler::send_data`] and the socket-command
//! helpers, which write to the wakeup pipe.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::descriptor::DescriptorInfo;
use crate::events::EventBits;
use crate::kqueue::{self, KqueueReactor, MAX_EVENTS};
use crate::mailbox::{Port, PortSink, ILLEGAL_PORT};
use crate::message::{Command, CommandData, InterruptMessage, SHUTDOWN_ID, TIMER_ID};
use crate::registry::{ListeningSocketRegistry, SignalHandlerRegistry};
use crate::socket::Socket;
use crate::timeout::{monotonic_millis, TimeoutQueue};
use crate::wakeup::{self, WakeupReceiver, WakeupSender, MAX_MESSAGES};

const LOOP_THREAD_NAME: &str = "portmux-event-loop";

/// Signalled exactly once, when the loop thread finishes its last iteration.
#[derive(Debug, Default)]
struct ShutdownMonitor {
    done: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownMonitor {
    fn notify_done(&self) {
        let mut done = self.done.lock().unwrap();
        *done = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.cond.wait(done).unwrap();
        }
    }
}

/// Public face of the event loop.
///
/// Construct one, [`start`](EventHandler::start) it, then submit commands
/// from any thread. Readiness is delivered through the supplied
/// [`PortSink`].
pub struct EventHandler {
    sender: WakeupSender,
    // Keeps the pipe's read end open for the handler's whole lifetime, so a
    // send after loop termination fills the pipe instead of raising SIGPIPE.
    _receiver: Arc<WakeupReceiver>,
    monitor: Arc<ShutdownMonitor>,
    listening: Arc<ListeningSocketRegistry>,
    signals: Arc<SignalHandlerRegistry>,
    worker: Mutex<Option<EventLoop>>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EventHandler {
    /// Builds the wakeup pipe, the kernel queue and the loop state with
    /// fresh registries.
    pub fn new(sink: Arc<dyn PortSink>) -> io::Result<EventHandler> {
        EventHandler::with_registries(sink, Arc::default(), Arc::default())
    }

    /// Like [`EventHandler::new`] with caller-supplied registries, for
    /// embedders sharing them with a wider socket layer.
    pub fn with_registries(
        sink: Arc<dyn PortSink>,
        listening: Arc<ListeningSocketRegistry>,
        signals: Arc<SignalHandlerRegistry>,
    ) -> io::Result<EventHandler> {
        let (sender, receiver) = wakeup::channel()?;
        let receiver = Arc::new(receiver);
        let reactor = KqueueReactor::new()?;
        reactor.register_wakeup(receiver.raw_fd())?;
        let monitor = Arc::new(ShutdownMonitor::default());
        let worker = EventLoop {
            reactor,
            wakeup: Arc::clone(&receiver),
            table: HashMap::new(),
            timeouts: TimeoutQueue::new(),
            sink,
            listening: Arc::clone(&listening),
            signals: Arc::clone(&signals),
            shutdown: false,
            monitor: Arc::clone(&monitor),
        };
        Ok(EventHandler {
            sender,
            _receiver: receiver,
            monitor,
            listening,
            signals,
            worker: Mutex::new(Some(worker)),
            join: Mutex::new(None),
        })
    }

    /// Spawns the loop thread. Failing to spawn leaves the process without
    /// an I/O engine and is unrecoverable.
    pub fn start(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap()
            .take()
            .expect("event handler already started");
        let handle = thread::Builder::new()
            .name(LOOP_THREAD_NAME.into())
            .spawn(move || worker.run())
            .expect("failed to spawn event handler thread");
        *self.join.lock().unwrap() = Some(handle);
    }

    /// Asks the loop to terminate after its current iteration.
    pub fn shutdown(&self) {
        self.send_data(SHUTDOWN_ID, ILLEGAL_PORT, 0);
    }

    /// Blocks until the loop thread has completed its final iteration and
    /// exited.
    pub fn wait_for_shutdown(&self) {
        self.monitor.wait();
        if let Some(handle) = self.join.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Forwards a raw control record ([`TIMER_ID`] / [`SHUTDOWN_ID`]).
    pub fn send_data(&self, id: i64, port: Port, data: i64) {
        self.sender.send(InterruptMessage::new(id, port, data));
    }

    /// Submits a socket command built with the helpers in
    /// [`message`](crate::message). The socket's reference count is held
    /// across the wakeup and released inside the loop.
    pub fn send_socket_command(&self, socket: &Socket, port: Port, data: i64) {
        let id = socket.clone().into_msg_id();
        self.sender.send(InterruptMessage::new(id, port, data));
    }

    pub fn listening_registry(&self) -> &Arc<ListeningSocketRegistry> {
        &self.listening
    }

    pub fn signal_registry(&self) -> &Arc<SignalHandlerRegistry> {
        &self.signals
    }
}

struct EventLoop {
    reactor: KqueueReactor,
    wakeup: Arc<WakeupReceiver>,
    table: HashMap<RawFd, DescriptorInfo>,
    timeouts: TimeoutQueue,
    sink: Arc<dyn PortSink>,
    listening: Arc<ListeningSocketRegistry>,
    signals: Arc<SignalHandlerRegistry>,
    shutdown: bool,
    monitor: Arc<ShutdownMonitor>,
}

impl EventLoop {
    fn run(mut self) {
        let mut events: [libc::kevent; MAX_EVENTS] = unsafe { mem::zeroed() };
        while !self.shutdown {
            let millis = self.next_timeout_millis();
            let count = self.reactor.wait(&mut events, millis);
            self.service_timeouts();
            self.handle_events(&events[..count]);
        }
        self.reclaim_queued_sockets();
        for (_, mut di) in self.table.drain() {
            di.close();
        }
        crate::debug!("event loop terminated");
        self.monitor.notify_done();
    }

    /// Milliseconds until the next deadline, clamped to `i32::MAX`;
    /// negative means block indefinitely.
    fn next_timeout_millis(&self) -> i64 {
        match self.timeouts.current() {
            None => -1,
            Some((deadline, _)) => (deadline - monotonic_millis()).clamp(0, i32::MAX as i64),
        }
    }

    fn service_timeouts(&mut self) {
        if let Some((deadline, port)) = self.timeouts.current() {
            if deadline - monotonic_millis() <= 0 {
                self.sink.post_null(port);
                self.timeouts.remove_current();
            }
        }
    }

    fn handle_events(&mut self, events: &[libc::kevent]) {
        let mut interrupt_seen = false;
        for event in events {
            if (event.flags & libc::EV_ERROR) != 0 {
                panic!(
                    "kevent reported an error on ident {}: {}",
                    event.ident,
                    io::Error::from_raw_os_error(event.data as i32)
                );
            }
            match kqueue::cookie_to_fd(event.udata) {
                None => interrupt_seen = true,
                Some(fd) => self.handle_socket_event(fd, event),
            }
        }
        if interrupt_seen {
            // Handled after socket events so a queued close command cannot
            // destroy a descriptor with events still pending in this batch.
            self.handle_interrupts();
        }
    }

    fn handle_socket_event(&mut self, fd: RawFd, event: &libc::kevent) {
        let Self {
            table,
            reactor,
            sink,
            ..
        } = self;
        let Some(di) = table.get_mut(&fd) else {
            // Stale cookie; the descriptor was torn down earlier.
            return;
        };
        let old_mask = di.mask();
        let event_mask = kqueue::translate(event, di.is_listening());
        if event_mask.contains(EventBits::ERROR) {
            di.notify_all_ports(event_mask, sink.as_ref());
            reactor.update(old_mask, di, sink.as_ref());
        } else if !di.mask().is_empty() {
            let port = di.next_notify_port(event_mask);
            debug_assert_ne!(port, ILLEGAL_PORT);
            reactor.update(old_mask, di, sink.as_ref());
            sink.post_int32(port, event_mask.bits() as i32);
        }
        // A descriptor whose subscribers are all out of tokens gets no
        // delivery; the event resurfaces once credit is returned and the
        // filter is reinstalled.
    }

    fn handle_interrupts(&mut self) {
        let mut messages = [InterruptMessage::default(); MAX_MESSAGES];
        let count = self.wakeup.drain(&mut messages);
        for message in &messages[..count] {
            self.dispatch(message);
        }
    }

    fn dispatch(&mut self, msg: &InterruptMessage) {
        if msg.id == TIMER_ID {
            self.timeouts.update_timeout(msg.port, msg.data);
            return;
        }
        if msg.id == SHUTDOWN_ID {
            self.shutdown = true;
            return;
        }

        // Reclaim the reference the sender leaked into the message; dropping
        // `socket` at the end of dispatch is the scoped release.
        let socket = unsafe { Socket::from_msg_id(msg.id) };
        let cmd = CommandData::decode(msg.data)
            .unwrap_or_else(|| panic!("malformed interrupt command {:#x}", msg.data));
        let fd = socket.fd();
        if fd < 0 {
            return;
        }

        let Self {
            table,
            reactor,
            sink,
            listening,
            signals,
            ..
        } = self;
        let di = table.entry(fd).or_insert_with(|| {
            if cmd.listening {
                DescriptorInfo::multiple(fd)
            } else {
                DescriptorInfo::single(fd)
            }
        });

        match cmd.command {
            Command::ShutdownRead => {
                debug_assert!(!di.is_listening());
                // The descriptor may already be half-closed.
                unsafe { libc::shutdown(fd, libc::SHUT_RD) };
            }
            Command::ShutdownWrite => {
                debug_assert!(!di.is_listening());
                unsafe { libc::shutdown(fd, libc::SHUT_WR) };
            }
            Command::ReturnTokens(count) => {
                let old_mask = di.mask();
                di.return_tokens(msg.port, count as i64);
                reactor.update(old_mask, di, sink.as_ref());
            }
            Command::SetEventMask(mask) => {
                let old_mask = di.mask();
                di.set_port_and_mask(msg.port, mask);
                reactor.update(old_mask, di, sink.as_ref());
            }
            Command::Close => {
                if cmd.signal {
                    signals.clear_by_fd(fd, socket.isolate_port());
                }
                let old_mask = di.mask();
                if msg.port != ILLEGAL_PORT {
                    di.remove_port(msg.port);
                }
                let new_mask = di.mask();
                reactor.update(old_mask, di, sink.as_ref());

                if cmd.listening {
                    // Only release the kernel descriptor when no other
                    // consumer still listens through it.
                    if listening.close_safe(&socket) {
                        debug_assert!(new_mask.is_empty());
                        let mut di = table.remove(&fd).unwrap();
                        di.close();
                    }
                } else {
                    debug_assert!(new_mask.is_empty());
                    let mut di = table.remove(&fd).unwrap();
                    di.close();
                }
                socket.close_fd();
                if msg.port != ILLEGAL_PORT {
                    sink.post_int32(msg.port, EventBits::DESTROYED.bits() as i32);
                }
            }
        }
    }

    /// Reclaims socket references still queued in the pipe when the loop
    /// exits, so shutdown does not leak them.
    fn reclaim_queued_sockets(&mut self) {
        let mut messages = [InterruptMessage::default(); MAX_MESSAGES];
        loop {
            let count = self.wakeup.drain(&mut messages);
            if count == 0 {
                return;
            }
            for message in &messages[..count] {
                if message.id != TIMER_ID && message.id != SHUTDOWN_ID {
                    drop(unsafe { Socket::from_msg_id(message.id) });
                }
            }
        }
    }
}
