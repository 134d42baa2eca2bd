#![cfg(any(target_os = "macos", target_os = "ios"))]

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::os::unix::net::UnixStream;
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use portmux::events::EventBits;
use portmux::handler::EventHandler;
use portmux::mailbox::{Port, PortSink};
use portmux::message;
use portmux::socket::Socket;
use portmux::timeout::monotonic_millis;
use portmux::TIMER_ID;

use socket2::{Domain, Socket as NetSocket, Type};

#[derive(Default)]
struct RecordingSink {
    posts: Mutex<Vec<(Port, Option<i32>)>>,
    cond: Condvar,
}

impl RecordingSink {
    fn posts(&self) -> Vec<(Port, Option<i32>)> {
        self.posts.lock().unwrap().clone()
    }

    /// Blocks until the recorded deliveries satisfy `pred`, or the timeout
    /// elapses. Returns whether the predicate held.
    fn wait_until(
        &self,
        timeout: Duration,
        pred: impl Fn(&[(Port, Option<i32>)]) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut posts = self.posts.lock().unwrap();
        loop {
            if pred(&posts) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(posts, deadline - now).unwrap();
            posts = guard;
        }
    }
}

impl PortSink for RecordingSink {
    fn post_int32(&self, port: Port, value: i32) {
        self.posts.lock().unwrap().push((port, Some(value)));
        self.cond.notify_all();
    }

    fn post_null(&self, port: Port) {
        self.posts.lock().unwrap().push((port, None));
        self.cond.notify_all();
    }
}

const IN: i32 = 1 << 0;
const CLOSE: i32 = 1 << 3;
const DESTROYED: i32 = 1 << 4;

const WAIT: Duration = Duration::from_secs(5);

fn start_handler() -> (EventHandler, Arc<RecordingSink>) {
    tracing_subscriber::fmt().with_target(false).try_init().ok();
    let sink = Arc::new(RecordingSink::default());
    let handler = EventHandler::new(sink.clone()).unwrap();
    handler.start();
    (handler, sink)
}

fn count_for(posts: &[(Port, Option<i32>)], port: Port) -> usize {
    posts.iter().filter(|(p, _)| *p == port).count()
}

#[test]
fn delivers_readiness_and_respects_tokens() {
    let (handler, sink) = start_handler();

    let (local, mut peer) = UnixStream::pair().unwrap();
    let socket = Socket::new(local.into_raw_fd(), 0);
    handler.send_socket_command(&socket, 7, message::set_event_mask(EventBits::IN, false));

    peer.write_all(b"X").unwrap();
    assert!(sink.wait_until(WAIT, |posts| posts.contains(&(7, Some(IN)))));

    // The only token is spent; more data must stay silent until the
    // consumer returns credit.
    peer.write_all(b"Y").unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(count_for(&sink.posts(), 7), 1);

    handler.send_socket_command(&socket, 7, message::return_tokens(1, false));
    assert!(sink.wait_until(WAIT, |posts| count_for(posts, 7) == 2));
    assert_eq!(sink.posts()[1], (7, Some(IN)));

    handler.send_socket_command(&socket, 7, message::close(false, false));
    assert!(sink.wait_until(WAIT, |posts| posts.contains(&(7, Some(DESTROYED)))));

    handler.shutdown();
    handler.wait_for_shutdown();
}

#[test]
fn surfaces_close_after_buffered_data() {
    let (handler, sink) = start_handler();

    let (local, mut peer) = UnixStream::pair().unwrap();
    let socket = Socket::new(local.into_raw_fd(), 0);
    handler.send_socket_command(&socket, 7, message::set_event_mask(EventBits::IN, false));

    peer.write_all(b"data").unwrap();
    assert!(sink.wait_until(WAIT, |posts| posts.contains(&(7, Some(IN)))));

    // Remote closes; once the consumer acks and re-arms, the close edge
    // surfaces (data-before-close priority keeps IN set alongside it).
    drop(peer);
    handler.send_socket_command(&socket, 7, message::return_tokens(1, false));
    assert!(sink.wait_until(WAIT, |posts| {
        posts
            .iter()
            .any(|&(port, value)| port == 7 && value.is_some_and(|v| v & CLOSE != 0))
    }));

    handler.send_socket_command(&socket, 7, message::close(false, false));
    assert!(sink.wait_until(WAIT, |posts| posts.contains(&(7, Some(DESTROYED)))));

    handler.shutdown();
    handler.wait_for_shutdown();
}

#[test]
fn listening_fanout_round_robin() {
    let (handler, sink) = start_handler();

    let listener = NetSocket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    listener
        .bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap().into())
        .unwrap();
    listener.listen(16).unwrap();
    let addr = listener.local_addr().unwrap().as_socket().unwrap();

    let socket = Socket::new(listener.into_raw_fd(), 0);
    for _ in 0..3 {
        handler.listening_registry().register(socket.fd());
    }
    for port in [10, 11, 12] {
        handler.send_socket_command(&socket, port, message::set_event_mask(EventBits::IN, true));
    }

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(addr).unwrap());
    }

    // One pending connection per subscriber, in insertion order.
    assert!(sink.wait_until(WAIT, |posts| posts.len() == 3));
    assert_eq!(
        sink.posts(),
        vec![(10, Some(IN)), (11, Some(IN)), (12, Some(IN))]
    );

    // All tokens are spent; a fourth connection stays invisible.
    clients.push(TcpStream::connect(addr).unwrap());
    thread::sleep(Duration::from_millis(200));
    assert_eq!(sink.posts().len(), 3);

    handler.send_socket_command(&socket, 10, message::return_tokens(1, true));
    assert!(sink.wait_until(WAIT, |posts| posts.len() == 4));
    assert_eq!(sink.posts()[3], (10, Some(IN)));

    // Tear the three subscribers down; the descriptor goes with the last.
    for port in [10, 11, 12] {
        handler.send_socket_command(&socket, port, message::close(true, false));
    }
    assert!(sink.wait_until(WAIT, |posts| {
        [10, 11, 12]
            .iter()
            .all(|&port| posts.contains(&(port, Some(DESTROYED))))
    }));

    handler.shutdown();
    handler.wait_for_shutdown();
}

#[test]
fn timer_deadline_posts_null() {
    let (handler, sink) = start_handler();

    handler.send_data(TIMER_ID, 20, monotonic_millis() + 50);
    assert!(sink.wait_until(WAIT, |posts| posts.contains(&(20, None))));

    // The timeout is one-shot.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(count_for(&sink.posts(), 20), 1);

    handler.shutdown();
    handler.wait_for_shutdown();
}

#[test]
fn cancelled_timer_never_fires() {
    let (handler, sink) = start_handler();

    handler.send_data(TIMER_ID, 21, monotonic_millis() + 100);
    handler.send_data(TIMER_ID, 21, 0);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(count_for(&sink.posts(), 21), 0);

    handler.shutdown();
    handler.wait_for_shutdown();
}

#[test]
fn close_after_subscribe_destroys_once() {
    let (handler, sink) = start_handler();

    let (local, mut peer) = UnixStream::pair().unwrap();
    let socket = Socket::new(local.into_raw_fd(), 0);
    handler.send_socket_command(&socket, 30, message::set_event_mask(EventBits::IN, false));
    handler.send_socket_command(&socket, 30, message::close(false, false));

    assert!(sink.wait_until(WAIT, |posts| posts.contains(&(30, Some(DESTROYED)))));
    assert_eq!(socket.fd(), -1);

    // The descriptor is gone; readiness on the old peer goes nowhere.
    let _ = peer.write_all(b"X");
    thread::sleep(Duration::from_millis(200));
    assert_eq!(sink.posts(), vec![(30, Some(DESTROYED))]);

    handler.shutdown();
    handler.wait_for_shutdown();
}

#[test]
fn shutdown_quiesces_within_iteration() {
    let (handler, _sink) = start_handler();
    let handler = Arc::new(handler);

    handler.shutdown();

    let (done_tx, done_rx) = mpsc::channel();
    let waiter = Arc::clone(&handler);
    thread::spawn(move || {
        waiter.wait_for_shutdown();
        done_tx.send(()).unwrap();
    });
    assert!(done_rx.recv_timeout(WAIT).is_ok());

    // Completion is signalled exactly once and stays signalled.
    handler.wait_for_shutdown();
}

#[test]
fn unpollable_descriptor_synthesizes_close() {
    let (handler, sink) = start_handler();

    // Far beyond any real descriptor table; the kernel queue refuses it.
    let socket = Socket::new(i32::MAX - 1, 0);
    handler.send_socket_command(&socket, 40, message::set_event_mask(EventBits::IN, false));
    assert!(sink.wait_until(WAIT, |posts| posts.contains(&(40, Some(CLOSE)))));

    handler.shutdown();
    handler.wait_for_shutdown();
}

#[test]
fn signal_socket_close_clears_registry() {
    let (handler, sink) = start_handler();

    let (local, _peer) = UnixStream::pair().unwrap();
    let fd = local.into_raw_fd();
    let socket = Socket::new(fd, 41);
    handler.signal_registry().register(fd, 41);

    handler.send_socket_command(&socket, 41, message::set_event_mask(EventBits::IN, false));
    handler.send_socket_command(&socket, 41, message::close(false, true));

    assert!(sink.wait_until(WAIT, |posts| posts.contains(&(41, Some(DESTROYED)))));
    assert!(!handler.signal_registry().is_registered(fd));

    handler.shutdown();
    handler.wait_for_shutdown();
}

#[test]
fn commands_for_closed_handles_are_ignored() {
    let (handler, sink) = start_handler();

    let (local, _peer) = UnixStream::pair().unwrap();
    let stream = local; // keep ownership; the handler never sees the fd
    let socket = Socket::new(stream.as_raw_fd(), 0);
    socket.close_fd();
    handler.send_socket_command(&socket, 50, message::set_event_mask(EventBits::IN, false));

    // The loop is still healthy afterwards.
    handler.send_data(TIMER_ID, 51, monotonic_millis() + 20);
    assert!(sink.wait_until(WAIT, |posts| posts.contains(&(51, None))));
    assert_eq!(count_for(&sink.posts(), 50), 0);

    handler.shutdown();
    handler.wait_for_shutdown();
}
