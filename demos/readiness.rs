//! Readiness Demo: Event-Driven Accept Loop
//!
//! This demo wires an `EventHandler` to a TCP listener and serves accept
//! readiness from a message port, returning one flow-control token per
//! accepted connection.
//!
//! Run with: cargo run --example readiness

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn main() {
    println!("This demo is only available on kqueue platforms");
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn main() -> std::io::Result<()> {
    use std::net::{SocketAddr, TcpStream};
    use std::os::fd::IntoRawFd;
    use std::ptr;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    use portmux::events::EventBits;
    use portmux::mailbox::{Port, PortSink};
    use portmux::message;
    use portmux::{EventHandler, Socket};

    use socket2::{Domain, Socket as NetSocket, Type};

    struct ChannelSink(mpsc::Sender<(Port, Option<i32>)>);

    impl PortSink for ChannelSink {
        fn post_int32(&self, port: Port, value: i32) {
            let _ = self.0.send((port, Some(value)));
        }

        fn post_null(&self, port: Port) {
            let _ = self.0.send((port, None));
        }
    }

    const ACCEPT_PORT: Port = 1;
    const MAX_CLIENTS: usize = 3;

    println!("=== portmux readiness demo ===\n");

    let (tx, rx) = mpsc::channel();
    let handler = EventHandler::new(Arc::new(ChannelSink(tx)))?;
    handler.start();
    println!("[server] Started event handler");

    // A listening TCP socket, handed over to the event handler.
    let listener = NetSocket::new(Domain::IPV4, Type::STREAM, None)?;
    listener.bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap().into())?;
    listener.listen(16)?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?.as_socket().unwrap();
    println!("[server] Listening on {addr}");

    let socket = Socket::new(listener.into_raw_fd(), 0);
    handler.listening_registry().register(socket.fd());
    handler.send_socket_command(
        &socket,
        ACCEPT_PORT,
        message::set_event_mask(EventBits::IN, true),
    );

    // A few clients knocking on the door.
    for id in 1..=MAX_CLIENTS {
        thread::spawn(move || {
            let _stream = TcpStream::connect(addr).expect("connect failed");
            println!("[client {id}] Connected");
            thread::sleep(Duration::from_millis(200));
        });
    }

    let mut accepted = 0;
    while accepted < MAX_CLIENTS {
        let (port, value) = rx.recv().expect("event handler hung up");
        match value {
            Some(v) if EventBits::from_bits(v as u32).contains(EventBits::IN) => {
                let conn = unsafe { libc::accept(socket.fd(), ptr::null_mut(), ptr::null_mut()) };
                if conn >= 0 {
                    accepted += 1;
                    println!("[server] Accepted client #{accepted} (port {port})");
                    unsafe { libc::close(conn) };
                }
                // Return the consumed token so the next connection surfaces.
                handler.send_socket_command(&socket, ACCEPT_PORT, message::return_tokens(1, true));
            }
            other => println!("[server] Delivery on port {port}: {other:?}"),
        }
    }

    println!("\n[server] Handled all {MAX_CLIENTS} clients, shutting down");
    handler.send_socket_command(&socket, ACCEPT_PORT, message::close(true, false));
    handler.shutdown();
    handler.wait_for_shutdown();
    println!("[server] Done");

    Ok(())
}
