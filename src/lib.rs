//! Event demultiplexer and dispatch engine for message-port I/O.
//!
//! `portmux` is the single-threaded engine that underpins an asynchronous
//! network/IPC subsystem on kqueue platforms. It watches an arbitrary number
//! of file descriptors through the BSD kernel event facility, accepts control
//! commands from any thread over a self-pipe, and delivers readiness events
//! to per-descriptor subscribers identified by opaque mailbox handles
//! ("ports").
//!
//! # Architecture
//!
//! The engine consists of:
//!
//! - [`handler::EventHandler`]: the public face; owns the loop thread and the
//!   wakeup channel
//! - [`descriptor::DescriptorInfo`]: per-descriptor subscriber lists, event
//!   masks and token accounting
//! - [`kqueue::KqueueReactor`]: installs/removes kernel filters and
//!   translates raw kernel events into [`events::EventBits`]
//! - [`timeout::TimeoutQueue`]: (deadline, port) pairs driving periodic
//!   null deliveries
//! - [`wakeup`]: the self-pipe carrying fixed-size [`message::InterruptMessage`]
//!   records from producer threads to the loop
//!
//! Delivery goes through a [`mailbox::PortSink`] supplied by the embedder;
//! the engine never interprets socket payload data.
//!
//! # Concurrency
//!
//! One dedicated thread owns the kqueue descriptor, the descriptor table and
//! the timeout queue; none of those are locked because they are never touched
//! off-thread. Producer threads interact only with the wakeup channel (safe
//! because a pipe write of at most `PIPE_BUF` bytes is atomic) and with the
//! reference-counted [`socket::Socket`] handle. The listening-socket and
//! signal-handler registries are the only shared structures, each behind its
//! own mutex.
//!
//! # Backpressure
//!
//! Every subscriber carries a token count. Delivering an event consumes one
//! token; a subscriber with no tokens stops contributing to the kernel filter
//! mask until the consumer returns credit with a `RETURN_TOKEN` command.

#[cfg(unix)]
pub mod descriptor;
#[cfg(unix)]
pub mod errno;
pub mod events;
pub mod mailbox;
pub mod message;
#[cfg(unix)]
pub mod registry;
#[cfg(unix)]
pub mod socket;
pub mod timeout;
#[cfg(unix)]
pub mod wakeup;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "macos", target_os = "ios"))] {
        pub mod handler;
        pub mod kqueue;

        pub use handler::EventHandler;
    }
}

pub use events::EventBits;
pub use mailbox::{Port, PortSink, ILLEGAL_PORT};
pub use message::{InterruptMessage, SHUTDOWN_ID, TIMER_ID};
#[cfg(unix)]
pub use socket::Socket;
pub use timeout::monotonic_millis;

#[macro_export]
macro_rules! trace {
    ($($body:tt)+) => {{
        #[cfg(feature = "log")]
        { ::log::trace!($($body)+) }
        #[cfg(feature = "tracing")]
        { ::tracing::trace!($($body)+) }
    }};
}

#[macro_export]
macro_rules! debug {
    ($($body:tt)+) => {{
        #[cfg(feature = "log")]
        { ::log::debug!($($body)+) }
        #[cfg(feature = "tracing")]
        { ::tracing::debug!($($body)+) }
    }};
}

#[macro_export]
macro_rules! info {
    ($($body:tt)+) => {{
        #[cfg(feature = "log")]
        { ::log::info!($($body)+) }
        #[cfg(feature = "tracing")]
        { ::tracing::info!($($body)+) }
    }};
}

#[macro_export]
macro_rules! warn {
    ($($body:tt)+) => {{
        #[cfg(feature = "log")]
        { ::log::warn!($($body)+) }
        #[cfg(feature = "tracing")]
        { ::tracing::warn!($($body)+) }
    }};
}

#[macro_export]
macro_rules! error {
    ($($body:tt)+) => {{
        #[cfg(feature = "log")]
        { ::log::error!($($body)+) }
        #[cfg(feature = "tracing")]
        { ::tracing::error!($($body)+) }
    }};
}
