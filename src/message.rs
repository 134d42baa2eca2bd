//! Control messages carried over the wakeup channel.
//!
//! Every command submitted to the event loop travels as a fixed-size
//! [`InterruptMessage`]. The record is small enough that a single pipe write
//! is atomic (`PIPE_BUF`), so producers on any thread can send without a
//! user-space lock.
//!
//! The `data` field of a socket command is bit-packed:
//!
//! ```text
//! bits 0..8    payload: token count (RETURN_TOKEN) or event mask (SET_EVENT_MASK)
//! bits 8..=12  one-hot command tag
//! bit  16      the target is a listening socket
//! bit  17      the target is a signal socket
//! ```

use crate::events::EventBits;
use crate::mailbox::Port;

/// Sentinel id: `data` carries a timeout deadline for `port`.
pub const TIMER_ID: i64 = -1;

/// Sentinel id: cooperative loop termination.
pub const SHUTDOWN_ID: i64 = -2;

/// Wire size of one [`InterruptMessage`].
pub const INTERRUPT_MESSAGE_SIZE: usize = 24;

// A single blocking write must be atomic, otherwise concurrent producers
// could interleave records.
#[cfg(unix)]
const _: () = assert!(INTERRUPT_MESSAGE_SIZE <= libc::PIPE_BUF as usize);

/// One control record: a target id, a reply port and a command word.
///
/// `id` is [`TIMER_ID`], [`SHUTDOWN_ID`], or a socket handle transferred by
/// reference count (see [`Socket`](crate::socket::Socket)).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterruptMessage {
    pub id: i64,
    pub port: Port,
    pub data: i64,
}

impl InterruptMessage {
    pub fn new(id: i64, port: Port, data: i64) -> InterruptMessage {
        InterruptMessage { id, port, data }
    }

    pub fn to_bytes(&self) -> [u8; INTERRUPT_MESSAGE_SIZE] {
        let mut bytes = [0u8; INTERRUPT_MESSAGE_SIZE];
        bytes[0..8].copy_from_slice(&self.id.to_ne_bytes());
        bytes[8..16].copy_from_slice(&self.port.to_ne_bytes());
        bytes[16..24].copy_from_slice(&self.data.to_ne_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; INTERRUPT_MESSAGE_SIZE]) -> InterruptMessage {
        InterruptMessage {
            id: i64::from_ne_bytes(bytes[0..8].try_into().unwrap()),
            port: Port::from_ne_bytes(bytes[8..16].try_into().unwrap()),
            data: i64::from_ne_bytes(bytes[16..24].try_into().unwrap()),
        }
    }
}

const PAYLOAD_MASK: i64 = 0xff;

const CLOSE_BIT: i64 = 1 << 8;
const SHUTDOWN_READ_BIT: i64 = 1 << 9;
const SHUTDOWN_WRITE_BIT: i64 = 1 << 10;
const RETURN_TOKEN_BIT: i64 = 1 << 11;
const SET_EVENT_MASK_BIT: i64 = 1 << 12;
const COMMAND_MASK: i64 =
    CLOSE_BIT | SHUTDOWN_READ_BIT | SHUTDOWN_WRITE_BIT | RETURN_TOKEN_BIT | SET_EVENT_MASK_BIT;

const LISTENING_BIT: i64 = 1 << 16;
const SIGNAL_BIT: i64 = 1 << 17;

/// A decoded socket command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Replace the subscriber's event mask. Only `IN`/`OUT` are accepted.
    SetEventMask(EventBits),
    /// Tear the subscriber down and release the descriptor.
    Close,
    /// Credit flow-control tokens back to the subscriber.
    ReturnTokens(u8),
    /// `shutdown(fd, SHUT_RD)`; no subscriber state changes.
    ShutdownRead,
    /// `shutdown(fd, SHUT_WR)`; no subscriber state changes.
    ShutdownWrite,
}

/// A command plus the target-kind flags carried alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandData {
    pub command: Command,
    pub listening: bool,
    pub signal: bool,
}

impl CommandData {
    pub fn encode(self) -> i64 {
        let mut data = match self.command {
            Command::SetEventMask(mask) => SET_EVENT_MASK_BIT | mask.bits() as i64,
            Command::Close => CLOSE_BIT,
            Command::ReturnTokens(count) => RETURN_TOKEN_BIT | count as i64,
            Command::ShutdownRead => SHUTDOWN_READ_BIT,
            Command::ShutdownWrite => SHUTDOWN_WRITE_BIT,
        };
        if self.listening {
            data |= LISTENING_BIT;
        }
        if self.signal {
            data |= SIGNAL_BIT;
        }
        data
    }

    /// Decodes a command word. Returns `None` unless exactly one command tag
    /// is set and the payload is valid for that command.
    pub fn decode(data: i64) -> Option<CommandData> {
        let tag = data & COMMAND_MASK;
        let payload = data & PAYLOAD_MASK;
        let command = match tag {
            SET_EVENT_MASK_BIT => {
                let mask = EventBits::from_bits(payload as u32);
                if !EventBits::SUBSCRIBABLE.contains(mask) {
                    return None;
                }
                Command::SetEventMask(mask)
            }
            CLOSE_BIT if payload == 0 => Command::Close,
            RETURN_TOKEN_BIT => Command::ReturnTokens(payload as u8),
            SHUTDOWN_READ_BIT if payload == 0 => Command::ShutdownRead,
            SHUTDOWN_WRITE_BIT if payload == 0 => Command::ShutdownWrite,
            _ => return None,
        };
        Some(CommandData {
            command,
            listening: (data & LISTENING_BIT) != 0,
            signal: (data & SIGNAL_BIT) != 0,
        })
    }
}

/// Builds the command word subscribing `port` with the given mask.
pub fn set_event_mask(mask: EventBits, listening: bool) -> i64 {
    CommandData {
        command: Command::SetEventMask(mask),
        listening,
        signal: false,
    }
    .encode()
}

/// Builds the command word tearing a subscriber down.
pub fn close(listening: bool, signal: bool) -> i64 {
    CommandData {
        command: Command::Close,
        listening,
        signal,
    }
    .encode()
}

/// Builds the command word returning `count` flow-control tokens.
pub fn return_tokens(count: u8, listening: bool) -> i64 {
    CommandData {
        command: Command::ReturnTokens(count),
        listening,
        signal: false,
    }
    .encode()
}

/// Builds the command word for `shutdown(fd, SHUT_RD)`.
pub fn shutdown_read() -> i64 {
    CommandData {
        command: Command::ShutdownRead,
        listening: false,
        signal: false,
    }
    .encode()
}

/// Builds the command word for `shutdown(fd, SHUT_WR)`.
pub fn shutdown_write() -> i64 {
    CommandData {
        command: Command::ShutdownWrite,
        listening: false,
        signal: false,
    }
    .encode()
}
